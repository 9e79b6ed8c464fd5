use nalgebra::{DMatrix, DVector};
use rand::{
    distr::{Bernoulli, Distribution},
    rngs::StdRng,
    Rng,
};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter},
    iter::zip,
    path::Path,
};

use crate::{metrics, mnist, optim::Optimizer, Activation, Error, Gradient, Result};

/// Layer sizes of the Fashion-MNIST classifier.
pub const FASHION_SIZES: [usize; 5] = [mnist::IMAGE_SIZE, 256, 128, 64, 10];

/// Whether dropout is applied during forward passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    Train,
    Eval,
}

/// Fully-connected classifier producing log-probabilities.
///
/// Every hidden layer is `linear -> activation -> dropout`, the last layer
/// is `linear -> log_softmax`. Inputs are matrices with one column per
/// sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classifier {
    sizes: Vec<usize>,
    layers: Gradient<f32>,
    dropout: f32,
    activation: Activation,
    #[serde(skip)]
    mode: Mode,
}

/// Everything a training forward pass keeps for backpropagation.
pub struct ForwardPass {
    /// input of every layer, post dropout
    inputs: Vec<DMatrix<f32>>,
    /// pre-activation of every layer
    zs: Vec<DMatrix<f32>>,
    /// scaled keep-masks of the hidden layers, `None` where dropout was off
    masks: Vec<Option<DMatrix<f32>>>,
    pub log_probs: DMatrix<f32>,
}

impl Classifier {
    /// The list ``sizes`` contains the number of neurons in the
    /// respective layers of the network, the first entry being the input
    /// width and the last the number of classes. Weights and biases are
    /// drawn from `U(-1/√fan_in, 1/√fan_in)`.
    pub fn new<R: Rng + ?Sized>(
        sizes: &[usize],
        dropout: f32,
        activation: Activation,
        rng: &mut R,
    ) -> Result<Self> {
        if sizes.len() < 2 || sizes.contains(&0) {
            return Err(Error::InvalidConfig(format!(
                "layer sizes {sizes:?} need at least two non-zero entries"
            )));
        }
        check_dropout(dropout)?;

        let layers = zip(&sizes[..sizes.len() - 1], &sizes[1..])
            .map(|(&x, &y)| {
                let bound = 1. / (x as f32).sqrt();
                (
                    DMatrix::from_fn(y, x, |_, _| rng.random_range(-bound..=bound)),
                    DVector::from_fn(y, |_, _| rng.random_range(-bound..=bound)),
                )
            })
            .collect();

        Ok(Self {
            sizes: sizes.to_vec(),
            layers,
            dropout,
            activation,
            mode: Mode::Train,
        })
    }

    /// 784 -> 256 -> 128 -> 64 -> 10 with ReLU hidden layers.
    pub fn fashion<R: Rng + ?Sized>(dropout: f32, rng: &mut R) -> Result<Self> {
        Self::new(&FASHION_SIZES, dropout, Activation::Relu, rng)
    }

    pub fn train(&mut self) {
        self.mode = Mode::Train;
    }

    pub fn eval(&mut self) {
        self.mode = Mode::Eval;
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn dropout(&self) -> f32 {
        self.dropout
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn classes(&self) -> usize {
        self.sizes[self.sizes.len() - 1]
    }

    pub fn parameters(&self) -> &Gradient<f32> {
        &self.layers
    }

    pub fn set_parameters(&mut self, layers: Gradient<f32>) -> Result<()> {
        let matches = layers.len() == self.layers.len()
            && zip(&layers, &self.layers)
                .all(|((w, b), (ow, ob))| w.shape() == ow.shape() && b.len() == ob.len());

        if !matches {
            return Err(Error::Shape(format!(
                "parameters do not fit layer sizes {:?}",
                self.sizes
            )));
        }

        self.layers = layers;
        Ok(())
    }

    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(|(w, b)| w.len() + b.len()).sum()
    }

    /// Log-probabilities for a batch, dropping units when in train mode.
    pub fn forward<R: Rng + ?Sized>(&self, x: &DMatrix<f32>, rng: &mut R) -> Result<DMatrix<f32>> {
        Ok(self.run(x, Some(rng))?.log_probs)
    }

    /// Log-probabilities for a batch with dropout disabled, whatever the mode.
    pub fn infer(&self, x: &DMatrix<f32>) -> Result<DMatrix<f32>> {
        Ok(self.run::<StdRng>(x, None)?.log_probs)
    }

    /// Class probabilities of a single sample.
    pub fn predict(&self, input: &DVector<f32>) -> Result<DVector<f32>> {
        let x = DMatrix::from_column_slice(input.len(), 1, input.as_slice());
        Ok(self.infer(&x)?.column(0).map(f32::exp))
    }

    pub fn classify(&self, input: &DVector<f32>) -> Result<usize> {
        let x = DMatrix::from_column_slice(input.len(), 1, input.as_slice());
        Ok(metrics::predictions(&self.infer(&x)?)[0])
    }

    /// Forward pass keeping what [`Classifier::backward`] needs. Dropout
    /// masks are drawn only in train mode and only when `rng` is given.
    pub fn run<R: Rng + ?Sized>(
        &self,
        x: &DMatrix<f32>,
        mut rng: Option<&mut R>,
    ) -> Result<ForwardPass> {
        if x.nrows() != self.sizes[0] {
            return Err(Error::Shape(format!(
                "input has {} rows, network expects {}",
                x.nrows(),
                self.sizes[0]
            )));
        }

        let last = self.layers.len() - 1;
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut zs = Vec::with_capacity(self.layers.len());
        let mut masks = Vec::with_capacity(last);
        let mut a = x.clone();

        for (i, (w, b)) in self.layers.iter().enumerate() {
            let z = linear(w, b, &a);
            inputs.push(a);

            if i == last {
                let log_probs = log_softmax(&z);
                zs.push(z);

                return Ok(ForwardPass {
                    inputs,
                    zs,
                    masks,
                    log_probs,
                });
            }

            let mut h = z.clone();
            h.apply(self.activation.get_fun32());
            zs.push(z);

            let mask = match rng.as_deref_mut() {
                Some(rng) if self.mode == Mode::Train && self.dropout > 0. => {
                    Some(dropout_mask(h.nrows(), h.ncols(), self.dropout, rng)?)
                }
                _ => None,
            };

            if let Some(mask) = &mask {
                h.component_mul_assign(mask);
            }
            masks.push(mask);
            a = h;
        }

        unreachable!("a classifier always has an output layer")
    }

    /// Gradients of the mean negative log-likelihood of `labels` with
    /// respect to every weight and bias.
    pub fn backward(&self, pass: &ForwardPass, labels: &[usize]) -> Result<Gradient<f32>> {
        metrics::nll_loss(&pass.log_probs, labels)?;

        let batch = labels.len() as f32;

        // d(nll)/dz of the output is softmax - onehot
        let mut delta = pass.log_probs.map(f32::exp);
        for (c, &label) in labels.iter().enumerate() {
            delta[(label, c)] -= 1.;
        }
        delta /= batch;

        let mut grads = Vec::with_capacity(self.layers.len());

        for l in (0..self.layers.len()).rev() {
            grads.push((&delta * pass.inputs[l].transpose(), delta.column_sum()));

            if l > 0 {
                let mut d = self.layers[l].0.tr_mul(&delta);
                if let Some(mask) = &pass.masks[l - 1] {
                    d.component_mul_assign(mask);
                }
                let sp = pass.zs[l - 1].clone().apply_into(self.activation.get_dir32());
                d.component_mul_assign(&sp);
                delta = d;
            }
        }

        grads.reverse();
        Ok(grads)
    }

    /// One optimizer update on a mini-batch, returning the batch loss.
    pub fn train_step<R: Rng + ?Sized>(
        &mut self,
        x: &DMatrix<f32>,
        labels: &[usize],
        optimizer: &mut dyn Optimizer,
        rng: &mut R,
    ) -> Result<f32> {
        let pass = self.run(x, Some(rng))?;
        let loss = metrics::nll_loss(&pass.log_probs, labels)?;
        let grads = self.backward(&pass, labels)?;

        optimizer.step(&mut self.layers, &grads);

        Ok(loss)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        serde_json::to_writer(BufWriter::new(File::create(path)?), self)?;
        Ok(())
    }

    /// Load a saved classifier. It comes back in train mode.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let model: Self = serde_json::from_reader(BufReader::new(File::open(path)?))?;

        check_dropout(model.dropout)?;
        let consistent = !model.layers.is_empty()
            && model.sizes.len() == model.layers.len() + 1
            && model.layers.iter().enumerate().all(|(i, (w, b))| {
                w.shape() == (model.sizes[i + 1], model.sizes[i]) && b.len() == model.sizes[i + 1]
            });
        if !consistent {
            return Err(Error::Shape(format!(
                "saved parameters do not match layer sizes {:?}",
                model.sizes
            )));
        }

        Ok(model)
    }
}

fn check_dropout(p: f32) -> Result<()> {
    if !(0.0..1.0).contains(&p) {
        return Err(Error::InvalidConfig(format!(
            "dropout probability {p} is outside [0, 1)"
        )));
    }
    Ok(())
}

/// `w·a + b` with `b` added to every column.
fn linear(w: &DMatrix<f32>, b: &DVector<f32>, a: &DMatrix<f32>) -> DMatrix<f32> {
    let mut z = w * a;
    for mut column in z.column_iter_mut() {
        column += b;
    }
    z
}

/// Column-wise log-softmax, shifted by the column max for stability.
pub fn log_softmax(z: &DMatrix<f32>) -> DMatrix<f32> {
    let mut out = z.clone();
    for mut column in out.column_iter_mut() {
        let max = column.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let log_sum = max + column.iter().map(|v| (v - max).exp()).sum::<f32>().ln();
        column.apply(|v| *v -= log_sum);
    }
    out
}

/// Inverted dropout: kept units are scaled by `1 / (1 - p)` so the
/// expected activation is unchanged.
fn dropout_mask<R: Rng + ?Sized>(
    rows: usize,
    cols: usize,
    p: f32,
    rng: &mut R,
) -> Result<DMatrix<f32>> {
    let keep = Bernoulli::new(f64::from(1. - p))
        .map_err(|e| Error::InvalidConfig(format!("dropout probability {p}: {e}")))?;
    let scale = 1. / (1. - p);

    Ok(DMatrix::from_fn(rows, cols, |_, _| {
        if keep.sample(rng) {
            scale
        } else {
            0.
        }
    }))
}
