use indicatif::{ProgressBar, ProgressStyle};
use rand::{rngs::StdRng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
    time::Instant,
};

use crate::{
    metrics::{self, Evaluation},
    mnist::Dataset,
    Activation, Classifier, Error, Gradient, OptimizerKind, Result,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub dropout: f32,
    pub optimizer: OptimizerKind,
    pub activation: Activation,
    pub seed: u64,
    /// put back the parameters of the epoch with the lowest validation loss
    pub restore_best: bool,
    /// no progress bars or per-epoch lines
    pub quiet: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 30,
            batch_size: 64,
            learning_rate: 0.003,
            dropout: 0.2,
            optimizer: OptimizerKind::Adam,
            activation: Activation::Relu,
            seed: 42,
            restore_best: false,
            quiet: false,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(Error::InvalidConfig("epochs must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch size must be at least 1".into()));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0. {
            return Err(Error::InvalidConfig(format!(
                "learning rate {} must be positive",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::InvalidConfig(format!(
                "dropout probability {} is outside [0, 1)",
                self.dropout
            )));
        }
        Ok(())
    }
}

/// Per-epoch training loss, validation loss and validation accuracy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub train_losses: Vec<f32>,
    pub test_losses: Vec<f32>,
    pub test_accuracies: Vec<f32>,
}

impl History {
    pub fn epochs(&self) -> usize {
        self.train_losses.len()
    }

    pub fn push(&mut self, train_loss: f32, evaluation: &Evaluation) {
        self.train_losses.push(train_loss);
        self.test_losses.push(evaluation.loss);
        self.test_accuracies.push(evaluation.accuracy);
    }

    /// Epoch with the lowest validation loss, the earliest on ties.
    pub fn best_epoch(&self) -> Option<usize> {
        self.test_losses
            .iter()
            .enumerate()
            .min_by(|(i, a), (j, b)| a.total_cmp(b).then(i.cmp(j)))
            .map(|(i, _)| i)
    }

    /// The validation loss has not improved for `patience` epochs while the
    /// training loss kept going down.
    pub fn is_overfitting(&self, patience: usize) -> bool {
        let Some(best) = self.best_epoch() else {
            return false;
        };
        let stale = self.test_losses.len().saturating_sub(best + 1);
        let latest = self.train_losses.last();
        let (Some(&latest), Some(&at_best)) = (latest, self.train_losses.get(best)) else {
            return false;
        };

        patience > 0 && stale >= patience && latest < at_best
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        serde_json::to_writer_pretty(BufWriter::new(File::create(path)?), self)?;
        Ok(())
    }

    /// Reads a history written by [`History::save`]. The three series must
    /// have one entry per epoch.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let history: Self = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        let (train, test, accuracy) = (
            history.train_losses.len(),
            history.test_losses.len(),
            history.test_accuracies.len(),
        );
        if train != test || test != accuracy {
            return Err(Error::Shape(format!(
                "history series differ in length: {train} train, {test} test, {accuracy} accuracy"
            )));
        }
        Ok(history)
    }
}

/// Loss and accuracy over the whole dataset with dropout off. Batches are
/// evaluated in parallel and the model's mode is left as it was.
pub fn evaluate(model: &Classifier, data: &Dataset, batch_size: usize) -> Result<Evaluation> {
    if data.is_empty() {
        return Err(Error::EmptyDataset);
    }

    let (loss_sum, correct) = data
        .batch_indices(batch_size)
        .par_iter()
        .map(|indices| {
            let (x, labels) = data.batch(indices);
            let log_probs = model.infer(&x)?;
            let loss = metrics::nll_loss(&log_probs, &labels)? * labels.len() as f32;
            Ok((loss, metrics::correct(&log_probs, &labels)?))
        })
        .collect::<Result<Vec<(f32, usize)>>>()?
        .into_iter()
        .fold((0., 0), |(l, c), (bl, bc)| (l + bl, c + bc));

    let total = data.len();

    Ok(Evaluation {
        loss: loss_sum / total as f32,
        accuracy: correct as f32 / total as f32,
        correct,
        total,
    })
}

/// Train `model` on `train`, validating on `test` after every epoch.
///
/// Each epoch runs in train mode over a fresh shuffle of the training set,
/// then switches to eval mode for validation and back to train mode. The
/// config's dropout and activation must match the model's.
pub fn fit(
    model: &mut Classifier,
    train: &Dataset,
    test: &Dataset,
    config: &TrainConfig,
) -> Result<History> {
    config.validate()?;
    if config.dropout != model.dropout() || config.activation != model.activation() {
        return Err(Error::InvalidConfig(format!(
            "config asks for dropout {} with {:?} but the model has dropout {} with {:?}",
            config.dropout,
            config.activation,
            model.dropout(),
            model.activation()
        )));
    }
    if train.is_empty() || test.is_empty() {
        return Err(Error::EmptyDataset);
    }

    let style = ProgressStyle::with_template(
        "[{elapsed:.green}] [{wide_bar:.cyan/red}] {pos:.red}/{len:.green} ({eta})",
    )?
    .progress_chars("=> ");

    if !config.quiet {
        println!(
            "Starting training:\n  epochs: {:>3}\n  mini_batch: {}\n  examples: {}\n  dropout: {}",
            config.epochs,
            config.batch_size,
            train.len(),
            model.dropout()
        );
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut optimizer = config.optimizer.build(config.learning_rate);
    let mut history = History::default();
    let mut best: Option<(f32, Gradient<f32>)> = None;

    for epoch in 0..config.epochs {
        let start = Instant::now();
        model.train();

        let batches = train.shuffled_batch_indices(config.batch_size, &mut rng);
        let bar = if config.quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(batches.len() as u64).with_style(style.clone())
        };

        let mut running_loss = 0.;
        for indices in bar.wrap_iter(batches.iter()) {
            let (x, labels) = train.batch(indices);
            running_loss += model.train_step(&x, &labels, optimizer.as_mut(), &mut rng)?;
        }
        bar.finish_and_clear();

        model.eval();
        let evaluation = evaluate(model, test, config.batch_size)?;
        model.train();

        let train_loss = running_loss / batches.len() as f32;
        history.push(train_loss, &evaluation);

        if config.restore_best && best.as_ref().is_none_or(|(loss, _)| evaluation.loss < *loss) {
            best = Some((evaluation.loss, model.parameters().clone()));
        }

        if !config.quiet {
            println!(
                "Epoch: {:>3}/{}.. Training Loss: {:.3}.. Test Loss: {:.3}.. Test Accuracy: {:.3}  time: {:#?}",
                epoch + 1,
                config.epochs,
                train_loss,
                evaluation.loss,
                evaluation.accuracy,
                start.elapsed()
            );
        }
    }

    if let Some((_, parameters)) = best {
        model.set_parameters(parameters)?;
    }

    Ok(history)
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    fn history(train: &[f32], test: &[f32]) -> History {
        History {
            train_losses: train.to_vec(),
            test_losses: test.to_vec(),
            test_accuracies: vec![0.5; test.len()],
        }
    }

    #[test]
    fn default_config_is_valid() {
        let config = TrainConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.epochs, 30);
        assert_eq!(config.batch_size, 64);
        assert_relative_eq!(config.learning_rate, 0.003);
        assert_relative_eq!(config.dropout, 0.2);
    }

    #[test]
    fn invalid_configs() {
        let base = TrainConfig::default();
        for config in [
            TrainConfig { epochs: 0, ..base.clone() },
            TrainConfig { batch_size: 0, ..base.clone() },
            TrainConfig { learning_rate: 0., ..base.clone() },
            TrainConfig { learning_rate: f32::NAN, ..base.clone() },
            TrainConfig { dropout: 1.0, ..base.clone() },
        ] {
            assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        }
    }

    #[test]
    fn best_epoch_is_lowest_validation_loss() {
        let h = history(&[1.0, 0.8, 0.6, 0.5], &[0.9, 0.7, 0.7, 0.8]);
        assert_eq!(h.best_epoch(), Some(1));
        assert_eq!(History::default().best_epoch(), None);
    }

    #[test]
    fn overfitting_needs_stale_validation_and_falling_training() {
        let h = history(&[1.0, 0.8, 0.6, 0.5, 0.4], &[0.9, 0.7, 0.75, 0.8, 0.85]);
        assert!(h.is_overfitting(3));
        assert!(!h.is_overfitting(4));
        assert!(!h.is_overfitting(0));

        let stuck = history(&[1.0, 0.8, 0.9, 0.95], &[0.9, 0.7, 0.75, 0.8]);
        assert!(!stuck.is_overfitting(2));

        let improving = history(&[1.0, 0.8, 0.6], &[0.9, 0.7, 0.5]);
        assert!(!improving.is_overfitting(1));
    }

    #[test]
    fn evaluate_rejects_empty_dataset() {
        let mut rng = StdRng::seed_from_u64(0);
        let model = Classifier::new(&[2, 3], 0.0, Activation::Relu, &mut rng).unwrap();
        let err = evaluate(&model, &Dataset::default(), 8).unwrap_err();
        assert!(matches!(err, Error::EmptyDataset));
    }

    #[test]
    fn evaluate_leaves_mode_untouched() {
        let mut rng = StdRng::seed_from_u64(0);
        let model = Classifier::new(&[2, 3], 0.5, Activation::Relu, &mut rng).unwrap();
        let image = DVector::from_column_slice(&[1., 0.]);
        let labels = vec![0, 1, 2, 0, 1];
        let data = Dataset::new(vec![image.clone(); 5], labels.clone()).unwrap();

        // identical images all get the same prediction
        let predicted = model.classify(&image).unwrap();
        let expected = labels.iter().filter(|&&l| l == predicted).count();

        let evaluation = evaluate(&model, &data, 2).unwrap();
        assert_eq!(model.mode(), crate::Mode::Train);
        assert_eq!(evaluation.total, 5);
        assert_eq!(evaluation.correct, expected);
        assert_relative_eq!(evaluation.accuracy, expected as f32 / 5.);
    }

    #[test]
    fn history_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let h = history(&[1.0, 0.5], &[1.1, 0.75]);

        h.save(&path).unwrap();
        assert_eq!(History::load(&path).unwrap(), h);
    }

    #[test]
    fn history_with_uneven_series_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(
            &path,
            r#"{"train_losses":[],"test_losses":[0.5],"test_accuracies":[0.1]}"#,
        )
        .unwrap();

        assert!(matches!(History::load(&path), Err(Error::Shape(_))));
    }

    #[test]
    fn overfitting_check_tolerates_uneven_series() {
        let short_train = History {
            train_losses: vec![],
            test_losses: vec![0.5],
            test_accuracies: vec![0.1],
        };
        assert!(!short_train.is_overfitting(1));

        let long_test = History {
            train_losses: vec![1.0, 0.8],
            test_losses: vec![0.9, 0.7, 0.8, 0.9],
            test_accuracies: vec![0.5; 4],
        };
        assert!(!long_test.is_overfitting(1));
    }
}
