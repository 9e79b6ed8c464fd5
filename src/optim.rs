//! Parameter update rules.
//!
//! Parameters and gradients share the [`Gradient`] layout: one `(weights,
//! biases)` pair per layer, gradients already averaged over the batch.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::iter::zip;

use crate::Gradient;

pub trait Optimizer {
    fn step(&mut self, params: &mut Gradient<f32>, grads: &Gradient<f32>);

    fn learning_rate(&self) -> f32;
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum OptimizerKind {
    Sgd,
    #[default]
    Adam,
}

impl OptimizerKind {
    pub fn build(self, learning_rate: f32) -> Box<dyn Optimizer + Send> {
        match self {
            OptimizerKind::Sgd => Box::new(Sgd::new(learning_rate)),
            OptimizerKind::Adam => Box::new(Adam::new(learning_rate)),
        }
    }
}

/// Plain gradient descent.
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f32,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut Gradient<f32>, grads: &Gradient<f32>) {
        for ((weights, biases), (nw, nb)) in zip(params.iter_mut(), grads) {
            *weights -= nw * self.learning_rate;
            *biases -= nb * self.learning_rate;
        }
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

/// Adam with bias-corrected first and second moment estimates.
///
/// ```text
/// m = β1·m + (1 − β1)·g
/// v = β2·v + (1 − β2)·g²
/// θ = θ − α·(m / (1 − β1^t)) / (√(v / (1 − β2^t)) + ε)
/// ```
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    m: Gradient<f32>,
    v: Gradient<f32>,
    t: i32,
}

impl Adam {
    pub fn new(learning_rate: f32) -> Self {
        Self::with_betas(learning_rate, 0.9, 0.999, 1e-8)
    }

    pub fn with_betas(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            m: Vec::new(),
            v: Vec::new(),
            t: 0,
        }
    }

    pub fn steps(&self) -> i32 {
        self.t
    }

    fn zeros_like(params: &Gradient<f32>) -> Gradient<f32> {
        params
            .iter()
            .map(|(w, b)| (DMatrix::zeros(w.nrows(), w.ncols()), DVector::zeros(b.len())))
            .collect()
    }

    fn update(
        &self,
        param: &mut [f32],
        grad: &[f32],
        m: &mut [f32],
        v: &mut [f32],
        correction1: f32,
        correction2: f32,
    ) {
        for i in 0..param.len() {
            m[i] = self.beta1 * m[i] + (1. - self.beta1) * grad[i];
            v[i] = self.beta2 * v[i] + (1. - self.beta2) * grad[i] * grad[i];

            let m_hat = m[i] / correction1;
            let v_hat = v[i] / correction2;
            param[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut Gradient<f32>, grads: &Gradient<f32>) {
        if self.m.len() != params.len() {
            self.m = Self::zeros_like(params);
            self.v = Self::zeros_like(params);
            self.t = 0;
        }

        self.t += 1;
        let correction1 = 1. - self.beta1.powi(self.t);
        let correction2 = 1. - self.beta2.powi(self.t);

        let mut m = std::mem::take(&mut self.m);
        let mut v = std::mem::take(&mut self.v);

        for (((weights, biases), (nw, nb)), ((mw, mb), (vw, vb))) in zip(
            zip(params.iter_mut(), grads),
            zip(m.iter_mut(), v.iter_mut()),
        ) {
            self.update(
                weights.as_mut_slice(),
                nw.as_slice(),
                mw.as_mut_slice(),
                vw.as_mut_slice(),
                correction1,
                correction2,
            );
            self.update(
                biases.as_mut_slice(),
                nb.as_slice(),
                mb.as_mut_slice(),
                vb.as_mut_slice(),
                correction1,
                correction2,
            );
        }

        self.m = m;
        self.v = v;
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    fn single(w: f32, b: f32) -> Gradient<f32> {
        vec![(DMatrix::from_element(1, 1, w), DVector::from_element(1, b))]
    }

    #[test]
    fn sgd_moves_against_gradient() {
        let mut params = single(1.0, 0.5);
        Sgd::new(0.1).step(&mut params, &single(2.0, -1.0));

        assert_relative_eq!(params[0].0[(0, 0)], 0.8, epsilon = 1e-6);
        assert_relative_eq!(params[0].1[0], 0.6, epsilon = 1e-6);
    }

    #[test]
    fn adam_first_step_is_learning_rate_sized() {
        // bias correction makes the first step ±lr regardless of gradient scale
        let mut params = single(1.0, 1.0);
        let mut adam = Adam::new(0.01);
        adam.step(&mut params, &single(250.0, -0.003));

        assert_eq!(adam.steps(), 1);
        assert_relative_eq!(params[0].0[(0, 0)], 0.99, epsilon = 1e-5);
        assert_relative_eq!(params[0].1[0], 1.01, epsilon = 1e-4);
    }

    #[test]
    fn adam_minimizes_quadratic() {
        // f(x) = (x - 3)^2
        let mut params = single(0.0, 0.0);
        let mut adam = Adam::new(0.1);

        for _ in 0..500 {
            let x = params[0].0[(0, 0)];
            let grad = single(2. * (x - 3.), 0.0);
            adam.step(&mut params, &grad);
        }

        assert_relative_eq!(params[0].0[(0, 0)], 3.0, epsilon = 5e-2);
    }

    #[test]
    fn kind_builds_matching_optimizer() {
        assert_relative_eq!(OptimizerKind::Sgd.build(0.5).learning_rate(), 0.5);
        assert_relative_eq!(OptimizerKind::Adam.build(0.003).learning_rate(), 0.003);
    }
}
