pub mod error;
pub mod metrics;
pub mod mnist;
pub mod nn;
pub mod optim;
pub mod render;
pub mod train;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

pub use error::{Error, Result};
pub use nn::{Classifier, Mode};
pub use optim::{Adam, Optimizer, OptimizerKind, Sgd};
pub use train::{evaluate, fit, History, TrainConfig};

/// Per layer `(weights, biases)`. Used both for the parameters of a
/// network and for gradients of the same shape.
pub type Gradient<T> = Vec<(DMatrix<T>, DVector<T>)>;

/// Hidden layer activation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum Activation {
    #[default]
    Relu,
    Sigmoid,
}

impl Activation {
    pub fn get_fun32(&self) -> fn(&mut f32) {
        match self {
            Activation::Relu => |v: &mut f32| *v = v.max(0.),
            Activation::Sigmoid => |v: &mut f32| *v = 1. / (1. + (-*v).exp()),
        }
    }

    /// Derivative with respect to the pre-activation value, applied in place.
    pub fn get_dir32(&self) -> fn(&mut f32) {
        match self {
            Activation::Relu => |v: &mut f32| *v = if *v > 0. { 1. } else { 0. },
            Activation::Sigmoid => |v: &mut f32| {
                let s = 1. / (1. + (-*v).exp());
                *v = s * (1. - s)
            },
        }
    }
}
