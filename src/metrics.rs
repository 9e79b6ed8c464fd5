use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Loss and accuracy of a model over a whole dataset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub loss: f32,
    pub accuracy: f32,
    pub correct: usize,
    pub total: usize,
}

fn check_labels(log_probs: &DMatrix<f32>, labels: &[usize]) -> Result<()> {
    if labels.is_empty() {
        return Err(Error::EmptyDataset);
    }

    if log_probs.ncols() != labels.len() {
        return Err(Error::Shape(format!(
            "{} output columns for {} labels",
            log_probs.ncols(),
            labels.len()
        )));
    }

    match labels.iter().find(|&&label| label >= log_probs.nrows()) {
        Some(&label) => Err(Error::BadLabel {
            label,
            classes: log_probs.nrows(),
        }),
        None => Ok(()),
    }
}

/// Mean negative log-likelihood of the true classes.
pub fn nll_loss(log_probs: &DMatrix<f32>, labels: &[usize]) -> Result<f32> {
    check_labels(log_probs, labels)?;

    let total: f32 = labels
        .iter()
        .enumerate()
        .map(|(c, &label)| -log_probs[(label, c)])
        .sum();

    Ok(total / labels.len() as f32)
}

/// The `k` most probable classes of every column as `(class, probability)`,
/// highest first. Equal probabilities keep the lower class first.
pub fn top_k(log_probs: &DMatrix<f32>, k: usize) -> Vec<Vec<(usize, f32)>> {
    log_probs
        .column_iter()
        .map(|column| {
            let mut ranked: Vec<(usize, f32)> = column
                .iter()
                .map(|lp| lp.exp())
                .enumerate()
                .collect();
            ranked.sort_by(|(i, a), (j, b)| b.total_cmp(a).then(i.cmp(j)));
            ranked.truncate(k);
            ranked
        })
        .collect()
}

/// Index of the most probable class of every column.
pub fn predictions(log_probs: &DMatrix<f32>) -> Vec<usize> {
    log_probs
        .column_iter()
        .map(|column| {
            column
                .iter()
                .enumerate()
                .max_by(|(i, a), (j, b)| a.total_cmp(b).then(j.cmp(i)))
                .map_or(0, |(i, _)| i)
        })
        .collect()
}

/// Number of columns whose top-1 class equals the label.
pub fn correct(log_probs: &DMatrix<f32>, labels: &[usize]) -> Result<usize> {
    check_labels(log_probs, labels)?;

    Ok(predictions(log_probs)
        .iter()
        .zip(labels)
        .filter(|(predicted, label)| predicted == label)
        .count())
}

/// Fraction of columns whose top-1 class equals the label.
pub fn accuracy(log_probs: &DMatrix<f32>, labels: &[usize]) -> Result<f32> {
    Ok(correct(log_probs, labels)? as f32 / labels.len() as f32)
}
