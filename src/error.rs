use thiserror::Error;

/// Errors produced while loading data, building or training a classifier.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{file}: first 4 bytes must be 0x00 0x00 0x08 0x{dims:02x}, found {found:02x?}")]
    BadHeader {
        file: String,
        dims: u8,
        found: [u8; 4],
    },

    #[error("{file}: header describes {expected} bytes of data, found {found}")]
    Truncated {
        file: String,
        expected: usize,
        found: usize,
    },

    #[error("images are {rows}x{cols}, expected 28x28")]
    ImageSize { rows: usize, cols: usize },

    #[error("{images} images but {labels} labels")]
    CountMismatch { images: usize, labels: usize },

    #[error("label {label} is out of range for {classes} classes")]
    BadLabel { label: usize, classes: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("dataset is empty")]
    EmptyDataset,

    #[error("progress bar template: {0}")]
    Template(#[from] indicatif::style::TemplateError),

    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
