use nalgebra::{DMatrix, DVector};
use rand::{seq::SliceRandom, Rng};
use std::path::Path;

use crate::{Error, Result};

pub const IMAGE_SIDE: usize = 28;
pub const IMAGE_SIZE: usize = IMAGE_SIDE * IMAGE_SIDE;

/// Fashion-MNIST class names, indexed by label.
pub const CLASSES: [&str; 10] = [
    "T-shirt/top",
    "Trouser",
    "Pullover",
    "Dress",
    "Coat",
    "Sandal",
    "Shirt",
    "Sneaker",
    "Bag",
    "Ankle Boot",
];

/// Images as column vectors plus their integer labels.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct Dataset {
    pub images: Vec<DVector<f32>>,
    pub labels: Vec<usize>,
}

impl Dataset {
    pub fn new(images: Vec<DVector<f32>>, labels: Vec<usize>) -> Result<Self> {
        if images.len() != labels.len() {
            return Err(Error::CountMismatch {
                images: images.len(),
                labels: labels.len(),
            });
        }

        if let Some(first) = images.first() {
            if let Some(bad) = images.iter().find(|image| image.len() != first.len()) {
                return Err(Error::Shape(format!(
                    "images of length {} and {} in one dataset",
                    first.len(),
                    bad.len()
                )));
            }
        }

        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Length of each image vector, 0 for an empty dataset.
    pub fn features(&self) -> usize {
        self.images.first().map_or(0, DVector::len)
    }

    pub fn get(&self, index: usize) -> Option<(&DVector<f32>, usize)> {
        Some((self.images.get(index)?, *self.labels.get(index)?))
    }

    /// Stack the selected samples into a matrix with one column per sample.
    pub fn batch(&self, indices: &[usize]) -> (DMatrix<f32>, Vec<usize>) {
        let inputs = DMatrix::from_fn(self.features(), indices.len(), |r, c| {
            self.images[indices[c]][r]
        });
        let labels = indices.iter().map(|&i| self.labels[i]).collect();

        (inputs, labels)
    }

    /// Sample indices split into chunks of `batch_size`, in dataset order.
    pub fn batch_indices(&self, batch_size: usize) -> Vec<Vec<usize>> {
        let order: Vec<usize> = (0..self.len()).collect();
        order
            .chunks(batch_size.max(1))
            .map(<[usize]>::to_vec)
            .collect()
    }

    /// Like [`Dataset::batch_indices`] but over a fresh random permutation.
    pub fn shuffled_batch_indices<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: &mut R,
    ) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        order
            .chunks(batch_size.max(1))
            .map(<[usize]>::to_vec)
            .collect()
    }

    pub fn batches(
        &self,
        batch_size: usize,
    ) -> impl Iterator<Item = (DMatrix<f32>, Vec<usize>)> + '_ {
        self.batch_indices(batch_size)
            .into_iter()
            .map(|indices| self.batch(&indices))
    }
}

#[derive(Default, Debug, Clone, PartialEq)]
pub struct Mnist {
    pub train: Dataset,
    pub test: Dataset,
}

/// Read the four IDX files of an MNIST-layout dataset from `path`.
pub fn read(path: impl AsRef<Path>) -> Result<Mnist> {
    let path = path.as_ref();

    Ok(Mnist {
        train: read_split(path, "train")?,
        test: read_split(path, "t10k")?,
    })
}

fn read_split(dir: &Path, prefix: &str) -> Result<Dataset> {
    let images_name = format!("{prefix}-images-idx3-ubyte");
    let labels_name = format!("{prefix}-labels-idx1-ubyte");

    let images = parse_images(&std::fs::read(dir.join(&images_name))?, &images_name)?;
    let labels = parse_labels(&std::fs::read(dir.join(&labels_name))?, &labels_name)?;

    Dataset::new(images, labels)
}

/// Parse an idx3 image file, normalizing every pixel into `[-1, 1]`.
pub fn parse_images(bytes: &[u8], file: &str) -> Result<Vec<DVector<f32>>> {
    let (dims, payload) = read_header(bytes, 3, file)?;
    let (count, rows, cols) = (dims[0], dims[1], dims[2]);

    if rows != IMAGE_SIDE || cols != IMAGE_SIDE {
        return Err(Error::ImageSize { rows, cols });
    }

    check_payload(payload, count * IMAGE_SIZE, file)?;

    Ok(payload
        .chunks_exact(IMAGE_SIZE)
        .map(|chunk| DVector::from_iterator(IMAGE_SIZE, chunk.iter().copied().map(normalize)))
        .collect())
}

pub fn parse_labels(bytes: &[u8], file: &str) -> Result<Vec<usize>> {
    let (dims, payload) = read_header(bytes, 1, file)?;
    check_payload(payload, dims[0], file)?;

    payload
        .iter()
        .map(|&byte| match byte as usize {
            label if label < CLASSES.len() => Ok(label),
            label => Err(Error::BadLabel {
                label,
                classes: CLASSES.len(),
            }),
        })
        .collect()
}

fn read_header<'a>(bytes: &'a [u8], dims: u8, file: &str) -> Result<(Vec<usize>, &'a [u8])> {
    let header_len = 4 + 4 * dims as usize;

    if bytes.len() < header_len {
        return Err(Error::Truncated {
            file: file.to_string(),
            expected: header_len,
            found: bytes.len(),
        });
    }

    match [bytes[0], bytes[1], bytes[2], bytes[3]] {
        [0, 0, 8, d] if d == dims => {}
        found => {
            return Err(Error::BadHeader {
                file: file.to_string(),
                dims,
                found,
            })
        }
    }

    let sizes = bytes[4..header_len]
        .chunks_exact(4)
        .map(|be| u32::from_be_bytes([be[0], be[1], be[2], be[3]]) as usize)
        .collect();

    Ok((sizes, &bytes[header_len..]))
}

fn check_payload(payload: &[u8], expected: usize, file: &str) -> Result<()> {
    if payload.len() != expected {
        return Err(Error::Truncated {
            file: file.to_string(),
            expected,
            found: payload.len(),
        });
    }
    Ok(())
}

/// Scale a raw pixel to `[0, 1]` then shift it to mean 0.5, std 0.5.
pub fn normalize(byte: u8) -> f32 {
    (byte as f32 / 255. - 0.5) / 0.5
}

pub fn denormalize(value: f32) -> f32 {
    value * 0.5 + 0.5
}
