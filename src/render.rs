//! Terminal pictures: braille images, probability bars and loss curves.

use braille_rs::BrailleChar;
use nalgebra::DVector;
use std::fmt::Write;

use crate::{
    mnist::{self, IMAGE_SIDE, IMAGE_SIZE},
    Error, History, Result,
};

/// Draw a normalized 28x28 image with one braille cell per 2x4 pixels.
/// A pixel is set when its `[0, 1]` intensity reaches `threshold`.
pub fn image(data: &[f32], threshold: f32) -> Result<String> {
    if data.len() != IMAGE_SIZE {
        return Err(Error::Shape(format!(
            "image has {} pixels, expected {}",
            data.len(),
            IMAGE_SIZE
        )));
    }

    let mut grid = [false; IMAGE_SIZE];
    for (cell, &value) in grid.iter_mut().zip(data) {
        *cell = mnist::denormalize(value) >= threshold;
    }

    let mut canvas = String::new();

    for line in grid.chunks_exact(IMAGE_SIDE * 4) {
        for i in 0..IMAGE_SIDE / 2 {
            let mut byte = 0u8;
            for row in 0..4 {
                byte |= (line[IMAGE_SIDE * row + 2 * i] as u8) << row;
                byte |= (line[IMAGE_SIDE * row + 2 * i + 1] as u8) << (row + 4);
            }

            canvas.push(BrailleChar::with_data(byte).into())
        }
        canvas.push('\n')
    }

    Ok(canvas)
}

/// One bar per class, scaled so probability 1 fills `width` cells.
pub fn probabilities(probs: &DVector<f32>, classes: &[&str], width: usize) -> String {
    let name_width = classes.iter().map(|name| name.len()).max().unwrap_or(0);
    let mut chart = String::new();

    for (i, &p) in probs.iter().enumerate() {
        let name = classes.get(i).copied().unwrap_or("?");
        let filled = ((p.clamp(0., 1.) * width as f32).round() as usize).min(width);

        let _ = writeln!(
            chart,
            "{name:>name_width$} |{}{}| {p:.3}",
            "█".repeat(filled),
            " ".repeat(width - filled),
        );
    }

    chart
}

/// The image followed by its class probabilities and the predicted class.
pub fn view_classify(
    image_data: &DVector<f32>,
    probs: &DVector<f32>,
    classes: &[&str],
) -> Result<String> {
    let mut view = image(image_data.as_slice(), 0.5)?;

    view.push_str("\nClass Probability\n");
    view.push_str(&probabilities(probs, classes, 30));

    if let Some((best, p)) = probs
        .iter()
        .enumerate()
        .max_by(|(i, a), (j, b)| a.total_cmp(b).then(j.cmp(i)))
    {
        let name = classes.get(best).copied().unwrap_or("?");
        let _ = writeln!(view, "prediction: {name} ({:.1}%)", p * 100.);
    }

    Ok(view)
}

/// Training (`t`) and validation (`v`) loss per epoch on a `width` x
/// `height` character grid; `*` marks epochs where both land on one cell.
pub fn loss_curves(history: &History, width: usize, height: usize) -> String {
    let epochs = history.train_losses.len().max(history.test_losses.len());
    if epochs == 0 || width == 0 || height == 0 {
        return "no epochs recorded\n".to_string();
    }

    let all = history.train_losses.iter().chain(&history.test_losses);
    let max = all.clone().copied().fold(f32::NEG_INFINITY, f32::max);
    let min = all.copied().fold(f32::INFINITY, f32::min);
    let span = if max > min { max - min } else { 1. };

    let mut grid = vec![vec![' '; width]; height];

    let column = |epoch: usize| {
        if epochs == 1 {
            0
        } else {
            epoch * (width - 1) / (epochs - 1)
        }
    };
    let row = |loss: f32| (((max - loss) / span) * (height - 1) as f32).round() as usize;

    for (series, mark) in [(&history.train_losses, 't'), (&history.test_losses, 'v')] {
        for (epoch, &loss) in series.iter().enumerate() {
            let cell = &mut grid[row(loss).min(height - 1)][column(epoch)];
            *cell = match *cell {
                ' ' => mark,
                existing if existing == mark => mark,
                _ => '*',
            };
        }
    }

    let mut chart = String::new();
    for (i, line) in grid.iter().enumerate() {
        let label = match i {
            0 => format!("{max:>8.3}"),
            i if i == height - 1 => format!("{min:>8.3}"),
            _ => " ".repeat(8),
        };
        let _ = writeln!(chart, "{label} |{}", line.iter().collect::<String>());
    }

    let _ = writeln!(chart, "{} +{}", " ".repeat(8), "-".repeat(width));
    let _ = writeln!(
        chart,
        "{} epoch 1{:>pad$}",
        " ".repeat(8),
        epochs,
        pad = width.saturating_sub(7)
    );
    let _ = writeln!(chart, "t training loss   v validation loss");

    chart
}
