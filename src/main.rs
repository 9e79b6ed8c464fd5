use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use fashion_classifier::{
    fit, metrics, mnist, render, Activation, Classifier, OptimizerKind, TrainConfig,
};
use rand::{rngs::StdRng, SeedableRng};

/// Train a Fashion-MNIST classifier with dropout, compare training and
/// validation loss, then classify a single test image.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Directory holding the four IDX files
    #[arg(short, long, default_value = "data/")]
    data: PathBuf,

    #[arg(long, default_value_t = 30)]
    epochs: usize,

    #[arg(long, default_value_t = 64)]
    batch_size: usize,

    #[arg(long, default_value_t = 0.003)]
    learning_rate: f32,

    /// Probability of dropping a hidden unit during training. Only used for a
    /// freshly built model; a loaded model keeps its own.
    #[arg(long, default_value_t = 0.2)]
    dropout: f32,

    #[arg(long, value_enum, default_value_t = OptimizerKind::Adam)]
    optimizer: OptimizerKind,

    /// Hidden activation of a freshly built model
    #[arg(long, value_enum, default_value_t = Activation::Relu)]
    activation: Activation,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Keep the weights from the epoch with the lowest validation loss
    #[arg(long, conflicts_with = "load_model")]
    restore_best: bool,

    /// Epochs without validation improvement before calling it overfitting
    #[arg(long, default_value_t = 3)]
    patience: usize,

    /// Index of the test image to classify at the end
    #[arg(long, default_value_t = 0)]
    sample: usize,

    /// Skip training and use a previously saved model
    #[arg(long)]
    load_model: Option<PathBuf>,

    #[arg(long)]
    save_model: Option<PathBuf>,

    #[arg(long, conflicts_with = "load_model")]
    save_history: Option<PathBuf>,

    /// No progress bars
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn config(&self) -> TrainConfig {
        TrainConfig {
            epochs: self.epochs,
            batch_size: self.batch_size,
            learning_rate: self.learning_rate,
            dropout: self.dropout,
            optimizer: self.optimizer,
            activation: self.activation,
            seed: self.seed,
            restore_best: self.restore_best,
            quiet: self.quiet,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.config();
    config.validate()?;

    let data = mnist::read(&args.data)
        .with_context(|| format!("reading Fashion-MNIST from {}", args.data.display()))?;

    let mut rng = StdRng::seed_from_u64(config.seed);

    let mut model = match &args.load_model {
        Some(path) => Classifier::load(path)
            .with_context(|| format!("loading model from {}", path.display()))?,
        None => Classifier::new(
            &fashion_classifier::nn::FASHION_SIZES,
            config.dropout,
            config.activation,
            &mut rng,
        )?,
    };

    // one test batch before training
    let Some((images, labels)) = data.test.batches(config.batch_size).next() else {
        bail!("the test set is empty");
    };
    let log_probs = model.forward(&images, &mut rng)?;
    let top_class: Vec<usize> = metrics::top_k(&log_probs, 1)
        .iter()
        .map(|top| top[0].0)
        .collect();

    let shown = &top_class[..top_class.len().min(10)];
    println!("top classes of the first 10 test images: {shown:?}");
    println!(
        "accuracy on one batch: {:.2}%",
        metrics::accuracy(&log_probs, &labels)? * 100.
    );

    if args.load_model.is_none() {
        let history = fit(&mut model, &data.train, &data.test, &config)?;

        println!("\n{}", render::loss_curves(&history, 60, 15));

        if let Some(best) = history.best_epoch() {
            println!(
                "lowest validation loss {:.3} at epoch {}, accuracy {:.2}%",
                history.test_losses[best],
                best + 1,
                history.test_accuracies[best] * 100.
            );
        }
        if history.is_overfitting(args.patience) {
            println!(
                "validation loss has not improved for {} epochs while training loss keeps falling: the model is overfitting",
                args.patience
            );
        }

        if let Some(path) = &args.save_history {
            history
                .save(path)
                .with_context(|| format!("writing history to {}", path.display()))?;
        }
    }

    model.eval();

    let (image, label) = data
        .test
        .get(args.sample)
        .with_context(|| format!("test set has no sample {}", args.sample))?;
    let probs = model.predict(image)?;

    println!("\n{}", render::view_classify(image, &probs, &mnist::CLASSES)?);
    println!("actual: {}", mnist::CLASSES[label]);

    if let Some(path) = &args.save_model {
        model
            .save(path)
            .with_context(|| format!("writing model to {}", path.display()))?;
    }

    Ok(())
}
