// End-to-end training on small synthetic clusters: validation tracking,
// best-epoch restore, reproducibility and mode handling.

use approx::assert_relative_eq;
use fashion_classifier::{
    evaluate, fit, mnist::Dataset, Activation, Classifier, Error, Mode, OptimizerKind,
    TrainConfig,
};
use nalgebra::DVector;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::Normal;

const FEATURES: usize = 8;
const CLASSES: usize = 3;

// class k is centred on +2 in features 2k and 2k + 1
fn clusters(samples: usize, seed: u64) -> Dataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0f32, 0.5).unwrap();

    let labels: Vec<usize> = (0..samples).map(|i| i % CLASSES).collect();
    let images = labels
        .iter()
        .map(|&label| {
            DVector::from_fn(FEATURES, |r, _| {
                let centre = if r / 2 == label { 2.0 } else { 0.0 };
                centre + rng.sample(noise)
            })
        })
        .collect();

    Dataset::new(images, labels).unwrap()
}

fn config() -> TrainConfig {
    TrainConfig {
        epochs: 12,
        batch_size: 16,
        learning_rate: 0.01,
        dropout: 0.2,
        optimizer: OptimizerKind::Adam,
        activation: Activation::Relu,
        seed: 9,
        restore_best: false,
        quiet: true,
    }
}

fn model(config: &TrainConfig) -> Classifier {
    let mut rng = StdRng::seed_from_u64(config.seed);
    Classifier::new(
        &[FEATURES, 32, 16, CLASSES],
        config.dropout,
        config.activation,
        &mut rng,
    )
    .unwrap()
}

#[test]
fn learns_separable_clusters() {
    let (train, test) = (clusters(300, 1), clusters(150, 2));
    let config = config();
    let mut model = model(&config);

    let before = evaluate(&model, &test, 32).unwrap();
    let history = fit(&mut model, &train, &test, &config).unwrap();
    let after = evaluate(&model, &test, 32).unwrap();

    assert_eq!(history.epochs(), config.epochs);
    assert_eq!(history.test_losses.len(), config.epochs);
    assert_eq!(history.test_accuracies.len(), config.epochs);

    assert!(after.loss < before.loss);
    assert!(after.accuracy > 0.9, "accuracy {}", after.accuracy);
    assert!(history.train_losses[config.epochs - 1] < history.train_losses[0]);

    // the last recorded validation numbers are those of the final model
    assert_relative_eq!(history.test_losses[config.epochs - 1], after.loss, epsilon = 1e-6);
    assert_relative_eq!(
        history.test_accuracies[config.epochs - 1],
        after.accuracy,
        epsilon = 1e-6
    );
}

#[test]
fn fit_leaves_model_in_train_mode() {
    let (train, test) = (clusters(60, 3), clusters(30, 4));
    let config = TrainConfig {
        epochs: 2,
        ..config()
    };
    let mut model = model(&config);
    model.eval();

    fit(&mut model, &train, &test, &config).unwrap();
    assert_eq!(model.mode(), Mode::Train);
}

#[test]
fn same_seed_same_history() {
    let (train, test) = (clusters(90, 5), clusters(45, 6));
    let config = TrainConfig {
        epochs: 3,
        ..config()
    };

    let mut first = model(&config);
    let mut second = model(&config);

    let a = fit(&mut first, &train, &test, &config).unwrap();
    let b = fit(&mut second, &train, &test, &config).unwrap();

    assert_eq!(a, b);
    assert_eq!(first.parameters(), second.parameters());
}

#[test]
fn restore_best_keeps_lowest_validation_loss() {
    let (train, test) = (clusters(90, 7), clusters(45, 8));
    let config = TrainConfig {
        epochs: 8,
        learning_rate: 0.05,
        restore_best: true,
        ..config()
    };
    let mut model = model(&config);

    let history = fit(&mut model, &train, &test, &config).unwrap();
    let best = history.best_epoch().unwrap();
    let restored = evaluate(&model, &test, config.batch_size).unwrap();

    assert_relative_eq!(restored.loss, history.test_losses[best], epsilon = 1e-6);
}

#[test]
fn rejects_invalid_config_and_empty_data() {
    let (train, test) = (clusters(30, 9), clusters(15, 10));
    let mut model = model(&config());

    let zero_batch = TrainConfig {
        batch_size: 0,
        ..config()
    };
    assert!(fit(&mut model, &train, &test, &zero_batch).is_err());
    assert!(fit(&mut model, &train, &Dataset::default(), &config()).is_err());
}

#[test]
fn config_must_describe_the_model() {
    let (train, test) = (clusters(30, 9), clusters(15, 10));
    let mut model = model(&config());
    let before = model.parameters().clone();

    let other_dropout = TrainConfig {
        dropout: 0.5,
        ..config()
    };
    let other_activation = TrainConfig {
        activation: Activation::Sigmoid,
        ..config()
    };
    for mismatched in [other_dropout, other_activation] {
        let err = fit(&mut model, &train, &test, &mismatched).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
    assert_eq!(model.parameters(), &before);
}

#[test]
fn dropout_only_changes_training_passes() {
    let test = clusters(30, 11);
    let (x, _) = test.batch(&(0..30).collect::<Vec<_>>());
    let mut model = model(&TrainConfig {
        dropout: 0.5,
        ..config()
    });
    let mut rng = StdRng::seed_from_u64(12);

    let noisy = model.forward(&x, &mut rng).unwrap();
    model.eval();
    let clean = model.forward(&x, &mut rng).unwrap();

    assert_ne!(noisy, clean);
    assert_eq!(clean, model.infer(&x).unwrap());
}
