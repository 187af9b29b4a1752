use capsnet::model::config::{
    Activation, CapsuleConfig, ConvConfig, DecoderConfig, DigitCapsConfig, ExperimentConfig, NetworkConfig,
    OptimizerType, TrainingConfig,
};
use capsnet::model::{MaskMode, ModelBuilder, SGD};
use capsnet::train_data::Dataset;
use capsnet::CapsError;
use ndarray::{Array2, Array4};

fn small_experiment() -> ExperimentConfig {
    ExperimentConfig {
        network: NetworkConfig {
            input_shape: (1, 10, 10),
            conv_layers: vec![ConvConfig {
                in_channels: 1,
                out_channels: 6,
                kernel_size: 3,
                stride: 1,
                padding: 0,
                activation: Activation::ReLU,
            }],
            primary_caps: CapsuleConfig {
                in_channels: 6,
                num_capsules: 2,
                capsule_dim: 3,
                kernel_size: 3,
                stride: 2,
                padding: 0,
                activation: Activation::None,
            },
            digit_caps: DigitCapsConfig {
                num_capsules: 2,
                capsule_dim: 4,
                weight_stddev: 0.05,
            },
            decoder: DecoderConfig { hidden_units: vec![12] },
            routing_iterations: 3,
            squash_epsilon: 1e-7,
            length_epsilon: 1e-9,
            use_reconstruction: true,
        },
        training: TrainingConfig {
            batch_size: 3,
            learning_rate: 0.05,
            num_epochs: 1,
            validation_size: 2,
            early_stopping_patience: 0,
            optimizer_type: OptimizerType::SGD { momentum: 0.9 },
            seed: 11,
            log_interval: 0,
            ..TrainingConfig::default()
        },
    }
}

/// Deux classes: moitié gauche ou moitié droite allumée
fn stripes(n: usize) -> Dataset {
    let images = Array4::from_shape_fn((n, 1, 10, 10), |(b, _, _, w)| {
        if (b % 2 == 0) == (w < 5) {
            1.0
        } else {
            0.0
        }
    });
    let labels = Array2::from_shape_fn((n, 2), |(b, c)| if b % 2 == c { 1.0 } else { 0.0 });
    Dataset::new(images, labels).unwrap()
}

#[test]
fn experiment_config_survives_json_file() {
    let experiment = small_experiment();
    let path = std::env::temp_dir().join(format!("capsnet-config-{}.json", std::process::id()));
    experiment.save(&path).unwrap();
    let loaded = ExperimentConfig::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(loaded, experiment);
}

#[test]
fn invalid_json_config_is_rejected() {
    let mut experiment = small_experiment();
    experiment.network.primary_caps.in_channels = 5;
    let path = std::env::temp_dir().join(format!("capsnet-bad-config-{}.json", std::process::id()));
    experiment.save(&path).unwrap();
    let loaded = ExperimentConfig::load(&path);
    std::fs::remove_file(&path).unwrap();
    assert!(matches!(loaded, Err(CapsError::Config(_))));
}

#[test]
fn build_train_and_evaluate() {
    let experiment = small_experiment();
    let mut model = ModelBuilder::new()
        .with_network_config(experiment.network.clone())
        .with_training_config(experiment.training.clone())
        .build()
        .unwrap();

    let data = stripes(8);
    let (validation, train) = data.split_at(experiment.training.validation_size);
    model.train(&train, &validation).unwrap();
    assert_eq!(model.history.train_loss.len(), 1);

    let evaluation = model.evaluate(&data, 5).unwrap();
    assert_eq!(evaluation.metrics.confusion_matrix.len(), 2);
    assert!(evaluation.loss.reconstruction > 0.0);

    let predictions = model.predict(&data.images.view()).unwrap();
    assert_eq!(predictions.len(), 8);
    assert!(predictions.iter().all(|&p| p < 2));
}

#[test]
fn training_mode_masks_with_labels() {
    let experiment = small_experiment();
    let mut model = ModelBuilder::new()
        .with_network_config(experiment.network)
        .with_training_config(experiment.training)
        .build()
        .unwrap();
    let data = stripes(4);

    let output = model
        .forward(&data.images.view(), Some(&data.labels.view()), MaskMode::GroundTruth)
        .unwrap();
    assert_eq!(output.masked.targets, data.labels);

    // Seule la tranche de la classe étiquetée est non nulle
    for (b, row) in output.masked.decoder_input.rows().into_iter().enumerate() {
        let class = b % 2;
        for (k, &v) in row.iter().enumerate() {
            if k / 4 != class {
                assert_eq!(v, 0.0);
            }
        }
    }

    let mut optimizer = SGD::new(0.05, 0.0);
    let step = model
        .train_step(&data.images.view(), &data.labels.view(), &mut optimizer)
        .unwrap();
    assert!(step.loss.total.is_finite());
    assert!((0.0..=1.0).contains(&step.accuracy()));
}
