pub mod config;
pub mod layers;
pub mod capsule;
pub mod routing;
pub mod mask;
pub mod decoder;
pub mod optimizer;
pub mod loss;
pub mod builder;
pub mod core;

// Réexportations principales
pub use config::{ExperimentConfig, NetworkConfig, TrainingConfig};
pub use core::{CapNet, Evaluation, ForwardOutput, StepMetrics};
pub use builder::ModelBuilder;
pub use mask::MaskMode;
pub use optimizer::{Optimizer, Adam, SGD};
pub use loss::{CombinedLoss, LossFunction, MarginLoss, Metrics};
pub use routing::DynamicRouting;
