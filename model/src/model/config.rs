use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{config, Result};

/// Fonction d'activation appliquée après une convolution ou une couche dense
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Activation {
    ReLU,
    LeakyReLU(f32),
    Sigmoid,
    Tanh,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub activation: Activation,
}

/// Capsules primaires: convolution dont les canaux sont regroupés en
/// `num_capsules` types de capsules de dimension `capsule_dim`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsuleConfig {
    pub in_channels: usize,
    pub num_capsules: usize,
    pub capsule_dim: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub activation: Activation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitCapsConfig {
    pub num_capsules: usize,
    pub capsule_dim: usize,
    /// Écart-type de l'initialisation normale de W
    pub weight_stddev: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub hidden_units: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// (canaux, hauteur, largeur)
    pub input_shape: (usize, usize, usize),
    pub conv_layers: Vec<ConvConfig>,
    pub primary_caps: CapsuleConfig,
    pub digit_caps: DigitCapsConfig,
    pub decoder: DecoderConfig,
    pub routing_iterations: usize,
    /// ε de la norme sûre du squash
    pub squash_epsilon: f32,
    /// ε de la norme sûre des longueurs de capsules
    pub length_epsilon: f32,
    pub use_reconstruction: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptimizerType {
    Adam { beta1: f32, beta2: f32, epsilon: f32 },
    SGD { momentum: f32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    pub positive_margin: f32,      // m+
    pub negative_margin: f32,      // m-
    pub down_weighting: f32,       // λ
    pub reconstruction_weight: f32, // α
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub learning_rate: f32,
    pub num_epochs: usize,
    /// Nombre d'échantillons d'entraînement réservés à la validation
    pub validation_size: usize,
    /// 0 désactive l'arrêt précoce
    pub early_stopping_patience: usize,
    pub optimizer_type: OptimizerType,
    pub loss_config: LossConfig,
    pub seed: u64,
    pub log_interval: usize,
}

/// Configuration complète d'une expérience, telle que lue depuis un fichier JSON
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub network: NetworkConfig,
    pub training: TrainingConfig,
}

/// Taille de sortie d'une convolution, `None` si le noyau dépasse l'entrée
pub fn conv_output_size(input: usize, kernel: usize, stride: usize, padding: usize) -> Option<usize> {
    if stride == 0 || input + 2 * padding < kernel {
        return None;
    }
    Some((input + 2 * padding - kernel) / stride + 1)
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<()> {
        let (channels, height, width) = self.input_shape;
        if channels == 0 || height == 0 || width == 0 {
            return Err(config(format!("input_shape nulle: {:?}", self.input_shape)));
        }
        if self.routing_iterations < 1 {
            return Err(config("routing_iterations doit être >= 1"));
        }
        if !(self.squash_epsilon > 0.0) || !(self.length_epsilon > 0.0) {
            return Err(config("les epsilons de norme doivent être > 0"));
        }

        let mut expected_channels = channels;
        for (i, conv) in self.conv_layers.iter().enumerate() {
            if conv.in_channels != expected_channels {
                return Err(config(format!(
                    "conv {i}: in_channels = {}, attendu {expected_channels}",
                    conv.in_channels
                )));
            }
            if conv.out_channels == 0 || conv.kernel_size == 0 || conv.stride == 0 {
                return Err(config(format!("conv {i}: dimensions nulles")));
            }
            expected_channels = conv.out_channels;
        }

        let primary = &self.primary_caps;
        if primary.in_channels != expected_channels {
            return Err(config(format!(
                "capsules primaires: in_channels = {}, attendu {expected_channels}",
                primary.in_channels
            )));
        }
        if primary.num_capsules == 0 || primary.capsule_dim == 0 {
            return Err(config("capsules primaires: dimensions nulles"));
        }
        if primary.kernel_size == 0 || primary.stride == 0 {
            return Err(config("capsules primaires: noyau ou pas nul"));
        }

        let digit = &self.digit_caps;
        if digit.num_capsules == 0 || digit.capsule_dim == 0 {
            return Err(config("capsules de sortie: dimensions nulles"));
        }
        if !(digit.weight_stddev > 0.0) || !digit.weight_stddev.is_finite() {
            return Err(config("weight_stddev doit être fini et > 0"));
        }
        if self.decoder.hidden_units.iter().any(|&units| units == 0) {
            return Err(config("décodeur: couche cachée vide"));
        }

        // Vérifie aussi la géométrie spatiale de toute la pile
        self.primary_grid()?;
        Ok(())
    }

    /// Forme (canaux, hauteur, largeur) en sortie de la pile de convolutions
    pub fn feature_shape(&self) -> Result<(usize, usize, usize)> {
        let (mut channels, mut height, mut width) = self.input_shape;
        for (i, conv) in self.conv_layers.iter().enumerate() {
            height = conv_output_size(height, conv.kernel_size, conv.stride, conv.padding)
                .ok_or_else(|| config(format!("conv {i}: noyau plus grand que l'entrée")))?;
            width = conv_output_size(width, conv.kernel_size, conv.stride, conv.padding)
                .ok_or_else(|| config(format!("conv {i}: noyau plus grand que l'entrée")))?;
            channels = conv.out_channels;
        }
        Ok((channels, height, width))
    }

    /// Grille spatiale (hauteur, largeur) des capsules primaires
    pub fn primary_grid(&self) -> Result<(usize, usize)> {
        let (_, height, width) = self.feature_shape()?;
        let p = &self.primary_caps;
        let h = conv_output_size(height, p.kernel_size, p.stride, p.padding)
            .ok_or_else(|| config("capsules primaires: noyau plus grand que l'entrée"))?;
        let w = conv_output_size(width, p.kernel_size, p.stride, p.padding)
            .ok_or_else(|| config("capsules primaires: noyau plus grand que l'entrée"))?;
        Ok((h, w))
    }

    /// N_in: nombre total de capsules primaires par échantillon
    pub fn num_primary_capsules(&self) -> Result<usize> {
        let (h, w) = self.primary_grid()?;
        Ok(h * w * self.primary_caps.num_capsules)
    }

    pub fn pixel_count(&self) -> usize {
        let (c, h, w) = self.input_shape;
        c * h * w
    }

    pub fn num_classes(&self) -> usize {
        self.digit_caps.num_capsules
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(config("batch_size doit être > 0"));
        }
        if self.num_epochs == 0 {
            return Err(config("num_epochs doit être > 0"));
        }
        if !(self.learning_rate > 0.0) {
            return Err(config("learning_rate doit être > 0"));
        }
        match self.optimizer_type {
            OptimizerType::Adam { beta1, beta2, epsilon } => {
                if !(0.0..1.0).contains(&beta1) || !(0.0..1.0).contains(&beta2) || !(epsilon > 0.0) {
                    return Err(config("paramètres Adam invalides"));
                }
            }
            OptimizerType::SGD { momentum } => {
                if !(0.0..1.0).contains(&momentum) {
                    return Err(config("momentum SGD invalide"));
                }
            }
        }
        self.loss_config.validate()
    }
}

impl LossConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.positive_margin > self.negative_margin) {
            return Err(config(format!(
                "m+ ({}) doit être > m- ({})",
                self.positive_margin, self.negative_margin
            )));
        }
        if self.negative_margin < 0.0 || self.positive_margin > 1.0 {
            return Err(config("les marges doivent être dans [0, 1]"));
        }
        if self.down_weighting < 0.0 || self.reconstruction_weight < 0.0 {
            return Err(config("λ et α doivent être >= 0"));
        }
        Ok(())
    }
}

impl ExperimentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let experiment: Self = serde_json::from_str(&raw)?;
        experiment.network.validate()?;
        experiment.training.validate()?;
        Ok(experiment)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

impl Default for NetworkConfig {
    /// Architecture MNIST: Conv1 256×9×9, 32 types de capsules 8D sur une
    /// grille 6×6, 10 capsules 16D, décodeur 512/1024/784.
    fn default() -> Self {
        Self {
            input_shape: (1, 28, 28),
            conv_layers: vec![ConvConfig {
                in_channels: 1,
                out_channels: 256,
                kernel_size: 9,
                stride: 1,
                padding: 0,
                activation: Activation::ReLU,
            }],
            primary_caps: CapsuleConfig {
                in_channels: 256,
                num_capsules: 32,
                capsule_dim: 8,
                kernel_size: 9,
                stride: 2,
                padding: 0,
                activation: Activation::ReLU,
            },
            digit_caps: DigitCapsConfig {
                num_capsules: 10,
                capsule_dim: 16,
                weight_stddev: 0.01,
            },
            decoder: DecoderConfig {
                hidden_units: vec![512, 1024],
            },
            routing_iterations: 3,
            squash_epsilon: 1e-7,
            length_epsilon: 1e-9,
            use_reconstruction: true,
        }
    }
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            positive_margin: 0.9,
            negative_margin: 0.1,
            down_weighting: 0.5,
            reconstruction_weight: 0.0005,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            learning_rate: 0.001,
            num_epochs: 10,
            validation_size: 5000,
            early_stopping_patience: 5,
            optimizer_type: OptimizerType::Adam {
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
            },
            loss_config: LossConfig::default(),
            seed: 42,
            log_interval: 10,
        }
    }
}
