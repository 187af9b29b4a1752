use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::SeedableRng;

use super::{
    capsule::{DigitCapsLayer, PrimaryCapsLayer},
    config::{NetworkConfig, TrainingConfig},
    core::CapNet,
    decoder::Decoder,
    layers::{ConvLayer, Layer},
    routing::DynamicRouting,
};
use crate::error::{config, Result};

/// Constructeur de modèle
pub struct ModelBuilder {
    network_config: Option<NetworkConfig>,
    training_config: Option<TrainingConfig>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self {
            network_config: None,
            training_config: None,
        }
    }

    pub fn with_network_config(mut self, config: NetworkConfig) -> Self {
        self.network_config = Some(config);
        self
    }

    pub fn with_training_config(mut self, config: TrainingConfig) -> Self {
        self.training_config = Some(config);
        self
    }

    /// Valide les configurations puis initialise toutes les couches avec la
    /// graine d'entraînement
    pub fn build(self) -> Result<CapNet> {
        let network_config = self
            .network_config
            .ok_or_else(|| config("configuration réseau requise"))?;
        let training_config = self.training_config.unwrap_or_default();

        // Validation
        network_config.validate()?;
        training_config.validate()?;

        let mut rng = StdRng::seed_from_u64(training_config.seed);
        let features = Self::build_features(&network_config, &mut rng);

        let p = &network_config.primary_caps;
        let primary = PrimaryCapsLayer::new(
            p.in_channels,
            p.num_capsules,
            p.capsule_dim,
            p.kernel_size,
            p.stride,
            p.padding,
            p.activation,
            network_config.squash_epsilon,
            &mut rng,
        );

        // N_in découle de la géométrie de la pile de convolutions
        let primary_capsules = network_config.num_primary_capsules()?;

        let routing = DynamicRouting::new(network_config.routing_iterations, network_config.squash_epsilon)?;
        let d = &network_config.digit_caps;
        let digit_caps = DigitCapsLayer::new(
            primary_capsules,
            p.capsule_dim,
            d.num_capsules,
            d.capsule_dim,
            routing,
            d.weight_stddev,
            &mut rng,
        )?;

        let decoder = network_config.use_reconstruction.then(|| {
            Decoder::new(
                d.num_capsules * d.capsule_dim,
                &network_config.decoder.hidden_units,
                network_config.pixel_count(),
                &mut rng,
            )
        });

        log::info!(
            "🏗️  CapsNet: {} convolution(s), {} capsules primaires {}D, {} capsules {}D, {} itérations de routage",
            features.len(),
            primary_capsules,
            p.capsule_dim,
            d.num_capsules,
            d.capsule_dim,
            network_config.routing_iterations
        );

        Ok(CapNet::new(
            network_config,
            training_config,
            features,
            primary,
            digit_caps,
            decoder,
        ))
    }

    fn build_features(config: &NetworkConfig, rng: &mut StdRng) -> Vec<Box<dyn Layer>> {
        config
            .conv_layers
            .iter()
            .map(|conv| {
                Box::new(ConvLayer::new(
                    conv.in_channels,
                    conv.out_channels,
                    conv.kernel_size,
                    conv.stride,
                    conv.padding,
                    conv.activation,
                    rng,
                )) as Box<dyn Layer>
            })
            .collect()
    }
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}
