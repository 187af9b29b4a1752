//! Réseau de capsules (CapsNet) avec routage dynamique par accord.
//!
//! Pipeline: convolutions, capsules primaires, capsules de sortie routées,
//! masquage puis décodeur de reconstruction. Les gradients sont calculés à
//! la main couche par couche.

pub mod error;
pub mod model;
pub mod train_data;

pub use error::{CapsError, Result};
