use thiserror::Error;

pub type Result<T> = std::result::Result<T, CapsError>;

/// Erreurs du réseau de capsules.
///
/// Les erreurs de forme et de configuration sont fatales: elles sont levées
/// à la construction ou au début d'une passe, jamais réessayées.
#[derive(Debug, Error)]
pub enum CapsError {
    #[error("forme incompatible: {0}")]
    Shape(String),
    #[error("configuration invalide: {0}")]
    Config(String),
    #[error("jeu de données: {0}")]
    Dataset(String),
    #[error("erreur d'entrée/sortie: {0}")]
    Io(#[from] std::io::Error),
    #[error("erreur d'image: {0}")]
    Image(#[from] image::ImageError),
    #[error("erreur JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("réorganisation de tableau impossible: {0}")]
    Layout(#[from] ndarray::ShapeError),
}

pub fn shape(msg: impl Into<String>) -> CapsError {
    CapsError::Shape(msg.into())
}

pub fn config(msg: impl Into<String>) -> CapsError {
    CapsError::Config(msg.into())
}

pub fn dataset(msg: impl Into<String>) -> CapsError {
    CapsError::Dataset(msg.into())
}

/// Vérifie qu'une forme observée correspond exactement à la forme attendue.
pub fn ensure_shape(what: &str, actual: &[usize], expected: &[usize]) -> Result<()> {
    if actual != expected {
        return Err(shape(format!(
            "{what}: forme {actual:?}, attendue {expected:?}"
        )));
    }
    Ok(())
}
