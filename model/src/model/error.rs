use thiserror::Error;

/// Type résultat du modèle
pub type Result<T> = std::result::Result<T, ScaeError>;

/// Erreurs de l'autoencodeur à capsules
#[derive(Error, Debug)]
pub enum ScaeError {
    #[error("Configuration invalide: {0}")]
    Config(String),

    #[error("Dimensions incompatibles: attendu {expected}, obtenu {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error("Champ manquant dans le lot: {0}")]
    MissingField(String),

    #[error("Entrée invalide: {0}")]
    InvalidInput(String),

    #[error("Erreur d'E/S: {0}")]
    Io(#[from] std::io::Error),

    #[error("Erreur de forme ndarray: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

impl ScaeError {
    pub fn shape(expected: impl std::fmt::Debug, actual: impl std::fmt::Debug) -> Self {
        ScaeError::ShapeMismatch {
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        }
    }
}

impl From<serde_json::Error> for ScaeError {
    fn from(err: serde_json::Error) -> Self {
        ScaeError::Config(err.to_string())
    }
}
