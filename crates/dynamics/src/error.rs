use ml::MlError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DynamicsError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("unknown variance type {0:?}, expected \"max\" or \"data\"")]
    UnknownVarianceType(String),
    #[error("an ensemble needs at least one model")]
    EmptyEnsemble,
    #[error("{what} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("discrete action {index} is not an index in [0, {action_size})")]
    InvalidAction { index: f32, action_size: usize },
    #[error(transparent)]
    Ml(#[from] MlError),
    #[error("failed to parse config: {0}")]
    Config(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DynamicsError>;

/// Checks that a shape is `[rows, cols]`.
pub(crate) fn expect_shape(what: &'static str, actual: &[usize], rows: usize, cols: usize) -> Result<()> {
    if actual == [rows, cols] {
        Ok(())
    } else {
        Err(DynamicsError::ShapeMismatch {
            what,
            expected: vec![rows, cols],
            actual: actual.to_vec(),
        })
    }
}
