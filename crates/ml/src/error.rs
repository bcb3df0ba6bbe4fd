use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MlError {
    #[error("shape mismatch in {op}: {left:?} vs {right:?}")]
    ShapeMismatch {
        op: &'static str,
        left: Vec<usize>,
        right: Vec<usize>,
    },
    #[error("shape expects {expected} elements but data has {actual}")]
    ElementCount { expected: usize, actual: usize },
    #[error("tensor {0} was not recorded in the tensor store")]
    MissingTensor(usize),
    #[error("{0} was recorded with the wrong number of operands")]
    MalformedNode(String),
}

pub type Result<T> = std::result::Result<T, MlError>;
