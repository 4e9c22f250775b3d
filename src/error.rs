use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("dimension mismatch: cannot multiply {left:?} by {right:?}")]
    DimensionMismatch { left: Vec<usize>, right: Vec<usize> },

    #[error("expected a two-dimensional tensor, got shape {0:?}")]
    NotTwoDimensional(Vec<usize>),

    #[error("cannot broadcast shapes {0:?} and {1:?}")]
    BroadcastMismatch(Vec<usize>, Vec<usize>),

    #[error("shape mismatch: {0:?} vs. {1:?}")]
    ShapeMismatch(Vec<usize>, Vec<usize>),

    #[error("ragged nesting at depth {depth}")]
    RaggedNesting { depth: usize },

    #[error("operation requires a non-empty tensor")]
    EmptyTensor,

    #[error("backprop needs a single-element culmination, got shape {0:?}")]
    NonScalarCulmination(Vec<usize>),

    #[error("invalid hyperparameter: {0}")]
    InvalidHyperparameter(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
