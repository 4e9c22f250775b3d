//! A small reverse-mode automatic differentiation engine: tensors that
//! remember how they were computed, a handful of differentiable operations,
//! dense layers, mean-squared-error loss, and stochastic gradient descent.

pub mod engine;
pub mod error;

pub use engine::dense::{Activation, Dense, Layer, Sequential};
pub use engine::loss::{mean_squared_error, Loss};
pub use engine::nested::NestedData;
pub use engine::operations::{Operation, TensorOps};
pub use engine::optimization::{Optimizer, StochasticGradientDescentOptimizer};
pub use engine::{backprop, backprop_summed, Tensor, TensorBuilder};
pub use error::{EngineError, Result};
