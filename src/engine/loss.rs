use std::rc::Rc;

use super::operations::{Operation, TensorOps};
use super::Tensor;
use crate::error::{EngineError, Result};

pub struct Loss;

impl Loss {
    pub fn mse(prediction: &Rc<Tensor>, target: &Rc<Tensor>) -> Result<Rc<Tensor>> {
        mean_squared_error(prediction, target)
    }
}

/// Mean of `(prediction − target)²` over every element, as a one-element
/// tensor whose only parent is the prediction.
pub fn mean_squared_error(prediction: &Rc<Tensor>, target: &Rc<Tensor>) -> Result<Rc<Tensor>> {
    if prediction.shape() != target.shape() {
        return Err(EngineError::ShapeMismatch(
            prediction.shape(),
            target.shape(),
        ));
    }
    if prediction.is_empty() {
        return Err(EngineError::EmptyTensor);
    }
    let negated_target = target.map(|t| -t);
    let operation = Operation::MeanSquaredError {
        negated_target: negated_target.borrow_array().clone(),
    };
    operation.forward(vec![prediction.clone()])
}
