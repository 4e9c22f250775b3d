use std::rc::Rc;

use super::Tensor;
use crate::error::{EngineError, Result};

pub trait Optimizer {
    fn step(&mut self);
    fn step_count(&self) -> usize;
    fn zero_gradients(&self);
}

/// Plain gradient descent: `θ ← θ − η·∇θ`. A step leaves gradients as they
/// are; zero them before the next forward pass.
pub struct StochasticGradientDescentOptimizer {
    parameters: Vec<Rc<Tensor>>,
    learning_rate: f64,
    step_count: usize,
}

impl StochasticGradientDescentOptimizer {
    pub fn new(parameters: Vec<Rc<Tensor>>, learning_rate: f64) -> Result<Self> {
        if !(learning_rate.is_finite() && learning_rate > 0.) {
            return Err(EngineError::InvalidHyperparameter(format!(
                "learning rate must be positive and finite, got {}",
                learning_rate
            )));
        }
        Ok(Self {
            parameters,
            learning_rate,
            step_count: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn parameters(&self) -> &[Rc<Tensor>] {
        &self.parameters
    }
}

impl Optimizer for StochasticGradientDescentOptimizer {
    fn step(&mut self) {
        for parameter in &self.parameters {
            let gradient = parameter.borrow_gradient();
            let mut array = parameter.borrow_array_mut();
            *array -= &(self.learning_rate * &*gradient);
        }
        self.step_count += 1;
    }

    fn step_count(&self) -> usize {
        self.step_count
    }

    fn zero_gradients(&self) {
        for parameter in &self.parameters {
            parameter.zero_gradient();
        }
    }
}
