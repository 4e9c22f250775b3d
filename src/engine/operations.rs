use std::rc::Rc;

use ndarray::prelude::*;

use super::{Origin, Tensor, TensorBuilder};
use crate::error::{EngineError, Result};

/// The differentiable operations a non-leaf tensor can originate from. Each
/// variant pairs a forward rule with a fixed vector-Jacobian product in
/// [`Operation::backward`].
#[derive(Debug, Clone)]
pub enum Operation {
    Addition,
    MatrixMultiplication,
    RectifiedLinearUnit,
    /// The target is not trainable, so it's carried here (already negated)
    /// rather than as a parent.
    MeanSquaredError { negated_target: ArrayD<f64> },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Addition => "add",
            Operation::MatrixMultiplication => "matmul",
            Operation::RectifiedLinearUnit => "relu",
            Operation::MeanSquaredError { .. } => "mse",
        }
    }

    fn arity(&self) -> usize {
        match self {
            Operation::Addition | Operation::MatrixMultiplication => 2,
            Operation::RectifiedLinearUnit | Operation::MeanSquaredError { .. } => 1,
        }
    }

    pub fn forward(&self, inputs: Vec<Rc<Tensor>>) -> Result<Rc<Tensor>> {
        assert!(
            inputs.len() == self.arity(),
            "{} expects {} operand(s), got {}",
            self.name(),
            self.arity(),
            inputs.len()
        );
        let array = match self {
            Operation::Addition => {
                broadcast_sum(&inputs[0].borrow_array(), &inputs[1].borrow_array())?
            }
            Operation::MatrixMultiplication => {
                let a_array = inputs[0].borrow_array();
                let b_array = inputs[1].borrow_array();
                let a = as_matrix(&a_array)?;
                let b = as_matrix(&b_array)?;
                if a.ncols() != b.nrows() {
                    return Err(EngineError::DimensionMismatch {
                        left: a_array.shape().to_vec(),
                        right: b_array.shape().to_vec(),
                    });
                }
                a.dot(&b).into_dyn()
            }
            Operation::RectifiedLinearUnit => inputs[0]
                .borrow_array()
                .map(|&x| if x > 0. { x } else { 0. }),
            Operation::MeanSquaredError { negated_target } => {
                let prediction = inputs[0].borrow_array();
                if prediction.shape() != negated_target.shape() {
                    return Err(EngineError::ShapeMismatch(
                        prediction.shape().to_vec(),
                        negated_target.shape().to_vec(),
                    ));
                }
                let difference = &*prediction + negated_target;
                let mean = difference
                    .mapv(|d| d * d)
                    .mean()
                    .ok_or(EngineError::EmptyTensor)?;
                array![mean].into_dyn()
            }
        };
        let requires_gradient = inputs.iter().any(|input| input.requires_gradient());
        let origin = Origin {
            operation: self.clone(),
            parents: inputs,
        };
        Ok(Rc::new(
            TensorBuilder::new(array)
                .requires_gradient(requires_gradient)
                .origin(origin)
                .build(),
        ))
    }

    /// The contribution to `parents[arg_index]`'s gradient, given the
    /// gradient flowing into this operation's output.
    pub fn backward(
        &self,
        out_gradient: &ArrayD<f64>,
        parents: &[Rc<Tensor>],
        arg_index: usize,
    ) -> Result<ArrayD<f64>> {
        match self {
            Operation::Addition => {
                // Addition passes the gradient through to both branches,
                // summed back down over any broadcast axes.
                Ok(unbroadcast(out_gradient, parents[arg_index].borrow_array().shape()))
            }
            Operation::MatrixMultiplication => {
                let out_gradient = as_matrix(out_gradient)?;
                // matrix multiplication is not commutative; separate cases
                // for out_gradient @ B^T and A^T @ out_gradient
                match arg_index {
                    0 => {
                        let other_array = parents[1].borrow_array();
                        let other = as_matrix(&other_array)?;
                        Ok(out_gradient.dot(&other.t()).into_dyn())
                    }
                    1 => {
                        let other_array = parents[0].borrow_array();
                        let other = as_matrix(&other_array)?;
                        Ok(other.t().dot(&out_gradient).into_dyn())
                    }
                    _ => panic!("binary operation expected"),
                }
            }
            Operation::RectifiedLinearUnit => {
                let input = parents[0].borrow_array();
                let mut gradient = Array::zeros(input.raw_dim());
                azip!((g in &mut gradient, o in out_gradient, a in &*input) if *a > 0. { *g += o });
                Ok(gradient)
            }
            Operation::MeanSquaredError { negated_target } => {
                // d/dp mean((p − t)²) = 2(p − t)/n
                let prediction = parents[0].borrow_array();
                let n = prediction.len() as f64;
                let upstream = out_gradient.iter().next().copied().unwrap_or(0.);
                let difference = &*prediction + negated_target;
                Ok(difference * (2. / n * upstream))
            }
        }
    }
}

fn as_matrix(array: &ArrayD<f64>) -> Result<ArrayView2<'_, f64>> {
    array
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| EngineError::NotTwoDimensional(array.shape().to_vec()))
}

/// NumPy-style: align trailing axes, where each pair must agree or one side
/// must be 1.
fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut shape = vec![0; rank];
    for axis in 0..rank {
        let a_size = if axis + a.len() >= rank {
            a[axis + a.len() - rank]
        } else {
            1
        };
        let b_size = if axis + b.len() >= rank {
            b[axis + b.len() - rank]
        } else {
            1
        };
        shape[axis] = match (a_size, b_size) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return Err(EngineError::BroadcastMismatch(a.to_vec(), b.to_vec())),
        };
    }
    Ok(shape)
}

fn broadcast_sum(a: &ArrayD<f64>, b: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    let shape = broadcast_shape(a.shape(), b.shape())?;
    let mismatch = || EngineError::BroadcastMismatch(a.shape().to_vec(), b.shape().to_vec());
    let a_view = a.broadcast(shape.as_slice()).ok_or_else(mismatch)?;
    let b_view = b.broadcast(shape.as_slice()).ok_or_else(mismatch)?;
    Ok(&a_view + &b_view)
}

/// Sums a gradient back down to the shape of an operand that was broadcast
/// to produce it.
fn unbroadcast(gradient: &ArrayD<f64>, shape: &[usize]) -> ArrayD<f64> {
    let mut reduced = gradient.clone();
    while reduced.ndim() > shape.len() {
        reduced = reduced.sum_axis(Axis(0));
    }
    for (axis, &size) in shape.iter().enumerate() {
        if size == 1 && reduced.shape()[axis] != 1 {
            reduced = reduced.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    reduced
}

/// Method-call sugar for building graphs: `x.matmul(&w)?.add(&b)?.relu()?`.
pub trait TensorOps {
    fn add(&self, other: &Rc<Tensor>) -> Result<Rc<Tensor>>;
    fn matmul(&self, other: &Rc<Tensor>) -> Result<Rc<Tensor>>;
    fn relu(&self) -> Result<Rc<Tensor>>;
    /// Elementwise application of `f`. The result is a fresh leaf: no
    /// gradient flows through a map.
    fn map<F: Fn(f64) -> f64>(&self, f: F) -> Rc<Tensor>;
}

impl TensorOps for Rc<Tensor> {
    fn add(&self, other: &Rc<Tensor>) -> Result<Rc<Tensor>> {
        Operation::Addition.forward(vec![self.clone(), other.clone()])
    }

    fn matmul(&self, other: &Rc<Tensor>) -> Result<Rc<Tensor>> {
        Operation::MatrixMultiplication.forward(vec![self.clone(), other.clone()])
    }

    fn relu(&self) -> Result<Rc<Tensor>> {
        Operation::RectifiedLinearUnit.forward(vec![self.clone()])
    }

    fn map<F: Fn(f64) -> f64>(&self, f: F) -> Rc<Tensor> {
        let array = self.borrow_array().mapv(f);
        Rc::new(TensorBuilder::new(array).build())
    }
}
