use ndarray::prelude::*;

use crate::error::{EngineError, Result};

/// Arbitrarily nested numeric lists, the loosely-typed form tensors are
/// usually handed to us in. Shape is inferred and validated once, when the
/// data is converted to an array.
#[derive(Debug, Clone, PartialEq)]
pub enum NestedData {
    Scalar(f64),
    List(Vec<NestedData>),
}

impl NestedData {
    /// A top-level scalar counts as a one-element vector.
    pub fn shape(&self) -> Result<Vec<usize>> {
        match self {
            NestedData::Scalar(_) => Ok(vec![1]),
            NestedData::List(_) => self.inferred_shape(0),
        }
    }

    fn inferred_shape(&self, depth: usize) -> Result<Vec<usize>> {
        match self {
            NestedData::Scalar(_) => Ok(Vec::new()),
            NestedData::List(items) => {
                let mut items_iter = items.iter();
                let inner = match items_iter.next() {
                    Some(first) => first.inferred_shape(depth + 1)?,
                    None => Vec::new(),
                };
                for item in items_iter {
                    if item.inferred_shape(depth + 1)? != inner {
                        return Err(EngineError::RaggedNesting { depth: depth + 1 });
                    }
                }
                let mut shape = vec![items.len()];
                shape.extend(inner);
                Ok(shape)
            }
        }
    }

    fn flatten_into(&self, values: &mut Vec<f64>) {
        match self {
            NestedData::Scalar(value) => values.push(*value),
            NestedData::List(items) => {
                for item in items {
                    item.flatten_into(values);
                }
            }
        }
    }

    pub fn into_array(self) -> Result<ArrayD<f64>> {
        let shape = self.shape()?;
        let mut values = Vec::new();
        self.flatten_into(&mut values);
        let count = values.len();
        ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|_| EngineError::ShapeMismatch(shape.clone(), vec![count]))
    }
}

impl From<f64> for NestedData {
    fn from(value: f64) -> Self {
        NestedData::Scalar(value)
    }
}

impl From<Vec<NestedData>> for NestedData {
    fn from(items: Vec<NestedData>) -> Self {
        NestedData::List(items)
    }
}

impl From<Vec<f64>> for NestedData {
    fn from(values: Vec<f64>) -> Self {
        NestedData::List(values.into_iter().map(NestedData::Scalar).collect())
    }
}

impl From<Vec<Vec<f64>>> for NestedData {
    fn from(rows: Vec<Vec<f64>>) -> Self {
        NestedData::List(rows.into_iter().map(NestedData::from).collect())
    }
}

impl<const N: usize> From<[f64; N]> for NestedData {
    fn from(values: [f64; N]) -> Self {
        NestedData::from(values.to_vec())
    }
}

impl<const M: usize, const N: usize> From<[[f64; N]; M]> for NestedData {
    fn from(rows: [[f64; N]; M]) -> Self {
        NestedData::List(rows.into_iter().map(NestedData::from).collect())
    }
}
