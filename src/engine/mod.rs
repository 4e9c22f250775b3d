use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::Mutex;

use lazy_static::lazy_static;
use log::trace;
use ndarray::prelude::*;

use topological_sort::TopologicalSort;

use crate::error::{EngineError, Result};

pub mod demo;
pub mod dense;
pub mod loss;
pub mod nested;
pub mod operations;
pub mod optimization;

use self::nested::NestedData;
use self::operations::Operation;

lazy_static! {
    static ref COUNTER: Mutex<u64> = Mutex::new(0);
}

fn generate_serial_number() -> u64 {
    // a poisoned counter is still a perfectly good counter
    let mut num = COUNTER.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *num += 1;
    *num
}

/// A node in the computation graph: an array of values, a same-shaped
/// gradient buffer, and (for non-leaves) the operation and operands that
/// produced it.
pub struct Tensor {
    serial_number: u64,
    identifier: String,
    array: RefCell<ArrayD<f64>>,
    requires_gradient: bool,
    gradient: RefCell<ArrayD<f64>>,
    origin: Option<Origin>,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("identifier", &self.identifier)
            .field("operation", &self.operation_name())
            .field("array", &self.array)
            .field("requires_gradient", &self.requires_gradient)
            .field("gradient", &self.gradient)
            .finish()
    }
}

impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.serial_number.hash(state);
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.serial_number == other.serial_number
    }
}

impl Eq for Tensor {}

impl Tensor {
    /// Wraps nested numeric data in a leaf tensor that does not require a
    /// gradient. Ragged nesting is rejected.
    pub fn from_nested(data: impl Into<NestedData>) -> Result<Rc<Tensor>> {
        Ok(Rc::new(TensorBuilder::from_nested(data)?.build()))
    }

    /// A bare number is treated as the one-element vector `[x]`.
    pub fn scalar(value: f64) -> Rc<Tensor> {
        Rc::new(TensorBuilder::new(array![value].into_dyn()).build())
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn requires_gradient(&self) -> bool {
        self.requires_gradient
    }

    pub fn borrow_array(&self) -> Ref<'_, ArrayD<f64>> {
        self.array.borrow()
    }

    /// Callers must preserve the shape; the gradient buffer is sized once at
    /// construction.
    ///
    /// # Panics
    ///
    /// Replacing the array with one of a different shape is not caught here.
    /// A later [`backprop`] through this tensor panics when the gradient
    /// contribution no longer matches the gradient buffer.
    pub fn borrow_array_mut(&self) -> RefMut<'_, ArrayD<f64>> {
        self.array.borrow_mut()
    }

    pub fn borrow_gradient(&self) -> Ref<'_, ArrayD<f64>> {
        self.gradient.borrow()
    }

    pub fn shape(&self) -> Vec<usize> {
        self.array.borrow().shape().to_vec()
    }

    pub fn len(&self) -> usize {
        self.array.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The first element; `NaN` for an empty tensor.
    pub fn item(&self) -> f64 {
        self.array.borrow().iter().next().copied().unwrap_or(f64::NAN)
    }

    /// Empty for leaves.
    pub fn operation_name(&self) -> &'static str {
        match &self.origin {
            Some(origin) => origin.operation.name(),
            None => "",
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.origin.is_none()
    }

    pub fn parents(&self) -> Vec<Rc<Tensor>> {
        match &self.origin {
            Some(origin) => origin.parents.clone(),
            None => Vec::new(),
        }
    }

    pub fn zero_gradient(&self) {
        self.gradient.borrow_mut().fill(0.);
    }

    fn accumulate_gradient(&self, contribution: &ArrayD<f64>) {
        let mut gradient = self.gradient.borrow_mut();
        assert_eq!(
            gradient.shape(),
            contribution.shape(),
            "gradient contribution for {} has the wrong shape",
            self.identifier
        );
        *gradient += contribution;
    }
}

/// Options bundle for constructing a leaf tensor: the array, an optional
/// identifier, whether it requires a gradient (default `false`), and an
/// optional initial gradient.
///
/// The operands and operation tag of a tensor are recorded only by the
/// differentiable operations themselves; they cannot be set from outside the
/// crate, so every tensor built here is a leaf.
pub struct TensorBuilder {
    array: ArrayD<f64>,
    identifier: Option<String>,
    requires_gradient: bool,
    gradient: Option<ArrayD<f64>>,
    origin: Option<Origin>,
}

impl TensorBuilder {
    pub fn new(array: ArrayD<f64>) -> TensorBuilder {
        TensorBuilder {
            array,
            identifier: None,
            requires_gradient: false,
            gradient: None,
            origin: None,
        }
    }

    pub fn from_nested(data: impl Into<NestedData>) -> Result<TensorBuilder> {
        Ok(Self::new(data.into().into_array()?))
    }

    pub fn identifier(mut self, identifier: &str) -> TensorBuilder {
        self.identifier = Some(identifier.to_owned());
        self
    }

    pub fn requires_gradient(mut self, requires: bool) -> TensorBuilder {
        self.requires_gradient = requires;
        self
    }

    /// Starts the gradient buffer somewhere other than zero; it must match
    /// the array's shape.
    pub fn gradient(mut self, gradient: ArrayD<f64>) -> TensorBuilder {
        self.gradient = Some(gradient);
        self
    }

    fn origin(mut self, origin: Origin) -> TensorBuilder {
        self.origin = Some(origin);
        self
    }

    /// # Panics
    ///
    /// Panics if an initial gradient was given whose shape differs from the
    /// array's.
    pub fn build(self) -> Tensor {
        let gradient = match self.gradient {
            Some(gradient) => {
                assert_eq!(
                    gradient.shape(),
                    self.array.shape(),
                    "initial gradient must match array shape"
                );
                gradient
            }
            None => Array::zeros(self.array.raw_dim()),
        };
        let serial_number = generate_serial_number();
        Tensor {
            serial_number,
            identifier: match self.identifier {
                Some(identifier) => identifier,
                None => format!("Tensor{}", serial_number),
            },
            array: RefCell::new(self.array),
            requires_gradient: self.requires_gradient,
            gradient: RefCell::new(gradient),
            origin: self.origin,
        }
    }
}

struct Origin {
    operation: Operation,
    parents: Vec<Rc<Tensor>>,
}

fn register_parents(
    sorter: &mut TopologicalSort<Rc<Tensor>>,
    visited: &mut HashSet<u64>,
    child: &Rc<Tensor>,
) {
    if !visited.insert(child.serial_number) {
        return;
    }
    if let Some(origin) = &child.origin {
        for parent in &origin.parents {
            sorter.add_dependency(parent.clone(), child.clone());
            register_parents(sorter, visited, parent);
        }
    }
}

fn sorted_computation_graph(end: &Rc<Tensor>) -> Vec<Rc<Tensor>> {
    if end.is_leaf() {
        return vec![end.clone()];
    }
    let mut sorter = TopologicalSort::new();
    let mut visited = HashSet::new();
    register_parents(&mut sorter, &mut visited, end);
    let mut sorted = sorter.collect::<Vec<_>>();
    // We actually want reverse-topological order
    sorted.reverse();
    sorted
}

/// Computes d(culmination)/d(tensor) for every tensor in the graph that
/// requires a gradient, adding into whatever those gradients already hold.
///
/// The culmination must hold exactly one element.
pub fn backprop(culmination: &Rc<Tensor>) -> Result<()> {
    if culmination.len() != 1 {
        return Err(EngineError::NonScalarCulmination(culmination.shape()));
    }
    backprop_summed(culmination)
}

/// Like [`backprop`], but seeds every element of the culmination with one,
/// which yields the gradient of the *sum* of its elements.
pub fn backprop_summed(culmination: &Rc<Tensor>) -> Result<()> {
    let sorted = sorted_computation_graph(culmination);
    // Intermediate buffers hold only this traversal's contributions; leaves
    // keep accumulating.
    for node in &sorted {
        if !node.is_leaf() {
            node.zero_gradient();
        }
    }
    *culmination.gradient.borrow_mut() = Array::ones(culmination.array.borrow().raw_dim());

    for node in sorted {
        let Some(origin) = &node.origin else {
            continue;
        };
        trace!(
            "backpropagating through {} ({})",
            node.identifier,
            origin.operation.name()
        );
        let out_gradient = node.gradient.borrow().clone();
        for (i, parent) in origin.parents.iter().enumerate() {
            if !parent.requires_gradient {
                continue;
            }
            let contribution = origin
                .operation
                .backward(&out_gradient, &origin.parents, i)?;
            parent.accumulate_gradient(&contribution);
        }
    }
    Ok(())
}
