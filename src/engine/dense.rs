use std::rc::Rc;

use log::debug;
use ndarray::prelude::*;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;

use super::operations::TensorOps;
use super::{Tensor, TensorBuilder};
use crate::error::{EngineError, Result};

/// A differentiable function of one tensor, possibly with trainable
/// parameters.
pub trait Layer {
    fn forward(&self, input: Rc<Tensor>) -> Result<Rc<Tensor>>;

    fn parameters(&self) -> Vec<Rc<Tensor>>;

    /// Must run before each training step; gradients otherwise keep
    /// accumulating across steps.
    fn zero_gradients(&self) {
        for parameter in self.parameters() {
            parameter.zero_gradient();
        }
    }
}

/// Affine map `input · weights + biases`, with weights shaped
/// `[in, out]` and biases `[1, out]` (broadcast across the batch).
pub struct Dense {
    identifier: String,
    weights: Rc<Tensor>,
    biases: Rc<Tensor>,
}

impl Dense {
    pub fn from_weights(
        identifier: &str,
        weights: ArrayD<f64>,
        biases: ArrayD<f64>,
    ) -> Result<Dense> {
        if weights.ndim() != 2 {
            return Err(EngineError::NotTwoDimensional(weights.shape().to_vec()));
        }
        let expected_biases_shape = vec![1, weights.shape()[1]];
        if biases.shape() != expected_biases_shape.as_slice() {
            return Err(EngineError::ShapeMismatch(
                biases.shape().to_vec(),
                expected_biases_shape,
            ));
        }
        Ok(Self::assemble(identifier, weights, biases))
    }

    pub fn new(identifier: &str, in_dimensionality: usize, out_dimensionality: usize) -> Dense {
        Self::new_using(
            identifier,
            in_dimensionality,
            out_dimensionality,
            &mut rand::thread_rng(),
        )
    }

    /// Glorot-uniform weights drawn from `rng`; zero biases.
    pub fn new_using<R: Rng + ?Sized>(
        identifier: &str,
        in_dimensionality: usize,
        out_dimensionality: usize,
        rng: &mut R,
    ) -> Dense {
        let fan = in_dimensionality + out_dimensionality;
        let limit = if fan == 0 {
            0.
        } else {
            (6. / fan as f64).sqrt()
        };
        let weights = Array::random_using(
            (in_dimensionality, out_dimensionality),
            Uniform::new_inclusive(-limit, limit),
            rng,
        )
        .into_dyn();
        let biases = Array::zeros((1, out_dimensionality)).into_dyn();

        debug!(
            "creating Dense layer {} with weights shape {:?} and biases shape {:?}",
            identifier,
            (in_dimensionality, out_dimensionality),
            (1, out_dimensionality)
        );
        Self::assemble(identifier, weights, biases)
    }

    fn assemble(identifier: &str, weights: ArrayD<f64>, biases: ArrayD<f64>) -> Dense {
        Dense {
            identifier: identifier.to_owned(),
            weights: Rc::new(
                TensorBuilder::new(weights)
                    .requires_gradient(true)
                    .identifier(&format!("{}_weights", identifier))
                    .build(),
            ),
            biases: Rc::new(
                TensorBuilder::new(biases)
                    .requires_gradient(true)
                    .identifier(&format!("{}_biases", identifier))
                    .build(),
            ),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn weights(&self) -> &Rc<Tensor> {
        &self.weights
    }

    pub fn biases(&self) -> &Rc<Tensor> {
        &self.biases
    }

    pub fn in_dimensionality(&self) -> usize {
        self.weights.borrow_array().shape()[0]
    }

    pub fn out_dimensionality(&self) -> usize {
        self.weights.borrow_array().shape()[1]
    }
}

impl Layer for Dense {
    fn forward(&self, input: Rc<Tensor>) -> Result<Rc<Tensor>> {
        input.matmul(&self.weights)?.add(&self.biases)
    }

    fn parameters(&self) -> Vec<Rc<Tensor>> {
        vec![self.weights.clone(), self.biases.clone()]
    }
}

/// Parameter-free nonlinearities, for slotting between dense layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    RectifiedLinearUnit,
}

impl Layer for Activation {
    fn forward(&self, input: Rc<Tensor>) -> Result<Rc<Tensor>> {
        match self {
            Activation::RectifiedLinearUnit => input.relu(),
        }
    }

    fn parameters(&self) -> Vec<Rc<Tensor>> {
        Vec::new()
    }
}

/// Layers applied in order. Nothing is inserted between them: a stack of
/// dense layers without activations is still just an affine map, and that's
/// the caller's call to make.
pub struct Sequential {
    identifier: String,
    layers: Vec<Box<dyn Layer>>,
}

impl Sequential {
    pub fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_owned(),
            layers: Vec::new(),
        }
    }

    /// Dense layers of the given dimensionalities, with a ReLU after every
    /// layer but the last.
    pub fn perceptron<R: Rng + ?Sized>(
        identifier: &str,
        layer_dimensionalities: &[usize],
        rng: &mut R,
    ) -> Self {
        let mut network = Self::new(identifier);
        let layer_count = layer_dimensionalities.len().saturating_sub(1);
        for (i, window) in layer_dimensionalities.windows(2).enumerate() {
            let &[in_dimensionality, out_dimensionality] = window else {
                unreachable!("windows(2) yields pairs")
            };
            network.push(Dense::new_using(
                &format!("{}_layer_{}", identifier, i),
                in_dimensionality,
                out_dimensionality,
                rng,
            ));
            if i + 1 < layer_count {
                network.push(Activation::RectifiedLinearUnit);
            }
        }
        network
    }

    pub fn add(mut self, layer: impl Layer + 'static) -> Self {
        self.push(layer);
        self
    }

    pub fn push(&mut self, layer: impl Layer + 'static) {
        self.layers.push(Box::new(layer));
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters()
            .iter()
            .map(|parameter| parameter.len())
            .sum()
    }
}

impl Layer for Sequential {
    fn forward(&self, input: Rc<Tensor>) -> Result<Rc<Tensor>> {
        let mut x = input;
        for layer in &self.layers {
            x = layer.forward(x)?;
        }
        Ok(x)
    }

    fn parameters(&self) -> Vec<Rc<Tensor>> {
        self.layers
            .iter()
            .flat_map(|layer| layer.parameters())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::backprop;
    use crate::engine::loss::Loss;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_network(seed: u64) -> Sequential {
        Sequential::perceptron("net", &[3, 4, 2], &mut StdRng::seed_from_u64(seed))
    }

    fn loss_of(network: &Sequential, input: &ArrayD<f64>, target: &ArrayD<f64>) -> Rc<Tensor> {
        let prediction = network
            .forward(Rc::new(TensorBuilder::new(input.clone()).build()))
            .unwrap();
        Loss::mse(&prediction, &Rc::new(TensorBuilder::new(target.clone()).build())).unwrap()
    }

    #[test]
    fn test_dense_forward() {
        let weights = array![[0.1, 0.3, -0.5], [-0.2, 0.4, 0.6]].into_dyn();
        let biases = array![[0.1, -0.2, 0.3]].into_dyn();
        let dense = Dense::from_weights("test_dense", weights, biases).unwrap();

        let input = Tensor::from_nested([[1.0, 2.0]]).unwrap();
        let output = dense.forward(input).unwrap();

        // [1·0.1 + 2·-0.2 + 0.1, 1·0.3 + 2·0.4 − 0.2, 1·-0.5 + 2·0.6 + 0.3]
        assert_abs_diff_eq!(
            *output.borrow_array(),
            array![[-0.2, 0.9, 1.0]].into_dyn(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_dense_rejects_misshapen_biases() {
        let result = Dense::from_weights(
            "bad",
            array![[1., 2.], [3., 4.]].into_dyn(),
            array![1., 2.].into_dyn(),
        );
        assert_eq!(
            result.err(),
            Some(EngineError::ShapeMismatch(vec![2], vec![1, 2]))
        );
    }

    #[test]
    fn test_dense_initialization() {
        let dense = Dense::new_using("init", 5, 3, &mut StdRng::seed_from_u64(7));
        assert_eq!(dense.weights().shape(), vec![5, 3]);
        assert_eq!(dense.biases().shape(), vec![1, 3]);
        assert_eq!(dense.in_dimensionality(), 5);
        assert_eq!(dense.out_dimensionality(), 3);
        let limit = (6.0_f64 / 8.).sqrt();
        assert!(dense.weights().borrow_array().iter().all(|w| w.abs() <= limit));
        assert!(dense.biases().borrow_array().iter().all(|&b| b == 0.));
        assert!(dense.weights().requires_gradient());
        assert_eq!(dense.weights().identifier(), "init_weights");
        assert_eq!(dense.biases().identifier(), "init_biases");
    }

    #[test]
    fn test_same_seed_same_network() {
        let a = small_network(11);
        let b = small_network(11);
        for (p, q) in a.parameters().iter().zip(b.parameters().iter()) {
            assert_eq!(*p.borrow_array(), *q.borrow_array());
        }
    }

    #[test]
    fn test_sequential_parameter_order() {
        let network = small_network(1);
        let identifiers = network
            .parameters()
            .iter()
            .map(|p| p.identifier().to_owned())
            .collect::<Vec<_>>();
        assert_eq!(
            identifiers,
            vec![
                "net_layer_0_weights",
                "net_layer_0_biases",
                "net_layer_1_weights",
                "net_layer_1_biases"
            ]
        );
        assert_eq!(network.len(), 3); // dense, relu, dense
        assert_eq!(network.parameter_count(), 3 * 4 + 4 + 4 * 2 + 2);
        // stable across calls
        assert_eq!(network.parameters(), network.parameters());
    }

    #[test]
    fn test_sequential_without_activations_is_allowed() {
        let mut rng = StdRng::seed_from_u64(3);
        let network = Sequential::new("linear")
            .add(Dense::new_using("a", 2, 3, &mut rng))
            .add(Dense::new_using("b", 3, 3, &mut rng))
            .add(Dense::new_using("c", 3, 1, &mut rng));
        let output = network
            .forward(Tensor::from_nested([[0.5, -0.5]]).unwrap())
            .unwrap();
        assert_eq!(output.shape(), vec![1, 1]);
        assert_eq!(network.parameters().len(), 6);
    }

    #[test]
    fn test_forward_dimension_mismatch_propagates() {
        let network = small_network(2);
        let input = Tensor::from_nested([[1., 2.]]).unwrap();
        assert!(matches!(
            network.forward(input),
            Err(EngineError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let network = small_network(42);
        let input = array![[0.3, -1.2, 0.8]].into_dyn();
        let target = array![[0.5, -0.25]].into_dyn();

        network.zero_gradients();
        backprop(&loss_of(&network, &input, &target)).unwrap();

        let h = 1e-6;
        for parameter in network.parameters() {
            let analytic = parameter.borrow_gradient().clone();
            for index in 0..parameter.len() {
                let original = parameter.borrow_array().as_slice().unwrap()[index];

                parameter.borrow_array_mut().as_slice_mut().unwrap()[index] = original + h;
                let above = loss_of(&network, &input, &target).item();
                parameter.borrow_array_mut().as_slice_mut().unwrap()[index] = original - h;
                let below = loss_of(&network, &input, &target).item();
                parameter.borrow_array_mut().as_slice_mut().unwrap()[index] = original;

                let numerical = (above - below) / (2. * h);
                assert_abs_diff_eq!(
                    analytic.as_slice().unwrap()[index],
                    numerical,
                    epsilon = 1e-4
                );
            }
        }
    }

    #[test]
    fn test_zero_gradients_isolates_steps() {
        let first_batch = array![[1., 2., 3.]].into_dyn();
        let second_batch = array![[-0.5, 0.25, 2.]].into_dyn();
        let target = array![[1., 0.]].into_dyn();

        let reused = small_network(5);
        backprop(&loss_of(&reused, &first_batch, &target)).unwrap();
        reused.zero_gradients();
        backprop(&loss_of(&reused, &second_batch, &target)).unwrap();

        let fresh = small_network(5);
        backprop(&loss_of(&fresh, &second_batch, &target)).unwrap();

        for (p, q) in reused.parameters().iter().zip(fresh.parameters().iter()) {
            assert_eq!(*p.borrow_gradient(), *q.borrow_gradient());
        }
    }

    #[test]
    fn test_bias_gradient_sums_over_batch() {
        // With identity weights and zero bias the prediction is the input,
        // so dL/dprediction = 2/n · (input − target) and the bias gradient
        // is that summed over the batch rows.
        let dense = Dense::from_weights(
            "identity",
            array![[1., 0.], [0., 1.]].into_dyn(),
            array![[0., 0.]].into_dyn(),
        )
        .unwrap();
        let input = Tensor::from_nested([[1., 2.], [3., 4.], [5., 6.]]).unwrap();
        let target = Tensor::from_nested([[0., 0.], [0., 0.], [0., 0.]]).unwrap();
        let loss = Loss::mse(&dense.forward(input).unwrap(), &target).unwrap();
        backprop(&loss).unwrap();

        // n = 6: per-element gradient is x/3
        assert_relative_eq!(
            *dense.biases().borrow_gradient(),
            array![[9. / 3., 12. / 3.]].into_dyn(),
            epsilon = 1e-12
        );
        assert_eq!(dense.biases().borrow_gradient().shape(), &[1, 2]);
    }

    #[test]
    fn test_batch_gradient_equals_sum_of_single_sample_gradients() {
        // MSE averages over every element, so a batch of m rows produces
        // 1/m times the sum of the per-row gradients.
        let rows = [[0.3, -1.2, 0.8], [1.0, 0.5, -0.5]];
        let targets = [[0.5, -0.25], [0., 1.]];

        let batched = small_network(9);
        backprop(&loss_of(
            &batched,
            &arr2(&rows).into_dyn(),
            &arr2(&targets).into_dyn(),
        ))
        .unwrap();

        let single = small_network(9);
        for (row, target) in rows.iter().zip(targets.iter()) {
            backprop(&loss_of(
                &single,
                &arr2(&[*row]).into_dyn(),
                &arr2(&[*target]).into_dyn(),
            ))
            .unwrap();
        }

        for (p, q) in batched.parameters().iter().zip(single.parameters().iter()) {
            let halved = &*q.borrow_gradient() / 2.;
            assert_abs_diff_eq!(*p.borrow_gradient(), halved, epsilon = 1e-12);
        }
    }
}
