use std::fmt;
use std::rc::Rc;
use std::str::FromStr;
use std::time;

use log::{debug, info};
use ndarray::prelude::*;
use rand::prelude::*;
use rand_distr::Normal;

use super::dense::{Layer, Sequential};
use super::loss::Loss;
use super::optimization::{Optimizer, StochasticGradientDescentOptimizer};
use super::{backprop, Tensor, TensorBuilder};
use crate::error::{EngineError, Result};

/// Two-dimensional binary classification problems for the demo trainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dataset {
    /// Label 1 above the line `x₁ + x₂ = 0`; linearly separable.
    HalfPlane,
    /// Label 1 inside a circle of radius 0.5.
    Circle,
    /// Label 1 when the coordinates have opposite signs.
    Xor,
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dataset::HalfPlane => "halfplane",
            Dataset::Circle => "circle",
            Dataset::Xor => "xor",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Dataset {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "halfplane" => Ok(Dataset::HalfPlane),
            "circle" => Ok(Dataset::Circle),
            "xor" => Ok(Dataset::Xor),
            other => Err(EngineError::InvalidHyperparameter(format!(
                "unknown dataset {:?} (expected halfplane, circle, or xor)",
                other
            ))),
        }
    }
}

/// Samples points uniformly from `[-1, 1]²`, with a little Gaussian jitter
/// for the circle, and returns `(inputs, targets)` shaped `[n, 2]` and
/// `[n, 1]`.
pub fn generate_data<R: Rng + ?Sized>(
    dataset: Dataset,
    sample_count: usize,
    rng: &mut R,
) -> (Array2<f64>, Array2<f64>) {
    let mut inputs = Array2::zeros((sample_count, 2));
    let mut targets = Array2::zeros((sample_count, 1));
    let jitter = Normal::new(0., 0.05).expect("standard deviation is positive");
    for i in 0..sample_count {
        let x1: f64 = rng.gen_range(-1.0..=1.0);
        let x2: f64 = rng.gen_range(-1.0..=1.0);
        let label = match dataset {
            Dataset::HalfPlane => x1 + x2 > 0.,
            Dataset::Circle => {
                let radius = (x1 * x1 + x2 * x2).sqrt() + jitter.sample(&mut *rng);
                radius < 0.5
            }
            Dataset::Xor => (x1 > 0.) != (x2 > 0.),
        };
        inputs[[i, 0]] = x1;
        inputs[[i, 1]] = x2;
        targets[[i, 0]] = label as u8 as f64;
    }
    (inputs, targets)
}

pub struct TrainingConfiguration {
    pub dataset: Dataset,
    pub hidden_dimensionalities: Vec<usize>,
    pub learning_rate: f64,
    pub step_count: usize,
    pub sample_count: usize,
    pub seed: u64,
    /// Log progress every this many steps; zero disables it.
    pub status_interval: usize,
}

impl Default for TrainingConfiguration {
    fn default() -> Self {
        Self {
            dataset: Dataset::Circle,
            hidden_dimensionalities: vec![8, 8],
            learning_rate: 0.1,
            step_count: 500,
            sample_count: 200,
            seed: 0,
            status_interval: 50,
        }
    }
}

impl TrainingConfiguration {
    pub fn layer_dimensionalities(&self) -> Vec<usize> {
        let mut dimensionalities = vec![2];
        dimensionalities.extend(&self.hidden_dimensionalities);
        dimensionalities.push(1);
        dimensionalities
    }
}

pub struct TrainingReport {
    pub network: Sequential,
    pub losses: Vec<f64>,
    pub inputs: Array2<f64>,
    pub targets: Array2<f64>,
}

impl TrainingReport {
    pub fn final_loss(&self) -> Option<f64> {
        self.losses.last().copied()
    }
}

/// Full-batch training: the whole dataset is one tensor per step.
pub fn train(configuration: &TrainingConfiguration) -> Result<TrainingReport> {
    let mut rng = StdRng::seed_from_u64(configuration.seed);
    let (inputs, targets) =
        generate_data(configuration.dataset, configuration.sample_count, &mut rng);
    let network = Sequential::perceptron(
        &format!("{}_perceptron", configuration.dataset),
        &configuration.layer_dimensionalities(),
        &mut rng,
    );
    debug!(
        "training {} parameters on {} {} samples",
        network.parameter_count(),
        configuration.sample_count,
        configuration.dataset
    );
    let mut optimizer = StochasticGradientDescentOptimizer::new(
        network.parameters(),
        configuration.learning_rate,
    )?;

    let x = Rc::new(TensorBuilder::new(inputs.clone().into_dyn()).build());
    let y = Rc::new(TensorBuilder::new(targets.clone().into_dyn()).build());

    let start_time = time::Instant::now();
    let mut losses = Vec::with_capacity(configuration.step_count);
    for _ in 0..configuration.step_count {
        network.zero_gradients();
        let prediction = network.forward(x.clone())?;
        let loss = Loss::mse(&prediction, &y)?;
        backprop(&loss)?;
        optimizer.step();

        let loss_value = loss.item();
        losses.push(loss_value);
        if configuration.status_interval > 0
            && optimizer.step_count() % configuration.status_interval == 0
        {
            info!(
                "after {:.2}s, {} steps, loss: {}",
                start_time.elapsed().as_secs_f64(),
                optimizer.step_count(),
                loss_value
            );
        }
    }

    Ok(TrainingReport {
        network,
        losses,
        inputs,
        targets,
    })
}

/// Network output for a single point.
pub fn predict(network: &dyn Layer, x1: f64, x2: f64) -> Result<f64> {
    let input = Tensor::from_nested([[x1, x2]])?;
    Ok(network.forward(input)?.item())
}

/// Fraction of samples whose output lands on the right side of ½, judged
/// one sample at a time.
///
/// Inputs must be `[n, 2]` and targets `[n, 1]`.
pub fn accuracy(
    network: &dyn Layer,
    inputs: &Array2<f64>,
    targets: &Array2<f64>,
) -> Result<f64> {
    if inputs.ncols() != 2 {
        return Err(EngineError::ShapeMismatch(
            inputs.shape().to_vec(),
            vec![inputs.nrows(), 2],
        ));
    }
    if targets.shape() != [inputs.nrows(), 1] {
        return Err(EngineError::ShapeMismatch(
            targets.shape().to_vec(),
            vec![inputs.nrows(), 1],
        ));
    }
    if inputs.nrows() == 0 {
        return Err(EngineError::EmptyTensor);
    }
    let mut correct = 0;
    for (row, target) in inputs.rows().into_iter().zip(targets.column(0)) {
        let output = predict(network, row[0], row[1])?;
        if (output > 0.5) == (*target > 0.5) {
            correct += 1;
        }
    }
    Ok(correct as f64 / inputs.nrows() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_means(losses: &[f64], window: usize) -> Vec<f64> {
        losses
            .chunks_exact(window)
            .map(|chunk| chunk.iter().sum::<f64>() / window as f64)
            .collect()
    }

    #[test]
    fn test_halfplane_labels() {
        let mut rng = StdRng::seed_from_u64(1);
        let (inputs, targets) = generate_data(Dataset::HalfPlane, 500, &mut rng);
        assert_eq!(inputs.shape(), &[500, 2]);
        assert_eq!(targets.shape(), &[500, 1]);
        for (row, target) in inputs.rows().into_iter().zip(targets.column(0)) {
            assert!(row.iter().all(|x| (-1.0..=1.0).contains(x)));
            assert_eq!(*target, ((row[0] + row[1]) > 0.) as u8 as f64);
        }
    }

    #[test]
    fn test_xor_labels() {
        let mut rng = StdRng::seed_from_u64(2);
        let (inputs, targets) = generate_data(Dataset::Xor, 500, &mut rng);
        for (row, target) in inputs.rows().into_iter().zip(targets.column(0)) {
            let expected = ((row[0] > 0.) != (row[1] > 0.)) as u8 as f64;
            assert_eq!(*target, expected, "XOR output should be correct");
        }
    }

    #[test]
    fn test_circle_labels_are_binary_and_mostly_central() {
        let mut rng = StdRng::seed_from_u64(3);
        let (inputs, targets) = generate_data(Dataset::Circle, 500, &mut rng);
        for (row, target) in inputs.rows().into_iter().zip(targets.column(0)) {
            assert!(*target == 0. || *target == 1.);
            let radius = (row[0] * row[0] + row[1] * row[1]).sqrt();
            if radius > 0.8 {
                assert_eq!(*target, 0.);
            }
        }
    }

    #[test]
    fn test_dataset_names_round_trip() {
        for dataset in [Dataset::HalfPlane, Dataset::Circle, Dataset::Xor] {
            assert_eq!(dataset.to_string().parse::<Dataset>(), Ok(dataset));
        }
        assert!("spiral".parse::<Dataset>().is_err());
    }

    #[test]
    fn test_training_converges_on_separable_data() {
        let configuration = TrainingConfiguration {
            dataset: Dataset::HalfPlane,
            hidden_dimensionalities: vec![4],
            learning_rate: 0.05,
            step_count: 400,
            sample_count: 100,
            seed: 2024,
            status_interval: 0,
        };
        let report = train(&configuration).unwrap();
        assert_eq!(report.losses.len(), 400);

        let means = window_means(&report.losses, 20);
        assert!(
            means.last().unwrap() < means.first().unwrap(),
            "20-step averages should fall over the run: {:?}",
            means
        );
        for pair in means.windows(2) {
            assert!(
                pair[1] <= pair[0] + 1e-9,
                "20-step average rose: {:?}",
                means
            );
        }
    }

    #[test]
    fn test_trained_network_classifies_separable_data() {
        let configuration = TrainingConfiguration {
            dataset: Dataset::HalfPlane,
            hidden_dimensionalities: vec![4],
            learning_rate: 0.1,
            step_count: 1000,
            sample_count: 100,
            seed: 7,
            status_interval: 0,
        };
        let report = train(&configuration).unwrap();
        let score = accuracy(&report.network, &report.inputs, &report.targets).unwrap();
        assert!(score > 0.8, "accuracy was {}", score);
    }

    #[test]
    fn test_accuracy_of_empty_dataset() {
        let network = Sequential::perceptron("empty", &[2, 1], &mut StdRng::seed_from_u64(0));
        assert_eq!(
            accuracy(&network, &Array2::zeros((0, 2)), &Array2::zeros((0, 1))),
            Err(EngineError::EmptyTensor)
        );
    }

    #[test]
    fn test_accuracy_rejects_misshapen_inputs() {
        let network = Sequential::perceptron("narrow", &[2, 1], &mut StdRng::seed_from_u64(0));
        assert_eq!(
            accuracy(&network, &Array2::zeros((3, 1)), &Array2::zeros((3, 1))),
            Err(EngineError::ShapeMismatch(vec![3, 1], vec![3, 2]))
        );
    }

    #[test]
    fn test_accuracy_rejects_mismatched_row_counts() {
        let network = Sequential::perceptron("rows", &[2, 1], &mut StdRng::seed_from_u64(0));
        assert_eq!(
            accuracy(&network, &Array2::zeros((4, 2)), &Array2::zeros((2, 1))),
            Err(EngineError::ShapeMismatch(vec![2, 1], vec![4, 1]))
        );
        assert_eq!(
            accuracy(&network, &Array2::zeros((2, 2)), &Array2::zeros((2, 2))),
            Err(EngineError::ShapeMismatch(vec![2, 2], vec![2, 1]))
        );
    }
}
