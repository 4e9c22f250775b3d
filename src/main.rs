use std::env;
use std::error::Error;

use log::info;

use microtensor::engine::demo::{accuracy, train, Dataset, TrainingConfiguration};
use microtensor::Layer;

const INSTRUCTIONS: &str = "pass `--train`, optionally followed by \
`--dataset [halfplane|circle|xor]`, `--steps N`, `--samples N`, \
`--learning-rate X`, `--hidden N,N,...`, or `--seed N`";

fn parse_configuration(args: &[String]) -> Result<TrainingConfiguration, Box<dyn Error>> {
    let mut configuration = TrainingConfiguration::default();
    let mut flags = args.iter();
    while let Some(flag) = flags.next() {
        let value = flags
            .next()
            .ok_or_else(|| format!("{} needs a value", flag))?;
        match flag.as_str() {
            "--dataset" => configuration.dataset = value.parse::<Dataset>()?,
            "--steps" => configuration.step_count = value.parse()?,
            "--samples" => configuration.sample_count = value.parse()?,
            "--learning-rate" => configuration.learning_rate = value.parse()?,
            "--seed" => configuration.seed = value.parse()?,
            "--status-interval" => configuration.status_interval = value.parse()?,
            "--hidden" => {
                configuration.hidden_dimensionalities = value
                    .split(',')
                    .filter(|part| !part.is_empty())
                    .map(str::parse)
                    .collect::<Result<Vec<usize>, _>>()?
            }
            _ => return Err(format!("unrecognized flag {}", flag).into()),
        }
    }
    Ok(configuration)
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = env::args().collect::<Vec<_>>();

    if args.len() <= 1 || args[1] != "--train" {
        println!("{}", INSTRUCTIONS);
        return Ok(());
    }

    let configuration = parse_configuration(&args[2..])?;
    info!(
        "training a {:?} perceptron on {} for {} steps",
        configuration.layer_dimensionalities(),
        configuration.dataset,
        configuration.step_count
    );
    let report = train(&configuration)?;
    println!(
        "network trained! {} parameters, final loss: {:?}",
        report.network.parameter_count(),
        report.final_loss()
    );
    println!(
        "training accuracy: {:.3}",
        accuracy(&report.network, &report.inputs, &report.targets)?
    );
    println!(
        "{} layers holding {} parameter tensors",
        report.network.len(),
        report.network.parameters().len()
    );
    Ok(())
}
