use sequent_core::backends::{cpu::CpuTensor, Tensor};
use sequent_core::nn::activations::Activation;
use sequent_core::nn::layers::Dense;
use sequent_core::nn::losses::BinaryCrossEntropy;
use sequent_core::nn::optimizers::Sgd;
use sequent_core::{Sequential, TrainConfig};

use ndarray::array;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;

const CONFIG_PATH: &str = "train_config.json";
const WEIGHTS_PATH: &str = "xor_weights.txt";
const EPOCHS: usize = 20000;

fn main() -> sequent_core::Result<()> {
    let config = if Path::new(CONFIG_PATH).exists() {
        println!("Config loaded from {}", CONFIG_PATH);
        TrainConfig::from_json_file(CONFIG_PATH)?
    } else {
        TrainConfig { verbose: false, ..TrainConfig::default() }
    };

    let rows = [([0.0, 0.0], 0.0), ([0.0, 1.0], 1.0), ([1.0, 0.0], 1.0), ([1.0, 1.0], 0.0)];
    let inputs: Vec<CpuTensor<f32>> = rows.iter().map(|(x, _)| CpuTensor::new(array![[x[0], x[1]]].into_dyn())).collect();
    let labels: Vec<CpuTensor<f32>> = rows.iter().map(|(_, y)| CpuTensor::new(array![[*y]].into_dyn())).collect();

    let mut rng = StdRng::seed_from_u64(0);
    let mut model = Sequential::<f32, CpuTensor<f32>>::with_config(config);
    model
        .add(Dense::with_rng(2, 4, Activation::Sigmoid, &mut rng).named("hidden"))
        .add(Dense::with_rng(4, 1, Activation::Sigmoid, &mut rng).named("output"));
    model.compile(BinaryCrossEntropy::default(), Sgd::new(0.01, 0.0));

    print!("{}", model.summary(&[1, 2])?);

    if Path::new(WEIGHTS_PATH).exists() {
        model.load_weights(WEIGHTS_PATH)?;
        println!("Weights loaded from {}", WEIGHTS_PATH);
    }

    println!("Training model...");
    let history = model.fit(&inputs, &labels, EPOCHS)?;
    for (epoch, loss) in history.losses.iter().enumerate().step_by(2500) {
        println!("epoch {:>5}: loss {:.5}", epoch + 1, loss);
    }
    println!("final loss {:.5} after {:.2?}", history.final_loss().unwrap_or(f32::NAN), history.elapsed);

    println!("Testing model...");
    for (input, label) in inputs.iter().zip(&labels) {
        let output = model.predict(input)?;
        println!(
            "{:?} -> {:.3} (target {})",
            input.get_data().iter().collect::<Vec<_>>(),
            output.get_data()[[0, 0]],
            label.get_data()[[0, 0]]
        );
    }

    model.save_weights(WEIGHTS_PATH)?;
    println!("Weights saved to {}", WEIGHTS_PATH);
    Ok(())
}
