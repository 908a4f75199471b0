use anyhow::{Context, Result};
use std::{env, path::PathBuf};
use templar::{
    dataset::load_npy_dir,
    experiment::AttackConfig,
    guessing_entropy::ExperimentConfig,
    template::CovarianceMode,
};

// ChipWhisperer campaign: 5000 traces, the first 4000 for profiling
const TARGET_BYTE: usize = 0;
const PROFILING_TRACES: usize = 4000;
const ATTACK_TRACES: usize = 1000;

fn main() -> Result<()> {
    let traces_dir =
        PathBuf::from(env::var("TRACES_DIR").context("Missing TRACES_DIR environment variable")?);

    let dataset = load_npy_dir::<f64, _>(
        &traces_dir,
        TARGET_BYTE,
        0..PROFILING_TRACES,
        PROFILING_TRACES..PROFILING_TRACES + ATTACK_TRACES,
    )
    .context("Failed to load the campaign")?;

    let mut config = AttackConfig {
        covariance_mode: CovarianceMode::Pooled,
        estimation: ExperimentConfig {
            number_of_experiments: 100,
            random_seed: Some(0),
            ..Default::default()
        },
        ..Default::default()
    };
    // Optional JSON overrides
    if let Ok(path) = env::var("ATTACK_CONFIG") {
        let file = std::fs::File::open(&path).with_context(|| format!("Failed to open {path}"))?;
        config = serde_json::from_reader(file).context("Invalid attack configuration")?;
    }

    let metrics = config.run(&dataset)?;

    match metrics.traces_to_guessing_entropy(0.) {
        Some(n) => println!("Key recovered with {n} traces"),
        None => println!(
            "Key not recovered, final guessing entropy {:.2}",
            metrics.guessing_entropy()[metrics.len() - 1]
        ),
    }
    metrics.save_curves(&traces_dir)?;
    metrics.save(traces_dir.join("metrics.json"))?;

    Ok(())
}
