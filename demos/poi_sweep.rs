use anyhow::{Context, Result};
use std::{env, fs, path::PathBuf};
use templar::{
    dataset::load_npy_dir,
    experiment::{AttackConfig, PoiConfig},
    guessing_entropy::{ExperimentConfig, Sampling},
    leakage_model::LeakageModel,
    util::progress_bar,
};

const N_COMPONENTS: [usize; 6] = [2, 5, 10, 20, 50, 100];
const SPACING: usize = 5;

fn main() -> Result<()> {
    let traces_dir =
        PathBuf::from(env::var("TRACES_DIR").context("Missing TRACES_DIR environment variable")?);
    let results_dir = traces_dir.join("results");

    let dataset = load_npy_dir::<f64, _>(&traces_dir, 0, 0..4000, 4000..5000)
        .context("Failed to load the campaign")?;

    let bar = progress_bar(N_COMPONENTS.len());
    for n_components in N_COMPONENTS {
        let config = AttackConfig {
            leakage_model: LeakageModel::HammingWeight,
            poi: PoiConfig {
                n_components,
                spacing: SPACING,
            },
            estimation: ExperimentConfig {
                number_of_experiments: 50,
                number_of_traces: Some(20),
                sampling: Sampling::WithReplacement,
                random_seed: Some(n_components as u64),
            },
            ..Default::default()
        };

        let metrics = config.run(&dataset)?;

        let dir = results_dir.join(format!("n_components_{n_components}"));
        fs::create_dir_all(&dir)?;
        metrics.save_curves(&dir)?;
        fs::write(dir.join("config.json"), serde_json::to_vec_pretty(&config)?)?;

        bar.inc(1);
    }
    bar.finish();

    Ok(())
}
