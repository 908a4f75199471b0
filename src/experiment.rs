//! Profiling then attacking a dataset.
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    Error,
    dataset::Dataset,
    feature_selection::{SumOfDifferences, Transformer},
    guessing_entropy::{AttackMetrics, ExperimentConfig},
    leakage_model::{KeyBytes, LeakageModel},
    template::{CovarianceMode, Profiling, TemplateAttack},
};

/// Profiles templates on the profiling split, then estimates the guessing entropy and success
/// rate of the attack split.
///
/// `reducer` is fitted on the profiling traces and their labels, then applied to the attack
/// traces. The secret key is the key byte of the first attack trace.
pub fn run_experiment(
    dataset: &Dataset,
    model: LeakageModel,
    reducer: &mut dyn Transformer,
    mode: CovarianceMode,
    config: &ExperimentConfig,
) -> Result<AttackMetrics, Error> {
    let profiling = &dataset.profiling;
    let attack = &dataset.attack;

    let secret_key = *attack.keys().first().ok_or(Error::NoTraces)?;
    if attack.keys().iter().any(|&key| key != secret_key) {
        warn!("Attack traces use several keys, only the first one is ranked");
    }

    let labels = model.leakages(profiling.plaintexts(), KeyBytes::PerTrace(profiling.keys()))?;
    let reduced = reducer.fit_transform(profiling.traces(), labels.view())?;

    let mut template_attack = TemplateAttack::with_covariance_mode(model, mode);
    template_attack.create_template(reduced.view(), Profiling::Labels(labels.view()))?;

    let attack_traces = reducer.transform(attack.traces())?;
    let scores = template_attack.logpdfs(attack_traces.view(), attack.plaintexts())?;
    debug!(
        "Scored {} attack traces reduced to {} features",
        scores.nrows(),
        attack_traces.ncols()
    );

    config.estimate(scores.view(), secret_key)
}

/// Sum of differences selector parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoiConfig {
    pub n_components: usize,
    pub spacing: usize,
}

impl Default for PoiConfig {
    fn default() -> Self {
        Self {
            n_components: 50,
            spacing: 5,
        }
    }
}

/// Full parameters of a template attack using the sum of differences selector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttackConfig {
    pub leakage_model: LeakageModel,
    pub covariance_mode: CovarianceMode,
    pub poi: PoiConfig,
    pub estimation: ExperimentConfig,
}

impl AttackConfig {
    pub fn run(&self, dataset: &Dataset) -> Result<AttackMetrics, Error> {
        let mut selector = SumOfDifferences::new(self.poi.n_components, self.poi.spacing)?;

        run_experiment(
            dataset,
            self.leakage_model,
            &mut selector,
            self.covariance_mode,
            &self.estimation,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{AttackConfig, PoiConfig, run_experiment};
    use crate::{
        Error,
        dataset::{Dataset, TraceSet},
        feature_selection::AllSamples,
        guessing_entropy::ExperimentConfig,
        leakage_model::{KeyBytes, LeakageModel},
        template::CovarianceMode,
    };
    use ndarray::{Array1, Array2};
    use ndarray_rand::{
        RandomExt,
        rand::{SeedableRng, rngs::StdRng},
        rand_distr::Uniform,
    };

    /// Noiseless traces of `num_samples` samples, one-hot at `stride * label`.
    fn one_hot(
        model: LeakageModel,
        plaintexts: Array1<u8>,
        keys: Array1<u8>,
        num_samples: usize,
        stride: usize,
    ) -> TraceSet {
        let labels = model
            .leakages(plaintexts.view(), KeyBytes::PerTrace(keys.view()))
            .unwrap();
        let mut traces = Array2::zeros((labels.len(), num_samples));
        for (i, &label) in labels.iter().enumerate() {
            traces[[i, stride * label]] = 1.;
        }

        TraceSet::new(traces, plaintexts, keys).unwrap()
    }

    #[test]
    fn test_perfect_leakage_identity() {
        let mut rng = StdRng::seed_from_u64(0);
        let model = LeakageModel::Identity;

        // Two profiling traces per S-box output
        let plaintexts: Array1<u8> = (0..=255u8).chain(0..=255u8).collect();
        let keys: Array1<u8> = (0..512).map(|i| if i < 256 { 0x00 } else { 0xa5 }).collect();
        let profiling = one_hot(model, plaintexts, keys, 256, 1);

        let attack_plaintexts: Array1<u8> =
            Array1::random_using(4, Uniform::new_inclusive(0u8, 255), &mut rng);
        let attack = one_hot(model, attack_plaintexts, Array1::from_elem(4, 0x3c), 256, 1);

        let config = AttackConfig {
            leakage_model: model,
            covariance_mode: CovarianceMode::Pooled,
            poi: PoiConfig {
                n_components: 256,
                spacing: 0,
            },
            estimation: ExperimentConfig {
                number_of_experiments: 10,
                random_seed: Some(1),
                ..Default::default()
            },
        };
        let metrics = config.run(&Dataset { profiling, attack }).unwrap();

        assert_eq!(metrics.len(), 4);
        assert!(metrics.guessing_entropy().iter().all(|&ge| ge == 0.));
        assert!(metrics.success_rate().iter().all(|&sr| sr == 1.));
    }

    #[test]
    fn test_perfect_leakage_hamming_weight() {
        let model = LeakageModel::HammingWeight;

        let plaintexts: Array1<u8> = (0..=255u8).chain(0..=255u8).collect();
        let keys: Array1<u8> = (0..512).map(|i| if i < 256 { 0x11 } else { 0x80 }).collect();
        let profiling = one_hot(model, plaintexts, keys, 30, 3);

        let attack = one_hot(model, (0..=255u8).collect(), Array1::from_elem(256, 0x3c), 30, 3);
        let dataset = Dataset { profiling, attack };

        for mode in [CovarianceMode::Pooled, CovarianceMode::PerClass] {
            let config = AttackConfig {
                leakage_model: model,
                covariance_mode: mode,
                poi: PoiConfig {
                    n_components: 9,
                    spacing: 1,
                },
                estimation: ExperimentConfig {
                    number_of_experiments: 5,
                    random_seed: Some(2),
                    ..Default::default()
                },
            };
            let metrics = config.run(&dataset).unwrap();

            assert_eq!(metrics.len(), 256);
            assert_eq!(metrics.guessing_entropy()[255], 0.);
            assert_eq!(metrics.success_rate()[255], 1.);
        }
    }

    #[test]
    fn test_run_experiment_errors() {
        let model = LeakageModel::HammingWeight;
        let profiling = one_hot(model, (0..=255u8).collect(), Array1::zeros(256), 9, 1);
        let empty =
            TraceSet::new(Array2::zeros((0, 9)), Array1::zeros(0), Array1::zeros(0)).unwrap();
        let dataset = Dataset {
            profiling,
            attack: empty,
        };

        assert!(matches!(
            run_experiment(
                &dataset,
                model,
                &mut AllSamples::default(),
                CovarianceMode::Pooled,
                &ExperimentConfig::default()
            ),
            Err(Error::NoTraces)
        ));

        let config = AttackConfig {
            poi: PoiConfig {
                n_components: 0,
                spacing: 0,
            },
            ..Default::default()
        };
        assert!(matches!(
            config.run(&dataset),
            Err(Error::InvalidParameter { name: "n_components", .. })
        ));
    }

    #[test]
    fn test_attack_config_from_json() {
        let config: AttackConfig = serde_json::from_str(
            r#"{
                "leakage_model": "hamming_weight",
                "covariance_mode": "per_class",
                "poi": { "n_components": 10, "spacing": 1 },
                "estimation": { "number_of_experiments": 100, "number_of_traces": 10 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.leakage_model, LeakageModel::HammingWeight);
        assert_eq!(config.covariance_mode, CovarianceMode::PerClass);
        assert_eq!(config.poi.n_components, 10);
        assert_eq!(config.estimation.number_of_traces, Some(10));
        assert_eq!(config.estimation.random_seed, None);
    }
}
