use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use ndarray::Array2;
use ndarray_rand::RandomExt;
use ndarray_rand::rand::{SeedableRng, rngs::StdRng};
use ndarray_rand::rand_distr::Normal;
use templar::guessing_entropy::{ExperimentConfig, Sampling};

fn bench_guessing_entropy(c: &mut Criterion) {
    // Seed rng to get the same output each run
    let mut rng = StdRng::seed_from_u64(0);

    let mut group = c.benchmark_group("guessing_entropy");

    let scores = Array2::random_using((1000, 256), Normal::new(0., 1.).unwrap(), &mut rng);

    for number_of_experiments in [10, 100, 500] {
        let growing = ExperimentConfig {
            number_of_experiments,
            random_seed: Some(0),
            ..Default::default()
        };
        let fixed = ExperimentConfig {
            number_of_traces: Some(50),
            sampling: Sampling::WithReplacement,
            ..growing.clone()
        };

        group.bench_with_input(
            BenchmarkId::new("growing_window", number_of_experiments),
            &scores,
            |b, scores| b.iter(|| growing.estimate(scores.view(), 0x2b).unwrap()),
        );

        group.bench_with_input(
            BenchmarkId::new("fixed_sample", number_of_experiments),
            &scores,
            |b, scores| b.iter(|| fixed.estimate(scores.view(), 0x2b).unwrap()),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_guessing_entropy);
criterion_main!(benches);
