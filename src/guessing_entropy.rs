//! Guessing entropy and success rate of an attack.
//!
//! Both metrics are estimated from a score matrix (one row per attack trace, one column per key
//! hypothesis) by repeating randomized attacks and averaging the rank of the secret key.
use std::{cmp::Ordering, fs::File, ops::Add, path::Path};

use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::{Error, util::save_array};

/// How attack traces are drawn in the fixed-sample regime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sampling {
    /// Rows are drawn independently, the same row can be drawn several times.
    #[default]
    WithReplacement,
    /// Rows are drawn without repetition.
    WithoutReplacement,
}

/// Parameters of the guessing entropy and success rate estimation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Number of randomized attacks averaged
    pub number_of_experiments: usize,
    /// Number of traces drawn per attack. When `None`, every attack uses all the traces in a
    /// random order.
    pub number_of_traces: Option<usize>,
    /// Drawing of the traces when `number_of_traces` is given
    pub sampling: Sampling,
    /// Seed of the random generator built by [`ExperimentConfig::rng`]
    pub random_seed: Option<u64>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            number_of_experiments: 50,
            number_of_traces: None,
            sampling: Sampling::WithReplacement,
            random_seed: None,
        }
    }
}

impl ExperimentConfig {
    /// Random generator seeded with [`Self::random_seed`], or from OS entropy if unset.
    pub fn rng(&self) -> StdRng {
        match self.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Estimates the metrics with the generator returned by [`Self::rng`].
    pub fn estimate(
        &self,
        scores: ArrayView2<f64>,
        secret_key: u8,
    ) -> Result<AttackMetrics, Error> {
        self.estimate_with(scores, secret_key, &mut self.rng())
    }

    /// Estimates the guessing entropy and success rate of `secret_key`.
    ///
    /// `scores[[i, k]]` is the log-likelihood of key hypothesis `k` given the i-th trace.
    /// The returned curves have one point per number of traces used, from 1 to either the number
    /// of rows of `scores` or [`Self::number_of_traces`].
    pub fn estimate_with<R: Rng + ?Sized>(
        &self,
        scores: ArrayView2<f64>,
        secret_key: u8,
        rng: &mut R,
    ) -> Result<AttackMetrics, Error> {
        let num_traces = scores.nrows();
        let key = secret_key as usize;

        if self.number_of_experiments == 0 {
            return Err(Error::InvalidParameter {
                name: "number_of_experiments",
                reason: "at least one experiment is required",
            });
        }
        if num_traces == 0 {
            return Err(Error::NoTraces);
        }
        if key >= scores.ncols() {
            return Err(Error::InvalidParameter {
                name: "secret_key",
                reason: "the score matrix has no column for the secret key",
            });
        }
        match (self.number_of_traces, self.sampling) {
            (Some(0), _) => {
                return Err(Error::InvalidParameter {
                    name: "number_of_traces",
                    reason: "at least one trace must be drawn",
                });
            }
            (Some(count), Sampling::WithoutReplacement) if count > num_traces => {
                return Err(Error::InvalidParameter {
                    name: "number_of_traces",
                    reason: "cannot draw more traces than available without replacement",
                });
            }
            _ => {}
        }

        let curve_len = self.number_of_traces.unwrap_or(num_traces);
        // One generator per experiment, so results do not depend on thread scheduling
        let seeds: Vec<u64> = (0..self.number_of_experiments)
            .map(|_| rng.next_u64())
            .collect();

        let accumulator = seeds
            .into_par_iter()
            .fold(
                || RankAccumulator::new(curve_len),
                |mut acc, seed| {
                    let mut rng = StdRng::seed_from_u64(seed);
                    let rows = self.draw(num_traces, &mut rng);
                    acc.process(&cumulative_ranks(scores, &rows, key));
                    acc
                },
            )
            .reduce_with(|a, b| a + b)
            .ok_or(Error::InvalidParameter {
                name: "number_of_experiments",
                reason: "at least one experiment is required",
            })?;

        Ok(accumulator.finalize())
    }

    /// Row order of one experiment.
    fn draw(&self, num_traces: usize, rng: &mut StdRng) -> Vec<usize> {
        match (self.number_of_traces, self.sampling) {
            (None, _) => {
                let mut rows: Vec<usize> = (0..num_traces).collect();
                rows.shuffle(rng);
                rows
            }
            (Some(count), Sampling::WithReplacement) => {
                (0..count).map(|_| rng.gen_range(0..num_traces)).collect()
            }
            (Some(count), Sampling::WithoutReplacement) => {
                rand::seq::index::sample(rng, num_traces, count).into_vec()
            }
        }
    }
}

/// Estimates the guessing entropy and success rate of `secret_key` with traces drawn with
/// replacement. See [`ExperimentConfig::estimate_with`].
pub fn guessing_entropy_and_success_rate<R: Rng + ?Sized>(
    scores: ArrayView2<f64>,
    secret_key: u8,
    number_of_experiments: usize,
    number_of_traces: Option<usize>,
    rng: &mut R,
) -> Result<AttackMetrics, Error> {
    ExperimentConfig {
        number_of_experiments,
        number_of_traces,
        ..Default::default()
    }
    .estimate_with(scores, secret_key, rng)
}

/// Rank of hypothesis `key` given the hypotheses scores, 0 being the most likely.
///
/// The rank is `len - 1 - p` where `p` is the position of `key` when hypotheses are stably sorted
/// by increasing score.
///
/// # Panics
/// Panics if `key >= scores.len()`.
pub fn key_rank(scores: ArrayView1<f64>, key: usize) -> usize {
    let key_score = scores[key];
    let position = scores
        .iter()
        .enumerate()
        .filter(|&(guess, score)| match score.total_cmp(&key_score) {
            Ordering::Less => true,
            Ordering::Equal => guess < key,
            Ordering::Greater => false,
        })
        .count();

    scores.len() - 1 - position
}

/// Rank of `key` after accumulating the scores of each successive row of `rows`.
fn cumulative_ranks(scores: ArrayView2<f64>, rows: &[usize], key: usize) -> Vec<usize> {
    let mut total = Array1::zeros(scores.ncols());

    rows.iter()
        .map(|&row| {
            total += &scores.row(row);
            key_rank(total.view(), key)
        })
        .collect()
}

/// Sums key ranks over experiments.
#[derive(Debug, Clone)]
struct RankAccumulator {
    /// Sum of the key ranks per number of traces
    rank_sum: Array1<usize>,
    /// Number of experiments where the key ranked first, per number of traces
    successes: Array1<usize>,
    /// Number of experiments processed
    count: usize,
}

impl RankAccumulator {
    fn new(len: usize) -> Self {
        Self {
            rank_sum: Array1::zeros(len),
            successes: Array1::zeros(len),
            count: 0,
        }
    }

    fn process(&mut self, ranks: &[usize]) {
        debug_assert_eq!(ranks.len(), self.rank_sum.len());

        for (i, &rank) in ranks.iter().enumerate() {
            self.rank_sum[i] += rank;
            if rank == 0 {
                self.successes[i] += 1;
            }
        }
        self.count += 1;
    }

    fn finalize(&self) -> AttackMetrics {
        let count = self.count as f64;

        AttackMetrics {
            guessing_entropy: self.rank_sum.mapv(|x| x as f64 / count),
            success_rate: self.successes.mapv(|x| x as f64 / count),
            number_of_experiments: self.count,
        }
    }
}

impl Add for RankAccumulator {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        debug_assert_eq!(self.rank_sum.len(), rhs.rank_sum.len());

        Self {
            rank_sum: self.rank_sum + rhs.rank_sum,
            successes: self.successes + rhs.successes,
            count: self.count + rhs.count,
        }
    }
}

/// Guessing entropy and success rate curves, indexed by number of traces minus one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackMetrics {
    guessing_entropy: Array1<f64>,
    success_rate: Array1<f64>,
    number_of_experiments: usize,
}

impl AttackMetrics {
    /// Average rank of the secret key.
    pub fn guessing_entropy(&self) -> ArrayView1<f64> {
        self.guessing_entropy.view()
    }

    /// Fraction of experiments ranking the secret key first.
    pub fn success_rate(&self) -> ArrayView1<f64> {
        self.success_rate.view()
    }

    pub fn number_of_experiments(&self) -> usize {
        self.number_of_experiments
    }

    /// Number of points of the curves.
    pub fn len(&self) -> usize {
        self.guessing_entropy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guessing_entropy.is_empty()
    }

    /// Smallest number of traces from which the guessing entropy stays at or below `threshold`.
    pub fn traces_to_guessing_entropy(&self, threshold: f64) -> Option<usize> {
        let last_above = self
            .guessing_entropy
            .iter()
            .rposition(|&ge| ge > threshold);

        match last_above {
            None => Some(1),
            Some(i) if i + 1 < self.len() => Some(i + 2),
            Some(_) => None,
        }
    }

    /// Writes the curves to `guessing_entropy.npy` and `success_rate.npy` in `dir`.
    pub fn save_curves<P: AsRef<Path>>(&self, dir: P) -> Result<(), Error> {
        let dir = dir.as_ref();
        save_array(dir.join("guessing_entropy.npy"), &self.guessing_entropy)?;
        save_array(dir.join("success_rate.npy"), &self.success_rate)?;

        Ok(())
    }

    /// Save the [`AttackMetrics`] to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let file = File::create(path)?;
        serde_json::to_writer(file, self)?;

        Ok(())
    }

    /// Load [`AttackMetrics`] from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::open(path)?;
        let metrics: AttackMetrics = serde_json::from_reader(file)?;

        Ok(metrics)
    }
}
