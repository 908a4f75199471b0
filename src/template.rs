//! Gaussian template attack.
//!
//! One multivariate Gaussian is fitted per leakage label on reduced profiling traces. Attack
//! traces are then scored against the 256 key byte hypotheses by evaluating the log-density of
//! the template predicted by each hypothesis.
use std::{f64::consts::TAU, fs::File, iter::zip, path::Path};

use log::{debug, warn};
use nalgebra::{Cholesky, DMatrix, DVector};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use rayon::iter::{
    IndexedParallelIterator, IntoParallelIterator, ParallelBridge, ParallelIterator,
};
use serde::{Deserialize, Serialize};

use crate::{
    Error,
    error::check_len,
    leakage_model::{KEY_GUESSES, KeyBytes, LeakageModel},
    processors::{BATCH_SIZE, class_means, encode_labels},
    util::{argmax_by, argsort_by},
};

/// Smallest accepted ratio between the smallest and largest diagonal entries of a Cholesky
/// factor. Below this, the covariance is regularized.
const MIN_PIVOT_RATIO: f64 = 1e-7;
/// Number of increasingly large diagonal loadings tried before giving up.
const MAX_REGULARIZATION_STEPS: i32 = 16;

/// Labels of the profiling traces used to build templates.
#[derive(Debug, Clone, Copy)]
pub enum Profiling<'a> {
    /// Labels given explicitly, one per trace.
    Labels(ArrayView1<'a, usize>),
    /// Labels derived from the plaintext and key bytes with the attack leakage model.
    Keys {
        plaintexts: ArrayView1<'a, u8>,
        keys: KeyBytes<'a>,
    },
}

/// Covariance shared by the templates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovarianceMode {
    /// Unweighted mean of the per-label covariances, shared by every template.
    #[default]
    Pooled,
    /// Each template uses the covariance of its own label.
    PerClass,
}

/// Factorized Gaussian covariance.
#[derive(Debug, Clone)]
struct Density {
    /// Lower Cholesky factor of the (regularized) covariance
    l: DMatrix<f64>,
    /// -(k ln(2π) + ln|Σ|) / 2
    log_norm: f64,
    /// Value added to the covariance diagonal before factorization
    ridge: f64,
}

impl Density {
    /// Factorizes a covariance matrix.
    ///
    /// Singular or ill-conditioned matrices are loaded on their diagonal with an increasing
    /// ridge, starting at `1e-10 + 1e-8 * mean variance`, until the factorization succeeds.
    fn new(covariance: ArrayView2<f64>) -> Result<Self, Error> {
        let k = covariance.nrows();
        if covariance.iter().any(|x| !x.is_finite()) {
            return Err(Error::DegenerateCovariance);
        }

        let matrix = DMatrix::from_fn(k, k, |i, j| covariance[[i, j]]);
        let mean_var = covariance.diag().sum() / k as f64;
        let base = 1e-10 + mean_var.abs() * 1e-8;

        let mut ridge = 0.;
        for step in 0..MAX_REGULARIZATION_STEPS {
            let mut regularized = matrix.clone();
            for i in 0..k {
                regularized[(i, i)] += ridge;
            }

            if let Some(chol) = Cholesky::new(regularized) {
                let l = chol.unpack();
                if is_well_conditioned(&l) {
                    if ridge > 0. {
                        warn!(
                            "Covariance matrix of dimension {k} is singular or ill-conditioned, \
                             added {ridge:e} to its diagonal"
                        );
                    }
                    let log_det = 2. * l.diagonal().iter().map(|d| d.ln()).sum::<f64>();

                    return Ok(Self {
                        log_norm: -0.5 * (k as f64 * TAU.ln() + log_det),
                        l,
                        ridge,
                    });
                }
            }

            ridge = base * 10f64.powi(step);
        }

        Err(Error::DegenerateCovariance)
    }

    /// Log-density of a centered point.
    fn log_pdf(&self, mut centered: DVector<f64>) -> f64 {
        if !self.l.solve_lower_triangular_mut(&mut centered) {
            return f64::NEG_INFINITY;
        }

        self.log_norm - 0.5 * centered.norm_squared()
    }
}

fn is_well_conditioned(l: &DMatrix<f64>) -> bool {
    let diagonal = l.diagonal();
    let min = diagonal.min();
    let max = diagonal.max();

    min.is_finite() && max.is_finite() && min > 0. && min >= max * MIN_PIVOT_RATIO
}

/// Unbiased sample covariance of the rows of `traces`, `None` with fewer than two rows.
fn sample_covariance(traces: ArrayView2<f64>, mean: ArrayView1<f64>) -> Option<Array2<f64>> {
    let n = traces.nrows();
    if n < 2 {
        return None;
    }

    let centered = &traces - &mean;
    Some(centered.t().dot(&centered) / (n - 1) as f64)
}

/// Gaussian templates, one per profiled leakage label.
#[derive(Debug, Clone)]
pub struct Templates {
    /// Profiled labels, in increasing order
    labels: Vec<usize>,
    /// Mean of each label, one row per label
    means: Array2<f64>,
    /// A single pooled covariance, or one covariance per label
    covariances: Vec<Array2<f64>>,
    mode: CovarianceMode,
    /// Factorization of each covariance
    densities: Vec<Density>,
}

impl Templates {
    /// Fits templates on reduced traces, one label per trace.
    pub fn fit(
        traces: ArrayView2<f64>,
        labels: ArrayView1<usize>,
        mode: CovarianceMode,
    ) -> Result<Self, Error> {
        check_len("labels", traces.nrows(), labels.len())?;
        if traces.nrows() == 0 {
            return Err(Error::NoTraces);
        }
        if traces.ncols() == 0 {
            return Err(Error::InvalidParameter {
                name: "traces",
                reason: "templates need at least one feature",
            });
        }

        let (classes, encoded) = encode_labels(labels);
        let means = class_means(traces, encoded.view(), classes.len(), BATCH_SIZE)?.means();

        let mut members = vec![Vec::new(); classes.len()];
        for (i, &class) in encoded.iter().enumerate() {
            members[class].push(i);
        }

        let class_covariances: Vec<Option<Array2<f64>>> = members
            .into_par_iter()
            .enumerate()
            .map(|(class, rows)| {
                sample_covariance(traces.select(Axis(0), &rows).view(), means.row(class))
            })
            .collect();

        let undersampled = class_covariances.iter().filter(|c| c.is_none()).count();
        if undersampled > 0 {
            warn!(
                "{undersampled} of {} classes have fewer than two profiling traces, their \
                 covariance cannot be estimated",
                classes.len()
            );
        }

        let k = traces.ncols();
        let covariances = match mode {
            CovarianceMode::Pooled => {
                let estimated: Vec<_> = class_covariances.iter().flatten().collect();
                let mut pooled = Array2::zeros((k, k));
                for covariance in &estimated {
                    pooled += *covariance;
                }
                if estimated.is_empty() {
                    warn!("No class has two profiling traces, the pooled covariance is zero");
                } else {
                    pooled /= estimated.len() as f64;
                }
                vec![pooled]
            }
            CovarianceMode::PerClass => class_covariances
                .into_iter()
                .map(|c| c.unwrap_or_else(|| Array2::zeros((k, k))))
                .collect(),
        };

        debug!(
            "Fitted {} templates of dimension {k} with {mode:?} covariance",
            classes.len()
        );

        Self::from_parts(classes, means, covariances, mode)
    }

    fn from_parts(
        labels: Vec<usize>,
        means: Array2<f64>,
        covariances: Vec<Array2<f64>>,
        mode: CovarianceMode,
    ) -> Result<Self, Error> {
        check_len("means", labels.len(), means.nrows())?;
        if labels.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::InvalidParameter {
                name: "labels",
                reason: "template labels must be strictly increasing",
            });
        }

        let expected = match mode {
            CovarianceMode::Pooled => 1,
            CovarianceMode::PerClass => labels.len(),
        };
        check_len("covariances", expected, covariances.len())?;
        for covariance in &covariances {
            check_len("covariance rows", means.ncols(), covariance.nrows())?;
            check_len("covariance columns", means.ncols(), covariance.ncols())?;
        }

        let densities = covariances
            .iter()
            .map(|c| Density::new(c.view()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            labels,
            means,
            covariances,
            mode,
            densities,
        })
    }

    /// Profiled labels, in increasing order.
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Number of features of a template.
    pub fn dimension(&self) -> usize {
        self.means.ncols()
    }

    pub fn covariance_mode(&self) -> CovarianceMode {
        self.mode
    }

    fn index_of(&self, label: usize) -> Option<usize> {
        self.labels.binary_search(&label).ok()
    }

    fn density_index(&self, index: usize) -> usize {
        match self.mode {
            CovarianceMode::Pooled => 0,
            CovarianceMode::PerClass => index,
        }
    }

    /// Mean vector of a label template.
    pub fn mean(&self, label: usize) -> Option<ArrayView1<f64>> {
        self.index_of(label).map(|i| self.means.row(i))
    }

    /// Covariance of a label template, before regularization.
    pub fn covariance(&self, label: usize) -> Option<ArrayView2<f64>> {
        self.index_of(label)
            .map(|i| self.covariances[self.density_index(i)].view())
    }

    /// Value added to the diagonal of a label covariance to make it factorizable.
    pub fn regularization(&self, label: usize) -> Option<f64> {
        self.index_of(label)
            .map(|i| self.densities[self.density_index(i)].ridge)
    }

    /// Log-density of a reduced trace under a label template.
    pub fn log_pdf(&self, label: usize, trace: ArrayView1<f64>) -> Option<f64> {
        let index = self.index_of(label)?;
        if trace.len() != self.dimension() {
            return None;
        }

        Some(self.log_pdf_at(index, trace))
    }

    fn log_pdf_at(&self, index: usize, trace: ArrayView1<f64>) -> f64 {
        let mean = self.means.row(index);
        let centered = DVector::from_iterator(
            trace.len(),
            zip(trace.iter(), mean.iter()).map(|(x, m)| x - m),
        );

        self.densities[self.density_index(index)].log_pdf(centered)
    }

    /// Log-density of a reduced trace under every template, in [`Self::labels`] order.
    fn log_pdfs(&self, trace: ArrayView1<f64>) -> Vec<f64> {
        (0..self.labels.len())
            .map(|index| self.log_pdf_at(index, trace))
            .collect()
    }

    /// Save the [`Templates`] to a file.
    ///
    /// # Warning
    /// The file format is not stable as templar is active development. Thus, the format might
    /// change between versions.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let file = File::create(path)?;
        serde_json::to_writer(file, self)?;

        Ok(())
    }

    /// Load [`Templates`] from a file.
    ///
    /// # Warning
    /// The file format is not stable as templar is active development. Thus, the format might
    /// change between versions.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::open(path)?;
        let templates: Templates = serde_json::from_reader(file)?;

        Ok(templates)
    }
}

/// Serialized form of [`Templates`], factorizations are recomputed on load.
#[derive(Serialize, Deserialize)]
struct TemplatesData {
    labels: Vec<usize>,
    means: Array2<f64>,
    covariances: Vec<Array2<f64>>,
    mode: CovarianceMode,
}

impl Serialize for Templates {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        TemplatesData {
            labels: self.labels.clone(),
            means: self.means.clone(),
            covariances: self.covariances.clone(),
            mode: self.mode,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Templates {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let data = TemplatesData::deserialize(deserializer)?;

        Templates::from_parts(data.labels, data.means, data.covariances, data.mode)
            .map_err(serde::de::Error::custom)
    }
}

/// Profiled template attack on a key byte.
///
/// # Examples
/// ```
/// use templar::leakage_model::LeakageModel;
/// use templar::template::{Profiling, TemplateAttack};
/// use ndarray::array;
///
/// let traces = array![[0.1, 1.0], [0.0, 1.2], [1.0, 0.1], [0.9, 0.0], [2.1, 2.0], [1.9, 2.2]];
/// let labels = array![0usize, 0, 1, 1, 2, 2];
///
/// let mut attack = TemplateAttack::new(LeakageModel::HammingWeight);
/// attack
///     .create_template(traces.view(), Profiling::Labels(labels.view()))
///     .unwrap();
/// assert_eq!(attack.templates().unwrap().labels(), &[0, 1, 2]);
/// ```
#[derive(Debug, Clone)]
pub struct TemplateAttack {
    model: LeakageModel,
    mode: CovarianceMode,
    templates: Option<Templates>,
}

impl TemplateAttack {
    /// Creates an attack using a pooled covariance.
    pub fn new(model: LeakageModel) -> Self {
        Self::with_covariance_mode(model, CovarianceMode::Pooled)
    }

    pub fn with_covariance_mode(model: LeakageModel, mode: CovarianceMode) -> Self {
        Self {
            model,
            mode,
            templates: None,
        }
    }

    /// Creates an attack from already fitted templates.
    pub fn from_templates(model: LeakageModel, templates: Templates) -> Self {
        Self {
            model,
            mode: templates.covariance_mode(),
            templates: Some(templates),
        }
    }

    pub fn model(&self) -> LeakageModel {
        self.model
    }

    pub fn covariance_mode(&self) -> CovarianceMode {
        self.mode
    }

    /// Fitted templates, `None` before [`Self::create_template`].
    pub fn templates(&self) -> Option<&Templates> {
        self.templates.as_ref()
    }

    fn fitted(&self) -> Result<&Templates, Error> {
        self.templates
            .as_ref()
            .ok_or(Error::NotFitted("TemplateAttack"))
    }

    /// Builds one template per label observed in the profiling traces, replacing any previous
    /// templates.
    pub fn create_template(
        &mut self,
        traces: ArrayView2<f64>,
        profiling: Profiling,
    ) -> Result<(), Error> {
        self.templates = None;

        let labels = match profiling {
            Profiling::Labels(labels) => labels.to_owned(),
            Profiling::Keys { plaintexts, keys } => self.model.leakages(plaintexts, keys)?,
        };

        self.templates = Some(Templates::fit(traces, labels.view(), self.mode)?);

        Ok(())
    }

    /// Computes the log-likelihood of every trace under every key hypothesis.
    ///
    /// Returns a matrix of shape `(traces.nrows(), 256)`.
    pub fn logpdfs(
        &self,
        traces: ArrayView2<f64>,
        plaintexts: ArrayView1<u8>,
    ) -> Result<Array2<f64>, Error> {
        let templates = self.fitted()?;
        check_len("plaintexts", traces.nrows(), plaintexts.len())?;
        check_len("trace", templates.dimension(), traces.ncols())?;

        let mut scores = Array2::zeros((traces.nrows(), KEY_GUESSES));
        if traces.nrows() == 0 {
            return Ok(scores);
        }

        // Every label is reachable from any plaintext, as the S-box is a permutation.
        let index = (0..self.model.num_classes())
            .map(|label| templates.index_of(label).ok_or(Error::MissingTemplate(label)))
            .collect::<Result<Vec<_>, _>>()?;

        zip(
            scores.axis_iter_mut(Axis(0)),
            zip(traces.axis_iter(Axis(0)), plaintexts.iter()),
        )
        .par_bridge()
        .for_each(|(mut row, (trace, &plaintext))| {
            let class_scores = templates.log_pdfs(trace);
            for (key, score) in row.iter_mut().enumerate() {
                *score = class_scores[index[self.model.leakage(plaintext, key as u8)]];
            }
        });

        Ok(scores)
    }

    /// Returns the maximum likelihood key byte.
    ///
    /// When `number_of_traces` is given, the likelihood is computed over that many traces drawn
    /// uniformly with replacement.
    pub fn guess_key<R: Rng + ?Sized>(
        &self,
        traces: ArrayView2<f64>,
        plaintexts: ArrayView1<u8>,
        number_of_traces: Option<usize>,
        rng: &mut R,
    ) -> Result<u8, Error> {
        if traces.nrows() == 0 {
            return Err(Error::NoTraces);
        }

        let scores = self.logpdfs(traces, plaintexts)?;
        let total = match number_of_traces {
            None => scores.sum_axis(Axis(0)),
            Some(0) => {
                return Err(Error::InvalidParameter {
                    name: "number_of_traces",
                    reason: "at least one trace must be drawn",
                });
            }
            Some(count) => {
                let mut total = Array1::zeros(KEY_GUESSES);
                for _ in 0..count {
                    total += &scores.row(rng.gen_range(0..scores.nrows()));
                }
                total
            }
        };

        Ok(argmax_by(total.view(), f64::total_cmp) as u8)
    }

    /// Returns the key hypotheses sorted from most to least likely over all the traces.
    pub fn rank(
        &self,
        traces: ArrayView2<f64>,
        plaintexts: ArrayView1<u8>,
    ) -> Result<Vec<u8>, Error> {
        if traces.nrows() == 0 {
            return Err(Error::NoTraces);
        }

        let total = self.logpdfs(traces, plaintexts)?.sum_axis(Axis(0));
        let order = argsort_by(&total.to_vec(), |a, b| b.total_cmp(a));

        Ok(order.into_iter().map(|key| key as u8).collect())
    }
}
