//! Traces processing algorithms
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use std::{
    collections::{BTreeMap, BTreeSet},
    iter::zip,
    ops::Add,
};

use crate::{Error, error::check_len};

/// Number of traces processed per parallel batch.
pub(crate) const BATCH_SIZE: usize = 500;

/// Maps arbitrary labels to dense class indices.
///
/// Returns the distinct labels in increasing order and, for every input label, the index of that
/// label in the distinct list.
pub fn encode_labels(labels: ArrayView1<usize>) -> (Vec<usize>, Array1<usize>) {
    let index: BTreeMap<usize, usize> = labels
        .iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .enumerate()
        .map(|(i, label)| (label, i))
        .collect();

    let encoded = labels.mapv(|label| index[&label]);
    (index.into_keys().collect(), encoded)
}

/// Compute the per-class means of the given traces using [`ClassMeans`].
///
/// `labels[i]` is the class of the i-th trace and must be lower than `num_classes`.
///
/// # Panics
/// Panic if `batch_size` is 0.
pub fn class_means(
    traces: ArrayView2<f64>,
    labels: ArrayView1<usize>,
    num_classes: usize,
    batch_size: usize,
) -> Result<ClassMeans, Error> {
    assert!(batch_size > 0);
    check_len("labels", traces.shape()[0], labels.len())?;
    if traces.shape()[0] == 0 {
        return Err(Error::NoTraces);
    }
    if let Some(&label) = labels.iter().find(|&&label| label >= num_classes) {
        return Err(Error::LabelOutOfRange { label, num_classes });
    }

    // Partial sums are merged in batch order so that results do not depend on scheduling
    let num_traces = traces.shape()[0];
    let partials: Vec<ClassMeans> = (0..num_traces.div_ceil(batch_size))
        .into_par_iter()
        .map(|batch| {
            let start = batch * batch_size;
            let end = (start + batch_size).min(num_traces);

            let mut means = ClassMeans::new(traces.shape()[1], num_classes);
            for i in start..end {
                means.process(traces.row(i), labels[i]);
            }
            means
        })
        .collect();

    let means = partials
        .into_iter()
        .reduce(|a, b| a + b)
        .ok_or(Error::NoTraces)?;

    Ok(means)
}

/// Processes labelled traces to calculate the mean trace of every class.
#[derive(Debug, Clone)]
pub struct ClassMeans {
    /// Sum of traces per class
    classes_sum: Array2<f64>,
    /// Number of traces per class
    classes_count: Array1<usize>,
}

impl ClassMeans {
    /// Creates a new class means processor.
    ///
    /// # Arguments
    ///
    /// * `size` - Number of samples per trace
    /// * `num_classes` - Number of classes (labels are in `0..num_classes`)
    pub fn new(size: usize, num_classes: usize) -> Self {
        Self {
            classes_sum: Array2::zeros((num_classes, size)),
            classes_count: Array1::zeros(num_classes),
        }
    }

    /// Processes an input trace to update internal accumulators.
    ///
    /// # Panics
    /// Panics in debug if the length of the trace is different from the size of [`ClassMeans`].
    pub fn process(&mut self, trace: ArrayView1<f64>, class: usize) {
        debug_assert!(trace.len() == self.size());

        let mut class_sum = self.classes_sum.row_mut(class);
        class_sum += &trace;
        self.classes_count[class] += 1;
    }

    /// Returns the classes which received at least one trace, in increasing order.
    pub fn observed(&self) -> Vec<usize> {
        self.classes_count
            .iter()
            .enumerate()
            .filter(|&(_, &count)| count > 0)
            .map(|(class, _)| class)
            .collect()
    }

    /// Returns the mean trace of a class, or `None` if the class has no trace.
    pub fn mean(&self, class: usize) -> Option<Array1<f64>> {
        let count = *self.classes_count.get(class)?;
        if count == 0 {
            return None;
        }

        Some(self.classes_sum.row(class).mapv(|x| x / count as f64))
    }

    /// Returns the mean traces of the observed classes, one row per class of [`Self::observed`].
    pub fn means(&self) -> Array2<f64> {
        let observed = self.observed();
        let mut means = Array2::zeros((observed.len(), self.size()));
        for (mut row, &class) in zip(means.rows_mut(), observed.iter()) {
            let count = self.classes_count[class] as f64;
            row.assign(&self.classes_sum.row(class).mapv(|x| x / count));
        }

        means
    }

    /// Returns the number of traces processed for a class.
    pub fn count(&self, class: usize) -> usize {
        self.classes_count[class]
    }

    /// Returns the trace size handled.
    pub fn size(&self) -> usize {
        self.classes_sum.shape()[1]
    }

    /// Returns the number of classes handled.
    pub fn num_classes(&self) -> usize {
        self.classes_count.len()
    }

    /// Determine if two [`ClassMeans`] are compatible for addition.
    ///
    /// If they were created with the same parameters, they are compatible.
    fn is_compatible_with(&self, other: &Self) -> bool {
        self.size() == other.size() && self.num_classes() == other.num_classes()
    }
}

impl Add for ClassMeans {
    type Output = Self;

    /// Merge computations of two [`ClassMeans`]. Processors need to be compatible to be merged
    /// together, otherwise it can panic or yield incoherent result (see
    /// [`ClassMeans::is_compatible_with`]).
    ///
    /// # Panics
    /// Panics in debug if the processors are not compatible.
    fn add(self, rhs: Self) -> Self::Output {
        debug_assert!(self.is_compatible_with(&rhs));

        Self {
            classes_sum: self.classes_sum + rhs.classes_sum,
            classes_count: self.classes_count + rhs.classes_count,
        }
    }
}
