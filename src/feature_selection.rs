//! Point of interest selection.
//!
//! Reducers implement [`Transformer`]: they are fitted once on labelled profiling traces, then
//! project profiling and attack traces to the same reduced feature space.
use itertools::Itertools;
use log::debug;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::{
    Error,
    error::check_len,
    processors::{BATCH_SIZE, class_means, encode_labels},
};

/// A fittable trace reducer.
pub trait Transformer {
    /// Learns the reduction from labelled profiling traces.
    fn fit(&mut self, traces: ArrayView2<f64>, labels: ArrayView1<usize>) -> Result<(), Error>;

    /// Reduces traces, one output row per input row.
    ///
    /// Returns [`Error::NotFitted`] if [`Transformer::fit`] has not been called.
    fn transform(&self, traces: ArrayView2<f64>) -> Result<Array2<f64>, Error>;

    fn fit_transform(
        &mut self,
        traces: ArrayView2<f64>,
        labels: ArrayView1<usize>,
    ) -> Result<Array2<f64>, Error> {
        self.fit(traces, labels)?;
        self.transform(traces)
    }
}

/// Sum of differences point of interest selector.
///
/// Samples are scored by the sum, over every pair of classes, of the absolute difference between
/// the class mean traces. The `n_components` highest scoring samples are selected greedily, each
/// selection discarding the `spacing` samples on both of its sides.
#[derive(Debug, Clone)]
pub struct SumOfDifferences {
    n_components: usize,
    spacing: usize,
    /// Selected sample indices, in selection order
    features: Option<Vec<usize>>,
    /// Discrimination score of every sample, from the last fit
    discrimination: Option<Array1<f64>>,
}

impl SumOfDifferences {
    /// Creates a new selector.
    ///
    /// # Arguments
    ///
    /// * `n_components` - Number of points of interest to select
    /// * `spacing` - Minimum distance, excluded, between two selected points
    pub fn new(n_components: usize, spacing: usize) -> Result<Self, Error> {
        if n_components == 0 {
            return Err(Error::InvalidParameter {
                name: "n_components",
                reason: "at least one point of interest must be selected",
            });
        }

        Ok(Self {
            n_components,
            spacing,
            features: None,
            discrimination: None,
        })
    }

    pub fn n_components(&self) -> usize {
        self.n_components
    }

    pub fn spacing(&self) -> usize {
        self.spacing
    }

    /// Selected sample indices, in selection order.
    pub fn features(&self) -> Option<&[usize]> {
        self.features.as_deref()
    }

    /// Sum of absolute pairwise class mean differences computed by the last fit.
    pub fn discrimination(&self) -> Option<ArrayView1<f64>> {
        self.discrimination.as_ref().map(|d| d.view())
    }

    fn select(&self, discrimination: ArrayView1<f64>) -> Result<Vec<usize>, Error> {
        let num_samples = discrimination.len();
        let mut available = vec![true; num_samples];
        let mut features = Vec::with_capacity(self.n_components.min(num_samples));

        while features.len() < self.n_components {
            let best = (0..num_samples)
                .filter(|&i| available[i])
                .map(|i| {
                    let score = discrimination[i];
                    (i, if score.is_nan() { f64::NEG_INFINITY } else { score })
                })
                // `max_by` keeps the last maximum, reverse the order to keep the first one
                .rev()
                .max_by(|a, b| a.1.total_cmp(&b.1));

            let Some((feature, _)) = best else {
                return Err(Error::PoiUnachievable {
                    requested: self.n_components,
                    selectable: features.len(),
                    spacing: self.spacing,
                    num_samples,
                });
            };

            features.push(feature);

            let start = feature.saturating_sub(self.spacing);
            let end = feature.saturating_add(self.spacing + 1).min(num_samples);
            available[start..end].fill(false);
        }

        Ok(features)
    }
}

impl Transformer for SumOfDifferences {
    fn fit(&mut self, traces: ArrayView2<f64>, labels: ArrayView1<usize>) -> Result<(), Error> {
        self.features = None;
        self.discrimination = None;

        check_len("labels", traces.shape()[0], labels.len())?;
        if traces.shape()[0] == 0 {
            return Err(Error::NoTraces);
        }

        let (classes, encoded) = encode_labels(labels);
        let means = class_means(traces, encoded.view(), classes.len(), BATCH_SIZE)?.means();

        let mut discrimination = Array1::zeros(traces.shape()[1]);
        for (a, b) in (0..means.nrows()).tuple_combinations() {
            discrimination += &(&means.row(a) - &means.row(b)).mapv(f64::abs);
        }

        let features = self.select(discrimination.view())?;
        debug!(
            "Selected {} points of interest over {} classes: {:?}",
            features.len(),
            classes.len(),
            features
        );

        self.features = Some(features);
        self.discrimination = Some(discrimination);

        Ok(())
    }

    fn transform(&self, traces: ArrayView2<f64>) -> Result<Array2<f64>, Error> {
        let (Some(features), Some(discrimination)) = (&self.features, &self.discrimination) else {
            return Err(Error::NotFitted("SumOfDifferences"));
        };
        check_len("trace", discrimination.len(), traces.shape()[1])?;

        Ok(traces.select(Axis(1), features))
    }
}

/// Keeps every sample, for traces which are already reduced.
#[derive(Debug, Clone, Default)]
pub struct AllSamples {
    num_samples: Option<usize>,
}

impl Transformer for AllSamples {
    fn fit(&mut self, traces: ArrayView2<f64>, labels: ArrayView1<usize>) -> Result<(), Error> {
        check_len("labels", traces.shape()[0], labels.len())?;
        self.num_samples = Some(traces.shape()[1]);

        Ok(())
    }

    fn transform(&self, traces: ArrayView2<f64>) -> Result<Array2<f64>, Error> {
        let num_samples = self.num_samples.ok_or(Error::NotFitted("AllSamples"))?;
        check_len("trace", num_samples, traces.shape()[1])?;

        Ok(traces.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::{AllSamples, SumOfDifferences, Transformer};
    use crate::Error;
    use ndarray::{Array1, Array2, array};
    use ndarray_rand::{
        RandomExt,
        rand::{SeedableRng, rngs::StdRng},
        rand_distr::Uniform,
    };

    #[test]
    fn test_concrete_scenario() {
        let traces = array![
            [1., 1., 1., 1., 1.],
            [1., 1., 1., 1., 1.],
            [5., 5., 5., 5., 5.],
            [5., 5., 5., 5., 5.],
        ];
        let labels = array![0usize, 0, 1, 1];

        let mut selector = SumOfDifferences::new(1, 0).unwrap();
        let reduced = selector.fit_transform(traces.view(), labels.view()).unwrap();

        assert_eq!(selector.discrimination().unwrap(), array![4., 4., 4., 4., 4.]);
        assert_eq!(selector.features().unwrap(), &[0]);
        assert_eq!(reduced, array![[1.], [1.], [5.], [5.]]);
    }

    #[test]
    fn test_sum_of_differences() {
        let traces = array![
            [0., 1., 10., 0., 3.],
            [0., 3., 12., 0., 3.],
            [0., 2., 0., 6., 9.],
            [0., 4., 2., 6., 9.],
            [0., 8., 4., 0., 0.],
        ];
        let labels = array![0usize, 0, 1, 1, 2];
        // Means: [0, 2, 11, 0, 3], [0, 3, 1, 6, 9], [0, 8, 4, 0, 0]
        // Scores: [0, 1 + 6 + 5, 10 + 7 + 3, 6 + 0 + 6, 6 + 3 + 9] = [0, 12, 20, 12, 18]

        let mut selector = SumOfDifferences::new(3, 0).unwrap();
        selector.fit(traces.view(), labels.view()).unwrap();
        assert_eq!(selector.discrimination().unwrap(), array![0., 12., 20., 12., 18.]);
        assert_eq!(selector.features().unwrap(), &[2, 4, 1]);

        let mut spaced = SumOfDifferences::new(2, 1).unwrap();
        spaced.fit(traces.view(), labels.view()).unwrap();
        assert_eq!(spaced.features().unwrap(), &[2, 4]);
        assert_eq!(
            spaced.transform(traces.view()).unwrap(),
            array![[10., 3.], [12., 3.], [0., 9.], [2., 9.], [4., 0.]]
        );
    }

    #[test]
    fn test_spacing_and_determinism() {
        let mut rng = StdRng::seed_from_u64(0);
        let traces = Array2::random_using((200, 120), Uniform::new(-1., 1.), &mut rng);
        let labels: Array1<usize> = Array1::random_using(200, Uniform::new(0, 9), &mut rng);

        for spacing in [0, 1, 3, 7] {
            let mut a = SumOfDifferences::new(10, spacing).unwrap();
            let mut b = SumOfDifferences::new(10, spacing).unwrap();
            a.fit(traces.view(), labels.view()).unwrap();
            b.fit(traces.view(), labels.view()).unwrap();

            let features = a.features().unwrap();
            assert_eq!(features, b.features().unwrap());
            assert_eq!(features.len(), 10);
            for (i, &x) in features.iter().enumerate() {
                for &y in &features[i + 1..] {
                    assert!(x.abs_diff(y) > spacing);
                }
            }
        }
    }

    #[test]
    fn test_unachievable_selection() {
        let traces = Array2::<f64>::zeros((4, 5));
        let labels = array![0usize, 1, 0, 1];

        let mut selector = SumOfDifferences::new(3, 2).unwrap();
        // Ties select index 0, which excludes 0..=2, then index 3 excludes 3..=4.
        assert!(matches!(
            selector.fit(traces.view(), labels.view()),
            Err(Error::PoiUnachievable {
                requested: 3,
                selectable: 2,
                ..
            })
        ));
        assert!(SumOfDifferences::new(0, 2).is_err());

        let mut oversized = SumOfDifferences::new(usize::MAX, 0).unwrap();
        assert!(matches!(
            oversized.fit(Array2::<f64>::zeros((2, 3)).view(), array![0usize, 1].view()),
            Err(Error::PoiUnachievable {
                requested: usize::MAX,
                selectable: 3,
                ..
            })
        ));
    }

    #[test]
    fn test_transform_before_fit() {
        let traces = Array2::<f64>::zeros((2, 5));
        let selector = SumOfDifferences::new(1, 0).unwrap();
        assert!(matches!(
            selector.transform(traces.view()),
            Err(Error::NotFitted(_))
        ));
        assert!(matches!(
            AllSamples::default().transform(traces.view()),
            Err(Error::NotFitted(_))
        ));
    }

    #[test]
    fn test_transform_shape_mismatch() {
        let traces = array![[0., 0., 9.], [0., 0., 1.]];
        let mut selector = SumOfDifferences::new(1, 0).unwrap();
        selector.fit(traces.view(), array![0usize, 1].view()).unwrap();
        assert_eq!(selector.features().unwrap(), &[2]);
        assert!(matches!(
            selector.transform(Array2::<f64>::zeros((1, 2)).view()),
            Err(Error::ShapeMismatch { .. })
        ));
        assert!(matches!(
            selector.transform(Array2::<f64>::zeros((1, 50)).view()),
            Err(Error::ShapeMismatch {
                what: "trace",
                expected: 3,
                actual: 50
            })
        ));
    }

    #[test]
    fn test_failed_refit_clears_selection() {
        let traces = array![[0., 0., 9.], [0., 0., 1.]];
        let labels = array![0usize, 1];
        let mut selector = SumOfDifferences::new(1, 0).unwrap();
        selector.fit(traces.view(), labels.view()).unwrap();

        assert!(selector.fit(traces.view(), array![0usize].view()).is_err());
        assert!(selector.features().is_none());
        assert!(selector.discrimination().is_none());
        assert!(matches!(
            selector.transform(traces.view()),
            Err(Error::NotFitted(_))
        ));
    }

    #[test]
    fn test_all_samples() {
        let traces = array![[1., 2.], [3., 4.]];
        let mut reducer = AllSamples::default();
        assert_eq!(
            reducer.fit_transform(traces.view(), array![0usize, 1].view()).unwrap(),
            traces
        );
    }
}
