//! Convenient utility functions.

use std::{cmp::Ordering, fs::File, io::BufWriter, path::Path};

use ndarray::{Array2, ArrayBase, ArrayView1, ArrayView2, Data, Dimension};
use ndarray_npy::{WritableElement, WriteNpyExt};
use num_traits::AsPrimitive;

use crate::Error;

#[cfg(feature = "progress_bar")]
use indicatif::{ProgressBar, ProgressStyle};
#[cfg(feature = "progress_bar")]
use std::time::Duration;

/// Creates a [`ProgressBar`] with a predefined default style.
#[cfg(feature = "progress_bar")]
pub fn progress_bar(len: usize) -> ProgressBar {
    let progress_bar = ProgressBar::new(len as u64).with_style(
        ProgressStyle::with_template("{elapsed_precise} {wide_bar} {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    progress_bar.enable_steady_tick(Duration::new(0, 100000000));
    progress_bar
}

/// Saves an array to a numpy `.npy` file.
pub fn save_array<P, S, D>(path: P, array: &ArrayBase<S, D>) -> Result<(), Error>
where
    P: AsRef<Path>,
    S: Data,
    S::Elem: WritableElement,
    D: Dimension,
{
    let writer = BufWriter::new(File::create(path)?);
    array.write_npy(writer)?;

    Ok(())
}

/// Converts traces of any primitive sample type to `f64`.
pub fn to_f64<T>(traces: ArrayView2<T>) -> Array2<f64>
where
    T: AsPrimitive<f64>,
{
    traces.mapv(|x| x.as_())
}

/// Return the indices that would sort the given array with a comparison function.
pub fn argsort_by<T, F>(data: &[T], compare: F) -> Vec<usize>
where
    F: Fn(&T, &T) -> Ordering,
{
    let mut indices: Vec<usize> = (0..data.len()).collect();

    indices.sort_by(|&a, &b| compare(&data[a], &data[b]));

    indices
}

/// Return the index of the maximum value in the given array.
///
/// The first index is returned on ties.
pub fn argmax_by<T, F>(array: ArrayView1<T>, compare: F) -> usize
where
    F: Fn(&T, &T) -> Ordering,
{
    let mut idx_max = 0;

    for i in 0..array.shape()[0] {
        if compare(&array[i], &array[idx_max]).is_gt() {
            idx_max = i;
        }
    }

    idx_max
}
