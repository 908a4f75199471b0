//! Profiling and attack trace sets.
use std::{ops::Range, path::Path};

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};
use ndarray_npy::{ReadableElement, read_npy};
use num_traits::AsPrimitive;

use crate::{Error, error::check_len, util::to_f64};

/// Traces with the plaintext and key bytes of the attacked position.
#[derive(Debug, Clone)]
pub struct TraceSet {
    traces: Array2<f64>,
    plaintexts: Array1<u8>,
    keys: Array1<u8>,
}

impl TraceSet {
    /// Returns [`Error::ShapeMismatch`] if `plaintexts` or `keys` do not have one entry per trace.
    pub fn new(
        traces: Array2<f64>,
        plaintexts: Array1<u8>,
        keys: Array1<u8>,
    ) -> Result<Self, Error> {
        check_len("plaintexts", traces.nrows(), plaintexts.len())?;
        check_len("keys", traces.nrows(), keys.len())?;

        Ok(Self {
            traces,
            plaintexts,
            keys,
        })
    }

    pub fn traces(&self) -> ArrayView2<f64> {
        self.traces.view()
    }

    pub fn plaintexts(&self) -> ArrayView1<u8> {
        self.plaintexts.view()
    }

    pub fn keys(&self) -> ArrayView1<u8> {
        self.keys.view()
    }

    /// Number of traces.
    pub fn len(&self) -> usize {
        self.traces.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of samples per trace.
    pub fn num_samples(&self) -> usize {
        self.traces.ncols()
    }

    /// Copies the traces of `range`.
    pub fn select(&self, range: Range<usize>) -> Result<Self, Error> {
        if range.start > range.end || range.end > self.len() {
            return Err(Error::InvalidParameter {
                name: "range",
                reason: "range must lie within the trace set",
            });
        }

        Ok(Self {
            traces: self.traces.slice(s![range.clone(), ..]).to_owned(),
            plaintexts: self.plaintexts.slice(s![range.clone()]).to_owned(),
            keys: self.keys.slice(s![range]).to_owned(),
        })
    }
}

/// Profiling and attack splits of a campaign.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub profiling: TraceSet,
    pub attack: TraceSet,
}

/// Loads a campaign stored as flat numpy files in `dir`.
///
/// `traces.npy` holds one trace per row, with samples of type `T`. `plain.npy` and `key.npy` hold
/// one 16 bytes block per row, of which only `target_byte` is kept. The rows of `profiling` and
/// `attack` form the two splits.
pub fn load_npy_dir<T, P>(
    dir: P,
    target_byte: usize,
    profiling: Range<usize>,
    attack: Range<usize>,
) -> Result<Dataset, Error>
where
    T: ReadableElement + AsPrimitive<f64>,
    P: AsRef<Path>,
{
    let dir = dir.as_ref();
    let traces: Array2<T> = read_npy(dir.join("traces.npy"))?;
    let plaintexts: Array2<u8> = read_npy(dir.join("plain.npy"))?;
    let keys: Array2<u8> = read_npy(dir.join("key.npy"))?;

    if target_byte >= plaintexts.ncols() || target_byte >= keys.ncols() {
        return Err(Error::InvalidParameter {
            name: "target_byte",
            reason: "target byte is out of the plaintext or key block",
        });
    }

    let campaign = TraceSet::new(
        to_f64(traces.view()),
        plaintexts.column(target_byte).to_owned(),
        keys.column(target_byte).to_owned(),
    )?;

    Ok(Dataset {
        profiling: campaign.select(profiling)?,
        attack: campaign.select(attack)?,
    })
}

#[cfg(test)]
mod tests {
    use super::{TraceSet, load_npy_dir};
    use crate::Error;
    use ndarray::{Array1, Array2, array};
    use ndarray_npy::write_npy;
    use std::{env, fs};

    #[test]
    fn test_trace_set() {
        let set = TraceSet::new(
            array![[1., 2.], [3., 4.], [5., 6.]],
            array![10u8, 11, 12],
            array![7u8, 7, 7],
        )
        .unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.num_samples(), 2);

        let tail = set.select(1..3).unwrap();
        assert_eq!(tail.traces(), array![[3., 4.], [5., 6.]]);
        assert_eq!(tail.plaintexts(), array![11u8, 12]);
        assert!(set.select(2..4).is_err());

        assert!(matches!(
            TraceSet::new(Array2::zeros((2, 2)), Array1::zeros(3), Array1::zeros(2)),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_load_npy_dir() {
        let dir = env::temp_dir().join(format!("templar-dataset-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let traces = Array2::from_shape_fn((6, 4), |(i, j)| (i * 4 + j) as i16);
        let plaintexts = Array2::from_shape_fn((6, 16), |(i, j)| (i + j) as u8);
        let keys = Array2::from_shape_fn((6, 16), |(_, j)| j as u8);
        write_npy(dir.join("traces.npy"), &traces).unwrap();
        write_npy(dir.join("plain.npy"), &plaintexts).unwrap();
        write_npy(dir.join("key.npy"), &keys).unwrap();

        let dataset = load_npy_dir::<i16, _>(&dir, 2, 0..4, 4..6).unwrap();
        assert_eq!(dataset.profiling.len(), 4);
        assert_eq!(dataset.attack.traces(), array![[16., 17., 18., 19.], [20., 21., 22., 23.]]);
        assert_eq!(dataset.attack.plaintexts(), array![6u8, 7]);
        assert_eq!(dataset.profiling.keys(), array![2u8, 2, 2, 2]);

        assert!(matches!(
            load_npy_dir::<i16, _>(&dir, 16, 0..4, 4..6),
            Err(Error::InvalidParameter { name: "target_byte", .. })
        ));

        fs::remove_dir_all(&dir).unwrap();
    }
}
