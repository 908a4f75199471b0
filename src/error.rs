use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to save/load templar data")]
    SaveLoadError(#[from] serde_json::Error),
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error("Failed to read npy file")]
    ReadNpyError(#[from] ndarray_npy::ReadNpyError),
    #[error("Failed to write npy file")]
    WriteNpyError(#[from] ndarray_npy::WriteNpyError),
    #[error("Invalid parameter `{name}`: {reason}")]
    InvalidParameter {
        name: &'static str,
        reason: &'static str,
    },
    #[error(
        "Cannot select {requested} points of interest with spacing {spacing} in traces of \
         {num_samples} samples: only {selectable} can be selected"
    )]
    PoiUnachievable {
        requested: usize,
        selectable: usize,
        spacing: usize,
        num_samples: usize,
    },
    #[error("{0} must be fitted before use")]
    NotFitted(&'static str),
    #[error("Shape mismatch: {what} has length {actual}, expected {expected}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("No traces provided")]
    NoTraces,
    #[error("Label {label} is out of range for {num_classes} classes")]
    LabelOutOfRange { label: usize, num_classes: usize },
    #[error("No template was profiled for leakage label {0}")]
    MissingTemplate(usize),
    #[error("Covariance matrix cannot be factorized, even after regularization")]
    DegenerateCovariance,
}

/// Returns a [`Error::ShapeMismatch`] if `actual != expected`.
pub(crate) fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<(), Error> {
    if expected != actual {
        return Err(Error::ShapeMismatch {
            what,
            expected,
            actual,
        });
    }

    Ok(())
}
