//! Profiled template attacks on the first round AES S-box.
//!
//! Templates are multivariate Gaussians fitted on points of interest of labelled profiling
//! traces. They score every key hypothesis of attack traces, and the resulting score matrices
//! are turned into guessing entropy and success rate curves.
pub mod dataset;
mod error;
pub mod experiment;
pub mod feature_selection;
pub mod guessing_entropy;
pub mod leakage_model;
pub mod processors;
pub mod template;
pub mod util;

pub use crate::error::Error;
