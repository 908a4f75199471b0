//! Leakage models mapping a plaintext byte and a key hypothesis to a class label.
use std::str::FromStr;

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::{Error, error::check_len};

pub mod aes;

/// Number of possible values of a key byte.
pub const KEY_GUESSES: usize = 256;

pub fn hw(value: usize) -> usize {
    value.count_ones() as usize
}

/// Intermediate value targeted by the attack: the first round S-box output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeakageModel {
    /// The S-box output itself (256 classes).
    Identity,
    /// Hamming weight of the S-box output (9 classes).
    #[default]
    HammingWeight,
}

impl LeakageModel {
    /// Label of the S-box output `sbox(plaintext ^ key)`.
    pub fn leakage(self, plaintext: u8, key: u8) -> usize {
        let value = aes::sbox(plaintext ^ key) as usize;

        match self {
            Self::Identity => value,
            Self::HammingWeight => hw(value),
        }
    }

    /// Number of distinct labels the model can produce.
    pub fn num_classes(self) -> usize {
        match self {
            Self::Identity => 256,
            Self::HammingWeight => 9,
        }
    }

    /// Computes the labels of a batch of plaintext bytes.
    ///
    /// Returns [`Error::ShapeMismatch`] if per-trace keys do not match the plaintexts length.
    pub fn leakages(
        self,
        plaintexts: ArrayView1<u8>,
        keys: KeyBytes,
    ) -> Result<Array1<usize>, Error> {
        match keys {
            KeyBytes::Fixed(key) => Ok(plaintexts.mapv(|p| self.leakage(p, key))),
            KeyBytes::PerTrace(keys) => {
                check_len("keys", plaintexts.len(), keys.len())?;

                Ok(plaintexts
                    .iter()
                    .zip(keys.iter())
                    .map(|(&p, &k)| self.leakage(p, k))
                    .collect())
            }
        }
    }
}

impl FromStr for LeakageModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "identity" | "intermediate" => Ok(Self::Identity),
            "hw" | "hamming_weight" => Ok(Self::HammingWeight),
            _ => Err(Error::InvalidParameter {
                name: "leakage_model",
                reason: "expected one of identity, intermediate, hw, hamming_weight",
            }),
        }
    }
}

/// Key bytes associated with a batch of plaintexts.
#[derive(Debug, Clone, Copy)]
pub enum KeyBytes<'a> {
    /// Same key byte for every trace.
    Fixed(u8),
    /// One key byte per trace.
    PerTrace(ArrayView1<'a, u8>),
}
