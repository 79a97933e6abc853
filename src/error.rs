//! Typed errors raised by the teleoperation core.
//!
//! Hardware and bus failures travel as [`anyhow::Error`]; the variants here
//! cover contract and configuration violations that must never be papered
//! over with a default value.

use thiserror::Error;

/// Errors produced by the mapping core and its configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TeleopError {
    /// An expected observation field was absent.
    #[error("observation is missing field `{0}`")]
    MissingField(String),

    /// An observation field held NaN or an infinity.
    #[error("observation field `{key}` is not finite ({value})")]
    NonFinite {
        /// Field name.
        key: String,
        /// Offending value.
        value: f64,
    },

    /// A per-joint table had the wrong number of entries.
    #[error("{what} has {actual} entries, expected {expected}")]
    LengthMismatch {
        /// Which table.
        what: &'static str,
        /// Required length.
        expected: usize,
        /// Length found.
        actual: usize,
    },

    /// A configuration value broke a construction-time precondition.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A bus was used before `connect` or after `disconnect`.
    #[error("{0} is not connected")]
    NotConnected(&'static str),
}

impl TeleopError {
    /// Shorthand for [`TeleopError::InvalidConfig`].
    pub fn config(msg: impl Into<String>) -> Self {
        TeleopError::InvalidConfig(msg.into())
    }
}

/// Copy a per-joint table into a fixed-size array, failing on a length mismatch.
pub fn joint_table<T: Copy + Default, const N: usize>(
    what: &'static str,
    values: &[T],
) -> Result<[T; N], TeleopError> {
    if values.len() != N {
        return Err(TeleopError::LengthMismatch {
            what,
            expected: N,
            actual: values.len(),
        });
    }
    let mut out = [T::default(); N];
    out.copy_from_slice(values);
    Ok(out)
}
