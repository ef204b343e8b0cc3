//! Core type definitions shared across the workspace.

use serde::{Deserialize, Serialize};

/// Size or stride descriptor: a single value applied to both axes, or a
/// per-axis sequence.
///
/// Deserializes from either `224` or `[224, 224]`. The sequence length is
/// only checked when the descriptor is resolved, see
/// [`dimensions_from_size`](crate::size::dimensions_from_size).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SizeSpec {
    /// Same value for height and width
    Scalar(usize),
    /// Explicit values, `[height, width]` when well-formed
    Seq(Vec<usize>),
}

impl SizeSpec {
    /// Square descriptor
    pub fn square(size: usize) -> Self {
        SizeSpec::Scalar(size)
    }

    /// Explicit `[height, width]` descriptor
    pub fn hw(height: usize, width: usize) -> Self {
        SizeSpec::Seq(vec![height, width])
    }
}

impl From<usize> for SizeSpec {
    fn from(value: usize) -> Self {
        SizeSpec::Scalar(value)
    }
}

impl From<[usize; 2]> for SizeSpec {
    fn from(value: [usize; 2]) -> Self {
        SizeSpec::Seq(value.to_vec())
    }
}

impl From<Vec<usize>> for SizeSpec {
    fn from(value: Vec<usize>) -> Self {
        SizeSpec::Seq(value)
    }
}

impl std::fmt::Display for SizeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SizeSpec::Scalar(v) => write!(f, "{}", v),
            SizeSpec::Seq(values) => {
                let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "{}", parts.join("x"))
            }
        }
    }
}
