use std::fmt;

use crate::weights::WeightError;

/// Inference-time shape violation raised by a kernel or a stage.
///
/// These are never produced while loading; a tensor that does not fit its
/// parameters at load time is a [`WeightError`] instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    /// Channel axis does not match the layer's input width.
    Channels {
        op: &'static str,
        expected: usize,
        found: usize,
    },
    /// Input too short to yield a single output position.
    TooShort {
        op: &'static str,
        len: usize,
        needed: usize,
    },
    /// GLU split axis has odd length.
    OddGlu { axis: usize, len: usize },
    /// Two tensors combined elementwise differ in shape.
    Mismatch {
        op: &'static str,
        left: Vec<usize>,
        right: Vec<usize>,
    },
    /// Crop window falls outside the axis.
    Crop {
        axis: usize,
        start: usize,
        len: usize,
        available: usize,
    },
}

impl fmt::Display for ShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeError::Channels { op, expected, found } => {
                write!(f, "{op}: expected {expected} input channels, got {found}")
            }
            ShapeError::TooShort { op, len, needed } => {
                write!(f, "{op}: input length {len} is shorter than {needed}")
            }
            ShapeError::OddGlu { axis, len } => {
                write!(f, "glu: axis {axis} has odd length {len}")
            }
            ShapeError::Mismatch { op, left, right } => {
                write!(f, "{op}: shapes {left:?} and {right:?} differ")
            }
            ShapeError::Crop {
                axis,
                start,
                len,
                available,
            } => write!(
                f,
                "crop [{start}, {}) out of range on axis {axis} (length {available})",
                start + len
            ),
        }
    }
}

impl std::error::Error for ShapeError {}

/// Top-level error type for the demucs-engine public API.
#[derive(Debug)]
pub enum DemucsError {
    /// Weight loading or validation failure.
    Weight(WeightError),
    /// Tensor shape violation during inference.
    Shape(ShapeError),
    /// Model configuration that cannot be built.
    Config(String),
    /// A stage entry point was called with an index the model does not have.
    InvalidStage { branch: &'static str, stage: usize },
    /// Internal invariant violation (e.g. skip stack empty).
    Internal(String),
}

impl fmt::Display for DemucsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DemucsError::Weight(e) => write!(f, "weight error: {}", e),
            DemucsError::Shape(e) => write!(f, "shape error: {}", e),
            DemucsError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            DemucsError::InvalidStage { branch, stage } => {
                write!(f, "no {} stage with index {}", branch, stage)
            }
            DemucsError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for DemucsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DemucsError::Weight(e) => Some(e),
            DemucsError::Shape(e) => Some(e),
            _ => None,
        }
    }
}

impl From<WeightError> for DemucsError {
    fn from(e: WeightError) -> Self {
        DemucsError::Weight(e)
    }
}

impl From<ShapeError> for DemucsError {
    fn from(e: ShapeError) -> Self {
        DemucsError::Shape(e)
    }
}

/// Convenience alias so callers can write `Result<T>` instead of `Result<T, DemucsError>`.
pub type Result<T> = std::result::Result<T, DemucsError>;
