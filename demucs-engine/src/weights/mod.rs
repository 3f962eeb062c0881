pub(crate) mod load;
pub mod tensor_store;

use std::fmt;

use tensor_store::StoredTensor;

/// Errors that can occur during weight loading.
#[derive(Debug)]
pub enum WeightError {
    SafetensorsError(String),
    MissingKey(String),
    NoTensorsFound(String),
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    /// Final decoder width does not fit the requested number of sources.
    SourceVariant {
        key: String,
        sources: usize,
        found: usize,
    },
    UnusedKeys(Vec<String>),
    UnsupportedDtype(String),
}

impl fmt::Display for WeightError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightError::SafetensorsError(e) => write!(f, "safetensors error: {}", e),
            WeightError::MissingKey(k) => write!(f, "missing tensor key: {}", k),
            WeightError::NoTensorsFound(sig) => {
                write!(f, "no tensors found for signature: {}", sig)
            }
            WeightError::ShapeMismatch {
                key,
                expected,
                found,
            } => write!(
                f,
                "shape mismatch for {}: expected {:?}, found {:?}",
                key, expected, found
            ),
            WeightError::SourceVariant {
                key,
                sources,
                found,
            } => write!(
                f,
                "{} does not match a {}-source model (output width {})",
                key, sources, found
            ),
            WeightError::UnusedKeys(keys) => {
                let shown: Vec<&str> = keys.iter().take(20).map(|s| s.as_str()).collect();
                write!(f, "{} unused tensors: {:?}", keys.len(), shown)
            }
            WeightError::UnsupportedDtype(d) => write!(f, "unsupported dtype: {}", d),
        }
    }
}

impl std::error::Error for WeightError {}

/// Supplies named, shaped parameter tensors to the loader.
///
/// Keys use the PyTorch checkpoint naming (`encoder.0.conv.weight`, ...).
/// `expected` is the shape the layer was built with; implementations must
/// reject anything else with [`WeightError::ShapeMismatch`].
pub trait TensorSource {
    fn take(&mut self, key: &str, expected: &[usize]) -> Result<StoredTensor, WeightError>;

    /// Called once after every layer has been loaded.
    fn finish(&mut self) -> Result<(), WeightError> {
        Ok(())
    }
}

impl<S: TensorSource + ?Sized> TensorSource for &mut S {
    fn take(&mut self, key: &str, expected: &[usize]) -> Result<StoredTensor, WeightError> {
        (**self).take(key, expected)
    }

    fn finish(&mut self) -> Result<(), WeightError> {
        (**self).finish()
    }
}
