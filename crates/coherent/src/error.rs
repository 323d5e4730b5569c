use coherent_env::EnvVarError;
use thiserror::Error;

use crate::{access::Access, tensor::dtypes::Dtype};

#[derive(Error, Debug)]
pub enum CoherentError {
    #[error("Invalid execution context: {0}")]
    InvalidContext(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Unsupported tensor options: dtype {dtype:?} with {layout} layout")]
    UnsupportedOptions { dtype: Dtype, layout: &'static str },
    #[error("Conversion {conversion} failed: {reason}")]
    ConversionFailure { conversion: &'static str, reason: String },
    #[error("Access violation: requested {requested} but only {granted} is granted")]
    AccessViolation { requested: Access, granted: Access },
    #[error("Dtype mismatch: expected {expected:?}, actual {actual:?}")]
    DtypeMismatch { expected: Dtype, actual: Dtype },
    #[error("Invalid shape: {0}")]
    InvalidShape(String),
    #[error("Failed to create buffer of size {0}")]
    BufferCreationFailed(usize),
    #[error("Failed to create {width}x{height}x{depth} image")]
    ImageCreationFailed { width: usize, height: usize, depth: usize },
    #[error("Out of memory: {requested} bytes requested with {available} bytes available")]
    OutOfMemory { requested: usize, available: usize },
    #[error("Buffer is not host visible")]
    NotHostVisible,
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error(transparent)]
    Config(#[from] EnvVarError),
}

impl CoherentError {
    pub(crate) fn conversion(conversion: &'static str, reason: impl Into<String>) -> Self {
        Self::ConversionFailure {
            conversion,
            reason: reason.into(),
        }
    }
}
