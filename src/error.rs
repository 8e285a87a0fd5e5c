//! sbmoe error types

/// sbmoe result type
pub type Result<T> = std::result::Result<T, Error>;

/// sbmoe errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from numr operations
    #[error("numr error: {0}")]
    Numr(#[from] numr::error::Error),

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Tensor shape or head arity does not fit the operation
    #[error("shape mismatch: {reason}")]
    ShapeMismatch {
        /// Description of what went wrong
        reason: String,
    },

    /// Parallelism or input options that cannot be combined
    #[error("incompatible configuration: {reason}")]
    IncompatibleConfig {
        /// Description of what went wrong
        reason: String,
    },

    /// Model construction or config error
    #[error("model error: {reason}")]
    ModelError {
        /// Description of what went wrong
        reason: String,
    },

    /// Distributed communication error
    #[error("distributed error: {reason}")]
    DistributedError {
        /// Description of what went wrong
        reason: String,
    },
}

impl Error {
    pub(crate) fn shape(reason: impl Into<String>) -> Self {
        Error::ShapeMismatch {
            reason: reason.into(),
        }
    }

    pub(crate) fn incompatible(reason: impl Into<String>) -> Self {
        Error::IncompatibleConfig {
            reason: reason.into(),
        }
    }
}
