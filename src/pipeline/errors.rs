use thiserror::Error;

use crate::core::errors::ProcessingError;

/// A loosely-typed value could not be converted to the required type
#[derive(Debug, Error, Clone, PartialEq)]
#[error("cannot interpret `{value}` as {expected}")]
pub struct CoercionError {
    pub value: String,
    pub expected: &'static str,
}

impl CoercionError {
    pub fn new(value: impl ToString, expected: &'static str) -> Self {
        Self {
            value: value.to_string(),
            expected,
        }
    }
}

/// Errors of the module dispatch
#[derive(Debug, Error, PartialEq)]
pub enum PipelineError {
    /// The identifier is not one of the dispatchable operations. The registry
    /// and the dispatch table are out of sync.
    #[error("unimplemented operation: {0}")]
    UnknownModule(String),

    #[error("invalid value for parameter `{param}`: {source}")]
    InvalidParam {
        param: String,
        #[source]
        source: CoercionError,
    },

    #[error("invalid pipeline description: {0}")]
    InvalidSteps(String),

    /// Failure inside the preprocessing backend, passed through unchanged
    #[error(transparent)]
    Processing(#[from] ProcessingError),
}
