use crate::error::GatewayError;
use thiserror::Error;

/// Outcome of a retried operation that did not succeed
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("Maximum retries ({attempts}) exceeded: {last}")]
    MaxRetriesExceeded { attempts: u32, last: E },

    #[error("Non-retryable failure: {0}")]
    Fatal(E),

    #[error("Retry interrupted by shutdown signal")]
    Interrupted,
}

impl<E> RetryError<E> {
    pub fn is_max_retries(&self) -> bool {
        matches!(self, RetryError::MaxRetriesExceeded { .. })
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, RetryError::Interrupted)
    }

    /// The last error observed, unless the retry was interrupted
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::MaxRetriesExceeded { last, .. } => Some(last),
            RetryError::Fatal(e) => Some(e),
            RetryError::Interrupted => None,
        }
    }
}

/// Errors that know whether another attempt may succeed
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for GatewayError {
    fn is_retryable(&self) -> bool {
        GatewayError::is_retryable(self)
    }
}
