//! Error types for redis-message-queue.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The underlying store failure, if this error came from the store.
    pub fn as_store(&self) -> Option<&redis::RedisError> {
        match self {
            Error::Store(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a leased unit of work.
///
/// `Handler` carries the handler's own error untouched; it is only returned
/// after the message has been routed out of the processing list.
#[derive(Debug, Error)]
pub enum ProcessError<E> {
    #[error(transparent)]
    Store(#[from] Error),

    #[error("message handler failed: {0}")]
    Handler(E),
}

impl<E> ProcessError<E> {
    /// Unwrap the handler error, if that is what failed.
    pub fn into_handler(self) -> Option<E> {
        match self {
            ProcessError::Handler(e) => Some(e),
            ProcessError::Store(_) => None,
        }
    }
}
