/// error types for the store, source and read-through layers
///
use std::time::Duration;
use thiserror::Error;

/// the cache backend could not be reached or refused a command
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
}

/// the upstream data source failed to produce a value
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("upstream fetch failed: {0}")]
    Failed(String),
}

/// errors returned to callers of the read-through coordinator.
///
/// `Clone` because a single upstream fetch fans its result out to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache key must not be empty")]
    InvalidKey,

    #[error("source unavailable: {0}")]
    SourceFetchFailed(String),

    #[error("source unavailable: fetch timed out after {0:?}")]
    SourceTimeout(Duration),
}

impl From<SourceError> for CacheError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Failed(msg) => CacheError::SourceFetchFailed(msg),
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl<T> From<async_channel::SendError<T>> for StoreError {
    fn from(_: async_channel::SendError<T>) -> Self {
        StoreError::Unavailable("store worker is shut down".to_string())
    }
}

impl From<async_channel::RecvError> for StoreError {
    fn from(_: async_channel::RecvError) -> Self {
        StoreError::Unavailable("store worker dropped the request".to_string())
    }
}
