//! Errors surfaced by [`crate::ContextStore`] implementations.

/// Mirrors the teacher pack's `common_redis::CustomRedisError` shape: a
/// small closed set rather than exposing the underlying driver's error type
/// to every caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,
    #[error("value could not be parsed: {0}")]
    Parse(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}
