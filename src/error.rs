//! Errors reported by the wrapped systems.

use std::error::Error as StdError;

/// Boxed error type used to carry SDK failures across the capability traits.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// An error reported by a wrapped SDK (Redis, S3).
///
/// The message is the SDK's own. The original error stays reachable through
/// [`DelegateError::downcast_ref`] so callers can match on SDK-specific kinds.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct DelegateError(BoxError);

impl DelegateError {
    pub fn new(err: impl Into<BoxError>) -> Self {
        Self(err.into())
    }

    /// Create from a plain message (used by backends with no native error type).
    pub fn msg(message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self(message.into())
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }

    pub fn into_inner(self) -> BoxError {
        self.0
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for DelegateError {
    fn from(err: redis::RedisError) -> Self {
        Self::new(err)
    }
}
