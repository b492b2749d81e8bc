//! Error type shared by the resilience primitives

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ResilienceError {
    /// Failure expected to clear up on its own (endpoint briefly unreachable)
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection pool is full ({0} connections)")]
    PoolExhausted(usize),

    /// Factory failure carrying the caller's own error type
    #[error("Connection failed: {0}")]
    Connect(Arc<dyn std::error::Error + Send + Sync>),
}

impl ResilienceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ResilienceError::Transient(_) | ResilienceError::Timeout(_))
    }

    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    pub fn connect<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ResilienceError::Connect(Arc::new(source))
    }

    /// Recover the factory's error if it is of type `E`
    pub fn connect_source<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            ResilienceError::Connect(source) => source.downcast_ref::<E>(),
            _ => None,
        }
    }
}
