use crate::metadata::{ConnectionMetadata, StoreKind};
use async_trait::async_trait;
use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("could not connect: {0}")]
    Connect(String),
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("could not close pool: {0}")]
    Close(String),
    #[error("query failed: {0}")]
    Query(String),
}

/// Driver capability a [`crate::registry::PoolRegistry`] is parameterized over: how
/// to build, check and close the pooled resource of one backing-store kind.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Pool: Clone + Send + Sync + 'static;

    fn kind(&self) -> StoreKind;

    /// Builds a pool from tenant metadata, including the driver's connection warm-up.
    async fn connect(&self, metadata: &ConnectionMetadata) -> Result<Self::Pool, BackendError>;

    /// Closes the pool. Called at most once per constructed pool.
    async fn close(&self, pool: &Self::Pool) -> Result<(), BackendError>;

    fn is_healthy(&self, _pool: &Self::Pool) -> bool {
        true
    }

    /// Runs a trivial round trip against the store.
    async fn ping(&self, pool: &Self::Pool) -> Result<(), BackendError>;
}
