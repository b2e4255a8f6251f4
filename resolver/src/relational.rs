use crate::backend::{Backend, BackendError};
use crate::metadata::{ConnectionMetadata, StoreKind};
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::str::FromStr;

/// Builds a Postgres pool from tenant metadata. The namespace becomes the session
/// `search_path`, so unqualified names resolve inside the tenant's schema.
pub(crate) async fn connect_postgres(metadata: &ConnectionMetadata) -> Result<PgPool, BackendError> {
    // Never log the uri, it may carry credentials.
    let mut options = PgConnectOptions::from_str(&metadata.uri)
        .map_err(|e| BackendError::Connect(format!("invalid connection uri: {e}")))?;

    if !metadata.principal.is_empty() {
        options = options.username(&metadata.principal);
    }
    if !metadata.secret.is_empty() {
        options = options.password(&metadata.secret);
    }
    if !metadata.namespace.is_empty() {
        options = options.options([("search_path", metadata.namespace.as_str())]);
    }

    PgPoolOptions::new()
        .min_connections(metadata.min_pool_size)
        .max_connections(metadata.max_pool_size)
        .acquire_timeout(metadata.connect_timeout)
        .connect_with(options)
        .await
        .map_err(|e| BackendError::Connect(e.to_string()))
}

pub(crate) async fn ping_postgres(pool: &PgPool) -> Result<(), BackendError> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(|e| BackendError::Query(e.to_string()))
}

/// SQL store driver.
#[derive(Clone, Copy, Debug, Default)]
pub struct RelationalBackend;

#[async_trait]
impl Backend for RelationalBackend {
    type Pool = PgPool;

    fn kind(&self) -> StoreKind {
        StoreKind::Relational
    }

    async fn connect(&self, metadata: &ConnectionMetadata) -> Result<PgPool, BackendError> {
        connect_postgres(metadata).await
    }

    async fn close(&self, pool: &PgPool) -> Result<(), BackendError> {
        pool.close().await;
        Ok(())
    }

    fn is_healthy(&self, pool: &PgPool) -> bool {
        !pool.is_closed()
    }

    async fn ping(&self, pool: &PgPool) -> Result<(), BackendError> {
        ping_postgres(pool).await
    }
}
