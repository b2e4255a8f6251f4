//! Per-tenant connection metadata and the caching client in front of the
//! metadata authority.

use crate::config::{DatasourceSettings, SettingsError, redact_uri};
use crate::metrics_defs::{METADATA_FETCH, METADATA_FETCH_DURATION, METADATA_FETCH_FAILED};
use crate::tenant::TenantId;
use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use shared::{counter, histogram};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Kind of backing store a pool talks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Relational,
    Document,
}

impl StoreKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Relational => "relational",
            StoreKind::Document => "document",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection parameters of one tenant's backing store. Shared behind an `Arc` once
/// fetched; a refresh produces a new value instead of mutating this one.
#[derive(Clone)]
pub struct ConnectionMetadata {
    pub tenant: TenantId,
    pub kind: StoreKind,
    pub uri: String,
    pub principal: String,
    pub secret: String,
    pub namespace: String,
    pub min_pool_size: u32,
    pub max_pool_size: u32,
    pub connect_timeout: Duration,
    pub fetched_at: SystemTime,
}

impl ConnectionMetadata {
    pub fn from_settings(
        tenant: TenantId,
        kind: StoreKind,
        settings: DatasourceSettings,
    ) -> Result<Self, SettingsError> {
        settings.validate()?;

        Ok(ConnectionMetadata {
            tenant,
            kind,
            uri: settings.uri,
            principal: settings.principal,
            secret: settings.secret,
            namespace: settings.namespace,
            min_pool_size: settings.min_pool_size,
            max_pool_size: settings.max_pool_size,
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            fetched_at: SystemTime::now(),
        })
    }
}

impl fmt::Debug for ConnectionMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionMetadata")
            .field("tenant", &self.tenant)
            .field("kind", &self.kind)
            .field("uri", &redact_uri(&self.uri))
            .field("principal", &self.principal)
            .field("secret", &"<redacted>")
            .field("namespace", &self.namespace)
            .field("min_pool_size", &self.min_pool_size)
            .field("max_pool_size", &self.max_pool_size)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MetadataError {
    #[error("no {kind} datasource is configured for tenant {tenant}")]
    TenantNotFound { tenant: TenantId, kind: StoreKind },
    #[error("metadata authority unavailable: {0}")]
    Unavailable(String),
}

/// The source of truth for tenant connection parameters.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Performs exactly one lookup. Retrying is left to the caller.
    async fn fetch(
        &self,
        tenant: &TenantId,
        kind: StoreKind,
    ) -> Result<ConnectionMetadata, MetadataError>;
}

/// Caches metadata per (tenant, kind) with a bounded TTL. Concurrent misses for the
/// same key share one in-flight fetch; failures are handed to every waiter and are
/// never cached.
pub struct MetadataClient {
    source: Arc<dyn MetadataSource>,
    cache: Cache<(TenantId, StoreKind), Arc<ConnectionMetadata>>,
}

impl MetadataClient {
    pub fn new(source: Arc<dyn MetadataSource>, ttl: Duration, capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();

        MetadataClient { source, cache }
    }

    pub async fn fetch(
        &self,
        tenant: &TenantId,
        kind: StoreKind,
    ) -> Result<Arc<ConnectionMetadata>, MetadataError> {
        let source = self.source.clone();
        let owned_tenant = tenant.clone();

        self.cache
            .try_get_with((tenant.clone(), kind), async move {
                counter!(METADATA_FETCH, "kind" => kind.as_str()).increment(1);
                let start = Instant::now();
                let result = source.fetch(&owned_tenant, kind).await;
                histogram!(METADATA_FETCH_DURATION).record(start.elapsed().as_secs_f64());

                if let Err(err) = &result {
                    counter!(METADATA_FETCH_FAILED, "kind" => kind.as_str()).increment(1);
                    tracing::warn!(tenant = %owned_tenant, %kind, "metadata fetch failed: {err}");
                }
                result.map(Arc::new)
            })
            .await
            .map_err(|err| (*err).clone())
    }

    /// Drops the cached entry so the next fetch goes back to the authority.
    pub async fn invalidate(&self, tenant: &TenantId, kind: StoreKind) {
        self.cache.invalidate(&(tenant.clone(), kind)).await;
    }
}
