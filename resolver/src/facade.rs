//! The single entry point business code uses to get a pool.
//!
//! [`RoutingFacade::acquire`] reads the tenant bound to the current call chain and
//! hands back a [`Lease`] on that tenant's pool. The default tenant is served by a
//! pool built at startup; every other tenant goes through the [`PoolRegistry`].

use crate::backend::Backend;
use crate::metadata::{ConnectionMetadata, StoreKind};
use crate::registry::{Lease, PoolEntry, PoolInfo, PoolRegistry, ResolveError, ShutdownReport};
use crate::tenant::{TenantContext, TenantId};
use async_trait::async_trait;
use std::sync::Arc;

pub struct RoutingFacade<B: Backend> {
    registry: Arc<PoolRegistry<B>>,
    default: Arc<PoolEntry<B::Pool>>,
}

impl<B: Backend> RoutingFacade<B> {
    /// Builds the default tenant's pool from `default` and fronts `registry` with it.
    /// Fails if the default pool cannot be constructed.
    pub async fn new(
        registry: Arc<PoolRegistry<B>>,
        default: ConnectionMetadata,
    ) -> Result<Self, ResolveError> {
        let default = registry.provision(default).await?;
        tracing::info!(kind = %registry.kind(), "default pool provisioned");
        Ok(RoutingFacade { registry, default })
    }

    /// Borrows the pool of the tenant bound to the current call chain.
    pub async fn acquire(&self) -> Result<Lease<B::Pool>, ResolveError> {
        self.acquire_for(&TenantContext::get()).await
    }

    pub async fn acquire_for(&self, tenant: &TenantId) -> Result<Lease<B::Pool>, ResolveError> {
        if tenant.is_default() {
            return self.default.try_lease().ok_or(ResolveError::ShuttingDown);
        }

        loop {
            let entry = self.registry.resolve(tenant).await?;
            if let Some(lease) = entry.try_lease() {
                return Ok(lease);
            }
            // Retired between resolve and lease. Retired entries are already out of
            // the map, so the next resolve finds or builds the replacement.
            tokio::task::yield_now().await;
        }
    }

    pub fn registry(&self) -> &Arc<PoolRegistry<B>> {
        &self.registry
    }
}

/// Kind-agnostic operations over one store kind's pools, used by the request filter,
/// the admin endpoints and shutdown.
#[async_trait]
pub trait TenantPools: Send + Sync {
    fn kind(&self) -> StoreKind;

    /// Makes sure the tenant's pool exists, surfacing resolution failures early.
    async fn warm(&self, tenant: &TenantId) -> Result<(), ResolveError>;

    async fn evict(&self, tenant: &TenantId) -> bool;

    fn snapshot(&self) -> Vec<PoolInfo>;

    /// Closes every tenant pool and the default pool.
    async fn close_all(&self) -> ShutdownReport;
}

#[async_trait]
impl<B: Backend> TenantPools for RoutingFacade<B> {
    fn kind(&self) -> StoreKind {
        self.registry.kind()
    }

    async fn warm(&self, tenant: &TenantId) -> Result<(), ResolveError> {
        if tenant.is_default() {
            return Ok(());
        }
        self.registry.resolve(tenant).await.map(|_| ())
    }

    async fn evict(&self, tenant: &TenantId) -> bool {
        self.registry.evict(tenant).await
    }

    fn snapshot(&self) -> Vec<PoolInfo> {
        self.registry.snapshot()
    }

    async fn close_all(&self) -> ShutdownReport {
        if self.registry.is_shut_down() {
            return ShutdownReport::default();
        }
        let mut report = self.registry.shutdown_all().await;

        match self.registry.close_entry(&self.default).await {
            Ok(()) => report.closed += 1,
            Err(err) => {
                tracing::error!(kind = %self.kind(), "failed to close default pool: {err}");
                report.failed.push(self.default.tenant().clone());
            }
        }
        report
    }
}
