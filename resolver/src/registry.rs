//! Tenant id to live pool cache.
//!
//! Lookups take a shared read lock on the map. A miss takes a per-tenant creation
//! lock, re-checks the map and only then fetches metadata and builds the pool, so
//! at most one construction per tenant is in flight and tenants never wait on each
//! other. Nothing is cached when metadata or construction fails.

use crate::backend::{Backend, BackendError};
use crate::config::RegistryConfig;
use crate::metadata::{ConnectionMetadata, MetadataClient, MetadataError, StoreKind};
use crate::metrics_defs::{
    REGISTRY_POOL_CLOSE_FAILED, REGISTRY_POOL_CLOSED, REGISTRY_POOL_CONSTRUCTED,
    REGISTRY_POOL_CONSTRUCTION_FAILED, REGISTRY_POOLS, REGISTRY_RESOLVE_HIT,
    REGISTRY_RESOLVE_MISS,
};
use crate::tenant::TenantId;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use shared::{counter, gauge};
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::task::JoinSet;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("no datasource is configured for tenant {0}")]
    TenantNotFound(TenantId),
    #[error("metadata authority unavailable: {0}")]
    MetadataUnavailable(String),
    #[error("could not construct pool for tenant {tenant}: {source}")]
    PoolConstructionFailed {
        tenant: TenantId,
        source: BackendError,
    },
    #[error("tenant pool limit of {limit} reached")]
    CapacityExceeded { limit: usize },
    #[error("pool registry is shutting down")]
    ShuttingDown,
    #[error("the default tenant is served by the pre-provisioned pool")]
    DefaultTenant,
}

impl From<MetadataError> for ResolveError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::TenantNotFound { tenant, .. } => ResolveError::TenantNotFound(tenant),
            MetadataError::Unavailable(message) => ResolveError::MetadataUnavailable(message),
        }
    }
}

/// A cached pool and its borrow state. Only the registry creates, retires and closes
/// entries; everyone else borrows through a [`Lease`].
pub struct PoolEntry<P> {
    tenant: TenantId,
    pool: P,
    metadata: Arc<ConnectionMetadata>,
    created_at: SystemTime,
    leases: AtomicUsize,
    retired: AtomicBool,
    closed: AtomicBool,
    released: Notify,
}

impl<P> PoolEntry<P> {
    fn new(pool: P, metadata: Arc<ConnectionMetadata>) -> Self {
        PoolEntry {
            tenant: metadata.tenant.clone(),
            pool,
            metadata,
            created_at: SystemTime::now(),
            leases: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            released: Notify::new(),
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.metadata
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn active_leases(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Borrows the pool. Refused once the entry has been retired, so new checkouts
    /// move on to the replacement pool.
    pub fn try_lease(self: &Arc<Self>) -> Option<Lease<P>> {
        // Count first, then check: retire() flips the flag before it reads the count.
        self.leases.fetch_add(1, Ordering::SeqCst);
        if self.retired.load(Ordering::SeqCst) {
            self.release();
            return None;
        }
        Some(Lease {
            entry: self.clone(),
        })
    }

    fn release(&self) {
        if self.leases.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.released.notify_waiters();
        }
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    async fn drained(&self) {
        loop {
            let notified = self.released.notified();
            if self.leases.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    fn info(&self, kind: StoreKind) -> PoolInfo {
        PoolInfo {
            tenant: self.tenant.clone(),
            kind,
            namespace: self.metadata.namespace.clone(),
            created_at: self
                .created_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            active_leases: self.active_leases(),
        }
    }
}

impl<P> fmt::Debug for PoolEntry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("tenant", &self.tenant)
            .field("namespace", &self.metadata.namespace)
            .field("leases", &self.active_leases())
            .field("retired", &self.is_retired())
            .finish()
    }
}

/// An in-flight borrow of a tenant pool. Dereferences to the pool itself.
pub struct Lease<P> {
    entry: Arc<PoolEntry<P>>,
}

impl<P> Lease<P> {
    pub fn tenant(&self) -> &TenantId {
        &self.entry.tenant
    }

    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.entry.metadata
    }
}

impl<P> Deref for Lease<P> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.entry.pool
    }
}

impl<P> Drop for Lease<P> {
    fn drop(&mut self) {
        self.entry.release();
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PoolInfo {
    pub tenant: TenantId,
    pub kind: StoreKind,
    pub namespace: String,
    /// Seconds since the unix epoch.
    pub created_at: u64,
    pub active_leases: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShutdownReport {
    pub closed: usize,
    pub failed: Vec<TenantId>,
}

impl ShutdownReport {
    pub fn merge(&mut self, other: ShutdownReport) {
        self.closed += other.closed;
        self.failed.extend(other.failed);
    }
}

pub struct PoolRegistry<B: Backend> {
    backend: Arc<B>,
    metadata: Arc<MetadataClient>,
    config: RegistryConfig,
    entries: RwLock<HashMap<TenantId, Arc<PoolEntry<B::Pool>>>>,
    creation_locks: CreationLocks,
    /// Closes of replaced entries that no longer sit in the map.
    retiring: Mutex<JoinSet<Retirement>>,
    closed: AtomicBool,
}

type Retirement = (TenantId, Result<(), BackendError>);

impl<B: Backend> PoolRegistry<B> {
    pub fn new(backend: Arc<B>, metadata: Arc<MetadataClient>, config: RegistryConfig) -> Self {
        PoolRegistry {
            backend,
            metadata,
            config,
            entries: RwLock::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
            retiring: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> StoreKind {
        self.backend.kind()
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn drain_timeout(&self) -> Duration {
        self.config.drain_timeout()
    }

    /// Returns the tenant's live pool entry, constructing it on first use.
    pub async fn resolve(
        &self,
        tenant: &TenantId,
    ) -> Result<Arc<PoolEntry<B::Pool>>, ResolveError> {
        if tenant.is_default() {
            return Err(ResolveError::DefaultTenant);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(ResolveError::ShuttingDown);
        }

        let kind = self.kind().as_str();
        if let Some(entry) = self.healthy_entry(tenant) {
            counter!(REGISTRY_RESOLVE_HIT, "kind" => kind).increment(1);
            return Ok(entry);
        }
        counter!(REGISTRY_RESOLVE_MISS, "kind" => kind).increment(1);

        let slot = CreationSlot::new(&self.creation_locks, tenant);
        let _guard = slot.acquire().await;

        // Another caller may have finished building while we waited for the lock.
        if let Some(entry) = self.healthy_entry(tenant) {
            return Ok(entry);
        }
        self.discard_unhealthy(tenant);

        self.construct(tenant).await
    }

    /// Builds a pool that is not tracked in the map, for the pre-provisioned default
    /// tenant. It is never evicted and must be closed with [`PoolRegistry::close_entry`].
    pub async fn provision(
        &self,
        metadata: ConnectionMetadata,
    ) -> Result<Arc<PoolEntry<B::Pool>>, ResolveError> {
        let metadata = Arc::new(metadata);
        let pool = self.connect(&metadata).await?;
        Ok(Arc::new(PoolEntry::new(pool, metadata)))
    }

    /// Drops the tenant's cached pool and metadata so the next resolve starts over.
    /// Returns whether a pool was cached. The old pool keeps serving its outstanding
    /// leases until they are released or the drain timeout passes, then closes.
    pub async fn evict(&self, tenant: &TenantId) -> bool {
        // Under the creation lock: a pool under construction is inserted before it is
        // removed here, never after.
        let removed = {
            let slot = CreationSlot::new(&self.creation_locks, tenant);
            let _guard = slot.acquire().await;
            self.metadata.invalidate(tenant, self.kind()).await;

            let mut entries = self.entries.write();
            let removed = entries.remove(tenant);
            gauge!(REGISTRY_POOLS, "kind" => self.kind().as_str()).set(entries.len() as f64);
            removed
        };

        let Some(entry) = removed else {
            return false;
        };

        tracing::info!(
            %tenant,
            kind = %self.kind(),
            leases = entry.active_leases(),
            "evicting tenant pool"
        );
        if let Err(err) = retire(&*self.backend, &entry, self.drain_timeout()).await {
            tracing::warn!(%tenant, kind = %self.kind(), "evicted pool failed to close: {err}");
        }
        true
    }

    /// Closes every cached pool. Only the first call does any work; individual close
    /// failures are reported and do not stop the remaining closes.
    pub async fn shutdown_all(&self) -> ShutdownReport {
        let (drained, mut join_set) = {
            let mut entries = self.entries.write();
            if self.closed.swap(true, Ordering::SeqCst) {
                return ShutdownReport::default();
            }
            let drained: Vec<_> = entries.drain().map(|(_, entry)| entry).collect();
            (drained, std::mem::take(&mut *self.retiring.lock()))
        };
        gauge!(REGISTRY_POOLS, "kind" => self.kind().as_str()).set(0.0);

        tracing::info!(
            kind = %self.kind(),
            pools = drained.len(),
            retiring = join_set.len(),
            "closing tenant pools"
        );

        let drain_timeout = self.drain_timeout();
        for entry in drained {
            let backend = self.backend.clone();
            join_set.spawn(async move {
                let result = retire(&*backend, &entry, drain_timeout).await;
                (entry.tenant().clone(), result)
            });
        }

        let mut report = ShutdownReport::default();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.closed += 1,
                Ok((tenant, Err(err))) => {
                    tracing::error!(%tenant, kind = %self.kind(), "failed to close pool: {err}");
                    report.failed.push(tenant);
                }
                Err(err) => tracing::error!(kind = %self.kind(), "pool close task panicked: {err}"),
            }
        }
        report
    }

    /// Retires and closes an entry that is not tracked in the map.
    pub async fn close_entry(&self, entry: &PoolEntry<B::Pool>) -> Result<(), BackendError> {
        retire(&*self.backend, entry, self.drain_timeout()).await
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<PoolInfo> {
        let kind = self.kind();
        let mut pools: Vec<PoolInfo> = self
            .entries
            .read()
            .values()
            .map(|entry| entry.info(kind))
            .collect();
        pools.sort_by(|a, b| a.tenant.cmp(&b.tenant));
        pools
    }

    fn healthy_entry(&self, tenant: &TenantId) -> Option<Arc<PoolEntry<B::Pool>>> {
        self.entries
            .read()
            .get(tenant)
            .filter(|entry| self.backend.is_healthy(&entry.pool))
            .cloned()
    }

    /// Removes an entry the driver reports as unusable. Its close runs in the
    /// background so the caller can go on to build the replacement; `shutdown_all`
    /// waits for it.
    fn discard_unhealthy(&self, tenant: &TenantId) {
        let mut entries = self.entries.write();
        let unhealthy = entries
            .get(tenant)
            .is_some_and(|entry| !self.backend.is_healthy(&entry.pool));
        if !unhealthy {
            return;
        }
        let Some(entry) = entries.remove(tenant) else {
            return;
        };
        tracing::warn!(%tenant, kind = %self.kind(), "replacing unhealthy tenant pool");

        let backend = self.backend.clone();
        let drain_timeout = self.drain_timeout();
        // Spawned while the map is locked so shutdown_all cannot miss it.
        let mut retiring = self.retiring.lock();
        while retiring.try_join_next().is_some() {}
        retiring.spawn(async move {
            let result = retire(&*backend, &entry, drain_timeout).await;
            if let Err(err) = &result {
                tracing::warn!(tenant = %entry.tenant(), "unhealthy pool failed to close: {err}");
            }
            (entry.tenant().clone(), result)
        });
    }

    async fn construct(
        &self,
        tenant: &TenantId,
    ) -> Result<Arc<PoolEntry<B::Pool>>, ResolveError> {
        let limit = self.config.max_tenants;
        if self.len() >= limit {
            return Err(ResolveError::CapacityExceeded { limit });
        }

        let metadata = self.metadata.fetch(tenant, self.kind()).await?;
        let start = Instant::now();
        let pool = self.connect(&metadata).await?;
        let entry = Arc::new(PoolEntry::new(pool, metadata));

        let rejected = {
            let mut entries = self.entries.write();
            if self.closed.load(Ordering::SeqCst) {
                Some(ResolveError::ShuttingDown)
            } else if entries.len() >= limit {
                Some(ResolveError::CapacityExceeded { limit })
            } else {
                entries.insert(tenant.clone(), entry.clone());
                gauge!(REGISTRY_POOLS, "kind" => self.kind().as_str()).set(entries.len() as f64);
                None
            }
        };

        if let Some(err) = rejected {
            if let Err(close_err) = self.close_entry(&entry).await {
                tracing::warn!(%tenant, "discarded pool failed to close: {close_err}");
            }
            return Err(err);
        }

        counter!(REGISTRY_POOL_CONSTRUCTED, "kind" => self.kind().as_str()).increment(1);
        tracing::info!(
            %tenant,
            kind = %self.kind(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "tenant pool constructed"
        );
        Ok(entry)
    }

    async fn connect(&self, metadata: &ConnectionMetadata) -> Result<B::Pool, ResolveError> {
        let result =
            match tokio::time::timeout(metadata.connect_timeout, self.backend.connect(metadata))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout(metadata.connect_timeout)),
            };

        result.map_err(|source| {
            counter!(REGISTRY_POOL_CONSTRUCTION_FAILED, "kind" => self.kind().as_str())
                .increment(1);
            tracing::warn!(
                tenant = %metadata.tenant,
                kind = %self.kind(),
                "pool construction failed: {source}"
            );
            ResolveError::PoolConstructionFailed {
                tenant: metadata.tenant.clone(),
                source,
            }
        })
    }
}

/// Waits for outstanding leases (bounded by `drain_timeout`), then closes the pool.
/// The close happens once no matter how many times an entry is retired.
async fn retire<B: Backend>(
    backend: &B,
    entry: &PoolEntry<B::Pool>,
    drain_timeout: Duration,
) -> Result<(), BackendError> {
    entry.retire();
    if tokio::time::timeout(drain_timeout, entry.drained())
        .await
        .is_err()
    {
        tracing::warn!(
            tenant = %entry.tenant(),
            leases = entry.active_leases(),
            "drain timed out, closing pool with leases outstanding"
        );
    }

    if !entry.mark_closed() {
        return Ok(());
    }

    let result = backend.close(&entry.pool).await;
    match &result {
        Ok(()) => counter!(REGISTRY_POOL_CLOSED, "kind" => backend.kind().as_str()).increment(1),
        Err(_) => {
            counter!(REGISTRY_POOL_CLOSE_FAILED, "kind" => backend.kind().as_str()).increment(1)
        }
    }
    result
}

type CreationLocks = Mutex<HashMap<TenantId, Arc<tokio::sync::Mutex<()>>>>;

/// Holds a tenant's creation lock. The lock is dropped from the shared map once no
/// other caller holds or waits on it.
struct CreationSlot<'a> {
    locks: &'a CreationLocks,
    tenant: TenantId,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> CreationSlot<'a> {
    fn new(locks: &'a CreationLocks, tenant: &TenantId) -> Self {
        let lock = locks.lock().entry(tenant.clone()).or_default().clone();
        CreationSlot {
            locks,
            tenant: tenant.clone(),
            lock,
        }
    }

    async fn acquire(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for CreationSlot<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // Released under the map lock so concurrent drops see exact counts.
        let lock = std::mem::take(&mut self.lock);
        // One reference in the map and ours: nobody else is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&self.tenant);
        }
        drop(lock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{MockBackend, StaticMetadataSource, test_metadata};

    struct Fixture {
        source: Arc<StaticMetadataSource>,
        backend: Arc<MockBackend>,
        registry: Arc<PoolRegistry<MockBackend>>,
    }

    fn fixture(config: RegistryConfig) -> Fixture {
        let source = Arc::new(StaticMetadataSource::new());
        let backend = Arc::new(MockBackend::new(StoreKind::Relational));
        let metadata = Arc::new(MetadataClient::new(
            source.clone(),
            Duration::from_secs(60),
            100,
        ));
        let registry = Arc::new(PoolRegistry::new(backend.clone(), metadata, config));
        Fixture {
            source,
            backend,
            registry,
        }
    }

    fn quick_drain() -> RegistryConfig {
        RegistryConfig {
            max_tenants: 100,
            drain_timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_resolve_constructs_once_and_reuses() {
        let f = fixture(quick_drain());
        f.source.insert("org-acme", StoreKind::Relational);
        let tenant = TenantId::new("org-acme");

        let first = f.registry.resolve(&tenant).await.unwrap();
        let second = f.registry.resolve(&tenant).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.tenant(), &tenant);
        assert_eq!(f.backend.connect_count("org-acme"), 1);
        assert_eq!(f.source.fetch_count("org-acme"), 1);
        assert_eq!(f.registry.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_first_resolves_construct_one_pool() {
        let f = fixture(quick_drain());
        f.source.insert("org-acme", StoreKind::Relational);
        f.backend.set_delay("org-acme", Duration::from_millis(100));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let registry = f.registry.clone();
            handles.push(tokio::spawn(async move {
                registry.resolve(&TenantId::new("org-acme")).await
            }));
        }

        let mut entries = Vec::new();
        for handle in handles {
            entries.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(f.backend.connect_count("org-acme"), 1);
        assert_eq!(f.source.fetch_count("org-acme"), 1);
        assert!(entries.iter().all(|e| Arc::ptr_eq(e, &entries[0])));
        assert!(f.registry.creation_locks.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slow_tenant_does_not_block_other_tenants() {
        let f = fixture(quick_drain());
        f.source.insert("org-slow", StoreKind::Relational);
        f.source.insert("org-fast", StoreKind::Relational);
        f.backend.set_delay("org-slow", Duration::from_millis(500));

        let registry = f.registry.clone();
        let slow = tokio::spawn(async move { registry.resolve(&TenantId::new("org-slow")).await });
        // Let the slow construction take its creation lock.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let start = Instant::now();
        f.registry.resolve(&TenantId::new("org-fast")).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(250));
        assert!(!slow.is_finished());

        slow.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_tenant_is_not_cached() {
        let f = fixture(quick_drain());
        let tenant = TenantId::new("org-missing");

        assert_eq!(
            f.registry.resolve(&tenant).await.unwrap_err(),
            ResolveError::TenantNotFound(tenant.clone())
        );
        assert!(f.registry.is_empty());

        f.source.insert("org-missing", StoreKind::Relational);
        assert!(f.registry.resolve(&tenant).await.is_ok());
        assert_eq!(f.source.fetch_count("org-missing"), 2);
    }

    #[tokio::test]
    async fn test_metadata_outage_is_retried_on_next_resolve() {
        let f = fixture(quick_drain());
        f.source.insert("org-acme", StoreKind::Relational);
        f.source.set_unavailable(true);
        let tenant = TenantId::new("org-acme");

        assert!(matches!(
            f.registry.resolve(&tenant).await,
            Err(ResolveError::MetadataUnavailable(_))
        ));
        assert_eq!(f.backend.connect_count("org-acme"), 0);

        f.source.set_unavailable(false);
        assert!(f.registry.resolve(&tenant).await.is_ok());
        assert_eq!(f.source.fetch_count("org-acme"), 2);
    }

    #[tokio::test]
    async fn test_construction_failure_is_not_cached() {
        let f = fixture(quick_drain());
        f.source.insert("org-acme", StoreKind::Relational);
        f.backend.set_failing("org-acme", true);
        let tenant = TenantId::new("org-acme");

        assert!(matches!(
            f.registry.resolve(&tenant).await,
            Err(ResolveError::PoolConstructionFailed { .. })
        ));
        assert!(f.registry.is_empty());

        f.backend.set_failing("org-acme", false);
        assert!(f.registry.resolve(&tenant).await.is_ok());
        assert_eq!(f.backend.connect_count("org-acme"), 2);
    }

    #[tokio::test]
    async fn test_construction_timeout() {
        let f = fixture(quick_drain());
        f.source.insert("org-acme", StoreKind::Relational);
        // test metadata carries a one second connect timeout
        f.backend.set_delay("org-acme", Duration::from_secs(5));

        let err = f
            .registry
            .resolve(&TenantId::new("org-acme"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ResolveError::PoolConstructionFailed {
                tenant: TenantId::new("org-acme"),
                source: BackendError::Timeout(Duration::from_secs(1)),
            }
        );
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_default_tenant_is_rejected() {
        let f = fixture(quick_drain());
        assert_eq!(
            f.registry.resolve(&TenantId::default()).await.unwrap_err(),
            ResolveError::DefaultTenant
        );
        assert_eq!(f.source.fetch_count(crate::tenant::DEFAULT_TENANT), 0);
    }

    #[tokio::test]
    async fn test_evict_then_resolve_rebuilds() {
        let f = fixture(quick_drain());
        f.source.insert("org-acme", StoreKind::Relational);
        let tenant = TenantId::new("org-acme");

        let old = f.registry.resolve(&tenant).await.unwrap();
        let old_id = old.pool.id;
        drop(old);

        assert!(f.registry.evict(&tenant).await);
        assert!(!f.registry.evict(&tenant).await);
        assert_eq!(f.backend.close_count(old_id), 1);

        let new = f.registry.resolve(&tenant).await.unwrap();
        assert_ne!(new.pool.id, old_id);
        assert_eq!(f.source.fetch_count("org-acme"), 2);
        assert_eq!(f.backend.connect_count("org-acme"), 2);
        assert_eq!(f.backend.close_count(old_id), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_evict_during_construction_removes_the_new_pool() {
        let f = fixture(quick_drain());
        f.source.insert("org-acme", StoreKind::Relational);
        f.backend.set_delay("org-acme", Duration::from_millis(300));
        let tenant = TenantId::new("org-acme");

        let registry = f.registry.clone();
        let building =
            tokio::spawn(async move { registry.resolve(&TenantId::new("org-acme")).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(f.registry.evict(&tenant).await);
        assert!(f.registry.is_empty());

        let stale = building.await.unwrap().unwrap();
        assert!(stale.is_retired());
        assert_eq!(f.backend.close_count(stale.pool.id), 1);

        let fresh = f.registry.resolve(&tenant).await.unwrap();
        assert_ne!(fresh.pool.id, stale.pool.id);
        assert_eq!(f.source.fetch_count("org-acme"), 2);
        assert_eq!(f.backend.connect_count("org-acme"), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_evict_waits_for_outstanding_leases() {
        let f = fixture(quick_drain());
        f.source.insert("org-acme", StoreKind::Relational);
        let tenant = TenantId::new("org-acme");

        let old = f.registry.resolve(&tenant).await.unwrap();
        let old_id = old.pool.id;
        let leases: Vec<_> = (0..3).map(|_| old.try_lease().unwrap()).collect();

        let registry = f.registry.clone();
        let evict_tenant = tenant.clone();
        let eviction = tokio::spawn(async move { registry.evict(&evict_tenant).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // In-flight borrowers keep a usable pool; new checkouts are refused.
        assert!(!eviction.is_finished());
        assert!(leases.iter().all(|lease| !lease.is_closed()));
        assert!(old.try_lease().is_none());

        // The next request builds a fresh pool.
        let fresh = f.registry.resolve(&tenant).await.unwrap();
        assert_ne!(fresh.pool.id, old_id);

        drop(leases);
        assert!(eviction.await.unwrap());
        assert_eq!(f.backend.close_count(old_id), 1);
        assert_eq!(f.backend.close_count(fresh.pool.id), 0);
    }

    #[tokio::test]
    async fn test_drain_timeout_closes_anyway() {
        let f = fixture(RegistryConfig {
            max_tenants: 10,
            drain_timeout_secs: 0,
        });
        f.source.insert("org-acme", StoreKind::Relational);
        let tenant = TenantId::new("org-acme");

        let entry = f.registry.resolve(&tenant).await.unwrap();
        let lease = entry.try_lease().unwrap();

        assert!(f.registry.evict(&tenant).await);
        assert!(lease.is_closed());
        assert_eq!(f.backend.close_count(entry.pool.id), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_entry_is_replaced() {
        let f = fixture(quick_drain());
        f.source.insert("org-acme", StoreKind::Relational);
        let tenant = TenantId::new("org-acme");

        let old = f.registry.resolve(&tenant).await.unwrap();
        old.pool.break_pool();

        let new = f.registry.resolve(&tenant).await.unwrap();
        assert_ne!(new.pool.id, old.pool.id);
        assert_eq!(f.backend.connect_count("org-acme"), 2);
        assert_eq!(f.registry.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_waits_for_replaced_unhealthy_pool() {
        let f = fixture(quick_drain());
        f.source.insert("org-acme", StoreKind::Relational);
        let tenant = TenantId::new("org-acme");

        let old = f.registry.resolve(&tenant).await.unwrap();
        let lease = old.try_lease().unwrap();
        old.pool.break_pool();

        let new = f.registry.resolve(&tenant).await.unwrap();
        assert_ne!(new.pool.id, old.pool.id);
        // Still draining the lease taken before the pool broke.
        assert_eq!(f.backend.close_count(old.pool.id), 0);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(lease);
        });

        let report = f.registry.shutdown_all().await;
        assert_eq!(report.closed, 2);
        assert!(report.failed.is_empty());
        assert_eq!(f.backend.close_count(old.pool.id), 1);
        assert_eq!(f.backend.close_count(new.pool.id), 1);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let f = fixture(RegistryConfig {
            max_tenants: 1,
            drain_timeout_secs: 1,
        });
        f.source.insert("org-a", StoreKind::Relational);
        f.source.insert("org-b", StoreKind::Relational);

        f.registry.resolve(&TenantId::new("org-a")).await.unwrap();
        assert_eq!(
            f.registry
                .resolve(&TenantId::new("org-b"))
                .await
                .unwrap_err(),
            ResolveError::CapacityExceeded { limit: 1 }
        );
        assert_eq!(f.backend.connect_count("org-b"), 0);

        // Evicting frees the slot.
        f.registry.evict(&TenantId::new("org-a")).await;
        assert!(f.registry.resolve(&TenantId::new("org-b")).await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_all_closes_everything_once() {
        let f = fixture(quick_drain());
        for tenant in ["org-a", "org-b", "org-c"] {
            f.source.insert(tenant, StoreKind::Relational);
            f.registry.resolve(&TenantId::new(tenant)).await.unwrap();
        }

        let report = f.registry.shutdown_all().await;
        assert_eq!(report.closed, 3);
        assert!(report.failed.is_empty());
        assert_eq!(f.backend.total_closes(), 3);
        assert!(f.registry.is_empty());

        // Idempotent.
        assert_eq!(f.registry.shutdown_all().await, ShutdownReport::default());
        assert_eq!(f.backend.total_closes(), 3);

        assert_eq!(
            f.registry
                .resolve(&TenantId::new("org-a"))
                .await
                .unwrap_err(),
            ResolveError::ShuttingDown
        );
    }

    #[tokio::test]
    async fn test_shutdown_all_tolerates_close_failures() {
        let f = fixture(quick_drain());
        for tenant in ["org-a", "org-b"] {
            f.source.insert(tenant, StoreKind::Relational);
            f.registry.resolve(&TenantId::new(tenant)).await.unwrap();
        }
        f.backend.set_fail_close(true);

        let mut report = f.registry.shutdown_all().await;
        report.failed.sort();
        assert_eq!(report.closed, 0);
        assert_eq!(
            report.failed,
            vec![TenantId::new("org-a"), TenantId::new("org-b")]
        );
        // Every pool was still attempted.
        assert_eq!(f.backend.total_closes(), 2);
    }

    #[tokio::test]
    async fn test_provisioned_entry_is_untracked() {
        let f = fixture(quick_drain());
        let entry = f
            .registry
            .provision(test_metadata("_default", StoreKind::Relational))
            .await
            .unwrap();

        assert!(entry.tenant().is_default());
        assert!(f.registry.is_empty());
        f.registry.close_entry(&entry).await.unwrap();
        f.registry.close_entry(&entry).await.unwrap();
        assert_eq!(f.backend.close_count(entry.pool.id), 1);
    }

    #[tokio::test]
    async fn test_snapshot() {
        let f = fixture(quick_drain());
        f.source.insert("org-b", StoreKind::Relational);
        f.source.insert("org-a", StoreKind::Relational);
        f.registry.resolve(&TenantId::new("org-b")).await.unwrap();
        let a = f.registry.resolve(&TenantId::new("org-a")).await.unwrap();
        let _lease = a.try_lease().unwrap();

        let snapshot = f.registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].tenant, TenantId::new("org-a"));
        assert_eq!(snapshot[0].namespace, "org-a");
        assert_eq!(snapshot[0].active_leases, 1);
        assert_eq!(snapshot[1].active_leases, 0);
    }
}
