//! In-memory stand-ins for the metadata authority and a store driver.

use crate::backend::{Backend, BackendError};
use crate::config::DatasourceSettings;
use crate::metadata::{ConnectionMetadata, MetadataError, MetadataSource, StoreKind};
use crate::tenant::TenantId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

pub fn test_settings(namespace: &str) -> DatasourceSettings {
    DatasourceSettings {
        uri: format!("postgres://db.internal:5432/{namespace}"),
        principal: namespace.to_string(),
        secret: "secret".to_string(),
        namespace: namespace.to_string(),
        min_pool_size: 1,
        max_pool_size: 5,
        connect_timeout_ms: 1_000,
    }
}

pub fn test_metadata(tenant: &str, kind: StoreKind) -> ConnectionMetadata {
    ConnectionMetadata::from_settings(TenantId::new(tenant), kind, test_settings(tenant))
        .expect("test settings are valid")
}

/// Metadata source answering from an in-memory table and counting calls per tenant.
#[derive(Default)]
pub struct StaticMetadataSource {
    entries: Mutex<HashSet<(String, StoreKind)>>,
    fetches: Mutex<HashMap<String, usize>>,
    unavailable: AtomicBool,
    delay: Duration,
}

impl StaticMetadataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn insert(&self, tenant: &str, kind: StoreKind) {
        self.entries.lock().insert((tenant.to_string(), kind));
    }

    pub fn remove(&self, tenant: &str, kind: StoreKind) {
        self.entries.lock().remove(&(tenant.to_string(), kind));
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn fetch_count(&self, tenant: &str) -> usize {
        self.fetches.lock().get(tenant).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MetadataSource for StaticMetadataSource {
    async fn fetch(
        &self,
        tenant: &TenantId,
        kind: StoreKind,
    ) -> Result<ConnectionMetadata, MetadataError> {
        *self
            .fetches
            .lock()
            .entry(tenant.as_str().to_string())
            .or_default() += 1;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MetadataError::Unavailable(
                "metadata authority is down".into(),
            ));
        }

        let known = self
            .entries
            .lock()
            .contains(&(tenant.as_str().to_string(), kind));
        if !known {
            return Err(MetadataError::TenantNotFound {
                tenant: tenant.clone(),
                kind,
            });
        }

        Ok(test_metadata(tenant.as_str(), kind))
    }
}

#[derive(Clone, Debug)]
pub struct MockPool {
    pub id: u64,
    pub tenant: TenantId,
    closed: Arc<AtomicBool>,
}

impl MockPool {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simulates the driver tearing the pool down on its own.
    pub fn break_pool(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Driver double that records every construction and close.
pub struct MockBackend {
    kind: StoreKind,
    next_id: AtomicU64,
    connects: Mutex<HashMap<String, usize>>,
    closes: Mutex<HashMap<u64, usize>>,
    failing: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    fail_close: AtomicBool,
}

impl MockBackend {
    pub fn new(kind: StoreKind) -> Self {
        MockBackend {
            kind,
            next_id: AtomicU64::new(1),
            connects: Mutex::new(HashMap::new()),
            closes: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            delays: Mutex::new(HashMap::new()),
            fail_close: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, tenant: &str, failing: bool) {
        let mut set = self.failing.lock();
        if failing {
            set.insert(tenant.to_string());
        } else {
            set.remove(tenant);
        }
    }

    pub fn set_delay(&self, tenant: &str, delay: Duration) {
        self.delays.lock().insert(tenant.to_string(), delay);
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn connect_count(&self, tenant: &str) -> usize {
        self.connects.lock().get(tenant).copied().unwrap_or(0)
    }

    pub fn total_connects(&self) -> usize {
        self.connects.lock().values().sum()
    }

    pub fn close_count(&self, pool_id: u64) -> usize {
        self.closes.lock().get(&pool_id).copied().unwrap_or(0)
    }

    pub fn total_closes(&self) -> usize {
        self.closes.lock().values().sum()
    }
}

#[async_trait]
impl Backend for MockBackend {
    type Pool = MockPool;

    fn kind(&self) -> StoreKind {
        self.kind
    }

    async fn connect(&self, metadata: &ConnectionMetadata) -> Result<MockPool, BackendError> {
        let tenant = metadata.tenant.as_str().to_string();
        *self.connects.lock().entry(tenant.clone()).or_default() += 1;

        let delay = self.delays.lock().get(&tenant).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.lock().contains(&tenant) {
            return Err(BackendError::Connect("password authentication failed".into()));
        }

        Ok(MockPool {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            tenant: metadata.tenant.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn close(&self, pool: &MockPool) -> Result<(), BackendError> {
        *self.closes.lock().entry(pool.id).or_default() += 1;
        pool.closed.store(true, Ordering::SeqCst);

        if self.fail_close.load(Ordering::SeqCst) {
            return Err(BackendError::Close("server closed the connection".into()));
        }
        Ok(())
    }

    fn is_healthy(&self, pool: &MockPool) -> bool {
        !pool.is_closed()
    }

    async fn ping(&self, pool: &MockPool) -> Result<(), BackendError> {
        if pool.is_closed() {
            return Err(BackendError::Query("pool is closed".into()));
        }
        Ok(())
    }
}
