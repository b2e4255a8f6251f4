//! Tenant identity and the call-chain scoped tenant context.
//!
//! The active tenant is stored in a tokio task-local that only exists while a
//! [`TenantContext::scope`] future is being driven. The value therefore travels with
//! the unit of work across worker threads and disappears as soon as the scope ends,
//! whether the wrapped future completes, errors, panics or is dropped.

use serde::{Serialize, Serializer};
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Reserved tenant value meaning "no tenant specified".
pub const DEFAULT_TENANT: &str = "_default";

/// Opaque organization identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantId(Arc<str>);

impl TenantId {
    /// Builds a tenant id from raw input. Blank input and the reserved sentinel both
    /// map to the default tenant.
    pub fn new(id: impl AsRef<str>) -> Self {
        let id = id.as_ref().trim();
        if id.is_empty() || id == DEFAULT_TENANT {
            return TenantId::default_tenant();
        }
        TenantId(Arc::from(id))
    }

    pub fn default_tenant() -> Self {
        TenantId(Arc::from(DEFAULT_TENANT))
    }

    pub fn is_default(&self) -> bool {
        &*self.0 == DEFAULT_TENANT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        TenantId::default_tenant()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TenantId({:?})", &*self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        TenantId::new(s)
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        TenantId::new(s)
    }
}

impl Serialize for TenantId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

tokio::task_local! {
    static CURRENT_TENANT: RefCell<TenantId>;
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ContextError {
    #[error("no tenant scope is active on this call chain")]
    NoScope,
}

/// Accessors for the tenant bound to the current call chain.
pub struct TenantContext;

impl TenantContext {
    /// Runs `fut` with `tenant` as the active tenant. The value is gone once the
    /// returned future finishes or is dropped.
    pub async fn scope<F: Future>(tenant: TenantId, fut: F) -> F::Output {
        CURRENT_TENANT.scope(RefCell::new(tenant), fut).await
    }

    /// Synchronous counterpart of [`TenantContext::scope`].
    pub fn sync_scope<F, R>(tenant: TenantId, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        CURRENT_TENANT.sync_scope(RefCell::new(tenant), f)
    }

    /// Returns the active tenant, or the default tenant outside of any scope.
    pub fn get() -> TenantId {
        CURRENT_TENANT
            .try_with(|tenant| tenant.borrow().clone())
            .unwrap_or_default()
    }

    /// Replaces the active tenant for the rest of the current scope.
    pub fn set(tenant: TenantId) -> Result<(), ContextError> {
        CURRENT_TENANT
            .try_with(|current| *current.borrow_mut() = tenant)
            .map_err(|_| ContextError::NoScope)
    }

    /// Resets the active tenant to the default for the rest of the current scope.
    pub fn clear() -> Result<(), ContextError> {
        TenantContext::set(TenantId::default_tenant())
    }

    /// Binds the caller's current tenant to `fut`, so work handed to `tokio::spawn`
    /// keeps the tenant of the request that created it.
    pub fn propagate<F: Future>(fut: F) -> impl Future<Output = F::Output> {
        let tenant = TenantContext::get();
        CURRENT_TENANT.scope(RefCell::new(tenant), fut)
    }
}
