pub mod authority;
pub mod backend;
pub mod config;
pub mod document;
pub mod facade;
pub mod metadata;
pub mod metrics_defs;
pub mod registry;
pub mod relational;
pub mod shutdown;
pub mod tenant;

#[cfg(any(test, feature = "testutils"))]
pub mod testutils;

pub use backend::{Backend, BackendError};
pub use facade::{RoutingFacade, TenantPools};
pub use metadata::{ConnectionMetadata, MetadataClient, MetadataError, MetadataSource, StoreKind};
pub use registry::{Lease, PoolInfo, PoolRegistry, ResolveError, ShutdownReport};
pub use shutdown::ShutdownCoordinator;
pub use tenant::{DEFAULT_TENANT, TenantContext, TenantId};
