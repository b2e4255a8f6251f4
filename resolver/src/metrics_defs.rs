//! Metrics definitions for the resolver.

use shared::metrics_defs::{MetricDef, MetricType};

pub const REGISTRY_RESOLVE_HIT: MetricDef = MetricDef {
    name: "registry.resolve.hit",
    metric_type: MetricType::Counter,
    description: "Resolutions answered from a live pool entry",
};

pub const REGISTRY_RESOLVE_MISS: MetricDef = MetricDef {
    name: "registry.resolve.miss",
    metric_type: MetricType::Counter,
    description: "Resolutions that had to take the per-tenant creation lock",
};

pub const REGISTRY_POOL_CONSTRUCTED: MetricDef = MetricDef {
    name: "registry.pool.constructed",
    metric_type: MetricType::Counter,
    description: "Tenant pools constructed",
};

pub const REGISTRY_POOL_CONSTRUCTION_FAILED: MetricDef = MetricDef {
    name: "registry.pool.construction_failed",
    metric_type: MetricType::Counter,
    description: "Tenant pool constructions that failed to connect",
};

pub const REGISTRY_POOL_CLOSED: MetricDef = MetricDef {
    name: "registry.pool.closed",
    metric_type: MetricType::Counter,
    description: "Pools closed by eviction or shutdown",
};

pub const REGISTRY_POOL_CLOSE_FAILED: MetricDef = MetricDef {
    name: "registry.pool.close_failed",
    metric_type: MetricType::Counter,
    description: "Pools whose close reported an error",
};

pub const REGISTRY_POOLS: MetricDef = MetricDef {
    name: "registry.pools",
    metric_type: MetricType::Gauge,
    description: "Live tenant pools held by a registry",
};

pub const METADATA_FETCH: MetricDef = MetricDef {
    name: "metadata.fetch",
    metric_type: MetricType::Counter,
    description: "Calls made to the metadata authority",
};

pub const METADATA_FETCH_FAILED: MetricDef = MetricDef {
    name: "metadata.fetch.failed",
    metric_type: MetricType::Counter,
    description: "Metadata authority calls that failed",
};

pub const METADATA_FETCH_DURATION: MetricDef = MetricDef {
    name: "metadata.fetch.duration",
    metric_type: MetricType::Histogram,
    description: "Time spent in a metadata authority call in seconds",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REGISTRY_RESOLVE_HIT,
    REGISTRY_RESOLVE_MISS,
    REGISTRY_POOL_CONSTRUCTED,
    REGISTRY_POOL_CONSTRUCTION_FAILED,
    REGISTRY_POOL_CLOSED,
    REGISTRY_POOL_CLOSE_FAILED,
    REGISTRY_POOLS,
    METADATA_FETCH,
    METADATA_FETCH_FAILED,
    METADATA_FETCH_DURATION,
];
