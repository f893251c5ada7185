//! Metrics definitions for the runner.

use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUESTS: MetricDef = MetricDef {
    name: "requests",
    metric_type: MetricType::Counter,
    description: "Number of handled requests. Tagged with outcome.",
};

pub const AUTH_REJECTED: MetricDef = MetricDef {
    name: "auth.rejected",
    metric_type: MetricType::Counter,
    description: "Number of requests rejected by the credential check",
};

pub const CACHE_HIT: MetricDef = MetricDef {
    name: "collection_cache.hit",
    metric_type: MetricType::Counter,
    description: "Cold starts that found a cache archive to hydrate from",
};

pub const CACHE_MISS: MetricDef = MetricDef {
    name: "collection_cache.miss",
    metric_type: MetricType::Counter,
    description: "Cold starts without a cache archive, falling back to a full sync",
};

pub const CACHE_PERSIST_FAILED: MetricDef = MetricDef {
    name: "collection_cache.persist_failed",
    metric_type: MetricType::Counter,
    description: "Cache archive uploads that failed after a successful run",
};

pub const CACHE_ARCHIVE_SIZE: MetricDef = MetricDef {
    name: "collection_cache.archive_size",
    metric_type: MetricType::Gauge,
    description: "Size in bytes of the most recently persisted cache archive",
};

pub const PROCESSOR_DURATION: MetricDef = MetricDef {
    name: "processor.duration",
    metric_type: MetricType::Histogram,
    description: "Deck processor run time in seconds. Tagged with outcome.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUESTS,
    AUTH_REJECTED,
    CACHE_HIT,
    CACHE_MISS,
    CACHE_PERSIST_FAILED,
    CACHE_ARCHIVE_SIZE,
    PROCESSOR_DURATION,
];
