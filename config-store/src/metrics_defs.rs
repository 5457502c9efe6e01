//! Metrics definitions for the config store.

use shared::metrics_defs::{MetricDef, MetricType};

pub const STORE_REQUESTS: MetricDef = MetricDef {
    name: "store.requests",
    metric_type: MetricType::Counter,
    description: "Number of store operations, tagged by operation and outcome",
};

pub const STORE_DURATION: MetricDef = MetricDef {
    name: "store.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a store operation in seconds",
};

pub const STORE_WRITE_CONFLICTS: MetricDef = MetricDef {
    name: "store.write.conflicts",
    metric_type: MetricType::Counter,
    description: "Number of writes rejected because the precondition or version check failed",
};

pub const STORE_BULK_SIZE: MetricDef = MetricDef {
    name: "store.bulk.size",
    metric_type: MetricType::Histogram,
    description: "Number of keys in a bulk write or bulk delete",
};

pub const QUERY_RESULTS: MetricDef = MetricDef {
    name: "store.query.results",
    metric_type: MetricType::Histogram,
    description: "Number of live records matching a query before pagination",
};

pub const TENANT_LOCK_TIMEOUTS: MetricDef = MetricDef {
    name: "guard.tenant_lock.timeouts",
    metric_type: MetricType::Counter,
    description: "Number of tenant lock acquisitions that timed out",
};

pub const KEY_MONITORS: MetricDef = MetricDef {
    name: "guard.key_monitors",
    metric_type: MetricType::Gauge,
    description: "Number of per-key monitors currently cached",
};

pub const OBJECT_DECODE_FAILURES: MetricDef = MetricDef {
    name: "object_store.decode_failures",
    metric_type: MetricType::Counter,
    description: "Number of stored records that could not be decoded into objects",
};

pub const ALL_METRICS: &[MetricDef] = &[
    STORE_REQUESTS,
    STORE_DURATION,
    STORE_WRITE_CONFLICTS,
    STORE_BULK_SIZE,
    QUERY_RESULTS,
    TENANT_LOCK_TIMEOUTS,
    KEY_MONITORS,
    OBJECT_DECODE_FAILURES,
];
