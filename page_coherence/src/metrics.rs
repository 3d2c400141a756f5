use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, register_int_counter, register_int_counter_vec};

pub static PAGE_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "page_coherence_page_requests_total",
        "Number of page ownership requests sent to the directory, by requested mode and outcome",
        &["mode", "outcome"]
    )
    .expect("failed to define a metric")
});

pub static IO_WAITS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "page_coherence_io_waits_total",
        "Number of times a worker waited for another worker's IO on the same buffer"
    )
    .expect("failed to define a metric")
});

pub static REBUILD_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "page_coherence_rebuild_requests_total",
        "Number of ownership rebuild requests, by outcome",
        &["outcome"]
    )
    .expect("failed to define a metric")
});

pub static FAILOVER_INVALIDATIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "page_coherence_failover_invalidations_total",
        "Number of unowned buffers invalidated during failover"
    )
    .expect("failed to define a metric")
});

pub static DDL_BROADCASTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "page_coherence_ddl_broadcasts_total",
        "Number of DDL lock broadcast attempts, by message kind and outcome",
        &["kind", "outcome"]
    )
    .expect("failed to define a metric")
});

pub(crate) fn outcome<T, E>(res: &Result<T, E>) -> &'static str {
    if res.is_ok() { "success" } else { "error" }
}
