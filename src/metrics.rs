//! Metrics helpers for the procedure gateway.
//!
//! Thin wrappers over the `metrics` crate macros. No exporter is embedded;
//! the embedding application installs whatever recorder it wants.
//!
//! Provided metrics:
//! * `openedge_procedures_total` (counter, labels: procedure, status)
//! * `openedge_procedure_duration_seconds` (histogram, label: procedure)
//! * `openedge_cache_lookups_total` (counter, label: result)
//! * `openedge_refusals_total` (counter, label: reason)
//! * `openedge_active_proxies` (gauge)
//! * `openedge_pooled_connections` (gauge)
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const OPENEDGE_PROCEDURES_TOTAL: &str = "openedge_procedures_total";
pub const OPENEDGE_PROCEDURE_DURATION_SECONDS: &str = "openedge_procedure_duration_seconds";
pub const OPENEDGE_CACHE_LOOKUPS_TOTAL: &str = "openedge_cache_lookups_total";
pub const OPENEDGE_REFUSALS_TOTAL: &str = "openedge_refusals_total";
pub const OPENEDGE_ACTIVE_PROXIES: &str = "openedge_active_proxies";
pub const OPENEDGE_POOLED_CONNECTIONS: &str = "openedge_pooled_connections";

/// Last values written to the pool gauges, for ad-hoc snapshots
pub static POOL_GAUGES: Lazy<Mutex<HashMap<&'static str, f64>>> = Lazy::new(|| {
    describe_counter!(
        OPENEDGE_PROCEDURES_TOTAL,
        Unit::Count,
        "Total number of procedure executions by resulting status."
    );
    describe_histogram!(
        OPENEDGE_PROCEDURE_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of procedure executions, cache hits included."
    );
    describe_counter!(
        OPENEDGE_CACHE_LOOKUPS_TOTAL,
        Unit::Count,
        "Response cache lookups by outcome (hit, miss, bypass)."
    );
    describe_counter!(
        OPENEDGE_REFUSALS_TOTAL,
        Unit::Count,
        "Calls refused by the app server or the connection pool."
    );
    describe_gauge!(
        OPENEDGE_ACTIVE_PROXIES,
        "Number of proxy interfaces currently in use."
    );
    describe_gauge!(
        OPENEDGE_POOLED_CONNECTIONS,
        "Number of pooled app server connections."
    );

    Mutex::new(HashMap::new())
});

fn store_gauge(name: &'static str, value: f64) {
    match POOL_GAUGES.lock() {
        Ok(mut gauges) => {
            gauges.insert(name, value);
        }
        Err(_) => tracing::error!("Failed to acquire lock for pool gauges"),
    }
    gauge!(name).set(value);
}

/// Count a finished procedure execution.
pub fn increment_procedure_total(procedure: &str, status: u16) {
    counter!(
        OPENEDGE_PROCEDURES_TOTAL,
        "procedure" => procedure.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_procedure_duration(procedure: &str, duration: Duration) {
    histogram!(
        OPENEDGE_PROCEDURE_DURATION_SECONDS,
        "procedure" => procedure.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Count a cache lookup; `result` is `hit`, `miss` or `bypass`.
pub fn increment_cache_lookup(result: &'static str) {
    counter!(OPENEDGE_CACHE_LOOKUPS_TOTAL, "result" => result).increment(1);
}

pub fn increment_refusal(reason: &'static str) {
    counter!(OPENEDGE_REFUSALS_TOTAL, "reason" => reason).increment(1);
}

pub fn set_active_proxies(count: usize) {
    store_gauge(OPENEDGE_ACTIVE_PROXIES, count as f64);
}

pub fn set_pooled_connections(count: usize) {
    store_gauge(OPENEDGE_POOLED_CONNECTIONS, count as f64);
}

/// RAII helper recording a procedure's duration on drop.
pub struct ProcedureTimer {
    start: Instant,
    procedure: String,
}

impl ProcedureTimer {
    pub fn new(procedure: &str) -> Self {
        Self {
            start: Instant::now(),
            procedure: procedure.to_string(),
        }
    }
}

impl Drop for ProcedureTimer {
    fn drop(&mut self) {
        record_procedure_duration(&self.procedure, self.start.elapsed());
    }
}

/// Register metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    tracing::info!("Initializing procedure gateway metrics");

    Lazy::force(&POOL_GAUGES);

    tracing::info!("Procedure gateway metrics initialized");
    Ok(())
}

/// Snapshot of the pool gauges.
pub fn get_current_metrics() -> HashMap<String, f64> {
    let mut metrics = HashMap::new();

    if let Ok(gauges) = POOL_GAUGES.lock() {
        for (name, value) in gauges.iter() {
            metrics.insert((*name).to_string(), *value);
        }
    }

    metrics
}
