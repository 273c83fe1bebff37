use std::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;
use prometheus::{core::Collector, IntCounter, IntCounterVec, Registry};
use tracing::error;

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct BrokerMetricsSnapshot {
    pub calls: u64,
    pub deliveries: u64,
    pub settled: u64,
    pub timeouts: u64,
    pub late_responses: u64,
    pub handler_panics: u64,
}

static CALLS: AtomicU64 = AtomicU64::new(0);
static DELIVERIES: AtomicU64 = AtomicU64::new(0);
static SETTLED: AtomicU64 = AtomicU64::new(0);
static TIMEOUTS: AtomicU64 = AtomicU64::new(0);
static LATE_RESPONSES: AtomicU64 = AtomicU64::new(0);
static HANDLER_PANICS: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    static ref RPC_CALLS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("preview_rpc_calls_total", "Forwarded capability calls"),
        &["capability"]
    )
    .unwrap();
    static ref RPC_DELIVERIES_TOTAL: IntCounter = IntCounter::new(
        "preview_rpc_deliveries_total",
        "Deliver frames pushed into contexts"
    )
    .unwrap();
    static ref RPC_TIMEOUTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("preview_rpc_timeouts_total", "Calls settled by timeout"),
        &["label"]
    )
    .unwrap();
    static ref RPC_LATE_RESPONSES_TOTAL: IntCounter = IntCounter::new(
        "preview_rpc_late_responses_total",
        "Responses dropped because their request was already settled"
    )
    .unwrap();
    static ref RPC_HANDLER_PANICS_TOTAL: IntCounter = IntCounter::new(
        "preview_rpc_handler_panics_total",
        "Inbound handlers that panicked"
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(target: "rpc-broker", ?err, "failed to register broker metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, RPC_CALLS_TOTAL.clone());
    register(registry, RPC_DELIVERIES_TOTAL.clone());
    register(registry, RPC_TIMEOUTS_TOTAL.clone());
    register(registry, RPC_LATE_RESPONSES_TOTAL.clone());
    register(registry, RPC_HANDLER_PANICS_TOTAL.clone());
}

pub fn record_call(capability: &str) {
    CALLS.fetch_add(1, Ordering::Relaxed);
    RPC_CALLS_TOTAL.with_label_values(&[capability]).inc();
}

pub fn record_delivery() {
    DELIVERIES.fetch_add(1, Ordering::Relaxed);
    RPC_DELIVERIES_TOTAL.inc();
}

pub fn record_settled() {
    SETTLED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_timeout(label: &str) {
    TIMEOUTS.fetch_add(1, Ordering::Relaxed);
    RPC_TIMEOUTS_TOTAL.with_label_values(&[label]).inc();
}

pub fn record_late_response() {
    LATE_RESPONSES.fetch_add(1, Ordering::Relaxed);
    RPC_LATE_RESPONSES_TOTAL.inc();
}

pub fn record_handler_panic() {
    HANDLER_PANICS.fetch_add(1, Ordering::Relaxed);
    RPC_HANDLER_PANICS_TOTAL.inc();
}

pub fn snapshot() -> BrokerMetricsSnapshot {
    BrokerMetricsSnapshot {
        calls: CALLS.load(Ordering::Relaxed),
        deliveries: DELIVERIES.load(Ordering::Relaxed),
        settled: SETTLED.load(Ordering::Relaxed),
        timeouts: TIMEOUTS.load(Ordering::Relaxed),
        late_responses: LATE_RESPONSES.load(Ordering::Relaxed),
        handler_panics: HANDLER_PANICS.load(Ordering::Relaxed),
    }
}

pub fn reset() {
    CALLS.store(0, Ordering::Relaxed);
    DELIVERIES.store(0, Ordering::Relaxed);
    SETTLED.store(0, Ordering::Relaxed);
    TIMEOUTS.store(0, Ordering::Relaxed);
    LATE_RESPONSES.store(0, Ordering::Relaxed);
    HANDLER_PANICS.store(0, Ordering::Relaxed);
}
