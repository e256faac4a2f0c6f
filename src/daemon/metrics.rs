//! Metrics emission helpers.
//!
//! Metrics are emitted as structured tracing events on the `metrics` target.
//! A test sink can be installed to capture emissions in unit tests.

use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(u64),
    Histogram(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricLabel {
    pub key: &'static str,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: MetricValue,
    pub labels: Vec<MetricLabel>,
}

pub trait MetricSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: MetricEvent) {
        let (kind, value) = match event.value {
            MetricValue::Counter(value) => ("counter", value),
            MetricValue::Gauge(value) => ("gauge", value),
            MetricValue::Histogram(value) => ("histogram", value),
        };
        tracing::info!(
            target: "metrics",
            metric = event.name,
            kind,
            value,
            labels = ?event.labels
        );
    }
}

static METRIC_SINK: OnceLock<RwLock<Arc<dyn MetricSink>>> = OnceLock::new();

fn sink_lock() -> &'static RwLock<Arc<dyn MetricSink>> {
    METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)))
}

fn sink() -> Arc<dyn MetricSink> {
    sink_lock()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

pub fn set_sink(sink: Arc<dyn MetricSink>) {
    *sink_lock().write().unwrap_or_else(PoisonError::into_inner) = sink;
}

fn emit(name: &'static str, value: MetricValue, labels: Vec<MetricLabel>) {
    sink().record(MetricEvent {
        name,
        value,
        labels,
    });
}

fn label(key: &'static str, value: impl ToString) -> Vec<MetricLabel> {
    vec![MetricLabel {
        key,
        value: value.to_string(),
    }]
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub fn apply_ok(action: &'static str, duration: Duration) {
    emit("apply_ok", MetricValue::Counter(1), label("action", action));
    emit(
        "apply_duration",
        MetricValue::Histogram(duration_ms(duration)),
        Vec::new(),
    );
}

pub fn apply_err(action: &'static str, duration: Duration) {
    emit("apply_err", MetricValue::Counter(1), label("action", action));
    emit(
        "apply_duration",
        MetricValue::Histogram(duration_ms(duration)),
        Vec::new(),
    );
}

pub fn set_lane_queue_depth(depth: usize) {
    emit("lane_queue_depth", MetricValue::Gauge(depth as u64), Vec::new());
}

pub fn lane_overloaded() {
    emit("lane_overloaded_total", MetricValue::Counter(1), Vec::new());
}

pub fn lane_cancelled(count: usize) {
    emit(
        "lane_cancelled_total",
        MetricValue::Counter(count as u64),
        Vec::new(),
    );
}

pub fn set_retirement_pending(pending: usize) {
    emit(
        "retirement_pending",
        MetricValue::Gauge(pending as u64),
        Vec::new(),
    );
}

pub fn repl_sent(kind: &'static str) {
    emit("repl_sent_total", MetricValue::Counter(1), label("kind", kind));
}

pub fn repl_filtered() {
    emit("repl_filtered_total", MetricValue::Counter(1), Vec::new());
}

pub fn repl_send_failed() {
    emit("repl_send_failed_total", MetricValue::Counter(1), Vec::new());
}

pub fn repl_resent(count: usize) {
    emit("repl_resent_total", MetricValue::Counter(count as u64), Vec::new());
}

pub fn repl_duplicate() {
    emit("repl_duplicates_total", MetricValue::Counter(1), Vec::new());
}

pub fn passive_degraded() {
    emit("passive_degraded_total", MetricValue::Counter(1), Vec::new());
}

pub fn set_sync_buffer_depth(depth: usize) {
    emit("sync_buffer_depth", MetricValue::Gauge(depth as u64), Vec::new());
}
