//! Telemetry hook points.
//!
//! The runtime emits spans and metrics through a pluggable
//! [`TelemetryObserver`]; exporters live outside this crate. The default
//! observer forwards to `tracing` at debug level, and [`NoopTelemetry`]
//! drops everything.
//!
//! Span names: `agent.run`, `step.execute`, `llm.generate`, `mcp.call`.
//! Metrics: `agent.execution`, `agent.tokens`, `step.duration`, `llm.call`,
//! `llm.duration`, `llm.tokens.{input,output,total}`, `mcp.call`,
//! `workflow.steps`, `error`, `workflow.retry`, `workflow.timeout`.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// A shared telemetry observer.
pub type SharedTelemetry = Arc<dyn TelemetryObserver>;

/// Receives span and metric events from the runtime. All methods default to
/// no-ops so observers implement only what they need.
pub trait TelemetryObserver: Send + Sync {
    /// A span opened around an operation.
    fn span_start(&self, name: &str, attrs: &[(&'static str, String)]) {
        let _ = (name, attrs);
    }

    /// The matching span closed; `ok` reflects the operation outcome.
    fn span_end(&self, name: &str, ok: bool) {
        let _ = (name, ok);
    }

    /// A monotonic counter increment.
    fn counter(&self, name: &str, value: u64) {
        let _ = (name, value);
    }

    /// A duration observation in milliseconds.
    fn duration(&self, name: &str, ms: u64) {
        let _ = (name, ms);
    }
}

/// Observer that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetryObserver for NoopTelemetry {}

/// Observer that forwards events to `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetryObserver for TracingTelemetry {
    fn span_start(&self, name: &str, attrs: &[(&'static str, String)]) {
        debug!(span = name, ?attrs, "span start");
    }

    fn span_end(&self, name: &str, ok: bool) {
        debug!(span = name, ok, "span end");
    }

    fn counter(&self, name: &str, value: u64) {
        debug!(metric = name, value, "counter");
    }

    fn duration(&self, name: &str, ms: u64) {
        debug!(metric = name, ms, "duration");
    }
}

/// One recorded telemetry event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryEvent {
    /// Span opened.
    SpanStart(String),
    /// Span closed with its outcome.
    SpanEnd(String, bool),
    /// Counter increment.
    Counter(String, u64),
    /// Duration observation.
    Duration(String, u64),
}

/// Observer that records every event, for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every event recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    /// Total of all increments to the named counter.
    #[must_use]
    pub fn counter_total(&self, name: &str) -> u64 {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                TelemetryEvent::Counter(n, v) if n == name => Some(*v),
                _ => None,
            })
            .sum()
    }

    /// Number of spans opened with the given name.
    #[must_use]
    pub fn span_count(&self, name: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, TelemetryEvent::SpanStart(n) if n == name))
            .count()
    }
}

impl TelemetryObserver for RecordingTelemetry {
    fn span_start(&self, name: &str, _attrs: &[(&'static str, String)]) {
        self.events
            .lock()
            .push(TelemetryEvent::SpanStart(name.to_string()));
    }

    fn span_end(&self, name: &str, ok: bool) {
        self.events
            .lock()
            .push(TelemetryEvent::SpanEnd(name.to_string(), ok));
    }

    fn counter(&self, name: &str, value: u64) {
        self.events
            .lock()
            .push(TelemetryEvent::Counter(name.to_string(), value));
    }

    fn duration(&self, name: &str, ms: u64) {
        self.events
            .lock()
            .push(TelemetryEvent::Duration(name.to_string(), ms));
    }
}
