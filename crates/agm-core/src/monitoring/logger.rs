//! Perf logger: brackets operations with pending/terminal events.
//!
//! Two rules keep the telemetry-retrieval path out of its own store:
//! 1. Starting an operation whose metadata names the well-known
//!    monitoring method returns a no-op span.
//! 2. Before recording, serialized params and results are scanned for the
//!    `skipPerfLogging` sentinel; a hit drops the event (or removes the
//!    pending one) instead of storing it. Errors are exempt from rule 2 —
//!    failures are always recorded.
//!
//! Bookkeeping failures (e.g. a payload that will not serialize) degrade
//! to omitted fields and never disturb the wrapped operation.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;

use super::collection::PerfCollection;
use super::event::{PerfDomain, PerfEvent, PerfStatus};
use super::{MONITORING_GET_EVENTS, SKIP_PERF_LOGGING_KEY};

/// Description of one operation to record.
#[derive(Debug, Clone)]
pub struct LogMessage {
    pub domain: PerfDomain,
    /// Free-form metadata; serialized into the event. The keys
    /// `methodDefinition` and `methodFilter` participate in rule 1.
    pub metadata: Value,
    /// Whether the operation crosses the process boundary.
    pub ipc: bool,
    /// Operation arguments, recorded with their serialized size.
    pub args: Option<Value>,
    /// Terminal error for one-shot logging.
    pub error: Option<String>,
}

impl LogMessage {
    pub fn new(domain: PerfDomain, metadata: Value) -> Self {
        Self {
            domain,
            metadata,
            ipc: true,
            args: None,
            error: None,
        }
    }

    pub fn local(mut self) -> Self {
        self.ipc = false;
        self
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Assigns event ids and writes operation lifecycles into a collection.
///
/// Ids are strictly increasing in `start`/`log` call order and never
/// reused, regardless of completion order.
pub struct PerfLogger {
    collection: Arc<dyn PerfCollection>,
    next_id: AtomicI64,
}

impl PerfLogger {
    pub fn new(collection: Arc<dyn PerfCollection>) -> Self {
        Self {
            collection,
            next_id: AtomicI64::new(0),
        }
    }

    pub fn collection(&self) -> &Arc<dyn PerfCollection> {
        &self.collection
    }

    /// One-shot variant for operations that complete synchronously:
    /// builds a single event already in its terminal status.
    pub fn log(&self, msg: LogMessage) {
        if Self::is_monitoring_call(&msg.metadata) {
            return;
        }
        if msg.args.as_ref().is_some_and(Self::carries_skip_marker) && msg.error.is_none() {
            return;
        }
        let mut event = self.create_event(&msg);
        event.error = msg.error;
        event.status = if event.error.is_some() {
            PerfStatus::Failed
        } else {
            PerfStatus::Completed
        };
        self.collection.add_event(event);
    }

    /// Record the start of an operation; the returned span is consumed by
    /// exactly one of [`PerfSpan::success`] / [`PerfSpan::error`] when the
    /// operation settles.
    pub fn start(&self, msg: LogMessage) -> PerfSpan {
        if Self::is_monitoring_call(&msg.metadata) {
            // The monitoring-retrieval call must never instrument itself.
            return PerfSpan { inner: None };
        }
        // A sentinel in the params suppresses the pending and success
        // records, but the span stays live: a failure must still land.
        let suppress_success = msg.args.as_ref().is_some_and(Self::carries_skip_marker);
        let event = self.create_event(&msg);
        let id = event.id;
        if !suppress_success {
            self.collection.add_event(event.clone());
        }
        PerfSpan {
            inner: Some(SpanInner {
                id,
                event,
                started: Instant::now(),
                collection: self.collection.clone(),
                suppress_success,
            }),
        }
    }

    fn create_event(&self, msg: &LogMessage) -> PerfEvent {
        let params_size = msg.args.as_ref().map(Self::serialized_size);
        PerfEvent {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            date: Utc::now(),
            status: PerfStatus::Pending,
            domain: msg.domain,
            ipc: msg.ipc,
            metadata: serde_json::to_string(&msg.metadata).ok(),
            error: None,
            params: msg.args.clone(),
            params_size,
            result: None,
            result_size: None,
            elapsed: None,
        }
    }

    fn is_monitoring_call(metadata: &Value) -> bool {
        ["methodDefinition", "methodFilter"].iter().any(|key| {
            metadata.get(key).and_then(Value::as_str) == Some(MONITORING_GET_EVENTS)
        })
    }

    fn carries_skip_marker(value: &Value) -> bool {
        match serde_json::to_string(value) {
            Ok(serialized) => serialized.contains(SKIP_PERF_LOGGING_KEY),
            Err(_) => false,
        }
    }

    fn serialized_size(value: &Value) -> u64 {
        serde_json::to_string(value)
            .map(|s| s.len() as u64)
            .unwrap_or(0)
    }
}

struct SpanInner {
    id: i64,
    event: PerfEvent,
    started: Instant,
    collection: Arc<dyn PerfCollection>,
    suppress_success: bool,
}

/// In-flight measurement handle returned by [`PerfLogger::start`].
///
/// Consumed by value, so completion fires at most once per started
/// operation. A no-op span (excluded operation) swallows both outcomes.
pub struct PerfSpan {
    inner: Option<SpanInner>,
}

impl PerfSpan {
    /// Record successful settlement with the (optional) result payload.
    pub fn success(self, result: Option<&Value>) {
        let Some(inner) = self.inner else { return };
        let elapsed = inner.started.elapsed().as_secs_f64() * 1000.0;

        if inner.suppress_success {
            // Nothing pending was stored for this span.
            return;
        }
        if result.is_some_and(PerfLogger::carries_skip_marker) {
            // Sentinel in the result payload: the pending event must not
            // survive either.
            inner.collection.remove_event(inner.id);
            return;
        }

        let mut event = inner.event;
        event.status = PerfStatus::Completed;
        event.result = result.cloned();
        event.result_size = result.map(PerfLogger::serialized_size);
        event.elapsed = Some(elapsed);
        inner.collection.change_event(inner.id, event);
    }

    /// Record failed settlement. Errors are recorded unconditionally.
    pub fn error(self, message: impl Into<String>) {
        let Some(inner) = self.inner else { return };
        let elapsed = inner.started.elapsed().as_secs_f64() * 1000.0;

        let mut event = inner.event;
        event.status = PerfStatus::Failed;
        event.error = Some(message.into());
        event.elapsed = Some(elapsed);
        inner.collection.change_event(inner.id, event);
    }

    /// Whether this span records anything at all.
    pub fn is_active(&self) -> bool {
        self.inner.is_some()
    }
}
