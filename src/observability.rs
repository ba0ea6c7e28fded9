//! Pluggable telemetry shim.
//!
//! Components record spans, metrics, and errors through the [`Tracer`]
//! trait without knowing where they land. The embedded implementation
//! forwards everything to the host's `tracing` subscriber; the noop
//! implementation drops it.

use crate::config::TracerMode;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Metric names recorded by the fabric.
pub mod metrics {
    /// Interrupts delivered on the in-memory fast path.
    pub const INTERRUPT_DELIVERED_FAST: &str = "weft.interrupt.delivered.fast";
    /// Critical interrupts delivered through the persistent retry path.
    pub const INTERRUPT_DELIVERED_SLOW: &str = "weft.interrupt.delivered.slow";
    /// Delivery attempts that were retried.
    pub const INTERRUPT_RETRIED: &str = "weft.interrupt.retried";
    /// Non-critical interrupts dropped on saturation.
    pub const INTERRUPT_DROPPED: &str = "weft.interrupt.dropped";
    /// Messages handed to a consumer.
    pub const MESSAGE_DEQUEUED: &str = "weft.queue.dequeued";
    /// Messages whose dequeue count crossed the poison threshold.
    pub const MESSAGE_POISON_SUSPECT: &str = "weft.queue.poison_suspect";
    /// Broadcast events dropped because a subscriber buffer was full.
    pub const BROADCAST_DROPPED: &str = "weft.broadcast.dropped";
    /// Duration of a workflow stage, in milliseconds.
    pub const STAGE_DURATION_MS: &str = "weft.workflow.stage_duration_ms";
    /// Prompt tokens consumed by LLM calls.
    pub const LLM_PROMPT_TOKENS: &str = "weft.llm.prompt_tokens";
    /// Completion tokens produced by LLM calls.
    pub const LLM_COMPLETION_TOKENS: &str = "weft.llm.completion_tokens";
    /// Cost of LLM calls in USD.
    pub const LLM_COST_USD: &str = "weft.llm.cost_usd";
}

/// Opaque span handle returned by [`Tracer::start_span`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanHandle(Uuid);

impl SpanHandle {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Telemetry sink for spans, metrics, and errors.
pub trait Tracer: Send + Sync {
    /// Opens a span and returns its handle.
    fn start_span(&self, name: &str) -> SpanHandle;

    /// Closes a span previously returned by `start_span`.
    fn end_span(&self, span: SpanHandle);

    /// Records a counter or gauge sample.
    fn record_metric(&self, name: &str, value: f64);

    /// Records an error within a named scope.
    fn record_error(&self, scope: &str, message: &str);
}

/// Tracer that drops everything.
#[derive(Debug, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn start_span(&self, _name: &str) -> SpanHandle {
        SpanHandle::generate()
    }

    fn end_span(&self, _span: SpanHandle) {}

    fn record_metric(&self, _name: &str, _value: f64) {}

    fn record_error(&self, _scope: &str, _message: &str) {}
}

/// Tracer that forwards to the host's `tracing` subscriber.
///
/// Span durations are measured wall-clock and logged on `end_span`;
/// metrics and errors become structured events.
#[derive(Debug, Default)]
pub struct EmbeddedTracer {
    open_spans: DashMap<SpanHandle, (String, Instant)>,
}

impl Tracer for EmbeddedTracer {
    fn start_span(&self, name: &str) -> SpanHandle {
        let handle = SpanHandle::generate();
        self.open_spans
            .insert(handle, (name.to_string(), Instant::now()));
        handle
    }

    fn end_span(&self, span: SpanHandle) {
        if let Some((_, (name, started))) = self.open_spans.remove(&span) {
            debug!(
                span = %name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "span closed"
            );
        }
    }

    fn record_metric(&self, name: &str, value: f64) {
        debug!(metric = %name, value, "metric");
    }

    fn record_error(&self, scope: &str, message: &str) {
        error!(scope = %scope, message = %message, "recorded error");
    }
}

/// Constructs the tracer for the configured mode.
///
/// `Service` mode is a placeholder for an external exporter and currently
/// behaves like `Embedded`.
#[must_use]
pub fn tracer_for_mode(mode: TracerMode) -> Arc<dyn Tracer> {
    match mode {
        TracerMode::None => Arc::new(NoopTracer),
        TracerMode::Embedded => Arc::new(EmbeddedTracer::default()),
        TracerMode::Service => {
            warn!("service tracer mode is not wired to an exporter; using embedded output");
            Arc::new(EmbeddedTracer::default())
        }
    }
}

/// Convenience guard that ends its span on drop.
pub struct SpanGuard {
    tracer: Arc<dyn Tracer>,
    handle: SpanHandle,
}

impl SpanGuard {
    /// Opens a span on `tracer` that closes when the guard drops.
    #[must_use]
    pub fn enter(tracer: Arc<dyn Tracer>, name: &str) -> Self {
        let handle = tracer.start_span(name);
        Self { tracer, handle }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        self.tracer.end_span(self.handle);
    }
}

/// Logs a one-line startup banner for the chosen mode.
pub fn log_tracer_mode(mode: TracerMode) {
    info!(?mode, "telemetry configured");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_close_span_when_guard_dropped() {
        let tracer: Arc<dyn Tracer> = Arc::new(EmbeddedTracer::default());
        let embedded = Arc::new(EmbeddedTracer::default());
        let handle = embedded.start_span("work");
        assert_eq!(embedded.open_spans.len(), 1);
        embedded.end_span(handle);
        assert!(embedded.open_spans.is_empty());

        // Guard path compiles and drops cleanly.
        let _guard = SpanGuard::enter(tracer, "guarded");
    }

    #[test]
    fn test_should_select_noop_tracer_when_mode_none() {
        let tracer = tracer_for_mode(TracerMode::None);
        let span = tracer.start_span("ignored");
        tracer.end_span(span);
        tracer.record_metric(metrics::MESSAGE_DEQUEUED, 1.0);
    }
}
