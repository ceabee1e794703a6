//! Observability boundary for pool and circuit breaker events
//!
//! The pool and breaker report named counters, gauges and timers through a
//! [`MetricsSink`] rather than binding to a concrete metrics transport. The
//! default [`LogSink`] forwards everything to `tracing`; [`NullSink`] keeps
//! tests quiet.

use std::fmt;

use tracing::{debug, error, info, warn};

/// Kind of metric being reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Timer,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Timer => "timer",
        };
        f.write_str(s)
    }
}

/// Severity for reported events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Sink for metrics and lifecycle events emitted by the pool and breaker
///
/// Implementations must be cheap: reporting happens inline on the acquire and
/// execute paths.
pub trait MetricsSink: Send + Sync {
    /// Report a named metric value, optionally tagged (e.g. with a provider id)
    fn report_metric(&self, name: &str, value: f64, kind: MetricKind, tags: &[(&str, &str)]);

    /// Report a named lifecycle event (e.g. `circuit_open`)
    fn report_event(&self, name: &str, level: EventLevel, message: &str, tags: &[(&str, &str)]);
}

/// Default sink that forwards everything to `tracing`
#[derive(Debug, Default, Clone)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn report_metric(&self, name: &str, value: f64, kind: MetricKind, tags: &[(&str, &str)]) {
        debug!(metric = name, value, kind = %kind, ?tags, "metric");
    }

    fn report_event(&self, name: &str, level: EventLevel, message: &str, tags: &[(&str, &str)]) {
        match level {
            EventLevel::Debug => debug!(event = name, ?tags, "{}", message),
            EventLevel::Info => info!(event = name, ?tags, "{}", message),
            EventLevel::Warn => warn!(event = name, ?tags, "{}", message),
            EventLevel::Error => error!(event = name, ?tags, "{}", message),
        }
    }
}

/// Sink that discards everything, for hermetic tests
#[derive(Debug, Default, Clone)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn report_metric(&self, _name: &str, _value: f64, _kind: MetricKind, _tags: &[(&str, &str)]) {}

    fn report_event(&self, _name: &str, _level: EventLevel, _message: &str, _tags: &[(&str, &str)]) {
    }
}
