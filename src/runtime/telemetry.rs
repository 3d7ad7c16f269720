//! Span-lifecycle interface consumed by the host, and its `tracing` backend.
//!
//! The host only starts, annotates and ends spans. Exporting them is left to
//! whatever subscriber the process installs.

use std::fmt;
use std::time::Instant;
use tracing::field::Empty;

/// Final status recorded on a span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanStatus {
    Unset,
    Ok,
    Error { message: String },
}

/// A started span.
pub trait Span: Send {
    /// Record the span status. The last call wins.
    fn set_status(&mut self, status: SpanStatus);

    /// End the span.
    fn end(self: Box<Self>);
}

/// Starts spans. Shared with user functions through the invocation context.
pub trait Tracer: Send + Sync + fmt::Debug {
    /// Start a span named `name`, parented to the current request span.
    fn start_span(&self, name: &str) -> Box<dyn Span>;
}

/// Tracer that maps spans onto `tracing` spans.
#[derive(Debug, Clone)]
pub struct SpanTracer {
    service_name: String,
}

impl SpanTracer {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

impl Tracer for SpanTracer {
    fn start_span(&self, name: &str) -> Box<dyn Span> {
        let span = tracing::info_span!(
            "span",
            otel.name = name,
            service.name = %self.service_name,
            otel.status_code = Empty,
            otel.status_message = Empty,
        );
        Box::new(TracingSpan {
            span,
            name: name.to_string(),
            started: Instant::now(),
            status: SpanStatus::Unset,
        })
    }
}

struct TracingSpan {
    span: tracing::Span,
    name: String,
    started: Instant,
    status: SpanStatus,
}

impl Span for TracingSpan {
    fn set_status(&mut self, status: SpanStatus) {
        match &status {
            SpanStatus::Unset => {}
            SpanStatus::Ok => {
                self.span.record("otel.status_code", "OK");
            }
            SpanStatus::Error { message } => {
                self.span.record("otel.status_code", "ERROR");
                self.span.record("otel.status_message", message.as_str());
            }
        }
        self.status = status;
    }

    fn end(self: Box<Self>) {
        let _entered = self.span.enter();
        tracing::debug!(
            "span '{}' ended after {:?} with status {:?}",
            self.name,
            self.started.elapsed(),
            self.status
        );
    }
}

/// Derive the service name from a pod host name by dropping the last three
/// dash-delimited segments (`my-fn-5d8f-abc12-xyz` → `my-fn`).
///
/// A name that runs out of dashes collapses to an empty string.
pub fn service_name_from_host(host_name: &str) -> String {
    let mut name = host_name;
    for _ in 0..3 {
        name = match name.rfind('-') {
            Some(idx) => &name[..idx],
            None => "",
        };
    }
    name.to_string()
}

/// Hierarchical tracing service name: `service.namespace`.
pub fn qualified_service_name(service_name: &str, namespace: &str) -> String {
    format!("{}.{}", service_name, namespace)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Tracer that records every span it hands out.
    #[derive(Debug, Default, Clone)]
    pub(crate) struct RecordingTracer {
        pub spans: Arc<Mutex<Vec<(String, SpanStatus, bool)>>>,
    }

    struct RecordingSpan {
        index: usize,
        spans: Arc<Mutex<Vec<(String, SpanStatus, bool)>>>,
    }

    impl Tracer for RecordingTracer {
        fn start_span(&self, name: &str) -> Box<dyn Span> {
            let mut spans = self.spans.lock().unwrap();
            spans.push((name.to_string(), SpanStatus::Unset, false));
            Box::new(RecordingSpan {
                index: spans.len() - 1,
                spans: self.spans.clone(),
            })
        }
    }

    impl Span for RecordingSpan {
        fn set_status(&mut self, status: SpanStatus) {
            self.spans.lock().unwrap()[self.index].1 = status;
        }

        fn end(self: Box<Self>) {
            self.spans.lock().unwrap()[self.index].2 = true;
        }
    }

    #[test]
    fn test_service_name_strips_three_segments() {
        assert_eq!(service_name_from_host("orders-fn-5d8f9-abc12-xyz34"), "orders-fn");
        assert_eq!(service_name_from_host("a-b-c-d"), "a");
        assert_eq!(service_name_from_host("a-b"), "");
        assert_eq!(service_name_from_host(""), "");
    }

    #[test]
    fn test_qualified_service_name() {
        assert_eq!(qualified_service_name("orders", "prod"), "orders.prod");
        assert_eq!(qualified_service_name("", ""), ".");
    }

    #[test]
    fn test_span_tracer_lifecycle() {
        let tracer = SpanTracer::new("orders.prod");
        let mut span = tracer.start_span("userFunction");
        span.set_status(SpanStatus::Error {
            message: "boom".to_string(),
        });
        span.end();
        assert_eq!(tracer.service_name(), "orders.prod");
    }
}
