use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{errors::Error, sse::SseEvent, RetryMetadata};

/// User-provided callbacks for emitting metrics without taking on a tracing dependency.
#[derive(Clone, Default)]
pub struct MetricsCallbacks {
    pub http_request: Option<Arc<dyn Fn(HttpRequestMetrics) + Send + Sync>>,
    pub stream_first_event: Option<Arc<dyn Fn(StreamFirstEventMetrics) + Send + Sync>>,
}

impl fmt::Debug for MetricsCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsCallbacks")
            .field(
                "http_request",
                &self.http_request.as_ref().map(|_| "callback"),
            )
            .field(
                "stream_first_event",
                &self.stream_first_event.as_ref().map(|_| "callback"),
            )
            .finish()
    }
}

/// Request metadata shared by all telemetry events.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub method: String,
    pub url: String,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
        }
    }
}

/// Outcome of one executor call, recorded once after the last attempt.
#[derive(Clone, Debug)]
pub struct HttpRequestMetrics {
    pub latency: Duration,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub retries: Option<RetryMetadata>,
    pub context: RequestContext,
}

/// Time from request start to the first stream event (or to whatever ended the
/// stream first).
#[derive(Clone, Debug)]
pub struct StreamFirstEventMetrics {
    pub latency: Duration,
    pub error: Option<String>,
    pub context: RequestContext,
}

/// Internal helper that owns the registered callbacks (if any).
#[derive(Clone, Default)]
pub(crate) struct Telemetry {
    callbacks: MetricsCallbacks,
}

impl Telemetry {
    pub fn new(callbacks: Option<MetricsCallbacks>) -> Self {
        Self {
            callbacks: callbacks.unwrap_or_default(),
        }
    }

    pub fn http_enabled(&self) -> bool {
        self.callbacks.http_request.is_some()
    }

    pub fn stream_enabled(&self) -> bool {
        self.callbacks.stream_first_event.is_some()
    }

    pub fn record_http(&self, metrics: HttpRequestMetrics) {
        if let Some(cb) = &self.callbacks.http_request {
            cb(metrics);
        }
    }

    pub fn record_first_event(&self, metrics: StreamFirstEventMetrics) {
        if let Some(cb) = &self.callbacks.stream_first_event {
            cb(metrics);
        }
    }

    pub fn stream_state(&self, context: RequestContext, start: Instant) -> Option<StreamTelemetry> {
        if self.stream_enabled() || tracing_enabled() {
            return Some(StreamTelemetry::new(self.clone(), context, start));
        }
        None
    }
}

/// Per-stream metrics/tracing state shared by the async and blocking stream paths.
#[derive(Clone)]
pub(crate) struct StreamTelemetry {
    inner: Arc<StreamTelemetryInner>,
}

struct StreamTelemetryInner {
    telemetry: Telemetry,
    context: RequestContext,
    start: Instant,
    first_recorded: AtomicBool,
}

impl StreamTelemetry {
    pub fn new(telemetry: Telemetry, context: RequestContext, start: Instant) -> Self {
        Self {
            inner: Arc::new(StreamTelemetryInner {
                telemetry,
                context,
                start,
                first_recorded: AtomicBool::new(false),
            }),
        }
    }

    pub fn on_event(&self, event: &SseEvent) {
        #[cfg(feature = "tracing")]
        tracing::trace!(
            url = %self.inner.context.url,
            framed = event.framed,
            len = event.data.len(),
            "stream event"
        );
        #[cfg(not(feature = "tracing"))]
        let _ = event;
        self.record_first(None);
    }

    pub fn on_error(&self, error: &Error) {
        #[cfg(feature = "tracing")]
        tracing::warn!(url = %self.inner.context.url, error = %error, "stream error");
        self.record_first(Some(error.to_string()));
    }

    pub fn on_closed(&self) {
        #[cfg(feature = "tracing")]
        tracing::debug!(url = %self.inner.context.url, "stream closed");
        self.record_first(Some("stream closed".to_string()));
    }

    fn record_first(&self, error: Option<String>) {
        if !self.inner.telemetry.stream_enabled() {
            return;
        }
        let already_recorded = self.inner.first_recorded.swap(true, Ordering::SeqCst);
        if already_recorded {
            return;
        }
        self.inner
            .telemetry
            .record_first_event(StreamFirstEventMetrics {
                latency: self.inner.start.elapsed(),
                error,
                context: self.inner.context.clone(),
            });
    }
}

pub(crate) fn tracing_enabled() -> bool {
    #[cfg(feature = "tracing")]
    {
        tracing::enabled!(tracing::Level::DEBUG) || tracing::enabled!(tracing::Level::TRACE)
    }
    #[cfg(not(feature = "tracing"))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn first_event_is_recorded_once() {
        let calls = Arc::new(Mutex::new(Vec::<StreamFirstEventMetrics>::new()));
        let callbacks = MetricsCallbacks {
            stream_first_event: Some({
                let calls = calls.clone();
                Arc::new(move |metrics| {
                    calls.lock().unwrap().push(metrics);
                })
            }),
            ..Default::default()
        };

        let telemetry = Telemetry::new(Some(callbacks));
        let stream = telemetry
            .stream_state(RequestContext::new("POST", "/openapi/chat"), Instant::now())
            .expect("stream state");

        let event = SseEvent::framed("{\"type\":\"start\"}");
        stream.on_event(&event);
        stream.on_event(&event);
        stream.on_closed();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].error.is_none());
        assert_eq!(calls[0].context.url, "/openapi/chat");
    }

    #[test]
    fn first_error_only_fires_once() {
        let calls = Arc::new(Mutex::new(Vec::<StreamFirstEventMetrics>::new()));
        let callbacks = MetricsCallbacks {
            stream_first_event: Some({
                let calls = calls.clone();
                Arc::new(move |metrics| {
                    calls.lock().unwrap().push(metrics);
                })
            }),
            ..Default::default()
        };
        let telemetry = Telemetry::new(Some(callbacks));
        let stream = telemetry
            .stream_state(RequestContext::new("POST", "/openapi/plan"), Instant::now())
            .expect("stream state");

        let err = Error::Config("boom".into());
        stream.on_error(&err);
        stream.on_error(&err);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].error.as_deref(), Some("invalid configuration: boom"));
    }

    #[test]
    fn disabled_without_callbacks_or_subscriber() {
        let telemetry = Telemetry::new(None);
        assert!(!telemetry.http_enabled());
        assert!(!telemetry.stream_enabled());
    }
}
