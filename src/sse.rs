use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::{stream, StreamExt};
use reqwest::Response;
use serde::de::DeserializeOwned;
use tokio::{sync::Notify, task::JoinHandle};

use crate::{
    errors::{Error, Result, TransportError},
    telemetry::StreamTelemetry,
};

/// One event delivered from a streaming response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseEvent {
    /// Payload with the `data:` prefix (and one following space) removed.
    pub data: String,
    /// `true` for `data:` lines, `false` for lines passed through verbatim.
    pub framed: bool,
}

impl SseEvent {
    pub fn framed(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            framed: true,
        }
    }

    pub fn raw(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            framed: false,
        }
    }

    /// Decode the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.data).map_err(Error::Serialization)
    }
}

/// Parse a single physical line.
///
/// Blank lines and `:` comments produce nothing. Lines without a `data:` prefix
/// are passed through as their own event so servers that emit bare JSON lines
/// still work.
pub fn parse_line(line: &str) -> Option<SseEvent> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.trim().is_empty() || line.starts_with(':') {
        return None;
    }
    if let Some(rest) = line.strip_prefix("data:") {
        let rest = rest.strip_prefix(' ').unwrap_or(rest);
        return Some(SseEvent::framed(rest));
    }
    Some(SseEvent::raw(line))
}

/// Default cap on a single buffered line (16 MiB).
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Incremental line splitter over raw body chunks.
///
/// Bytes are buffered until a `\n` arrives, so multi-byte characters split across
/// chunks decode correctly. Bytes already searched for a terminator are not
/// searched again.
#[derive(Debug)]
pub struct SseLineParser {
    buffer: Vec<u8>,
    scanned: usize,
    max_line: usize,
}

impl Default for SseLineParser {
    fn default() -> Self {
        Self::with_max_line_len(DEFAULT_MAX_LINE_BYTES)
    }
}

impl SseLineParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line_len(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_line,
        }
    }

    /// Feed one chunk and return the events for every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut start = 0;
        let mut search_from = self.scanned;
        while let Some(offset) = self.buffer[search_from..].iter().position(|b| *b == b'\n') {
            let end = search_from + offset;
            let line = String::from_utf8_lossy(&self.buffer[start..end]);
            #[cfg(feature = "tracing")]
            tracing::trace!(line = %line, "stream line");
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
            start = end + 1;
            search_from = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        events
    }

    /// Flush an unterminated final line at end of stream.
    pub fn finish(&mut self) -> Option<SseEvent> {
        self.scanned = 0;
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&String::from_utf8_lossy(&rest))
    }

    /// Bytes held back waiting for a line terminator.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the unterminated line has grown past the configured cap.
    pub fn exceeds_limit(&self) -> bool {
        self.buffer.len() > self.max_line
    }
}

/// Streaming handle over the events of one SSE response.
///
/// Yields events in wire order, then either ends (clean close) or yields a single
/// `Err` and ends. Dropping the handle closes the connection.
pub struct StreamHandle {
    stream: Pin<Box<dyn Stream<Item = Result<SseEvent>> + Send>>,
    cancelled: Arc<AtomicBool>,
    telemetry: Option<StreamTelemetry>,
}

impl StreamHandle {
    pub(crate) fn new(response: Response, telemetry: Option<StreamTelemetry>) -> Self {
        let cancelled = Arc::new(AtomicBool::new(false));
        let stream = build_stream(
            Box::pin(response.bytes_stream()),
            SseLineParser::new(),
            cancelled.clone(),
            telemetry.clone(),
        );
        Self {
            stream: Box::pin(stream),
            cancelled,
            telemetry,
        }
    }

    /// Build a handle from a fixed list of events (useful in tests of callers).
    pub fn from_events(events: impl IntoIterator<Item = SseEvent>) -> Self {
        let collected: Vec<Result<SseEvent>> = events.into_iter().map(Ok).collect();
        Self {
            stream: Box::pin(stream::iter(collected)),
            cancelled: Arc::new(AtomicBool::new(false)),
            telemetry: None,
        }
    }

    /// Stop yielding events; the next poll ends the stream.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Drain the stream, returning every event or the first error.
    pub async fn collect_events(mut self) -> Result<Vec<SseEvent>> {
        let mut events = Vec::new();
        while let Some(item) = self.next().await {
            events.push(item?);
        }
        Ok(events)
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cancel();
        if let Some(t) = self.telemetry.take() {
            t.on_closed();
        }
    }
}

impl Stream for StreamHandle {
    type Item = Result<SseEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.is_cancelled() {
            return Poll::Ready(None);
        }
        self.stream.as_mut().poll_next(cx)
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

struct StreamState {
    body: ByteStream,
    parser: SseLineParser,
    pending: VecDeque<SseEvent>,
    cancelled: Arc<AtomicBool>,
    telemetry: Option<StreamTelemetry>,
    deferred: Option<Error>,
    eof: bool,
    failed: bool,
}

fn build_stream(
    body: ByteStream,
    parser: SseLineParser,
    cancelled: Arc<AtomicBool>,
    telemetry: Option<StreamTelemetry>,
) -> impl Stream<Item = Result<SseEvent>> + Send {
    let state = StreamState {
        body,
        parser,
        pending: VecDeque::new(),
        cancelled,
        telemetry,
        deferred: None,
        eof: false,
        failed: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.failed {
                return None;
            }
            if state.cancelled.load(Ordering::SeqCst) {
                if let Some(t) = state.telemetry.as_ref() {
                    t.on_closed();
                }
                return None;
            }
            if let Some(event) = state.pending.pop_front() {
                if let Some(t) = state.telemetry.as_ref() {
                    t.on_event(&event);
                }
                return Some((Ok(event), state));
            }
            if let Some(error) = state.deferred.take() {
                state.failed = true;
                if let Some(t) = state.telemetry.as_ref() {
                    t.on_error(&error);
                }
                return Some((Err(error), state));
            }
            if state.eof {
                if let Some(t) = state.telemetry.as_ref() {
                    t.on_closed();
                }
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    let events = state.parser.push(&chunk);
                    state.pending.extend(events);
                    if state.parser.exceeds_limit() {
                        state.deferred = Some(Error::Transport(TransportError::body(format!(
                            "stream line exceeds {} bytes",
                            state.parser.pending_len()
                        ))));
                    }
                }
                Some(Err(err)) => {
                    state.failed = true;
                    let error = Error::Transport(TransportError::from_reqwest(err, None));
                    if let Some(t) = state.telemetry.as_ref() {
                        t.on_error(&error);
                    }
                    return Some((Err(error), state));
                }
                None => {
                    state.eof = true;
                    if let Some(event) = state.parser.finish() {
                        state.pending.push_back(event);
                    }
                }
            }
        }
    })
}

type EventFn = Box<dyn FnMut(SseEvent) + Send>;
type ErrorFn = Box<dyn FnOnce(Error) + Send>;
type CompleteFn = Box<dyn FnOnce() + Send>;

/// Consumer callbacks for the `stream_with_callbacks` methods of both clients.
///
/// `on_event` runs for each event; afterwards exactly one of `on_error` or
/// `on_complete` runs. All of them run on the background task driving the stream.
pub struct StreamCallbacks {
    pub(crate) on_event: EventFn,
    pub(crate) on_error: ErrorFn,
    pub(crate) on_complete: CompleteFn,
}

impl StreamCallbacks {
    pub fn new(on_event: impl FnMut(SseEvent) + Send + 'static) -> Self {
        Self {
            on_event: Box::new(on_event),
            on_error: Box::new(|_| {}),
            on_complete: Box::new(|| {}),
        }
    }

    pub fn on_error(mut self, f: impl FnOnce(Error) + Send + 'static) -> Self {
        self.on_error = Box::new(f);
        self
    }

    pub fn on_complete(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_complete = Box::new(f);
        self
    }
}

impl std::fmt::Debug for StreamCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCallbacks").finish_non_exhaustive()
    }
}

/// Handle to a callback-driven stream running on a background task.
#[derive(Debug)]
pub struct StreamSubscription {
    cancel: Arc<Notify>,
    task: JoinHandle<()>,
}

impl StreamSubscription {
    pub(crate) fn spawn<F>(open: F, callbacks: StreamCallbacks) -> Self
    where
        F: Future<Output = Result<StreamHandle>> + Send + 'static,
    {
        let cancel = Arc::new(Notify::new());
        let task = tokio::spawn(drive(open, callbacks, cancel.clone()));
        Self { cancel, task }
    }

    /// Close the connection early. The consumer then sees `on_complete` (unless a
    /// terminal callback already ran).
    pub fn cancel(&self) {
        self.cancel.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the terminal callback has run.
    ///
    /// Fails only if one of the callbacks panicked.
    pub async fn join(self) -> std::result::Result<(), tokio::task::JoinError> {
        self.task.await
    }
}

pub(crate) async fn drive<F>(open: F, callbacks: StreamCallbacks, cancel: Arc<Notify>)
where
    F: Future<Output = Result<StreamHandle>>,
{
    let StreamCallbacks {
        mut on_event,
        on_error,
        on_complete,
    } = callbacks;

    let opened = tokio::select! {
        _ = cancel.notified() => {
            on_complete();
            return;
        }
        opened = open => opened,
    };
    let mut handle = match opened {
        Ok(handle) => handle,
        Err(err) => {
            on_error(err);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.notified() => {
                #[cfg(feature = "tracing")]
                tracing::debug!("stream cancelled by consumer");
                handle.cancel();
                break;
            }
            item = handle.next() => match item {
                Some(Ok(event)) => on_event(event),
                Some(Err(err)) => {
                    drop(handle);
                    on_error(err);
                    return;
                }
                None => break,
            },
        }
    }
    drop(handle);
    on_complete();
}
