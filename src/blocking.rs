use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use futures_util::StreamExt;
use reqwest::{
    blocking::{
        multipart::{Form, Part},
        Client as HttpClient, RequestBuilder, Response,
    },
    header::{HeaderMap, CONTENT_TYPE},
    Method, Url,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{runtime::Runtime, sync::Notify};

use crate::{
    client::{Client, Config},
    core::{
        build_headers, decode_body, json_spec, parse_base_url, request_error, require_positive,
        resolve_url, RequestBody, RequestSpec, RetryState, UploadFile, ACCEPT_JSON, UPLOAD_FIELD,
        UPLOAD_MIME,
    },
    errors::{Error, Result, RetryMetadata, TransportError, TransportErrorKind},
    http::{classify_response, AttemptOutcome, HeaderList, RequestOptions, RetryConfig, RetryStep},
    sse::{drive, SseEvent, StreamCallbacks, StreamHandle},
    telemetry::{HttpRequestMetrics, MetricsCallbacks, RequestContext, Telemetry},
    token::TokenStore,
    DEFAULT_CLIENT_HEADER, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
};

#[derive(Clone, Debug, Default)]
pub struct BlockingConfig {
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub token_store: Option<TokenStore>,
    pub client_header: Option<String>,
    /// Client for plain requests. Streams always use an internally built client.
    pub http_client: Option<HttpClient>,
    /// Override the connect timeout (defaults to 10s).
    pub connect_timeout: Option<Duration>,
    /// Override the stream idle timeout (defaults to 30s).
    pub read_timeout: Option<Duration>,
    /// Override the per-attempt request timeout (defaults to 30s).
    pub timeout: Option<Duration>,
    /// Retry/backoff policy (defaults to 3 retries, linear 1s backoff).
    pub retry: Option<RetryConfig>,
    pub default_headers: Option<HeaderList>,
    pub metrics: Option<MetricsCallbacks>,
}

/// Thread-blocking SQLBot transport client.
///
/// Must not be created or dropped inside an async runtime (a `reqwest::blocking`
/// restriction). Streams run on a single-worker runtime owned by the client.
#[derive(Clone)]
pub struct BlockingClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    base_url: Url,
    tokens: TokenStore,
    client_header: Option<String>,
    http: HttpClient,
    request_timeout: Duration,
    retry: RetryConfig,
    default_headers: Option<HeaderList>,
    telemetry: Telemetry,
    // Dropped before the runtime its connections live on.
    streams: Client,
    runtime: Arc<Runtime>,
}

impl BlockingClient {
    pub fn new(cfg: BlockingConfig) -> Result<Self> {
        let base_url = parse_base_url(cfg.base_url.as_deref())?;
        let connect_timeout = require_positive(
            "connect_timeout",
            cfg.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        )?;
        let request_timeout =
            require_positive("timeout", cfg.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT))?;
        let retry = cfg.retry.unwrap_or_default();

        let http = match cfg.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .connect_timeout(connect_timeout)
                // Per-request timeouts are set on each attempt.
                .timeout(None)
                .build()
                .map_err(|err| TransportError {
                    kind: TransportErrorKind::Connect,
                    message: "failed to build http client".to_string(),
                    source: Some(err),
                    retries: None,
                })?,
        };

        let tokens = cfg.token_store.unwrap_or_default();
        if let Some(token) = cfg.token.as_deref() {
            tokens.set(token);
        }

        let client_header = cfg
            .client_header
            .filter(|s| !s.trim().is_empty())
            .or_else(|| Some(DEFAULT_CLIENT_HEADER.to_string()));

        let streams = Client::new(Config {
            base_url: Some(base_url.to_string()),
            token_store: Some(tokens.clone()),
            client_header: client_header.clone(),
            connect_timeout: Some(connect_timeout),
            read_timeout: cfg.read_timeout,
            timeout: Some(request_timeout),
            retry: Some(RetryConfig::disabled()),
            default_headers: cfg.default_headers.clone(),
            metrics: cfg.metrics.clone(),
            ..Default::default()
        })?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("sqlbot-stream")
            .enable_all()
            .build()
            .map_err(|err| Error::Config(format!("failed to start stream runtime: {err}")))?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                base_url,
                tokens,
                client_header,
                http,
                request_timeout,
                retry,
                default_headers: cfg.default_headers,
                telemetry: Telemetry::new(cfg.metrics),
                streams,
                runtime: Arc::new(runtime),
            }),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    /// Replace the token; `None` clears it.
    pub fn set_token(&self, token: Option<&str>) {
        self.inner.tokens.set_optional(token);
    }

    pub fn current_token(&self) -> Option<String> {
        self.inner.tokens.get()
    }

    pub fn clear_token(&self) {
        self.inner.tokens.clear();
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.tokens.is_set()
    }

    pub fn token_store(&self) -> &TokenStore {
        &self.inner.tokens
    }

    pub fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.execute(RequestSpec::get(url))
    }

    pub fn get_with_options<T: DeserializeOwned>(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<T> {
        self.execute_with_options(RequestSpec::get(url), options)
    }

    pub fn post<B, T>(&self, url: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.post_with_options(url, body, RequestOptions::default())
    }

    pub fn post_with_options<B, T>(&self, url: &str, body: &B, options: RequestOptions) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.execute_with_options(json_spec(Method::POST, url, body)?, options)
    }

    pub fn put<B, T>(&self, url: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.put_with_options(url, body, RequestOptions::default())
    }

    pub fn put_with_options<B, T>(&self, url: &str, body: &B, options: RequestOptions) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.execute_with_options(json_spec(Method::PUT, url, body)?, options)
    }

    pub fn delete<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.execute(RequestSpec::delete(url))
    }

    pub fn delete_with_options<T: DeserializeOwned>(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<T> {
        self.execute_with_options(RequestSpec::delete(url), options)
    }

    pub fn delete_with_body<B, T>(&self, url: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.execute(json_spec(Method::DELETE, url, body)?)
    }

    pub fn upload_multipart<T, K, V>(
        &self,
        url: &str,
        file: UploadFile,
        fields: impl IntoIterator<Item = (K, V)>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        K: Into<String>,
        V: Into<String>,
    {
        self.execute(RequestSpec::post(url).multipart(file, fields))
    }

    pub fn execute<T: DeserializeOwned>(&self, spec: RequestSpec) -> Result<T> {
        self.execute_with_options(spec, RequestOptions::default())
    }

    pub fn execute_with_options<T: DeserializeOwned>(
        &self,
        spec: RequestSpec,
        options: RequestOptions,
    ) -> Result<T> {
        let url = resolve_url(&self.inner.base_url, &spec.url)?;
        let headers = self.inner.headers(&options.headers)?;
        let timeout = options.timeout.unwrap_or(self.inner.request_timeout);
        let retry = options
            .retry
            .clone()
            .unwrap_or_else(|| self.inner.retry.clone());
        let ctx = RequestContext::new(spec.method.as_str(), url.as_str());

        let resp = self
            .inner
            .send_with_retry(&spec, &url, &headers, timeout, &retry, ctx)?;
        let bytes = resp
            .bytes()
            .map_err(|err| Error::Transport(TransportError::from_reqwest(err, None)))?;
        decode_body(&bytes)
    }

    /// Open an SSE stream and iterate its events on the calling thread.
    ///
    /// A gap longer than the read timeout between chunks ends the stream with a
    /// `NetworkError`.
    pub fn stream<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> Result<BlockingStreamHandle> {
        self.execute_stream(json_spec(Method::POST, url, body)?, RequestOptions::default())
    }

    pub fn execute_stream(
        &self,
        spec: RequestSpec,
        options: RequestOptions,
    ) -> Result<BlockingStreamHandle> {
        let runtime = self.inner.runtime.clone();
        let inner = runtime.block_on(self.inner.streams.execute_stream(spec, options))?;
        Ok(BlockingStreamHandle { inner, runtime })
    }

    /// Callback form of [`BlockingClient::stream`], driven on a spawned thread.
    pub fn stream_with_callbacks<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        callbacks: StreamCallbacks,
    ) -> BlockingStreamSubscription {
        let client = self.clone();
        let spec = json_spec(Method::POST, url, body);
        let cancel = Arc::new(Notify::new());
        let signal = cancel.clone();
        let thread = thread::spawn(move || {
            let streams = client.inner.streams.clone();
            let open = async move {
                match spec {
                    Ok(spec) => streams.execute_stream(spec, RequestOptions::default()).await,
                    Err(err) => Err(err),
                }
            };
            client.inner.runtime.block_on(drive(open, callbacks, signal));
        });
        BlockingStreamSubscription { cancel, thread }
    }
}

impl std::fmt::Debug for BlockingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingClient")
            .field("base_url", &self.inner.base_url.as_str())
            .field("tokens", &self.inner.tokens)
            .field("retry", &self.inner.retry)
            .finish()
    }
}

impl ClientInner {
    fn headers(&self, extra: &HeaderList) -> Result<HeaderMap> {
        let token = self.tokens.get();
        build_headers(
            ACCEPT_JSON,
            self.client_header.as_deref(),
            self.default_headers.as_ref(),
            extra,
            token.as_deref(),
        )
    }

    fn build_request(
        &self,
        spec: &RequestSpec,
        url: &Url,
        headers: &HeaderMap,
        timeout: Duration,
    ) -> Result<RequestBuilder> {
        let builder = self
            .http
            .request(spec.method.clone(), url.clone())
            .headers(headers.clone())
            .timeout(timeout);
        Ok(match &spec.body {
            RequestBody::Empty => builder,
            RequestBody::Json(bytes) => builder
                .header(CONTENT_TYPE, ACCEPT_JSON)
                .body(bytes.to_vec()),
            RequestBody::Multipart { file, fields } => {
                builder.multipart(multipart_form(file, fields)?)
            }
        })
    }

    fn send_with_retry(
        &self,
        spec: &RequestSpec,
        url: &Url,
        headers: &HeaderMap,
        timeout: Duration,
        retry: &RetryConfig,
        ctx: RequestContext,
    ) -> Result<Response> {
        let mut state = RetryState::new();
        let start = Instant::now();
        let mut attempt = 0u32;

        loop {
            let builder = self.build_request(spec, url, headers, timeout)?;
            state.record_attempt(attempt);
            #[cfg(feature = "tracing")]
            let _span = tracing::debug_span!(
                "sqlbot.http",
                method = %ctx.method,
                url = %ctx.url,
                attempt,
                max_attempts = retry.max_attempts()
            )
            .entered();

            match builder.send() {
                Ok(resp) => {
                    let status = resp.status();
                    let outcome = if status.is_success() {
                        AttemptOutcome::Success
                    } else {
                        state.record_status(status.as_u16());
                        AttemptOutcome::Unsuccessful
                    };
                    match retry.next_step(attempt, outcome) {
                        RetryStep::RetryAfter(delay) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(
                                status = status.as_u16(),
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                "unsuccessful response; retrying"
                            );
                            drop(resp);
                            thread::sleep(delay);
                        }
                        RetryStep::Return | RetryStep::Fail => {
                            return self.finish(resp, state.metadata(), start, ctx);
                        }
                    }
                }
                Err(err) if err.is_builder() => {
                    let error = request_error(err, None);
                    self.record(start, None, Some(error.to_string()), None, ctx);
                    return Err(error);
                }
                Err(err) => {
                    state.record_error(&err);
                    match retry.next_step(attempt, AttemptOutcome::TransportFailure) {
                        RetryStep::RetryAfter(delay) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(
                                attempt,
                                error = %err,
                                delay_ms = delay.as_millis() as u64,
                                "transport error; retrying"
                            );
                            thread::sleep(delay);
                        }
                        RetryStep::Return | RetryStep::Fail => {
                            let retries = state.metadata();
                            self.record(start, None, Some(err.to_string()), retries.clone(), ctx);
                            #[cfg(feature = "tracing")]
                            tracing::warn!(attempt, error = %err, "transport error");
                            return Err(request_error(err, retries));
                        }
                    }
                }
            }
            attempt += 1;
        }
    }

    fn finish(
        &self,
        resp: Response,
        retries: Option<RetryMetadata>,
        start: Instant,
        ctx: RequestContext,
    ) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            self.record(start, Some(status.as_u16()), None, retries, ctx);
            #[cfg(feature = "tracing")]
            tracing::debug!(
                status = status.as_u16(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "request completed"
            );
            return Ok(resp);
        }
        let body = resp.text().unwrap_or_default();
        let err = classify_response(status.as_u16(), body, retries.clone());
        self.record(start, Some(status.as_u16()), Some(err.message.clone()), retries, ctx);
        #[cfg(feature = "tracing")]
        tracing::warn!(status = status.as_u16(), kind = %err.kind, "request failed; returning error");
        Err(err.into())
    }

    fn record(
        &self,
        start: Instant,
        status: Option<u16>,
        error: Option<String>,
        retries: Option<RetryMetadata>,
        context: RequestContext,
    ) {
        if self.telemetry.http_enabled() {
            self.telemetry.record_http(HttpRequestMetrics {
                latency: start.elapsed(),
                status,
                error,
                retries,
                context,
            });
        }
    }
}

fn multipart_form(file: &UploadFile, fields: &[(String, String)]) -> Result<Form> {
    let part = Part::bytes(file.content.to_vec())
        .file_name(file.file_name.clone())
        .mime_str(UPLOAD_MIME)
        .map_err(|err| Error::validation(format!("invalid upload mime type: {err}")))?;
    let mut form = Form::new().part(UPLOAD_FIELD, part);
    for (key, value) in fields {
        form = form.text(key.clone(), value.clone());
    }
    Ok(form)
}

/// Iterator over the events of one SSE response, read on the calling thread.
///
/// Yields at most one `Err`, after which iteration ends. Dropping the handle
/// closes the connection.
pub struct BlockingStreamHandle {
    inner: StreamHandle,
    runtime: Arc<Runtime>,
}

impl BlockingStreamHandle {
    /// Stop iterating and close the connection.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    pub fn collect_events(self) -> Result<Vec<SseEvent>> {
        self.collect()
    }
}

impl Iterator for BlockingStreamHandle {
    type Item = Result<SseEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        self.runtime.block_on(self.inner.next())
    }
}

impl std::fmt::Debug for BlockingStreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingStreamHandle")
            .field("cancelled", &self.inner.is_cancelled())
            .finish()
    }
}

/// Handle to a callback-driven stream running on its own thread.
#[derive(Debug)]
pub struct BlockingStreamSubscription {
    cancel: Arc<Notify>,
    thread: thread::JoinHandle<()>,
}

impl BlockingStreamSubscription {
    /// Close the connection early. The consumer then sees `on_complete` (unless a
    /// terminal callback already ran).
    pub fn cancel(&self) {
        self.cancel.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Block until the terminal callback has run.
    pub fn join(self) -> thread::Result<()> {
        self.thread.join()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_base_url() {
        let err = BlockingClient::new(BlockingConfig {
            base_url: Some("not a url".into()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_zero_read_timeout() {
        let err = BlockingClient::new(BlockingConfig {
            read_timeout: Some(Duration::ZERO),
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("read_timeout"));
    }

    #[test]
    fn validation_fails_before_network() {
        let client = BlockingClient::new(BlockingConfig {
            // Nothing listens here; a network attempt would be a NetworkError.
            base_url: Some("http://127.0.0.1:9".into()),
            retry: Some(RetryConfig::disabled()),
            ..Default::default()
        })
        .unwrap();
        let err = client.get::<serde_json::Value>("relative/path").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ClientValidationError);
        let err = client
            .post::<_, serde_json::Value>("", &serde_json::json!({}))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ClientValidationError);
    }

    #[test]
    fn open_failure_reaches_on_error_only() {
        let client = BlockingClient::new(BlockingConfig {
            base_url: Some("http://127.0.0.1:9".into()),
            ..Default::default()
        })
        .unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let tx_complete = tx.clone();
        let sub = client.stream_with_callbacks(
            "",
            &serde_json::json!({}),
            StreamCallbacks::new(|_| {})
                .on_error(move |err| tx.send(format!("error:{}", err.kind())).unwrap())
                .on_complete(move || tx_complete.send("complete".to_string()).unwrap()),
        );
        sub.join().unwrap();
        let seen: Vec<String> = rx.try_iter().collect();
        assert_eq!(seen, ["error:invalid request"]);
    }
}
