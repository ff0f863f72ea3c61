use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use reqwest::{
    header::{HeaderMap, CONTENT_TYPE},
    multipart::{Form, Part},
    Method, Url,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::time::sleep;

use crate::{
    core::{
        build_headers, decode_body, json_spec, parse_base_url, request_error, require_positive,
        resolve_url, RequestBody, RequestSpec, RetryState, UploadFile, ACCEPT_EVENT_STREAM,
        ACCEPT_JSON, UPLOAD_FIELD, UPLOAD_MIME,
    },
    errors::{Error, Result, RetryMetadata, TransportError, TransportErrorKind},
    http::{classify_response, AttemptOutcome, HeaderList, RequestOptions, RetryConfig, RetryStep},
    sse::{StreamCallbacks, StreamHandle, StreamSubscription},
    telemetry::{HttpRequestMetrics, MetricsCallbacks, RequestContext, Telemetry},
    token::TokenStore,
    DEFAULT_CLIENT_HEADER, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT,
    DEFAULT_REQUEST_TIMEOUT,
};

#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Service root (defaults to `http://localhost:8000`).
    pub base_url: Option<String>,
    /// Initial token.
    pub token: Option<String>,
    /// Share a token slot with other clients.
    pub token_store: Option<TokenStore>,
    pub client_header: Option<String>,
    pub http_client: Option<reqwest::Client>,
    /// Override the connect timeout (defaults to 10s).
    pub connect_timeout: Option<Duration>,
    /// Override the read timeout (defaults to 30s). Also bounds idle time on streams.
    pub read_timeout: Option<Duration>,
    /// Override the per-attempt request timeout (defaults to 30s).
    pub timeout: Option<Duration>,
    /// Retry/backoff policy (defaults to 3 retries, linear 1s backoff).
    pub retry: Option<RetryConfig>,
    /// Default extra headers applied to all requests.
    pub default_headers: Option<HeaderList>,
    /// Optional metrics callbacks (HTTP latency, time to first stream event).
    pub metrics: Option<MetricsCallbacks>,
}

/// Async SQLBot transport client. Cheap to clone; clones share the token.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    base_url: Url,
    tokens: TokenStore,
    client_header: Option<String>,
    http: reqwest::Client,
    request_timeout: Duration,
    retry: RetryConfig,
    default_headers: Option<HeaderList>,
    telemetry: Telemetry,
}

impl Client {
    pub fn new(cfg: Config) -> Result<Self> {
        let base_url = parse_base_url(cfg.base_url.as_deref())?;

        let connect_timeout = require_positive(
            "connect_timeout",
            cfg.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        )?;
        let read_timeout =
            require_positive("read_timeout", cfg.read_timeout.unwrap_or(DEFAULT_READ_TIMEOUT))?;
        let request_timeout =
            require_positive("timeout", cfg.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT))?;
        let retry = cfg.retry.unwrap_or_default();

        let http = match cfg.http_client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .connect_timeout(connect_timeout)
                .read_timeout(read_timeout)
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

    pub async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.execute(RequestSpec::get(url)).await
    }

    pub async fn get_with_options<T: DeserializeOwned>(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<T> {
        self.execute_with_options(RequestSpec::get(url), options)
            .await
    }

    pub async fn post<B, T>(&self, url: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.post_with_options(url, body, RequestOptions::default())
            .await
    }

    pub async fn post_with_options<B, T>(
        &self,
        url: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let spec = json_spec(Method::POST, url, body)?;
        self.execute_with_options(spec, options).await
    }

    pub async fn put<B, T>(&self, url: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.put_with_options(url, body, RequestOptions::default())
            .await
    }

    pub async fn put_with_options<B, T>(
        &self,
        url: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let spec = json_spec(Method::PUT, url, body)?;
        self.execute_with_options(spec, options).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.execute(RequestSpec::delete(url)).await
    }

    pub async fn delete_with_options<T: DeserializeOwned>(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<T> {
        self.execute_with_options(RequestSpec::delete(url), options)
            .await
    }

    pub async fn delete_with_body<B, T>(&self, url: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let spec = json_spec(Method::DELETE, url, body)?;
        self.execute(spec).await
    }

    /// `multipart/form-data` upload with the file in the `file` part.
    pub async fn upload_multipart<T, K, V>(
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
            .await
    }

    pub async fn execute<T: DeserializeOwned>(&self, spec: RequestSpec) -> Result<T> {
        self.execute_with_options(spec, RequestOptions::default())
            .await
    }

    /// Send `spec` with retry and decode the 2xx body into `T`.
    pub async fn execute_with_options<T: DeserializeOwned>(
        &self,
        spec: RequestSpec,
        options: RequestOptions,
    ) -> Result<T> {
        let url = resolve_url(&self.inner.base_url, &spec.url)?;
        let headers = self.inner.headers(ACCEPT_JSON, &options.headers)?;
        let timeout = options.timeout.unwrap_or(self.inner.request_timeout);
        let retry = options
            .retry
            .clone()
            .unwrap_or_else(|| self.inner.retry.clone());
        let ctx = RequestContext::new(spec.method.as_str(), url.as_str());

        let resp = self
            .inner
            .send_with_retry(&spec, &url, &headers, timeout, &retry, ctx)
            .await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| Error::Transport(TransportError::from_reqwest(err, None)))?;
        decode_body(&bytes)
    }

    /// Open an SSE stream with a JSON POST body.
    ///
    /// Failures before the first byte (validation, connect, non-2xx status) are
    /// returned here; the handle only carries mid-stream errors.
    pub async fn stream<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> Result<StreamHandle> {
        let spec = json_spec(Method::POST, url, body)?;
        self.execute_stream(spec, RequestOptions::default()).await
    }

    /// Open an SSE stream for an arbitrary request. Never retried.
    pub async fn execute_stream(
        &self,
        spec: RequestSpec,
        options: RequestOptions,
    ) -> Result<StreamHandle> {
        let url = resolve_url(&self.inner.base_url, &spec.url)?;
        let headers = self.inner.headers(ACCEPT_EVENT_STREAM, &options.headers)?;
        let ctx = RequestContext::new(spec.method.as_str(), url.as_str());
        let start = Instant::now();

        #[cfg(feature = "tracing")]
        tracing::debug!(method = %ctx.method, url = %ctx.url, "opening stream");

        let builder = self
            .inner
            .build_request(&spec, &url, &headers, options.timeout)?;
        let resp = match builder.send().await {
            Ok(resp) => resp,
            Err(err) => {
                let error = request_error(err, None);
                self.inner.record(start, None, Some(error.to_string()), None, ctx);
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %error, "stream request failed");
                return Err(error);
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let err = classify_response(status.as_u16(), body, None);
            self.inner
                .record(start, Some(status.as_u16()), Some(err.message.clone()), None, ctx);
            #[cfg(feature = "tracing")]
            tracing::warn!(status = status.as_u16(), "stream rejected");
            return Err(err.into());
        }

        self.inner
            .record(start, Some(status.as_u16()), None, None, ctx.clone());
        let telemetry = self.inner.telemetry.stream_state(ctx, start);
        Ok(StreamHandle::new(resp, telemetry))
    }

    /// Callback form of [`Client::stream`].
    ///
    /// Returns immediately; a spawned task runs the request and invokes the
    /// callbacks. Exactly one of `on_error` / `on_complete` runs.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    pub fn stream_with_callbacks<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        callbacks: StreamCallbacks,
    ) -> StreamSubscription {
        let client = self.clone();
        let spec = json_spec(Method::POST, url, body);
        StreamSubscription::spawn(
            async move {
                match spec {
                    Ok(spec) => client.execute_stream(spec, RequestOptions::default()).await,
                    Err(err) => Err(err),
                }
            },
            callbacks,
        )
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.inner.base_url.as_str())
            .field("tokens", &self.inner.tokens)
            .field("retry", &self.inner.retry)
            .finish()
    }
}

impl ClientInner {
    fn headers(&self, accept: &'static str, extra: &HeaderList) -> Result<HeaderMap> {
        let token = self.tokens.get();
        build_headers(
            accept,
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
        timeout: Option<Duration>,
    ) -> Result<reqwest::RequestBuilder> {
        let mut builder = self
            .http
            .request(spec.method.clone(), url.clone())
            .headers(headers.clone());
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(match &spec.body {
            RequestBody::Empty => builder,
            RequestBody::Json(bytes) => builder
                .header(CONTENT_TYPE, ACCEPT_JSON)
                .body(bytes.clone()),
            RequestBody::Multipart { file, fields } => {
                builder.multipart(multipart_form(file, fields)?)
            }
        })
    }

    async fn send_with_retry(
        &self,
        spec: &RequestSpec,
        url: &Url,
        headers: &HeaderMap,
        timeout: Duration,
        retry: &RetryConfig,
        ctx: RequestContext,
    ) -> Result<reqwest::Response> {
        let max_attempts = retry.max_attempts();
        let mut state = RetryState::new();
        let start = Instant::now();
        let mut attempt = 0u32;

        loop {
            let builder = self.build_request(spec, url, headers, Some(timeout))?;
            state.record_attempt(attempt);

            #[cfg(feature = "tracing")]
            let result = {
                use tracing::Instrument;
                let span = tracing::debug_span!(
                    "sqlbot.http",
                    method = %ctx.method,
                    url = %ctx.url,
                    attempt,
                    max_attempts
                );
                builder.send().instrument(span).await
            };
            #[cfg(not(feature = "tracing"))]
            let result = builder.send().await;

            match result {
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
                                max_attempts,
                                delay_ms = delay.as_millis() as u64,
                                "unsuccessful response; retrying"
                            );
                            drop(resp);
                            sleep(delay).await;
                        }
                        RetryStep::Return | RetryStep::Fail => {
                            return self.finish(resp, state.metadata(), start, ctx).await;
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
                                max_attempts,
                                error = %err,
                                delay_ms = delay.as_millis() as u64,
                                "transport error; retrying"
                            );
                            sleep(delay).await;
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

    /// Final response of a retry loop: pass 2xx through, classify anything else.
    async fn finish(
        &self,
        resp: reqwest::Response,
        retries: Option<RetryMetadata>,
        start: Instant,
        ctx: RequestContext,
    ) -> Result<reqwest::Response> {
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

        let body = resp.text().await.unwrap_or_default();
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
    let part = Part::stream_with_length(file.content.clone(), file.content.len() as u64)
        .file_name(file.file_name.clone())
        .mime_str(UPLOAD_MIME)
        .map_err(|err| Error::validation(format!("invalid upload mime type: {err}")))?;
    let mut form = Form::new().part(UPLOAD_FIELD, part);
    for (key, value) in fields {
        form = form.text(key.clone(), value.clone());
    }
    Ok(form)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_config() {
        let err = Client::new(Config {
            base_url: Some("ftp://files".into()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = Client::new(Config {
            timeout: Some(Duration::ZERO),
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn initial_token_lands_in_store() {
        let client = Client::new(Config {
            token: Some("tok".into()),
            ..Default::default()
        })
        .unwrap();
        assert!(client.is_authenticated());
        assert_eq!(client.current_token().as_deref(), Some("tok"));
        client.set_token(None);
        assert!(!client.is_authenticated());
    }

    #[test]
    fn clients_can_share_a_token_store() {
        let store = TokenStore::new();
        let a = Client::new(Config {
            token_store: Some(store.clone()),
            ..Default::default()
        })
        .unwrap();
        let b = Client::new(Config {
            token_store: Some(store.clone()),
            ..Default::default()
        })
        .unwrap();
        a.set_token(Some("shared"));
        assert_eq!(b.current_token().as_deref(), Some("shared"));
        assert_eq!(store.get().as_deref(), Some("shared"));
    }

    #[test]
    fn debug_output_hides_token() {
        let client = Client::new(Config {
            token: Some("very-secret-token".into()),
            ..Default::default()
        })
        .unwrap();
        let rendered = format!("{client:?}");
        assert!(!rendered.contains("very-secret-token"));
        assert!(rendered.contains("localhost:8000"));
    }
}
