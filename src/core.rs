//! Shared runtime-agnostic logic for async and blocking clients.
//!
//! This module contains data structures and pure functions that are used by both
//! the async client (`client.rs`) and the blocking client (`blocking.rs`).
//!
//! ## Contents
//!
//! - **Request model**: [`RequestSpec`], [`RequestBody`], [`UploadFile`]
//! - **Retry State**: [`RetryState`] for tracking HTTP retry attempts
//! - **URL handling**: [`resolve_url`] validates and resolves request targets
//! - **Decoding**: [`decode_body`] turns a full 2xx body into the caller's shape
//! - **Config/headers**: base URL normalization and per-call header assembly

use std::{path::Path, time::Duration};

use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION},
    Method, Url,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    errors::{Error, Result, RetryMetadata, TransportError, ValidationError},
    http::HeaderList,
    CLIENT_HEADER, DEFAULT_BASE_URL, TOKEN_HEADER,
};

/// One logical request: method, target and body.
///
/// Bodies are held as owned bytes so every retry attempt can rebuild a fresh
/// request without touching a previously consumed stream.
#[derive(Clone, Debug)]
pub struct RequestSpec {
    pub(crate) method: Method,
    pub(crate) url: String,
    pub(crate) body: RequestBody,
}

impl RequestSpec {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    /// Serialize `body` as the JSON payload. Fails with a serialization error, and
    /// without touching the network, if the value cannot be encoded.
    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self> {
        let bytes = serde_json::to_vec(body)?;
        self.body = RequestBody::Json(Bytes::from(bytes));
        Ok(self)
    }

    /// Attach a multipart upload: `file` goes in the `file` part, `fields` become
    /// plain text parts in order.
    pub fn multipart<K, V>(mut self, file: UploadFile, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.body = RequestBody::Multipart {
            file,
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        };
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }
}

/// Request payload.
#[derive(Clone, Debug)]
pub enum RequestBody {
    Empty,
    /// Pre-serialized JSON.
    Json(Bytes),
    Multipart {
        file: UploadFile,
        fields: Vec<(String, String)>,
    },
}

/// MIME type used for uploaded files.
pub(crate) const UPLOAD_MIME: &str = "application/octet-stream";

/// Multipart form field carrying the file.
pub(crate) const UPLOAD_FIELD: &str = "file";

/// File content for `multipart/form-data` uploads.
#[derive(Clone)]
pub struct UploadFile {
    pub file_name: String,
    pub content: Bytes,
}

impl UploadFile {
    pub fn from_bytes(file_name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            content: content.into(),
        }
    }

    /// Read a file from disk. A missing or unreadable file is a client validation
    /// error.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read(path).map_err(|err| upload_read_error(path, err))?;
        Ok(Self::from_bytes(file_name_of(path), content))
    }

    /// Async variant of [`UploadFile::from_path`].
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read(path)
            .await
            .map_err(|err| upload_read_error(path, err))?;
        Ok(Self::from_bytes(file_name_of(path), content))
    }
}

impl std::fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadFile")
            .field("file_name", &self.file_name)
            .field("len", &self.content.len())
            .finish()
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| UPLOAD_FIELD.to_string())
}

fn upload_read_error(path: &Path, err: std::io::Error) -> Error {
    let message = if err.kind() == std::io::ErrorKind::NotFound {
        format!("file does not exist: {}", path.display())
    } else {
        format!("failed to read {}: {err}", path.display())
    };
    Error::Validation(ValidationError::new(message).with_field("file"))
}

/// Validates a request target and resolves `/`-rooted paths against `base`.
///
/// Anything that is not an http(s) URL or an absolute path is rejected before
/// any network activity. A `/`-rooted path is always appended to the base, so it
/// can never change the scheme or host.
pub(crate) fn resolve_url(base: &Url, target: &str) -> Result<Url> {
    let target = target.trim();
    if target.is_empty() {
        return Err(Error::Validation(
            ValidationError::new("url is required").with_field("url"),
        ));
    }
    let lower = target.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Url::parse(target).map_err(|err| invalid_url(target, err));
    }
    if !target.starts_with('/') {
        return Err(Error::Validation(
            ValidationError::new(format!("url must be absolute: {target}")).with_field("url"),
        ));
    }

    let mut root = base.clone();
    root.set_query(None);
    root.set_fragment(None);
    let joined = format!(
        "{}/{}",
        root.as_str().trim_end_matches('/'),
        target.trim_start_matches('/')
    );
    let url = Url::parse(&joined).map_err(|err| invalid_url(target, err))?;
    if url.origin() != base.origin() {
        return Err(Error::Validation(
            ValidationError::new(format!("path escapes the base url: {target}")).with_field("url"),
        ));
    }
    Ok(url)
}

fn invalid_url(target: &str, err: impl std::fmt::Display) -> Error {
    Error::Validation(ValidationError::new(format!("invalid url {target}: {err}")).with_field("url"))
}

/// Map a failed send. Requests reqwest refuses to build are caller errors and
/// never reach the network.
pub(crate) fn request_error(err: reqwest::Error, retries: Option<RetryMetadata>) -> Error {
    if err.is_builder() {
        return Error::Validation(
            ValidationError::new(format!("invalid request: {err}")).with_field("url"),
        );
    }
    Error::Transport(TransportError::from_reqwest(err, retries))
}

/// Cheap pre-flight check used before serializing a body.
pub(crate) fn check_target(target: &str) -> Result<()> {
    if target.trim().is_empty() {
        return Err(Error::Validation(
            ValidationError::new("url is required").with_field("url"),
        ));
    }
    Ok(())
}

/// Builds a JSON request after checking the target, so a bad URL is reported
/// before a body that fails to serialize.
pub(crate) fn json_spec<B: Serialize + ?Sized>(method: Method, url: &str, body: &B) -> Result<RequestSpec> {
    check_target(url)?;
    RequestSpec::new(method, url).json(body)
}

/// Parse and normalize the configured base URL.
///
/// The result always ends in `/` so `/`-rooted targets keep any base path prefix.
pub(crate) fn parse_base_url(raw: Option<&str>) -> Result<Url> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_BASE_URL);
    let lower = raw.to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return Err(Error::Config(format!(
            "base url must start with http:// or https://: {raw}"
        )));
    }
    let normalized = format!("{}/", raw.trim_end_matches('/'));
    Url::parse(&normalized).map_err(|err| Error::Config(format!("invalid base url: {err}")))
}

pub(crate) fn require_positive(name: &str, value: Duration) -> Result<Duration> {
    if value.is_zero() {
        return Err(Error::Config(format!("{name} must be greater than zero")));
    }
    Ok(value)
}

pub(crate) const ACCEPT_JSON: &str = "application/json";
pub(crate) const ACCEPT_EVENT_STREAM: &str = "text/event-stream";

/// Assemble the headers for one call: client id, defaults, per-call extras, then
/// the token pair. Computed once per call and reused across attempts.
pub(crate) fn build_headers(
    accept: &'static str,
    client_header: Option<&str>,
    defaults: Option<&HeaderList>,
    extra: &HeaderList,
    token: Option<&str>,
) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(accept));
    if let Some(client_header) = client_header {
        let value = HeaderValue::from_str(client_header)
            .map_err(|err| Error::Config(format!("invalid client header: {err}")))?;
        headers.insert(CLIENT_HEADER, value);
    }
    if let Some(defaults) = defaults {
        apply_header_list(&mut headers, defaults)?;
    }
    apply_header_list(&mut headers, extra)?;

    if let Some(token) = token {
        let mut value = HeaderValue::from_str(token).map_err(|_| {
            Error::Validation(
                ValidationError::new("token is not a valid header value").with_field("token"),
            )
        })?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value.clone());
        headers.insert(TOKEN_HEADER, value);
    }
    Ok(headers)
}

fn apply_header_list(headers: &mut HeaderMap, list: &HeaderList) -> Result<()> {
    for entry in list.iter() {
        if !entry.is_valid() {
            continue;
        }
        let name = HeaderName::from_bytes(entry.key.trim().as_bytes()).map_err(|err| {
            Error::Validation(ValidationError::new(format!("invalid header name: {err}")).with_field("headers"))
        })?;
        let val = HeaderValue::from_str(entry.value.trim()).map_err(|err| {
            Error::Validation(ValidationError::new(format!("invalid header value: {err}")).with_field("headers"))
        })?;
        headers.insert(name, val);
    }
    Ok(())
}

/// Decode a complete 2xx body. An empty body decodes as JSON `null`, so `()` and
/// `Option<_>` accept empty replies.
pub(crate) fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let trimmed = bytes.iter().all(|b| b.is_ascii_whitespace());
    let source: &[u8] = if trimmed { b"null" } else { bytes };
    serde_json::from_slice(source).map_err(Error::Serialization)
}

/// Tracks retry state across attempts for both async and blocking clients.
#[derive(Default)]
pub(crate) struct RetryState {
    pub(crate) attempts: u32,
    pub(crate) last_status: Option<u16>,
    pub(crate) last_error: Option<String>,
}

impl RetryState {
    pub(crate) fn new() -> Self {
        Self {
            attempts: 0,
            last_status: None,
            last_error: None,
        }
    }

    /// Record that zero-based attempt `attempt` was made.
    pub(crate) fn record_attempt(&mut self, attempt: u32) {
        self.attempts = attempt + 1;
    }

    pub(crate) fn record_status(&mut self, status: u16) {
        self.last_status = Some(status);
    }

    pub(crate) fn record_error(&mut self, err: &reqwest::Error) {
        self.last_error = Some(err.to_string());
    }

    pub(crate) fn metadata(&self) -> Option<RetryMetadata> {
        if self.attempts <= 1 {
            None
        } else {
            Some(RetryMetadata {
                attempts: self.attempts,
                last_status: self.last_status,
                last_error: self.last_error.clone(),
            })
        }
    }
}
