//! Resilient HTTP and SSE transport for the SQLBot natural-language-to-SQL service.
//!
//! [`Client`] (async) and [`BlockingClient`] execute authenticated JSON and
//! multipart requests with bounded linear-backoff retry, classify failures into
//! [`ErrorKind`], and parse `text/event-stream` responses into [`SseEvent`]s.
#![cfg_attr(docsrs, feature(doc_cfg))]
// Allow large error types - refactoring to Box<Error> would be a breaking change
#![allow(clippy::result_large_err)]

use std::time::Duration;

/// Default service base URL.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Default client identification header value.
pub(crate) const DEFAULT_CLIENT_HEADER: &str = concat!("sqlbot-rust/", env!("CARGO_PKG_VERSION"));

/// Default connection timeout (10 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default read timeout (30 seconds).
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Default per-attempt request timeout (30 seconds).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Standard authorization header carrying the token.
pub const AUTHORIZATION_HEADER: &str = "Authorization";

/// Service-specific header carrying the same token value.
pub const TOKEN_HEADER: &str = "X-Sqlbot-Token";

/// HTTP header name identifying the client library.
pub const CLIENT_HEADER: &str = "X-Sqlbot-Client";

mod client;
mod core;
mod errors;
mod http;
mod sse;
mod telemetry;
mod token;

#[cfg(feature = "blocking")]
mod blocking;

#[cfg(feature = "testing")]
pub mod testing;

pub use client::{Client, Config};
pub use crate::core::{RequestBody, RequestSpec, UploadFile};
pub use errors::{
    APIError, Error, ErrorKind, Result, RetryMetadata, TransportError, TransportErrorKind,
    ValidationError,
};
pub use http::{
    classify_response, classify_status, HeaderEntry, HeaderList, RequestOptions, RetryConfig,
};
pub use sse::{
    parse_line, SseEvent, SseLineParser, StreamCallbacks, StreamHandle, StreamSubscription,
    DEFAULT_MAX_LINE_BYTES,
};
pub use telemetry::{
    HttpRequestMetrics, MetricsCallbacks, RequestContext, StreamFirstEventMetrics,
};
pub use token::TokenStore;

#[cfg(feature = "testing")]
pub use testing::StreamEnding;

#[cfg(feature = "blocking")]
pub use blocking::{
    BlockingClient, BlockingConfig, BlockingStreamHandle, BlockingStreamSubscription,
};
