use std::time::Duration;

use crate::errors::{APIError, ErrorKind, RetryMetadata};

/// Per-call overrides.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    pub headers: HeaderList,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryConfig>,
}

impl RequestOptions {
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(HeaderEntry::new(key.into(), value.into()));
        self
    }

    /// Override the per-attempt request timeout for this call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the retry policy for this call.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Send exactly once, e.g. for non-idempotent POSTs.
    pub fn disable_retry(mut self) -> Self {
        self.retry = Some(RetryConfig::disabled());
        self
    }
}

/// Bounded retry with linear backoff.
///
/// A call makes at most `max_retries + 1` attempts. Every unsuccessful outcome is
/// retried, transport failures and non-2xx responses alike; only the final
/// non-2xx response gets classified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
}

/// What a single attempt produced, as far as retry decisions go.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AttemptOutcome {
    Success,
    Unsuccessful,
    TransportFailure,
}

/// Next move after an attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RetryStep {
    /// Hand the response back (2xx, or the final non-2xx for classification).
    Return,
    /// Release the current attempt, sleep, and try again.
    RetryAfter(Duration),
    /// Out of attempts on a transport failure.
    Fail,
}

impl RetryConfig {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Single attempt, no retry.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Total attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before the retry that follows zero-based attempt `attempt`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.saturating_add(1))
    }

    pub(crate) fn next_step(&self, attempt: u32, outcome: AttemptOutcome) -> RetryStep {
        let last = attempt >= self.max_retries;
        match outcome {
            AttemptOutcome::Success => RetryStep::Return,
            AttemptOutcome::Unsuccessful if last => RetryStep::Return,
            AttemptOutcome::TransportFailure if last => RetryStep::Fail,
            _ => RetryStep::RetryAfter(self.backoff_delay(attempt)),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: crate::DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(1000),
        }
    }
}

/// Structured header list with validation.
#[derive(Clone, Debug, Default)]
pub struct HeaderList(Vec<HeaderEntry>);

impl HeaderList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Add a header entry. Entries with a blank key or value are ignored.
    pub fn push(&mut self, entry: HeaderEntry) {
        if !entry.is_valid() {
            #[cfg(feature = "tracing")]
            tracing::debug!(key = %entry.key, "ignoring blank header");
            return;
        }
        self.0.push(entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderEntry> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct HeaderEntry {
    pub key: String,
    pub value: String,
}

impl HeaderEntry {
    pub fn new(key: String, value: String) -> Self {
        Self { key, value }
    }

    pub fn is_valid(&self) -> bool {
        !(self.key.trim().is_empty() || self.value.trim().is_empty())
    }
}

/// Maps a non-2xx status onto the error taxonomy.
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        400 => ErrorKind::BadRequest,
        401 => ErrorKind::Unauthorized,
        403 => ErrorKind::Forbidden,
        404 => ErrorKind::NotFound,
        500 => ErrorKind::ServerError,
        other => ErrorKind::HttpError(other),
    }
}

/// Builds the classified error for a final non-2xx response.
///
/// `body` is kept verbatim; pass an empty string when the body could not be read.
pub fn classify_response(status: u16, body: String, retries: Option<RetryMetadata>) -> APIError {
    let kind = classify_status(status);
    let label = match kind {
        ErrorKind::HttpError(_) => "request failed".to_string(),
        other => other.to_string(),
    };
    APIError {
        kind,
        status,
        message: format!("{label} [{status}]: {body}"),
        raw_body: body,
        retries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_linear_in_attempt() {
        let retry = RetryConfig::new(5, Duration::from_millis(250));
        assert_eq!(retry.backoff_delay(0), Duration::from_millis(250));
        assert_eq!(retry.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(retry.backoff_delay(3), Duration::from_millis(1000));
    }

    #[test]
    fn backoff_saturates() {
        let retry = RetryConfig::new(1, Duration::MAX);
        assert_eq!(retry.backoff_delay(u32::MAX), Duration::MAX);
    }

    #[test]
    fn success_returns_on_any_attempt() {
        let retry = RetryConfig::new(2, Duration::from_millis(10));
        for attempt in 0..=2 {
            assert_eq!(
                retry.next_step(attempt, AttemptOutcome::Success),
                RetryStep::Return
            );
        }
    }

    #[test]
    fn unsuccessful_retries_until_last_attempt() {
        let retry = RetryConfig::new(2, Duration::from_millis(10));
        assert_eq!(
            retry.next_step(0, AttemptOutcome::Unsuccessful),
            RetryStep::RetryAfter(Duration::from_millis(10))
        );
        assert_eq!(
            retry.next_step(1, AttemptOutcome::Unsuccessful),
            RetryStep::RetryAfter(Duration::from_millis(20))
        );
        assert_eq!(
            retry.next_step(2, AttemptOutcome::Unsuccessful),
            RetryStep::Return
        );
    }

    #[test]
    fn transport_failure_fails_on_last_attempt() {
        let retry = RetryConfig::new(1, Duration::from_millis(10));
        assert_eq!(
            retry.next_step(0, AttemptOutcome::TransportFailure),
            RetryStep::RetryAfter(Duration::from_millis(10))
        );
        assert_eq!(
            retry.next_step(1, AttemptOutcome::TransportFailure),
            RetryStep::Fail
        );
    }

    #[test]
    fn disabled_allows_exactly_one_attempt() {
        let retry = RetryConfig::disabled();
        assert_eq!(retry.max_attempts(), 1);
        assert_eq!(
            retry.next_step(0, AttemptOutcome::TransportFailure),
            RetryStep::Fail
        );
        assert_eq!(
            retry.next_step(0, AttemptOutcome::Unsuccessful),
            RetryStep::Return
        );
    }

    #[test]
    fn classifier_maps_known_statuses() {
        let cases = [
            (400, ErrorKind::BadRequest),
            (401, ErrorKind::Unauthorized),
            (403, ErrorKind::Forbidden),
            (404, ErrorKind::NotFound),
            (500, ErrorKind::ServerError),
        ];
        for (status, kind) in cases {
            assert_eq!(classify_status(status), kind, "status {status}");
        }
    }

    #[test]
    fn classifier_falls_back_to_http_error() {
        for status in [301, 405, 409, 422, 429, 502, 503, 504] {
            assert_eq!(classify_status(status), ErrorKind::HttpError(status));
        }
    }

    #[test]
    fn classified_error_keeps_body_verbatim() {
        let body = r#"{"detail":"bad credentials"}"#.to_string();
        let err = classify_response(401, body.clone(), None);
        assert_eq!(err.kind, ErrorKind::Unauthorized);
        assert_eq!(err.status, 401);
        assert_eq!(err.raw_body, body);
        assert!(err.message.contains("bad credentials"));
        assert!(err.message.starts_with("unauthorized [401]"));
    }

    #[test]
    fn classified_error_tolerates_empty_body() {
        let err = classify_response(503, String::new(), None);
        assert_eq!(err.kind, ErrorKind::HttpError(503));
        assert_eq!(err.message, "request failed [503]: ");
        assert!(err.raw_body.is_empty());
    }

    #[test]
    fn request_options_disable_retry_sets_zero_retries() {
        let opts = RequestOptions::default().disable_retry();
        assert_eq!(opts.retry.map(|r| r.max_retries), Some(0));
    }

    #[test]
    fn blank_headers_are_skipped() {
        let mut list = HeaderList::new();
        list.push(HeaderEntry::new("".to_string(), "value".to_string()));
        list.push(HeaderEntry::new("X-Tenant".to_string(), "  ".to_string()));
        assert!(list.is_empty());

        let opts = RequestOptions::default()
            .with_header("X-Tenant", "")
            .with_header("X-Trace", "abc");
        assert_eq!(opts.headers.iter().count(), 1);
    }

    #[test]
    fn header_list_accepts_valid_entries() {
        let mut list = HeaderList::new();
        list.push(HeaderEntry::new("X-Trace".to_string(), "abc".to_string()));
        assert_eq!(list.iter().count(), 1);
        assert!(!list.is_empty());
    }
}
