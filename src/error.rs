//! Unified error handling for the fleet-sync library.
//!
//! Every failure that crosses a component boundary is a [`ClassifiedError`]:
//! a normalized record carrying the error kind, severity, recoverability and
//! user-facing messaging. Classification is pure (no I/O) so the retry policy
//! in the GP51 client and the messaging shown by UI layers can both be tested
//! against exact category assignment.

use std::fmt;
use std::time::Duration;

/// Backoff applied before retrying a transport-level failure.
pub const NETWORK_BACKOFF: Duration = Duration::from_secs(5);
/// Backoff applied after the vendor throttles us.
pub const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(30);
/// Backoff applied after a request timed out or was aborted.
pub const TIMEOUT_BACKOFF: Duration = Duration::from_secs(10);
/// Backoff applied after an unparseable or malformed response.
pub const DATA_BACKOFF: Duration = Duration::from_secs(5);
/// Backoff applied to otherwise-unclassified vendor errors.
pub const API_BACKOFF: Duration = Duration::from_secs(5);

/// Category of a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport-level failure (DNS, connect, TLS, reset).
    Network,
    /// Missing, expired or rejected session token.
    Authentication,
    /// Vendor-side error (bad action, vendor status != 0).
    Api,
    /// Response body was empty, unparseable or structurally wrong.
    Data,
    /// Vendor throttling (HTTP 429 or rate-limit message).
    RateLimit,
    /// Request exceeded its time budget or was cancelled.
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Network => "network",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Api => "api",
            ErrorKind::Data => "data",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// Operator-facing severity of a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A normalized error record derived from a raw failure.
///
/// `user_message` and `suggested_action` are a design contract: UI layers
/// surface them verbatim instead of the raw error text in `detail`.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub severity: Severity,
    /// Whether the condition can clear on its own.
    pub recoverable: bool,
    /// How long to wait before a retry, when one makes sense.
    pub retry_after: Option<Duration>,
    /// Plain-language description for end users.
    pub user_message: String,
    /// What the user (or operator) should do next.
    pub suggested_action: String,
    /// Raw underlying error text, for logs only.
    pub detail: String,
}

impl ClassifiedError {
    /// Transport-level failure: recoverable, retried after a short backoff.
    pub fn network(detail: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Network,
            severity: Severity::High,
            recoverable: true,
            retry_after: Some(NETWORK_BACKOFF),
            user_message: "Unable to reach the tracking server.".into(),
            suggested_action: "Check the network connection and try again.".into(),
            detail: detail.into(),
        }
    }

    /// Missing/expired/rejected credentials. Recoverable, but only by the
    /// operator signing in again — never retried silently.
    pub fn authentication(detail: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Authentication,
            severity: Severity::High,
            recoverable: true,
            retry_after: None,
            user_message: "Your GP51 session is missing or has expired.".into(),
            suggested_action: "Sign in to GP51 again to refresh the session.".into(),
            detail: detail.into(),
        }
    }

    /// Vendor rejected the request in a way retrying cannot fix.
    pub fn api_fatal(detail: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Api,
            severity: Severity::Critical,
            recoverable: false,
            retry_after: None,
            user_message: "The tracking server rejected the request.".into(),
            suggested_action: "Contact support if the problem persists.".into(),
            detail: detail.into(),
        }
    }

    /// Generic vendor error; assumed transient.
    pub fn api(detail: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Api,
            severity: Severity::Medium,
            recoverable: true,
            retry_after: Some(API_BACKOFF),
            user_message: "The tracking server returned an unexpected error.".into(),
            suggested_action: "Try again in a few seconds.".into(),
            detail: detail.into(),
        }
    }

    /// Vendor throttling. Waiting out the window clears it.
    pub fn rate_limit(detail: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::RateLimit,
            severity: Severity::Low,
            recoverable: true,
            retry_after: Some(RATE_LIMIT_BACKOFF),
            user_message: "The tracking server is throttling requests.".into(),
            suggested_action: "Wait half a minute before retrying.".into(),
            detail: detail.into(),
        }
    }

    /// Request exceeded its time budget or was cancelled by the caller.
    pub fn timeout(detail: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            severity: Severity::Medium,
            recoverable: true,
            retry_after: Some(TIMEOUT_BACKOFF),
            user_message: "The tracking server took too long to respond.".into(),
            suggested_action: "Try again; the server may be busy.".into(),
            detail: detail.into(),
        }
    }

    /// Empty body, parse failure or structurally invalid response.
    pub fn data(detail: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Data,
            severity: Severity::Medium,
            recoverable: true,
            retry_after: Some(DATA_BACKOFF),
            user_message: "The tracking server sent an unreadable response.".into(),
            suggested_action: "Try again; report the issue if it keeps happening.".into(),
            detail: detail.into(),
        }
    }

    /// Classify a failure from its message content alone.
    ///
    /// Used for vendor `cause` strings and errors with no structured source.
    /// Decision order matters: auth wording wins over everything else so an
    /// expired-token message never gets retried as a generic API error.
    pub fn from_message(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let lower = detail.to_lowercase();

        if lower.contains("token")
            || lower.contains("login")
            || lower.contains("auth")
            || lower.contains("session")
            || lower.contains("password")
        {
            return Self::authentication(detail);
        }
        if lower.contains("action not found")
            || lower.contains("unknown action")
            || lower.contains("not supported")
        {
            return Self::api_fatal(detail);
        }
        if lower.contains("rate limit") || lower.contains("too many requests") {
            return Self::rate_limit(detail);
        }
        if lower.contains("timeout") || lower.contains("timed out") || lower.contains("abort") {
            return Self::timeout(detail);
        }
        if lower.contains("json") || lower.contains("parse") || lower.contains("empty response") {
            return Self::data(detail);
        }
        Self::api(detail)
    }

    /// Classify a non-success HTTP status code.
    pub fn from_http_status(status: u16, detail: impl Into<String>) -> Self {
        match status {
            429 => Self::rate_limit(detail),
            401 | 403 => Self::authentication(detail),
            408 => Self::timeout(detail),
            500..=599 => Self::network(detail),
            _ => Self::api(detail),
        }
    }

    /// Whether the GP51 client's retry loop may retry this failure.
    ///
    /// Authentication errors are recoverable but require operator action,
    /// so they are surfaced immediately instead of being retried.
    pub fn should_retry(&self) -> bool {
        self.recoverable && self.kind != ErrorKind::Authentication
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.detail)
    }
}

impl std::error::Error for ClassifiedError {}

/// Result type alias for fleet-sync operations.
pub type Result<T> = std::result::Result<T, ClassifiedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_messages_classify_deterministically() {
        for msg in ["Rate limit exceeded", "too many requests from this IP"] {
            let err = ClassifiedError::from_message(msg);
            assert_eq!(err.kind, ErrorKind::RateLimit);
            assert!(err.recoverable);
            assert_eq!(err.retry_after, Some(RATE_LIMIT_BACKOFF));
        }
    }

    #[test]
    fn test_auth_wording_wins_over_other_patterns() {
        // "login timed out" mentions both auth and timeout; auth must win.
        let err = ClassifiedError::from_message("login timed out");
        assert_eq!(err.kind, ErrorKind::Authentication);
        assert!(!err.should_retry());
        assert_eq!(err.retry_after, None);

        let err = ClassifiedError::from_message("user or password error");
        assert_eq!(err.kind, ErrorKind::Authentication);
    }

    #[test]
    fn test_unknown_action_is_fatal() {
        let err = ClassifiedError::from_message("action not found: queryfoo");
        assert_eq!(err.kind, ErrorKind::Api);
        assert_eq!(err.severity, Severity::Critical);
        assert!(!err.recoverable);
        assert!(!err.should_retry());
    }

    #[test]
    fn test_unmatched_message_falls_back_to_api() {
        let err = ClassifiedError::from_message("something odd happened");
        assert_eq!(err.kind, ErrorKind::Api);
        assert!(err.recoverable);
        assert_eq!(err.retry_after, Some(API_BACKOFF));
    }

    #[test]
    fn test_http_status_classification() {
        assert_eq!(
            ClassifiedError::from_http_status(429, "429").kind,
            ErrorKind::RateLimit
        );
        assert_eq!(
            ClassifiedError::from_http_status(401, "401").kind,
            ErrorKind::Authentication
        );
        assert_eq!(
            ClassifiedError::from_http_status(503, "503").kind,
            ErrorKind::Network
        );
        assert_eq!(
            ClassifiedError::from_http_status(404, "404").kind,
            ErrorKind::Api
        );
    }

    #[test]
    fn test_every_classification_carries_messaging() {
        let samples = [
            ClassifiedError::network("x"),
            ClassifiedError::authentication("x"),
            ClassifiedError::api_fatal("x"),
            ClassifiedError::api("x"),
            ClassifiedError::rate_limit("x"),
            ClassifiedError::timeout("x"),
            ClassifiedError::data("x"),
        ];
        for err in &samples {
            assert!(!err.user_message.is_empty());
            assert!(!err.suggested_action.is_empty());
        }
    }

    #[test]
    fn test_display_includes_kind_and_detail() {
        let err = ClassifiedError::timeout("request aborted after 30s");
        let text = err.to_string();
        assert!(text.contains("timeout"));
        assert!(text.contains("request aborted"));
    }
}
