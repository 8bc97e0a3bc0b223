//! Error kinds shared across the pool runtime.
//!
//! Every component that talks to Google's Cloud Code backend or manages
//! account state returns one of these kinds rather than a raw HTTP status,
//! so the Message/Streaming handlers can apply a single retry/fallback
//! policy regardless of which component failed.

use thiserror::Error;

/// Top-level error kind. Variant names match the error kinds enumerated in
/// the proxy's error handling design, not the upstream transport detail.
#[derive(Debug, Error)]
pub enum Error {
    /// Refresh token rejected outright; the account is unusable until re-authorized.
    #[error("auth invalid_grant: {0}")]
    AuthInvalidGrant(String),

    /// Token exchange failed for a transient reason (network, 5xx from the token endpoint).
    #[error("auth transient: {0}")]
    AuthTransient(String),

    /// Upstream reported quota exhaustion (429 or a "quota" body match).
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    /// Upstream returned a 5xx.
    #[error("upstream 5xx: {0}")]
    Upstream5xx(String),

    /// Upstream returned a non-retryable 4xx.
    #[error("upstream 4xx: {0}")]
    Upstream4xxClient(String),

    /// Upstream returned 401/403 from a generation call, distinct from
    /// `Upstream4xxClient` so handlers can run the token-refresh-then-retry
    /// sequence before giving up on the account. Same wire kind as
    /// `Upstream4xxClient`; this variant only exists for internal dispatch.
    #[error("upstream unauthorized: {0}")]
    Unauthorized(String),

    /// A 2xx response carried zero content blocks.
    #[error("empty response")]
    EmptyResponse,

    /// `fetchAvailableModels` returned 403; the account is flagged forbidden.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The caller's cancellation signal fired mid-request.
    #[error("canceled")]
    Canceled,

    /// Anything else: serialization failures, logic errors, I/O on local state.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The error kind name as surfaced to API clients, e.g. `{"type": kind}`.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Error::AuthInvalidGrant(_) => "AUTH_INVALID_GRANT",
            Error::AuthTransient(_) => "AUTH_TRANSIENT",
            Error::QuotaExhausted(_) => "QUOTA_EXHAUSTED",
            Error::Upstream5xx(_) => "UPSTREAM_5XX",
            Error::Upstream4xxClient(_) => "UPSTREAM_4XX_CLIENT",
            Error::Unauthorized(_) => "UPSTREAM_4XX_CLIENT",
            Error::EmptyResponse => "EMPTY_RESPONSE",
            Error::Forbidden(_) => "FORBIDDEN",
            Error::Canceled => "CANCELED",
            Error::Internal(_) => "INTERNAL",
        }
    }

    /// Whether this error belongs to a 5xx-class upstream failure, matched on
    /// a word boundary so messages like "listening on port 5000" don't match.
    #[must_use]
    pub fn is_5xx_message(message: &str) -> bool {
        five_xx_regex().is_match(message)
    }
}

fn five_xx_regex() -> &'static FiveXxMatcher {
    static MATCHER: FiveXxMatcher = FiveXxMatcher;
    &MATCHER
}

/// Tiny hand-rolled matcher for `\b5\d{2}\b` so this crate doesn't need to
/// pull in the `regex` crate just for one predicate.
struct FiveXxMatcher;

impl FiveXxMatcher {
    fn is_match(&self, haystack: &str) -> bool {
        let bytes = haystack.as_bytes();
        let is_boundary = |b: Option<u8>| !matches!(b, Some(c) if c.is_ascii_alphanumeric());
        let mut i = 0;
        while i + 3 <= bytes.len() {
            if bytes[i] == b'5' && bytes[i + 1].is_ascii_digit() && bytes[i + 2].is_ascii_digit() {
                let before = if i == 0 { None } else { Some(bytes[i - 1]) };
                let after = bytes.get(i + 3).copied();
                if is_boundary(before) && is_boundary(after) {
                    return true;
                }
            }
            i += 1;
        }
        false
    }
}

/// Result type alias used throughout the pool runtime.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_5xx_word_boundary() {
        assert!(Error::is_5xx_message("upstream returned 503 Service Unavailable"));
        assert!(Error::is_5xx_message("500"));
        assert!(!Error::is_5xx_message("listening on port 5000"));
        assert!(!Error::is_5xx_message("code 5001x"));
    }

    #[test]
    fn kind_names_match_spec_vocabulary() {
        assert_eq!(Error::AuthInvalidGrant("x".into()).kind(), "AUTH_INVALID_GRANT");
        assert_eq!(Error::EmptyResponse.kind(), "EMPTY_RESPONSE");
        assert_eq!(Error::Canceled.kind(), "CANCELED");
    }
}
