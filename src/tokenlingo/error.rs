//! Error taxonomy shared by the provider adapters, the persistence collaborator, and the
//! session orchestrator.
//!
//! Provider adapters never leak vendor-native failures: every HTTP or transport fault is
//! mapped into a [`ProviderError`] so the orchestrator can apply one retry policy regardless
//! of which vendor is speaking.
//!
//! ```
//! use tokenlingo::error::ProviderError;
//!
//! let err = ProviderError::from_status(429, "slow down", Some(12));
//! assert!(err.is_retryable());
//! assert_eq!(err.to_string(), "Rate limited by provider (retry after 12s)");
//! ```

use crate::tokenlingo::session::SessionStatus;
use once_cell::sync::Lazy;
use regex::Regex;
use std::error::Error;
use std::fmt;

/// Faults raised by a [`ModelProvider`](crate::provider::ModelProvider).
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// The vendor throttled the request. Retryable.
    RateLimit {
        /// Seconds suggested by the `Retry-After` header, when the vendor sent one.
        retry_after_seconds: Option<u64>,
    },
    /// Prompt plus context exceeded the model window. The window must shrink before retrying.
    TokenLimit { requested: usize, max: usize },
    /// Missing, revoked, or malformed credential. Configuration fault.
    Authentication { message: String },
    /// Anything else, classified by status.
    Generic {
        status: Option<u16>,
        message: String,
        retryable: bool,
    },
}

static TOKEN_LIMIT_HINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(context[_ ]length|context window|maximum context|too many tokens|token limit|max_tokens)")
        .expect("static regex")
});

static TOKEN_NUMBERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{3,})").expect("static regex"));

impl ProviderError {
    /// Whether the exact same turn may be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimit { .. } => true,
            ProviderError::TokenLimit { .. } => false,
            ProviderError::Authentication { .. } => false,
            ProviderError::Generic { retryable, .. } => *retryable,
        }
    }

    /// Classify an HTTP-like status code and response body.
    ///
    /// 401/403 map to [`ProviderError::Authentication`], 429 to [`ProviderError::RateLimit`],
    /// 400/413 bodies that talk about a context or token limit to
    /// [`ProviderError::TokenLimit`]. 5xx and 408 are retryable generic faults; every other
    /// status is a non-retryable generic fault.
    ///
    /// ```
    /// use tokenlingo::error::ProviderError;
    ///
    /// assert!(matches!(
    ///     ProviderError::from_status(401, "bad key", None),
    ///     ProviderError::Authentication { .. }
    /// ));
    /// assert!(ProviderError::from_status(503, "overloaded", None).is_retryable());
    /// assert!(!ProviderError::from_status(404, "no such model", None).is_retryable());
    /// ```
    pub fn from_status(status: u16, body: &str, retry_after_seconds: Option<u64>) -> Self {
        match status {
            401 | 403 => ProviderError::Authentication {
                message: body.to_string(),
            },
            429 => ProviderError::RateLimit {
                retry_after_seconds,
            },
            400 | 413 if TOKEN_LIMIT_HINT.is_match(body) => {
                let (max, requested) = parse_token_limit_numbers(body);
                ProviderError::TokenLimit { requested, max }
            }
            408 | 500..=599 => ProviderError::Generic {
                status: Some(status),
                message: body.to_string(),
                retryable: true,
            },
            _ => ProviderError::Generic {
                status: Some(status),
                message: body.to_string(),
                retryable: false,
            },
        }
    }

    /// A network-level fault (connect, timeout, broken body). Always retryable.
    pub fn network(message: impl Into<String>) -> Self {
        ProviderError::Generic {
            status: None,
            message: message.into(),
            retryable: true,
        }
    }

    /// The vendor answered but the payload could not be understood.
    pub fn malformed(message: impl Into<String>) -> Self {
        ProviderError::Generic {
            status: None,
            message: message.into(),
            retryable: false,
        }
    }

    /// Stable snake_case reason used by the HTTP boundary.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProviderError::RateLimit { .. } => "rate_limit",
            ProviderError::TokenLimit { .. } => "token_limit",
            ProviderError::Authentication { .. } => "authentication",
            ProviderError::Generic { .. } => "provider_error",
        }
    }
}

/// Vendors phrase this as "maximum context length is 8192 tokens ... you requested 9000".
/// The first large number is the limit, the second the request.
fn parse_token_limit_numbers(body: &str) -> (usize, usize) {
    let numbers: Vec<usize> = TOKEN_NUMBERS
        .captures_iter(body)
        .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse().ok()))
        .collect();
    match numbers.as_slice() {
        [max, requested, ..] => (*max, *requested),
        [max] => (*max, 0),
        [] => (0, 0),
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::RateLimit {
                retry_after_seconds: Some(secs),
            } => write!(f, "Rate limited by provider (retry after {}s)", secs),
            ProviderError::RateLimit {
                retry_after_seconds: None,
            } => write!(f, "Rate limited by provider"),
            ProviderError::TokenLimit { requested, max } => write!(
                f,
                "Token limit exceeded: requested {} tokens, model allows {}",
                requested, max
            ),
            ProviderError::Authentication { message } => {
                write!(f, "Provider authentication failed: {}", message)
            }
            ProviderError::Generic {
                status: Some(status),
                message,
                ..
            } => write!(f, "Provider error (HTTP {}): {}", status, message),
            ProviderError::Generic {
                status: None,
                message,
                ..
            } => write!(f, "Provider error: {}", message),
        }
    }
}

impl Error for ProviderError {}

/// Faults raised by a [`SessionStore`](crate::store::SessionStore).
#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceError {
    Io(String),
    Serialization(String),
    NotFound(String),
    /// The write would violate a store invariant (duplicate id, iteration gap).
    Conflict(String),
    /// The on-disk hash chain does not verify.
    Integrity(String),
    /// The session id cannot name a file.
    InvalidId(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceError::Io(msg) => write!(f, "Storage I/O failure: {}", msg),
            PersistenceError::Serialization(msg) => write!(f, "Storage serialization failure: {}", msg),
            PersistenceError::NotFound(id) => write!(f, "Stored session not found: {}", id),
            PersistenceError::Conflict(msg) => write!(f, "Storage conflict: {}", msg),
            PersistenceError::Integrity(msg) => write!(f, "Storage integrity failure: {}", msg),
            PersistenceError::InvalidId(id) => write!(f, "Invalid session id for storage: {:?}", id),
        }
    }
}

impl Error for PersistenceError {}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        PersistenceError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::Serialization(err.to_string())
    }
}

/// Errors returned by [`SessionOrchestrator`](crate::orchestrator::SessionOrchestrator)
/// operations.
///
/// ```
/// use tokenlingo::error::SessionError;
///
/// let err = SessionError::AlreadyProcessing;
/// assert_eq!(err.reason_code(), "already_processing");
/// assert!(err.is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Bad caller input, surfaced verbatim.
    Validation(String),
    /// A participant names a provider with no configured adapter.
    ProviderUnavailable(String),
    /// A turn is already in flight on this orchestrator.
    AlreadyProcessing,
    /// `current_iteration` already reached `max_iterations`.
    SessionComplete,
    /// The operation needs a running session.
    SessionNotRunning(SessionStatus),
    /// No live or stored session carries this id.
    SessionNotFound(String),
    /// The orchestrator holds no live session.
    NoSession,
    Provider(ProviderError),
    Persistence(PersistenceError),
}

impl SessionError {
    /// Stable snake_case reason used by the HTTP boundary.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SessionError::Validation(_) => "validation",
            SessionError::ProviderUnavailable(_) => "provider_unavailable",
            SessionError::AlreadyProcessing => "already_processing",
            SessionError::SessionComplete => "session_complete",
            SessionError::SessionNotRunning(_) => "session_not_running",
            SessionError::SessionNotFound(_) => "session_not_found",
            SessionError::NoSession => "no_session",
            SessionError::Provider(inner) => inner.reason_code(),
            SessionError::Persistence(_) => "persistence",
        }
    }

    /// Whether the caller may retry the same call later without changing anything.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::AlreadyProcessing => true,
            SessionError::Provider(inner) => inner.is_retryable(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Validation(msg) => write!(f, "Invalid request: {}", msg),
            SessionError::ProviderUnavailable(tag) => {
                write!(f, "No adapter configured for provider: {}", tag)
            }
            SessionError::AlreadyProcessing => write!(f, "A turn is already being processed"),
            SessionError::SessionComplete => write!(f, "Session has reached its iteration limit"),
            SessionError::SessionNotRunning(status) => {
                write!(f, "Session is not running (status: {})", status)
            }
            SessionError::SessionNotFound(id) => write!(f, "Session not found: {}", id),
            SessionError::NoSession => write!(f, "No session is live on this orchestrator"),
            SessionError::Provider(_) => write!(f, "Provider call failed"),
            SessionError::Persistence(_) => write!(f, "Persisting the session failed"),
        }
    }
}

impl Error for SessionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SessionError::Provider(inner) => Some(inner),
            SessionError::Persistence(inner) => Some(inner),
            _ => None,
        }
    }
}

impl From<ProviderError> for SessionError {
    fn from(err: ProviderError) -> Self {
        SessionError::Provider(err)
    }
}

impl From<PersistenceError> for SessionError {
    fn from(err: PersistenceError) -> Self {
        SessionError::Persistence(err)
    }
}
