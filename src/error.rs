use std::fmt;

/// Crate-wide error type. Kinds are typed so that the retry policy and the
/// scheduler can classify failures without matching on message strings; the
/// substring fallback in [`BackupError::is_retryable`] exists only for
/// foreign errors surfaced by the HTTP client.
#[derive(Debug)]
pub enum BackupError {
    /// Schema or cross-field configuration violation. Fatal at load and at
    /// pre-flight; the payload is the formatted validation report.
    ConfigInvalid(String),
    InvalidAuth(String),
    InvalidTls(String),
    NotFound(String),
    ExecFailure(String),
    ClusterUnhealthy(String),
    /// The circuit breaker rejected the call without invoking the executor.
    BreakerOpen(String),
    Timeout(String),
    Cancelled,
    /// Transient failure, safe to retry.
    Retryable(String),
    /// Terminal failure, retrying will not help.
    NonRetryable(String),
    /// Foreign error from the HTTP client; retryability decided by the
    /// substring fallback.
    Api(reqwest::Error),
    Internal(String),
}

/// Message substrings that mark a foreign error as transient.
const RETRYABLE_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "timeout",
    "temporary failure",
    "network unreachable",
    "service unavailable",
    "gateway timeout",
    "too many requests",
    "rate limit",
];

impl BackupError {
    /// Default retryable-error predicate used by the retry policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackupError::Retryable(_) | BackupError::Timeout(_) => true,
            BackupError::Api(e) => {
                if e.is_timeout() || e.is_connect() {
                    return true;
                }
                if let Some(status) = e.status() {
                    return matches!(status.as_u16(), 429 | 502 | 503 | 504);
                }
                let msg = e.to_string().to_lowercase();
                RETRYABLE_PATTERNS.iter().any(|p| msg.contains(p))
            }
            BackupError::BreakerOpen(_)
            | BackupError::Cancelled
            | BackupError::ConfigInvalid(_)
            | BackupError::InvalidAuth(_)
            | BackupError::InvalidTls(_)
            | BackupError::NotFound(_)
            | BackupError::ExecFailure(_)
            | BackupError::ClusterUnhealthy(_)
            | BackupError::NonRetryable(_)
            | BackupError::Internal(_) => false,
        }
    }

    /// Classify a free-form message from an external source into a typed
    /// transient/terminal kind.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p)) {
            BackupError::Retryable(message)
        } else {
            BackupError::NonRetryable(message)
        }
    }
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupError::ConfigInvalid(report) => write!(f, "configuration invalid: {}", report),
            BackupError::InvalidAuth(msg) => write!(f, "invalid auth: {}", msg),
            BackupError::InvalidTls(msg) => write!(f, "invalid TLS: {}", msg),
            BackupError::NotFound(msg) => write!(f, "not found: {}", msg),
            BackupError::ExecFailure(msg) => write!(f, "exec credential failure: {}", msg),
            BackupError::ClusterUnhealthy(name) => write!(f, "cluster unhealthy: {}", name),
            BackupError::BreakerOpen(name) => write!(f, "circuit breaker open: {}", name),
            BackupError::Timeout(msg) => write!(f, "timeout: {}", msg),
            BackupError::Cancelled => write!(f, "cancelled"),
            BackupError::Retryable(msg) => write!(f, "transient failure: {}", msg),
            BackupError::NonRetryable(msg) => write!(f, "terminal failure: {}", msg),
            BackupError::Api(e) => write!(f, "api error: {}", e),
            BackupError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for BackupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackupError::Api(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for BackupError {
    fn from(e: reqwest::Error) -> Self {
        BackupError::Api(e)
    }
}
