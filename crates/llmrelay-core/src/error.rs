//! Error taxonomy and the dispatcher's own error type.
//!
//! `ErrorKind` is what lands in the log's `errorType` column; it is derived
//! from an upstream HTTP status or a transport failure, never constructed
//! directly by translator code (translator failures are folded into
//! `ErrorKind::Unknown` for the purposes of the per-attempt record, since
//! they aren't a vendor-classified failure).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Auth,
    RateLimit,
    Client,
    Server,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network_error",
            ErrorKind::Auth => "auth_error",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Client => "client_error",
            ErrorKind::Server => "server_error",
            ErrorKind::Unknown => "unknown_error",
        }
    }

    /// Classifies an upstream HTTP status into the taxonomy above.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => ErrorKind::Auth,
            429 => ErrorKind::RateLimit,
            400..=499 => ErrorKind::Client,
            500..=599 => ErrorKind::Server,
            _ => ErrorKind::Unknown,
        }
    }

    /// Whether this classification counts as a circuit-breaker failure
    /// (5xx or transport) versus a provider-innocent client error (4xx).
    pub fn is_provider_fault(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Server)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of one upstream attempt, before it's folded into a log
/// record or used to decide fallback.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Success { status: u16 },
    /// Upstream responded with a 4xx: surfaced to the client, no fallback.
    ClientError { status: u16, body: bytes::Bytes },
    /// 5xx or transport failure: circuit breaker records failure, dispatcher
    /// tries the next provider. `status` is the actual upstream HTTP status
    /// when one was received (`None` for transport/translation failures that
    /// never got a response at all), and is what gets logged — not a
    /// hardcoded 502.
    ProviderFailure { kind: ErrorKind, message: String, vendor_code: Option<String>, status: Option<u16> },
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no providers configured for platform {0}")]
    NoProvidersForPlatform(String),

    #[error("model '{requested}' not supported by any of {filtered} configured provider(s)")]
    ModelNotSupported { requested: String, filtered: usize },

    #[error("all {candidates} candidate provider(s) failed ({attempts} attempt(s) total): {last_error}")]
    AllProvidersFailed { candidates: usize, attempts: usize, last_error: String },

    #[error("unknown platform tag: {0}")]
    UnknownPlatform(String),

    #[error("repository error: {0}")]
    Repository(#[from] llmrelay_provider::RepositoryError),

    #[error("gateway dispatch failed: {0}")]
    Gateway(String),
}
