//! Error types for the sync engine.

use std::fmt;

use thiserror::Error;

/// Classification of a failed API call, derived from the HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// The request never produced a response (DNS, connect, timeout).
    Network,
    /// 400 or 422.
    BadRequest,
    /// 401.
    Unauthorized,
    /// 403.
    Forbidden,
    /// 404.
    NotFound,
    /// 409.
    Conflict,
    /// 429.
    RateLimited,
    /// Any 5xx.
    Server,
    /// The response body could not be decoded into the expected shape.
    Decode,
    /// Any other non-success status.
    Unexpected,
}

impl ApiErrorKind {
    /// Classify a non-success HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 422 => Self::BadRequest,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            409 => Self::Conflict,
            429 => Self::RateLimited,
            500..=599 => Self::Server,
            _ => Self::Unexpected,
        }
    }

    /// Whether retrying the same request later could succeed.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Network | Self::RateLimited | Self::Server)
    }
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::BadRequest => "bad request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::RateLimited => "rate limited",
            Self::Server => "server",
            Self::Decode => "decode",
            Self::Unexpected => "unexpected status",
        };
        f.write_str(name)
    }
}

/// A rejected request/response call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error{}{}", status.map(|s| format!(" ({})", s)).unwrap_or_default(), message.as_ref().map(|m| format!(": {}", m)).unwrap_or_default())]
pub struct ApiError {
    /// Status-derived classification.
    pub kind: ApiErrorKind,
    /// HTTP status, when a response was received.
    pub status: Option<u16>,
    /// Human-readable message from the server, if it sent one.
    pub message: Option<String>,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind) -> Self {
        Self {
            kind,
            status: None,
            message: None,
        }
    }

    /// Build an error from a non-success status and optional server message.
    pub fn from_status(status: u16, message: Option<String>) -> Self {
        Self {
            kind: ApiErrorKind::from_status(status),
            status: Some(status),
            message,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Network).with_message(message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Decode).with_message(message)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::decode(err.to_string());
        }
        match err.status() {
            Some(status) => Self::from_status(status.as_u16(), Some(err.to_string())),
            None => Self::network(err.to_string()),
        }
    }
}

/// Errors produced by the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A request/response call was rejected.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The push channel could not be opened.
    #[error("event stream connect failed: {0}")]
    Connect(String),

    /// The push channel dropped after it was open.
    #[error("event stream dropped: {0}")]
    StreamDropped(String),

    /// A push message could not be parsed.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// The task running a mutation was torn down before it settled.
    #[error("mutation task aborted before settling")]
    MutationAborted,

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

impl SyncError {
    /// Whether the same operation could succeed if tried again later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api(e) => e.kind.is_transient(),
            Self::Connect(_) | Self::StreamDropped(_) => true,
            Self::MalformedEvent(_) | Self::MutationAborted | Self::Config(_) => false,
        }
    }
}
