//! Error types across the client: configuration, auth, transport,
//! protocol, and room-level failures.

use thiserror::Error;

/// Documentation page referenced by configuration errors.
pub const SETUP_DOCS_URL: &str = "https://docs.huddle.dev/setup";

/// Invalid client construction. Raised synchronously by
/// [`crate::Client::new`] and [`crate::Client::enter`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("throttle should be a number between 80 and 1000.")]
    InvalidThrottle,

    #[error(
        "invalid auth configuration: provide exactly one of `public_api_key` or \
         `auth_endpoint`; see {SETUP_DOCS_URL}"
    )]
    MissingOrAmbiguousAuth,

    #[error("room id must be a non-empty string; see {SETUP_DOCS_URL}")]
    EmptyRoomId,

    #[error("invalid server base URL {url:?}: {reason}")]
    InvalidServerUrl { url: String, reason: String },
}

/// Token acquisition failures. Permanent failures move the room to
/// `Failed`; transient ones are retried with backoff.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("authentication forbidden (status {0})")]
    Forbidden(u16),

    #[error("malformed session token: {0}")]
    MalformedToken(String),

    #[error("auth endpoint returned status {0}")]
    Status(u16),

    #[error("auth endpoint returned an invalid body: {0}")]
    InvalidResponse(String),

    #[error("auth request failed: {0}")]
    Network(String),
}

impl AuthError {
    /// Permanent failures are not retried (HTTP 401/403 semantics and
    /// tokens the client cannot parse).
    pub fn is_permanent(&self) -> bool {
        matches!(self, AuthError::Forbidden(_) | AuthError::MalformedToken(_))
    }
}

/// HTTP fetch failure from the injected [`crate::auth::Fetcher`].
#[derive(Debug, Clone, Error)]
#[error("network error: {0}")]
pub struct FetchError(pub String);

/// WebSocket connect failure from the injected
/// [`crate::transport::Connector`].
#[derive(Debug, Clone, Error)]
#[error("connect failed: {0}")]
pub struct TransportError(pub String);

/// A server frame the client could not make sense of. The frame is
/// dropped; repeated violations inside a window force a reconnect.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown message type {0}")]
    UnknownType(u64),

    #[error("bad storage payload: {0}")]
    Storage(String),
}

/// Errors delivered to room error subscribers.
#[derive(Debug, Clone, Error)]
pub enum RoomError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("too many protocol violations; forcing reconnect")]
    ProtocolViolations,

    #[error("connection failed permanently; call connect() to retry")]
    ConnectionFailed,
}

/// Misuse of the undo/redo API.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HistoryError {
    #[error("history is paused; call resume_history() before undoing")]
    Paused,
}
