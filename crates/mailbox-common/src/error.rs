//! Error types for the mailbox service
//!
//! One error enum shared by every mailbox crate, following the same
//! "one enum wraps the failure domains" approach as other services in
//! this workspace.

use thiserror::Error;

/// Errors surfaced by the mailbox runtime.
#[derive(Debug, Error)]
pub enum MailboxError {
    /// The log server could not be reached.
    #[error("failed to connect to log server: {0}")]
    Connect(#[source] redis::RedisError),

    /// The log server rejected our credentials.
    #[error("log server authentication failed: {0}")]
    Auth(#[source] redis::RedisError),

    /// A stream operation (XADD, XREADGROUP, XACK, ...) failed mid-flight.
    #[error("log server I/O error: {0}")]
    Io(#[source] redis::RedisError),

    /// Payload JSON could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[source] serde_json::Error),

    /// Configuration was invalid or incomplete.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for MailboxError {
    fn from(err: serde_json::Error) -> Self {
        MailboxError::Codec(err)
    }
}

/// Result type alias for mailbox operations.
pub type Result<T> = std::result::Result<T, MailboxError>;

/// Classify a raw Redis error into connect vs. auth vs. generic I/O.
///
/// Prefers the structured `ErrorKind` the client library reports;
/// `AuthenticationFailed` maps to `Auth`, everything else that looks
/// like a transport failure (`IoError`) maps to `Connect` for errors
/// raised while opening a connection, or `Io` for errors raised
/// mid-stream. Callers choose which of `Connect`/`Io` applies based on
/// where in the call sequence the error occurred.
pub fn classify_connect_error(err: redis::RedisError) -> MailboxError {
    if err.kind() == redis::ErrorKind::AuthenticationFailed {
        MailboxError::Auth(err)
    } else {
        MailboxError::Connect(err)
    }
}

/// True if a Redis error is the `BUSYGROUP` extension error, meaning a
/// consumer group with the requested name already exists.
///
/// The `redis` crate reports this as `ErrorKind::ExtensionError`; the
/// specific Redis error code is only available via `Display`, so a
/// substring check on the code prefix is the correct fallback here
/// (there is no finer-grained `ErrorKind` to distinguish it from other
/// extension errors).
pub fn is_busygroup(err: &redis::RedisError) -> bool {
    err.code() == Some("BUSYGROUP") || err.to_string().contains("BUSYGROUP")
}

/// True if a Redis error is the `NOGROUP` extension error, meaning the
/// consumer group (or stream) does not exist yet.
pub fn is_nogroup(err: &redis::RedisError) -> bool {
    err.code() == Some("NOGROUP") || err.to_string().contains("NOGROUP")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_is_stable() {
        let err = MailboxError::Config("missing REDIS_HOST".to_string());
        assert_eq!(err.to_string(), "configuration error: missing REDIS_HOST");
    }
}
