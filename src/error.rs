use thiserror::Error;

/// Failure of the push-channel transport. Recoverable: surfaced as a
/// connection-state change, never as a crash.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("failed to dial {addr}: {reason}")]
    Dial { addr: String, reason: String },
    #[error("failed to subscribe to topic `{topic}`: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("channel session is closed")]
    Closed,
}

/// An inbound frame whose payload could not be decoded.
#[derive(Debug, Error)]
#[error("malformed frame on topic `{topic}`: {source}")]
pub struct DecodeError {
    pub topic: String,
    #[source]
    pub source: serde_json::Error,
}

/// Failure reported by the document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store unavailable: {0}")]
    Unavailable(String),
    #[error("write rejected by document store: {0}")]
    Rejected(String),
    #[error("stored record is malformed: {0}")]
    Corrupt(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("document codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Failure delivering a push notification. Logged, never retried.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("notification endpoint answered with status {0}")]
    Status(u16),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid room key `{0}`")]
    InvalidRoomKey(String),
    #[error("refusing to send an empty message")]
    EmptyMessage,
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
