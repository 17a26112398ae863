use serde::Serialize;

/// Lifecycle of the single push-channel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failing,
}

/// A topic-addressed payload pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// What a transport session reports back to the channel manager.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Frame(Frame),
    /// The session is no longer usable.
    Failed(String),
    /// Broker-reported problem. Informational only.
    Diagnostic(String),
}
