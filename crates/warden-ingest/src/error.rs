//! Ingestor error types.

use thiserror::Error;

/// Errors raised while constructing or driving ingestors.
#[derive(Debug, Error)]
pub enum IngestError {
    /// No factory registered for the requested kind/protocol.
    #[error("no ingestor registered for {0:?}")]
    UnknownKind(String),

    /// Configuration field or secret required by this ingestor is missing.
    #[error("missing ingestor configuration: {0}")]
    MissingConfig(String),

    /// WebSocket-level failure.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Outbound HTTP failure (URL fetch, poll request).
    #[error("http error: {0}")]
    Http(String),

    /// Upstream response could not be interpreted.
    #[error("bad upstream response: {0}")]
    BadResponse(String),
}
