//! Gateway error taxonomy.
//!
//! Once a session is established, every error travels back to the client
//! through the encrypted channel as a `proxy_response { success: false }`;
//! the plaintext HTTP surface only speaks 401 (unknown session), 403
//! (handshake/webhook rejection), and 429 (rate limit).

use thiserror::Error;
use warden_crypto::CryptoError;

/// Errors produced by the gateway request pipeline.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Handshake-level rejection; clients see a generic message.
    #[error("handshake failed")]
    Unauthorized,

    /// `/request` named a session we do not hold.
    #[error("unknown session")]
    SessionGone,

    /// Fixed-window limit exceeded for this session.
    #[error("rate limit exceeded")]
    RateLimited,

    /// Decrypt failure or anti-replay trip inside an established session.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// URL matched no route, or failed the allowlist after substitution.
    #[error("Endpoint not allowed")]
    RouteDenied,

    /// Client tried to override a route-injected header.
    #[error("Header conflict: client may not override route header {0:?}")]
    HeaderConflict(String),

    /// Tool name not in the dispatch table.
    #[error("unknown tool {0:?}")]
    UnknownTool(String),

    /// Outbound fetch failed.
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// Envelope or tool input failed to parse.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration could not be loaded or resolved.
    #[error("config error: {0}")]
    Config(String),
}
