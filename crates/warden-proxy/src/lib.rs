//! # Warden Proxy
//!
//! The local half of the gateway: a thin encrypt/decrypt shim that turns
//! `(tool_name, input) → result` calls into encrypted `/request` frames.
//! The client caches its channel, and a 401 from the remote transparently
//! tears it down and rehandshakes before retrying; callers never see
//! session turnover.
//!
//! The stdio tool-call transport that drives this client lives outside this
//! crate; everything here is the channel logic.

#![warn(clippy::all)]

use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use warden_crypto::handshake::finish_payload;
use warden_crypto::{CryptoError, EncryptedChannel, HandshakeInitiator, KeyBundle, PublicKeyBundle};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Proxy-side errors.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Handshake or channel crypto failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// HTTP transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote rejected a handshake message.
    #[error("handshake rejected by remote (HTTP {0})")]
    Rejected(u16),

    /// The remote rate-limited this session.
    #[error("rate limited by remote")]
    RateLimited,

    /// The tool ran and reported failure.
    #[error("{0}")]
    Tool(String),

    /// The decrypted response did not have the expected shape.
    #[error("malformed response: {0}")]
    Malformed(String),
}

struct ChannelState {
    session_id: String,
    channel: EncryptedChannel,
}

/// Encrypted tool-call client for one remote gateway.
pub struct ProxyClient {
    remote_url: String,
    local: KeyBundle,
    remote_keys: PublicKeyBundle,
    http: reqwest::Client,
    channel: tokio::sync::Mutex<Option<ChannelState>>,
}

impl ProxyClient {
    /// Create a client for `remote_url` (scheme + host + port, no path).
    pub fn new(
        remote_url: impl Into<String>,
        local: KeyBundle,
        remote_keys: PublicKeyBundle,
    ) -> Result<Self, ProxyError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::Transport(e.to_string()))?;
        Ok(Self {
            remote_url: remote_url.into().trim_end_matches('/').to_string(),
            local,
            remote_keys,
            http,
            channel: tokio::sync::Mutex::new(None),
        })
    }

    /// The remote's key fingerprint, for display during setup.
    #[must_use]
    pub fn remote_fingerprint(&self) -> String {
        self.remote_keys.fingerprint()
    }

    /// Session ID of the cached channel, if any.
    pub async fn session_id(&self) -> Option<String> {
        self.channel
            .lock()
            .await
            .as_ref()
            .map(|state| state.session_id.clone())
    }

    /// Establish a channel now (otherwise the first call does it lazily).
    pub async fn connect(&self) -> Result<String, ProxyError> {
        let mut guard = self.channel.lock().await;
        if guard.is_none() {
            *guard = Some(self.handshake().await?);
        }
        Ok(guard
            .as_ref()
            .map(|state| state.session_id.clone())
            .unwrap_or_default())
    }

    async fn handshake(&self) -> Result<ChannelState, ProxyError> {
        let initiator = HandshakeInitiator::start(&self.local, self.remote_keys)?;

        let response = self
            .http
            .post(format!("{}/handshake/init", self.remote_url))
            .header("Content-Type", "application/json")
            .body(initiator.init_bytes().to_vec())
            .send()
            .await
            .map_err(|e| ProxyError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProxyError::Rejected(response.status().as_u16()));
        }
        let reply_bytes = response
            .bytes()
            .await
            .map_err(|e| ProxyError::Transport(e.to_string()))?;

        let keys = initiator.complete(&reply_bytes)?;
        let session_id = keys.session_id.clone();
        let mut channel = EncryptedChannel::new(&keys);

        let finish_frame = channel.encrypt(&finish_payload())?;
        let response = self
            .http
            .post(format!("{}/handshake/finish", self.remote_url))
            .header("X-Session-Id", &session_id)
            .header("Content-Type", "application/octet-stream")
            .body(finish_frame)
            .send()
            .await
            .map_err(|e| ProxyError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProxyError::Rejected(response.status().as_u16()));
        }

        info!(session_id = session_id.as_str(), "channel established");
        Ok(ChannelState {
            session_id,
            channel,
        })
    }

    /// Invoke a tool on the remote, rehandshaking once if the session is
    /// gone.
    pub async fn call(&self, tool_name: &str, tool_input: Value) -> Result<Value, ProxyError> {
        let envelope = json!({
            "type": "proxy_request",
            "id": uuid::Uuid::new_v4().to_string(),
            "toolName": tool_name,
            "toolInput": tool_input,
            "timestamp": now_ms(),
        });
        let response = self.exchange(&envelope).await?;

        match response.get("success").and_then(Value::as_bool) {
            Some(true) => Ok(response.get("result").cloned().unwrap_or(Value::Null)),
            Some(false) => Err(ProxyError::Tool(
                response
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            )),
            None => Err(ProxyError::Malformed("missing success flag".into())),
        }
    }

    /// Keepalive round-trip; returns the remote's timestamp.
    pub async fn ping(&self) -> Result<u64, ProxyError> {
        let response = self
            .exchange(&json!({"type": "ping", "timestamp": now_ms()}))
            .await?;
        response
            .get("timestamp")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProxyError::Malformed("pong without timestamp".into()))
    }

    /// Encrypt, POST, decrypt, rehandshaking once on a 401.
    async fn exchange(&self, envelope: &Value) -> Result<Value, ProxyError> {
        let mut guard = self.channel.lock().await;

        for attempt in 0..2 {
            if guard.is_none() {
                *guard = Some(self.handshake().await?);
            }
            let (frame, session_id) = {
                let state = guard.as_mut().ok_or_else(|| {
                    ProxyError::Transport("channel unavailable after handshake".into())
                })?;
                (
                    state.channel.encrypt(envelope.to_string().as_bytes())?,
                    state.session_id.clone(),
                )
            };

            let response = self
                .http
                .post(format!("{}/request", self.remote_url))
                .header("X-Session-Id", &session_id)
                .header("Content-Type", "application/octet-stream")
                .body(frame)
                .send()
                .await
                .map_err(|e| ProxyError::Transport(e.to_string()))?;

            match response.status().as_u16() {
                401 if attempt == 0 => {
                    // Session expired or destroyed server-side: drop the
                    // cached channel and handshake again, invisibly to the
                    // caller.
                    debug!("session gone, rehandshaking");
                    *guard = None;
                    continue;
                }
                401 => return Err(ProxyError::Rejected(401)),
                429 => return Err(ProxyError::RateLimited),
                status if status != 200 => {
                    // The channel may be dead (e.g. the remote destroyed the
                    // session after a framing failure).
                    warn!(status, "request failed, dropping channel");
                    *guard = None;
                    return Err(ProxyError::Transport(format!("HTTP {status}")));
                }
                _ => {}
            }

            let body = response
                .bytes()
                .await
                .map_err(|e| ProxyError::Transport(e.to_string()))?;
            let state = guard.as_mut().ok_or_else(|| {
                ProxyError::Transport("channel dropped mid-exchange".into())
            })?;
            let plaintext = state.channel.decrypt(&body)?;
            return serde_json::from_slice(&plaintext)
                .map_err(|e| ProxyError::Malformed(e.to_string()));
        }

        Err(ProxyError::Transport("rehandshake loop exhausted".into()))
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
