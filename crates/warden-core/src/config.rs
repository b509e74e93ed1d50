//! Resolved configuration data model.
//!
//! The gateway loads one JSON document describing the server, its callers,
//! and the connector pool. `${VAR}` placeholders inside connector secrets
//! resolve against a precedence chain of caller-scoped `env` first, then the
//! process environment.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

fn default_listen_addr() -> String {
    "127.0.0.1:8743".to_string()
}

fn default_rate_limit() -> u32 {
    60
}

fn default_request_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_method() -> String {
    "GET".to_string()
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Bind address for the HTTP surface.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Directory holding this server's own key bundle.
    pub key_dir: PathBuf,
    /// Per-session request budget per minute.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
    /// Outbound request timeout, seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Outbound connect timeout, seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Authorized callers, keyed by alias.
    #[serde(default)]
    pub callers: BTreeMap<String, CallerConfig>,
    /// Connector pool, keyed by alias. Caller `connections` resolve here
    /// first, then against the built-in templates.
    #[serde(default)]
    pub connectors: BTreeMap<String, RouteConfig>,
}

impl ServerConfig {
    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| GatewayError::Config(format!("parse {}: {e}", path.display())))
    }

    /// Load `server.json` from a config directory.
    pub fn load_from_dir(dir: &Path) -> Result<Self, GatewayError> {
        Self::load(&dir.join("server.json"))
    }
}

/// One authorized caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerConfig {
    /// Human-readable label.
    #[serde(default)]
    pub name: Option<String>,
    /// Directory holding the caller's public key bundle.
    pub peer_key_dir: PathBuf,
    /// Connector aliases this caller may use.
    #[serde(default)]
    pub connections: Vec<String>,
    /// Caller-scoped environment; wins over the process environment when
    /// resolving `${VAR}` placeholders in this caller's routes.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-connection ingestor tweaks.
    #[serde(default)]
    pub ingestor_overrides: HashMap<String, IngestorOverrides>,
}

/// Per-caller adjustments applied to a connector's ingestor before start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestorOverrides {
    /// `false` disables the ingestor for this caller entirely.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Ring-buffer capacity override.
    #[serde(default)]
    pub buffer_size: Option<usize>,
    /// Event-type filter override.
    #[serde(default)]
    pub event_types: Option<Vec<String>>,
}

/// A connector: endpoint allowlist plus the headers and secrets to apply
/// when a request matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    /// Human-readable label.
    #[serde(default)]
    pub name: Option<String>,
    /// What the connector is for.
    #[serde(default)]
    pub description: Option<String>,
    /// API documentation link.
    #[serde(default)]
    pub docs_url: Option<String>,
    /// OpenAPI document link.
    #[serde(default, rename = "openApiUrl")]
    pub openapi_url: Option<String>,
    /// Headers injected into every matching outbound request. Values may
    /// reference `${SECRET}` placeholders.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Named secrets. A value that is exactly `"${VAR}"` resolves from the
    /// environment chain; anything else is a literal.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
    /// Glob patterns: `*` matches within a path segment, `**` across
    /// segments. An empty list matches nothing; allow-all is an explicit
    /// `"**"`.
    #[serde(default)]
    pub allowed_endpoints: Vec<String>,
    /// Substitute `${SECRET}` placeholders in request bodies. Off by
    /// default so an agent cannot exfiltrate a secret by writing it into a
    /// resource the API echoes back.
    #[serde(default)]
    pub resolve_secrets_in_body: bool,
    /// Optional event source attached to this connector.
    #[serde(default)]
    pub ingestor: Option<IngestorConfig>,
}

/// Event-source configuration, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IngestorConfig {
    /// Long-lived WebSocket gateway client.
    Websocket(WebsocketIngestorConfig),
    /// Passive signed-webhook receiver.
    Webhook(WebhookIngestorConfig),
    /// Periodic HTTP poller.
    Poll(PollIngestorConfig),
}

impl IngestorConfig {
    /// Registry key for this configuration: `kind` or `kind:protocol`.
    #[must_use]
    pub fn registry_key(&self) -> String {
        match self {
            IngestorConfig::Websocket(cfg) => format!("websocket:{}", cfg.protocol),
            IngestorConfig::Webhook(cfg) => match &cfg.protocol {
                Some(protocol) => format!("webhook:{protocol}"),
                None => "webhook:generic".to_string(),
            },
            IngestorConfig::Poll(_) => "poll".to_string(),
        }
    }

    /// Ring-buffer capacity requested by this configuration, if any.
    #[must_use]
    pub fn buffer_size(&self) -> Option<usize> {
        match self {
            IngestorConfig::Websocket(cfg) => cfg.buffer_size,
            IngestorConfig::Webhook(cfg) => cfg.buffer_size,
            IngestorConfig::Poll(cfg) => cfg.buffer_size,
        }
    }
}

/// WebSocket ingestor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebsocketIngestorConfig {
    /// Gateway dialect: `discord` or `slack`.
    pub protocol: String,
    /// Gateway URL (Discord-style; Slack fetches its own).
    #[serde(default)]
    pub gateway_url: Option<String>,
    /// Bot token, usually `"${VAR}"`.
    #[serde(default)]
    pub token: Option<String>,
    /// Slack app-level token for `apps.connections.open`.
    #[serde(default)]
    pub app_token: Option<String>,
    /// Discord gateway intents bitfield.
    #[serde(default)]
    pub intents: Option<u64>,
    /// Only buffer these event types (lifecycle events always pass).
    #[serde(default)]
    pub event_types: Option<Vec<String>>,
    /// Payload filter: guild IDs.
    #[serde(default)]
    pub guild_ids: Option<Vec<String>>,
    /// Payload filter: channel IDs.
    #[serde(default)]
    pub channel_ids: Option<Vec<String>>,
    /// Payload filter: user IDs.
    #[serde(default)]
    pub user_ids: Option<Vec<String>>,
    /// Ring-buffer capacity.
    #[serde(default)]
    pub buffer_size: Option<usize>,
}

/// Webhook ingestor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookIngestorConfig {
    /// Signature dialect: `github`, `stripe`, `trello`; absent means the
    /// unverified generic receiver.
    #[serde(default)]
    pub protocol: Option<String>,
    /// Path under `/webhooks/` this ingestor listens on.
    pub path: String,
    /// Shared signing secret, usually `"${VAR}"`. Leaving both this and the
    /// provider signature header unset skips verification (localhost dev).
    #[serde(default)]
    pub secret: Option<String>,
    /// Trello only: the callback URL the webhook was registered with; part
    /// of its signature base.
    #[serde(default)]
    pub callback_url: Option<String>,
    /// Only buffer these event types.
    #[serde(default)]
    pub event_types: Option<Vec<String>>,
    /// Generic receiver: dot-separated body path for the event type.
    #[serde(default)]
    pub event_type_path: Option<String>,
    /// Ring-buffer capacity.
    #[serde(default)]
    pub buffer_size: Option<usize>,
    /// Multi-instance discrimination (one ingestor per entry when present).
    #[serde(default)]
    pub instances: Vec<IngestorInstance>,
}

/// One instance of a multi-instance webhook ingestor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestorInstance {
    /// Instance identifier; becomes part of the manager key and of event
    /// metadata.
    pub id: String,
    /// Content filter deciding which payloads belong to this instance
    /// (e.g. `{"repository": "org/repo"}` or `{"boardId": "..."}`).
    #[serde(default)]
    pub filter: Option<serde_json::Value>,
}

/// Poll ingestor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollIngestorConfig {
    /// Endpoint to poll; may contain `${SECRET}` placeholders.
    pub url: String,
    /// Poll cadence; values under 5000 ms are raised to 5000 ms.
    pub interval_ms: u64,
    /// HTTP method.
    #[serde(default = "default_method")]
    pub method: String,
    /// Request body (ignored for GET).
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    /// Extra headers layered over the route's headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Dot-separated path to the array of items in the response.
    #[serde(default)]
    pub response_path: Option<String>,
    /// Event type stamped on each item.
    #[serde(default)]
    pub event_type: Option<String>,
    /// Item field used for deduplication across polls.
    #[serde(default)]
    pub deduplicate_by: Option<String>,
    /// Ring-buffer capacity.
    #[serde(default)]
    pub buffer_size: Option<usize>,
}

/// Look a variable up in the caller environment, then the process
/// environment.
#[must_use]
pub fn env_lookup(name: &str, caller_env: &HashMap<String, String>) -> Option<String> {
    caller_env
        .get(name)
        .cloned()
        .or_else(|| std::env::var(name).ok())
}
