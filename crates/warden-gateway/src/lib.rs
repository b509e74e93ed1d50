//! # Warden Gateway
//!
//! The remote half of the secrets-isolation gateway: terminates the
//! encrypted channel, resolves per-caller routes, performs outbound HTTP
//! calls with injected credentials, receives signed webhooks, and serves
//! buffered events back through the `poll_events` tool.
//!
//! The HTTP surface is deliberately small: `/handshake/init`,
//! `/handshake/finish`, `/request` (opaque encrypted frames),
//! `/webhooks/{path}`, and `/health`. Everything that happens after a
//! session is established, errors included, travels through the channel.

#![warn(clippy::all)]

pub mod http;
pub mod pipeline;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;
use warden_core::config::ServerConfig;
use warden_core::route::{resolve_routes_for_caller, ResolvedRoute};
use warden_core::session::SessionManager;
use warden_core::templates::builtin_templates;
use warden_core::GatewayError;
use warden_crypto::handshake::AuthorizedPeer;
use warden_crypto::{keystore, KeyBundle};
use warden_ingest::{IngestorManager, IngestorRegistry};

/// Shared gateway state behind every handler.
pub struct Gateway {
    /// Loaded configuration.
    pub config: ServerConfig,
    pub(crate) key_bundle: KeyBundle,
    pub(crate) peers: Vec<AuthorizedPeer>,
    pub(crate) caller_routes: HashMap<String, Vec<ResolvedRoute>>,
    /// Session and pending-handshake tables.
    pub sessions: Arc<SessionManager>,
    /// All live ingestors.
    pub ingestors: Arc<IngestorManager>,
    pub(crate) http: reqwest::Client,
    pub(crate) started_at: Instant,
}

impl Gateway {
    /// Assemble a gateway from pre-loaded parts (tests construct peers and
    /// keys directly).
    pub fn new(
        config: ServerConfig,
        key_bundle: KeyBundle,
        peers: Vec<AuthorizedPeer>,
    ) -> Result<Self, GatewayError> {
        let templates = builtin_templates();
        let mut caller_routes = HashMap::with_capacity(config.callers.len());
        for (alias, caller) in &config.callers {
            let routes = resolve_routes_for_caller(caller, &config.connectors, &templates)?;
            info!(
                caller = alias.as_str(),
                routes = routes.len(),
                "resolved caller routes"
            );
            caller_routes.insert(alias.clone(), routes);
        }

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| GatewayError::Config(format!("http client: {e}")))?;

        let sessions = Arc::new(SessionManager::new(config.rate_limit_per_minute));
        let ingestors = Arc::new(IngestorManager::new(IngestorRegistry::with_builtin()));

        Ok(Self {
            config,
            key_bundle,
            peers,
            caller_routes,
            sessions,
            ingestors,
            http,
            started_at: Instant::now(),
        })
    }

    /// Load keys and peers from disk per the configuration, then assemble.
    pub fn from_config(config: ServerConfig) -> Result<Self, GatewayError> {
        let key_bundle = keystore::load_bundle(&config.key_dir)
            .map_err(|e| GatewayError::Config(format!("server keys: {e}")))?;

        let mut peers = Vec::with_capacity(config.callers.len());
        for (alias, caller) in &config.callers {
            let keys = keystore::load_public_bundle(&caller.peer_key_dir)
                .map_err(|e| GatewayError::Config(format!("peer keys for {alias}: {e}")))?;
            info!(
                caller = alias.as_str(),
                fingerprint = keys.fingerprint().as_str(),
                "loaded caller keys"
            );
            peers.push(AuthorizedPeer {
                alias: alias.clone(),
                name: caller.name.clone(),
                keys,
            });
        }

        Self::new(config, key_bundle, peers)
    }

    /// Routes resolved for a caller at startup.
    #[must_use]
    pub fn routes_for(&self, caller_alias: &str) -> Vec<ResolvedRoute> {
        self.caller_routes
            .get(caller_alias)
            .cloned()
            .unwrap_or_default()
    }

    /// Start every configured ingestor.
    pub async fn start_ingestors(&self) {
        self.ingestors
            .start_all(&self.config.callers, &self.caller_routes)
            .await;
    }

    /// Seconds since the gateway came up.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
