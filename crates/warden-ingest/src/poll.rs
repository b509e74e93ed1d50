//! Periodic HTTP poll ingestor.
//!
//! Polls a configured endpoint on an interval (never under five seconds),
//! extracts an item array from the response, deduplicates by a configured
//! field, and buffers each fresh item. Consecutive failures back the state
//! off to `reconnecting`; ten in a row are terminal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};
use warden_core::config::{IngestorConfig, PollIngestorConfig};
use warden_core::route::resolve_placeholders;

use crate::base::{DedupSet, Ingestor, IngestorCore, IngestorState};
use crate::error::IngestError;
use crate::registry::SpawnContext;

/// Floor on the poll interval, whatever the config says.
pub const MIN_POLL_INTERVAL_MS: u64 = 5_000;

/// Consecutive failures before the terminal error state.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

struct PollShared {
    config: PollIngestorConfig,
    secrets: HashMap<String, String>,
    route_headers: HashMap<String, String>,
    shutdown: watch::Sender<bool>,
}

/// HTTP poll ingestor.
pub struct PollIngestor {
    core: Arc<IngestorCore>,
    shared: Arc<PollShared>,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Factory registered under `poll`.
pub(crate) fn spawn(ctx: SpawnContext) -> Result<Arc<dyn Ingestor>, IngestError> {
    let IngestorConfig::Poll(config) = ctx.config else {
        return Err(IngestError::MissingConfig("poll config expected".into()));
    };

    let core = IngestorCore::new(&ctx.connection_alias, ctx.instance_id, "poll", ctx.buffer_size);
    let (shutdown, _) = watch::channel(false);
    Ok(Arc::new(PollIngestor {
        core,
        shared: Arc::new(PollShared {
            config,
            secrets: ctx.secrets,
            route_headers: ctx.route_headers,
            shutdown,
        }),
        task: parking_lot::Mutex::new(None),
    }))
}

#[async_trait]
impl Ingestor for PollIngestor {
    fn core(&self) -> &IngestorCore {
        &self.core
    }

    async fn start(&self) -> Result<(), IngestError> {
        self.core.set_state(IngestorState::Starting);
        let core = Arc::clone(&self.core);
        let shared = Arc::clone(&self.shared);
        *self.task.lock() = Some(tokio::spawn(run_loop(core, shared)));
        Ok(())
    }

    async fn stop(&self) {
        self.core.set_state(IngestorState::Stopped);
        let _ = self.shared.shutdown.send(true);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

async fn run_loop(core: Arc<IngestorCore>, shared: Arc<PollShared>) {
    let mut shutdown_rx = shared.shutdown.subscribe();
    let interval = Duration::from_millis(shared.config.interval_ms.max(MIN_POLL_INTERVAL_MS));
    let client = reqwest::Client::new();
    let mut seen = DedupSet::new(1024);
    let mut consecutive_errors: u32 = 0;

    // The first poll fires on start; subsequent polls on the timer.
    loop {
        if *shutdown_rx.borrow() || core.state() == IngestorState::Stopped {
            break;
        }

        match poll_once(&core, &shared, &client, &mut seen).await {
            Ok(items) => {
                consecutive_errors = 0;
                core.set_state(IngestorState::Connected);
                debug!(connection = core.connection_alias(), items, "poll completed");
            }
            Err(reason) => {
                consecutive_errors += 1;
                warn!(
                    connection = core.connection_alias(),
                    consecutive_errors,
                    reason = reason.as_str(),
                    "poll failed"
                );
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    core.fail(format!("poll failed {consecutive_errors} times: {reason}"));
                    break;
                }
                core.set_state(IngestorState::Reconnecting);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => break,
        }
    }
}

async fn poll_once(
    core: &Arc<IngestorCore>,
    shared: &Arc<PollShared>,
    client: &reqwest::Client,
    seen: &mut DedupSet,
) -> Result<usize, String> {
    let config = &shared.config;
    let url = resolve_placeholders(&config.url, &shared.secrets);

    let method: reqwest::Method = config
        .method
        .to_ascii_uppercase()
        .parse()
        .map_err(|_| format!("invalid method {:?}", config.method))?;
    let is_get = method == reqwest::Method::GET;

    let mut request = client.request(method, &url);
    // Route headers first, poll-specific headers on top.
    for (key, value) in &shared.route_headers {
        request = request.header(key.as_str(), resolve_placeholders(value, &shared.secrets));
    }
    for (key, value) in &config.headers {
        request = request.header(key.as_str(), resolve_placeholders(value, &shared.secrets));
    }
    if !is_get {
        if let Some(body) = &config.body {
            let rendered =
                resolve_placeholders(&body.to_string(), &shared.secrets);
            request = request
                .header("Content-Type", "application/json")
                .body(rendered);
        }
    }

    let response = request.send().await.map_err(|e| format!("request failed: {e}"))?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("upstream returned {status}"));
    }
    let parsed: Value = response
        .json()
        .await
        .map_err(|e| format!("response not JSON: {e}"))?;

    let items: Vec<Value> = match &config.response_path {
        Some(path) => {
            let node = crate::webhook::walk_path(&parsed, path)
                .ok_or_else(|| format!("response path {path:?} not found"))?;
            node.as_array()
                .ok_or_else(|| format!("response path {path:?} is not an array"))?
                .clone()
        }
        None => match parsed {
            Value::Array(items) => items,
            other => vec![other],
        },
    };

    let event_type = config.event_type.as_deref().unwrap_or("poll");
    let mut pushed = 0;
    for item in items {
        if let Some(field) = &config.deduplicate_by {
            // Items missing the field pass through (fail-open).
            if let Some(value) = item.get(field) {
                let key = value.to_string();
                if !seen.insert(&key) {
                    continue;
                }
            }
        }
        if core.push_event(event_type, item, None) {
            pushed += 1;
        }
    }
    Ok(pushed)
}
