//! Slack-style socket mode client.
//!
//! Socket-mode WebSocket URLs are single-use: every connection starts with
//! an authenticated POST to `apps.connections.open`, and every reconnect
//! re-fetches. Envelopes must be acknowledged by `envelope_id` before the
//! event is buffered; the `disconnect` envelope's reason decides between a
//! fresh reconnect and the terminal error state.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use warden_core::config::IngestorConfig;
use warden_core::route::resolve_placeholders;

use super::{reconnect_delay, Drive, MAX_RECONNECT_ATTEMPTS};
use crate::base::{Ingestor, IngestorCore, IngestorState};
use crate::error::IngestError;
use crate::registry::SpawnContext;

const CONNECTIONS_OPEN_URL: &str = "https://slack.com/api/apps.connections.open";

#[derive(Debug, Deserialize)]
struct ConnectionsOpenResponse {
    ok: bool,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    envelope_id: Option<String>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum DisconnectAction {
    ReconnectFresh,
    Fatal,
}

/// Disconnect-reason policy: rotation requests reconnect with a clean
/// attempt counter; a disabled socket-mode link is unrecoverable.
fn disconnect_action(reason: Option<&str>) -> DisconnectAction {
    match reason {
        Some("link_disabled") => DisconnectAction::Fatal,
        // refresh_requested, warning, or anything else: rotate the URL.
        _ => DisconnectAction::ReconnectFresh,
    }
}

struct SlackShared {
    app_token: String,
    connections_open_url: String,
    event_types: Option<Vec<String>>,
    shutdown: watch::Sender<bool>,
}

/// Slack socket-mode ingestor.
pub struct SlackIngestor {
    core: Arc<IngestorCore>,
    shared: Arc<SlackShared>,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Factory registered under `websocket:slack`.
pub(crate) fn spawn(ctx: SpawnContext) -> Result<Arc<dyn Ingestor>, IngestError> {
    let IngestorConfig::Websocket(config) = ctx.config else {
        return Err(IngestError::MissingConfig("websocket config expected".into()));
    };
    // The app-level token is mandatory: without it the URL fetch can never
    // succeed and the ingestor would only ever error.
    let app_token = config
        .app_token
        .as_ref()
        .map(|t| resolve_placeholders(t, &ctx.secrets))
        .filter(|t| !t.is_empty() && !t.starts_with("${"))
        .ok_or_else(|| IngestError::MissingConfig("appToken".into()))?;
    // gateway_url doubles as an endpoint override for tests and proxies.
    let connections_open_url = config
        .gateway_url
        .clone()
        .unwrap_or_else(|| CONNECTIONS_OPEN_URL.to_string());

    let core = IngestorCore::new(
        &ctx.connection_alias,
        ctx.instance_id,
        "websocket:slack",
        ctx.buffer_size,
    );
    let (shutdown, _) = watch::channel(false);
    Ok(Arc::new(SlackIngestor {
        core,
        shared: Arc::new(SlackShared {
            app_token,
            connections_open_url,
            event_types: config.event_types,
            shutdown,
        }),
        task: parking_lot::Mutex::new(None),
    }))
}

#[async_trait]
impl Ingestor for SlackIngestor {
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

async fn fetch_socket_url(shared: &SlackShared) -> Result<String, String> {
    let client = reqwest::Client::new();
    let response = client
        .post(&shared.connections_open_url)
        .bearer_auth(&shared.app_token)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .send()
        .await
        .map_err(|e| format!("connections.open request failed: {e}"))?;
    let body: ConnectionsOpenResponse = response
        .json()
        .await
        .map_err(|e| format!("connections.open response invalid: {e}"))?;
    if !body.ok {
        return Err(format!(
            "connections.open rejected: {}",
            body.error.unwrap_or_else(|| "unknown error".into())
        ));
    }
    body.url
        .ok_or_else(|| "connections.open returned no url".into())
}

async fn run_loop(core: Arc<IngestorCore>, shared: Arc<SlackShared>) {
    let mut shutdown_rx = shared.shutdown.subscribe();
    let mut attempts: u32 = 0;

    loop {
        if *shutdown_rx.borrow() || core.state() == IngestorState::Stopped {
            break;
        }

        let drive = match fetch_socket_url(&shared).await {
            Ok(url) => connect_and_drive(&core, &shared, &url, &mut shutdown_rx).await,
            Err(reason) => {
                warn!(connection = core.connection_alias(), reason = reason.as_str(), "socket URL fetch failed");
                Drive::Reconnect {
                    clear_session: false,
                    reset_attempts: false,
                }
            }
        };

        match drive {
            Drive::Stopped => break,
            Drive::Fatal(reason) => {
                core.fail(reason);
                break;
            }
            Drive::Reconnect { reset_attempts, .. } => {
                if reset_attempts {
                    attempts = 0;
                }
                attempts += 1;
                if attempts >= MAX_RECONNECT_ATTEMPTS {
                    core.fail("reconnect attempts exhausted");
                    break;
                }
                if core.state() == IngestorState::Stopped {
                    break;
                }
                core.set_state(IngestorState::Reconnecting);
                tokio::select! {
                    _ = tokio::time::sleep(reconnect_delay(attempts)) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
        }
    }
}

async fn connect_and_drive(
    core: &Arc<IngestorCore>,
    shared: &Arc<SlackShared>,
    url: &str,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Drive {
    let stream = match connect_async(url).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!(connection = core.connection_alias(), error = %e, "socket mode connect failed");
            return Drive::Reconnect {
                clear_session: false,
                reset_attempts: false,
            };
        }
    };
    let (mut sink, mut stream) = stream.split();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return Drive::Stopped;
            }
            message = stream.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        warn!(connection = core.connection_alias(), error = %e, "socket mode read error");
                        return Drive::Reconnect { clear_session: false, reset_attempts: false };
                    }
                    None => return Drive::Reconnect { clear_session: false, reset_attempts: false },
                };
                match message {
                    Message::Text(text) => {
                        let Ok(envelope) = serde_json::from_str::<Envelope>(&text) else {
                            debug!(connection = core.connection_alias(), "unparseable envelope");
                            continue;
                        };
                        match envelope.kind.as_str() {
                            "hello" => {
                                core.set_state(IngestorState::Connected);
                                info!(connection = core.connection_alias(), "socket mode connected");
                                // A successful hello makes this connection healthy.
                            }
                            "disconnect" => {
                                info!(
                                    connection = core.connection_alias(),
                                    reason = envelope.reason.as_deref().unwrap_or("none"),
                                    "socket mode disconnect requested"
                                );
                                return match disconnect_action(envelope.reason.as_deref()) {
                                    DisconnectAction::Fatal => {
                                        Drive::Fatal("socket mode link disabled".into())
                                    }
                                    DisconnectAction::ReconnectFresh => Drive::Reconnect {
                                        clear_session: false,
                                        reset_attempts: true,
                                    },
                                };
                            }
                            kind => {
                                // events_api, slash_commands, interactive, …
                                let Some(envelope_id) = envelope.envelope_id else {
                                    debug!(connection = core.connection_alias(), kind, "envelope without id ignored");
                                    continue;
                                };
                                // ACK before buffering; prompt acknowledgement
                                // is part of the socket-mode contract.
                                let ack = json!({"envelope_id": envelope_id}).to_string();
                                if sink.send(Message::Text(ack)).await.is_err() {
                                    return Drive::Reconnect { clear_session: false, reset_attempts: false };
                                }
                                if let Some(wanted) = shared.event_types.as_ref().filter(|w| !w.is_empty()) {
                                    if !wanted.iter().any(|w| w == kind) {
                                        continue;
                                    }
                                }
                                let key = format!("slack:{}:{envelope_id}", core.connection_alias());
                                core.push_event(kind, envelope.payload, Some(key));
                            }
                        }
                    }
                    Message::Ping(data) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Message::Close(_) => {
                        return Drive::Reconnect { clear_session: false, reset_attempts: false };
                    }
                    _ => {}
                }
            }
        }
    }
}
