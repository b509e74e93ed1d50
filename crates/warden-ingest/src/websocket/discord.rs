//! Discord-style gateway client.
//!
//! Speaks the opcode protocol: HELLO starts a jittered heartbeat, IDENTIFY
//! or RESUME authenticates, DISPATCH events flow through the configured
//! filters into the ring buffer. Close codes decide between reconnecting
//! (optionally re-identifying) and the terminal error state; reconnects
//! prefer the `resume_gateway_url` announced by READY.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use warden_core::config::{IngestorConfig, WebsocketIngestorConfig};
use warden_core::route::resolve_placeholders;

use super::{reconnect_delay, Drive, INTENTIONAL_CLOSE_CODE, MAX_RECONNECT_ATTEMPTS};
use crate::base::{Ingestor, IngestorCore, IngestorState};
use crate::error::IngestError;
use crate::registry::SpawnContext;

// Gateway opcodes as observed on the wire.
const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_RESUME: u8 = 6;
const OP_RECONNECT: u8 = 7;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;
const OP_HEARTBEAT_ACK: u8 = 11;

/// Lifecycle dispatch types that must never be filtered out.
const LIFECYCLE_EVENTS: &[&str] = &["READY", "RESUMED"];

#[derive(Debug, Serialize, Deserialize)]
struct GatewayPayload {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

/// Session state carried across reconnects.
#[derive(Debug, Default)]
struct ConnState {
    session_id: Option<String>,
    last_seq: Option<u64>,
    resume_gateway_url: Option<String>,
    attempts: u32,
}

#[derive(Debug, PartialEq, Eq)]
enum CloseAction {
    Fatal,
    ClearAndReconnect,
    Reconnect,
}

/// Close-code policy: authentication and intent errors are unrecoverable;
/// stale-session codes re-identify; everything else resumes.
fn close_code_action(code: Option<u16>) -> CloseAction {
    match code {
        Some(4004 | 4010 | 4011 | 4012 | 4013 | 4014) => CloseAction::Fatal,
        Some(4007 | 4009) => CloseAction::ClearAndReconnect,
        _ => CloseAction::Reconnect,
    }
}

fn list_filter_passes(data: &Value, field: &str, allowed: Option<&Vec<String>>) -> bool {
    let Some(allowed) = allowed.filter(|list| !list.is_empty()) else {
        return true;
    };
    // Events without the filtered field pass through; lifecycle events carry
    // none of them.
    match data.get(field).and_then(Value::as_str) {
        Some(value) => allowed.iter().any(|a| a == value),
        None => true,
    }
}

fn passes_filters(config: &WebsocketIngestorConfig, event_type: &str, data: &Value) -> bool {
    if let Some(types) = config.event_types.as_ref().filter(|list| !list.is_empty()) {
        if !LIFECYCLE_EVENTS.contains(&event_type) && !types.iter().any(|t| t == event_type) {
            return false;
        }
    }
    if !list_filter_passes(data, "guild_id", config.guild_ids.as_ref()) {
        return false;
    }
    if !list_filter_passes(data, "channel_id", config.channel_ids.as_ref()) {
        return false;
    }
    if let Some(users) = config.user_ids.as_ref().filter(|list| !list.is_empty()) {
        let user = data
            .pointer("/author/id")
            .or_else(|| data.pointer("/user/id"))
            .and_then(Value::as_str);
        if let Some(user) = user {
            if !users.iter().any(|u| u == user) {
                return false;
            }
        }
    }
    true
}

/// Dedup key preventing re-delivery of a sequence number after a RESUME
/// replay.
fn dispatch_idempotency_key(
    connection: &str,
    session_id: Option<&str>,
    seq: Option<u64>,
) -> Option<String> {
    seq.map(|s| {
        format!(
            "discord:{connection}:{}:seq:{s}",
            session_id.unwrap_or("nosess")
        )
    })
}

struct DiscordShared {
    config: WebsocketIngestorConfig,
    gateway_url: String,
    token: Option<String>,
    shutdown: watch::Sender<bool>,
}

/// Discord-style gateway ingestor.
pub struct DiscordIngestor {
    core: Arc<IngestorCore>,
    shared: Arc<DiscordShared>,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Factory registered under `websocket:discord`.
pub(crate) fn spawn(ctx: SpawnContext) -> Result<Arc<dyn Ingestor>, IngestError> {
    let IngestorConfig::Websocket(config) = ctx.config else {
        return Err(IngestError::MissingConfig("websocket config expected".into()));
    };
    let gateway_url = config
        .gateway_url
        .clone()
        .ok_or_else(|| IngestError::MissingConfig("gatewayUrl".into()))?;
    let token = config
        .token
        .as_ref()
        .map(|t| resolve_placeholders(t, &ctx.secrets));

    let core = IngestorCore::new(
        &ctx.connection_alias,
        ctx.instance_id,
        "websocket:discord",
        ctx.buffer_size,
    );
    let (shutdown, _) = watch::channel(false);
    Ok(Arc::new(DiscordIngestor {
        core,
        shared: Arc::new(DiscordShared {
            config,
            gateway_url,
            token,
            shutdown,
        }),
        task: parking_lot::Mutex::new(None),
    }))
}

#[async_trait]
impl Ingestor for DiscordIngestor {
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
        // Terminal state first: a reconnect timer that wakes up now no-ops.
        self.core.set_state(IngestorState::Stopped);
        let _ = self.shared.shutdown.send(true);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

async fn run_loop(core: Arc<IngestorCore>, shared: Arc<DiscordShared>) {
    let mut shutdown_rx = shared.shutdown.subscribe();
    let mut conn = ConnState::default();

    loop {
        if *shutdown_rx.borrow() || core.state() == IngestorState::Stopped {
            break;
        }
        let url = conn
            .resume_gateway_url
            .clone()
            .unwrap_or_else(|| shared.gateway_url.clone());

        match connect_and_drive(&core, &shared, &mut conn, &url, &mut shutdown_rx).await {
            Drive::Stopped => break,
            Drive::Fatal(reason) => {
                core.fail(reason);
                break;
            }
            Drive::Reconnect {
                clear_session,
                reset_attempts,
            } => {
                if clear_session {
                    conn.session_id = None;
                    conn.last_seq = None;
                    conn.resume_gateway_url = None;
                }
                if reset_attempts {
                    conn.attempts = 0;
                }
                conn.attempts += 1;
                if conn.attempts >= MAX_RECONNECT_ATTEMPTS {
                    core.fail("reconnect attempts exhausted");
                    break;
                }
                if core.state() == IngestorState::Stopped {
                    break;
                }
                core.set_state(IngestorState::Reconnecting);
                let delay = reconnect_delay(conn.attempts);
                debug!(
                    connection = core.connection_alias(),
                    attempt = conn.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "gateway reconnect scheduled"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
        }
    }
}

fn text_payload(payload: &GatewayPayload) -> Message {
    Message::Text(serde_json::to_string(payload).unwrap_or_default())
}

fn heartbeat_message(last_seq: Option<u64>) -> Message {
    text_payload(&GatewayPayload {
        op: OP_HEARTBEAT,
        d: last_seq.map_or(Value::Null, |s| json!(s)),
        s: None,
        t: None,
    })
}

fn identify_message(shared: &DiscordShared) -> Message {
    text_payload(&GatewayPayload {
        op: OP_IDENTIFY,
        d: json!({
            "token": shared.token,
            "intents": shared.config.intents.unwrap_or(0),
            "properties": {"os": "linux", "browser": "warden", "device": "warden"},
        }),
        s: None,
        t: None,
    })
}

fn resume_message(shared: &DiscordShared, session_id: &str, seq: u64) -> Message {
    text_payload(&GatewayPayload {
        op: OP_RESUME,
        d: json!({
            "token": shared.token,
            "session_id": session_id,
            "seq": seq,
        }),
        s: None,
        t: None,
    })
}

fn intentional_close() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(INTENTIONAL_CLOSE_CODE),
        reason: "reconnecting".into(),
    }))
}

async fn connect_and_drive(
    core: &Arc<IngestorCore>,
    shared: &Arc<DiscordShared>,
    conn: &mut ConnState,
    url: &str,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Drive {
    let stream = match connect_async(url).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!(
                connection = core.connection_alias(),
                error = %e,
                "gateway connect failed"
            );
            return Drive::Reconnect {
                clear_session: false,
                reset_attempts: false,
            };
        }
    };
    let (mut sink, mut stream) = stream.split();

    let mut heartbeat: Option<tokio::time::Interval> = None;
    let mut heartbeat_acked = true;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                let _ = sink.send(intentional_close()).await;
                return Drive::Stopped;
            }
            _ = async {
                match heartbeat.as_mut() {
                    Some(timer) => { timer.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                if !heartbeat_acked {
                    // Zombie connection: the previous heartbeat was never
                    // acknowledged.
                    warn!(connection = core.connection_alias(), "heartbeat ACK missed");
                    let _ = sink.send(intentional_close()).await;
                    return Drive::Reconnect { clear_session: false, reset_attempts: false };
                }
                if sink.send(heartbeat_message(conn.last_seq)).await.is_err() {
                    return Drive::Reconnect { clear_session: false, reset_attempts: false };
                }
                heartbeat_acked = false;
            }
            message = stream.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        warn!(connection = core.connection_alias(), error = %e, "gateway read error");
                        return Drive::Reconnect { clear_session: false, reset_attempts: false };
                    }
                    None => {
                        return Drive::Reconnect { clear_session: false, reset_attempts: false };
                    }
                };
                match message {
                    Message::Text(text) => {
                        let Ok(payload) = serde_json::from_str::<GatewayPayload>(&text) else {
                            debug!(connection = core.connection_alias(), "unparseable gateway payload");
                            continue;
                        };
                        match handle_payload(core, shared, conn, payload, &mut sink, &mut heartbeat, &mut heartbeat_acked).await {
                            Some(drive) => return drive,
                            None => {}
                        }
                    }
                    Message::Close(frame) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        info!(
                            connection = core.connection_alias(),
                            code = code.unwrap_or(0),
                            "gateway closed"
                        );
                        return match close_code_action(code) {
                            CloseAction::Fatal => Drive::Fatal(format!(
                                "gateway closed with non-recoverable code {}",
                                code.unwrap_or(0)
                            )),
                            CloseAction::ClearAndReconnect => Drive::Reconnect {
                                clear_session: true,
                                reset_attempts: false,
                            },
                            CloseAction::Reconnect => Drive::Reconnect {
                                clear_session: false,
                                reset_attempts: false,
                            },
                        };
                    }
                    Message::Ping(data) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    _ => {}
                }
            }
        }
    }
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Handle one gateway payload; `Some(drive)` ends this connection.
#[allow(clippy::too_many_arguments)]
async fn handle_payload(
    core: &Arc<IngestorCore>,
    shared: &Arc<DiscordShared>,
    conn: &mut ConnState,
    payload: GatewayPayload,
    sink: &mut WsSink,
    heartbeat: &mut Option<tokio::time::Interval>,
    heartbeat_acked: &mut bool,
) -> Option<Drive> {
    match payload.op {
        OP_HELLO => {
            let interval_ms = payload
                .d
                .get("heartbeat_interval")
                .and_then(Value::as_u64)
                .unwrap_or(41_250);
            let period = std::time::Duration::from_millis(interval_ms.max(1));
            // First heartbeat after interval * jitter in [0, 1).
            let jitter = rand::thread_rng().gen_range(0.0..1.0);
            let first = std::time::Duration::from_millis(
                ((interval_ms as f64) * jitter) as u64,
            );
            let mut timer =
                tokio::time::interval_at(tokio::time::Instant::now() + first, period);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            *heartbeat = Some(timer);
            *heartbeat_acked = true;

            let auth = match (&conn.session_id, conn.last_seq) {
                (Some(session_id), Some(seq)) => resume_message(shared, session_id, seq),
                _ => identify_message(shared),
            };
            if sink.send(auth).await.is_err() {
                return Some(Drive::Reconnect {
                    clear_session: false,
                    reset_attempts: false,
                });
            }
            core.set_state(IngestorState::Connected);
        }
        OP_HEARTBEAT => {
            // The server may request an immediate heartbeat.
            if sink.send(heartbeat_message(conn.last_seq)).await.is_err() {
                return Some(Drive::Reconnect {
                    clear_session: false,
                    reset_attempts: false,
                });
            }
        }
        OP_HEARTBEAT_ACK => {
            *heartbeat_acked = true;
        }
        OP_RECONNECT => {
            let _ = sink.send(intentional_close()).await;
            return Some(Drive::Reconnect {
                clear_session: false,
                reset_attempts: false,
            });
        }
        OP_INVALID_SESSION => {
            let resumable = payload.d.as_bool().unwrap_or(false);
            // The gateway asks for a randomized wait before re-auth.
            let wait = rand::thread_rng().gen_range(1000..5000);
            tokio::time::sleep(std::time::Duration::from_millis(wait)).await;
            let auth = if resumable {
                match (&conn.session_id, conn.last_seq) {
                    (Some(session_id), Some(seq)) => resume_message(shared, session_id, seq),
                    _ => identify_message(shared),
                }
            } else {
                conn.session_id = None;
                conn.last_seq = None;
                identify_message(shared)
            };
            if sink.send(auth).await.is_err() {
                return Some(Drive::Reconnect {
                    clear_session: false,
                    reset_attempts: false,
                });
            }
        }
        OP_DISPATCH => {
            if let Some(seq) = payload.s {
                conn.last_seq = Some(seq);
            }
            let event_type = payload.t.unwrap_or_default();
            if event_type == "READY" {
                conn.session_id = payload
                    .d
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(String::from);
                conn.resume_gateway_url = payload
                    .d
                    .get("resume_gateway_url")
                    .and_then(Value::as_str)
                    .map(String::from);
                conn.attempts = 0;
                info!(connection = core.connection_alias(), "gateway session ready");
            }
            if passes_filters(&shared.config, &event_type, &payload.d) {
                let key = dispatch_idempotency_key(
                    core.connection_alias(),
                    conn.session_id.as_deref(),
                    payload.s,
                );
                core.push_event(&event_type, payload.d, key);
            }
        }
        other => {
            debug!(connection = core.connection_alias(), op = other, "unknown opcode ignored");
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_policy() {
        for code in [4004, 4010, 4011, 4012, 4013, 4014] {
            assert_eq!(close_code_action(Some(code)), CloseAction::Fatal);
        }
        for code in [4007, 4009] {
            assert_eq!(close_code_action(Some(code)), CloseAction::ClearAndReconnect);
        }
        assert_eq!(close_code_action(Some(1006)), CloseAction::Reconnect);
        assert_eq!(close_code_action(Some(1000)), CloseAction::Reconnect);
        assert_eq!(close_code_action(None), CloseAction::Reconnect);
    }

    fn config(
        event_types: Option<Vec<String>>,
        guild_ids: Option<Vec<String>>,
    ) -> WebsocketIngestorConfig {
        WebsocketIngestorConfig {
            protocol: "discord".into(),
            gateway_url: Some("wss://gateway.example".into()),
            token: None,
            app_token: None,
            intents: None,
            event_types,
            guild_ids,
            channel_ids: None,
            user_ids: None,
            buffer_size: None,
        }
    }

    #[test]
    fn test_event_type_filter() {
        let cfg = config(Some(vec!["MESSAGE_CREATE".into()]), None);
        assert!(passes_filters(&cfg, "MESSAGE_CREATE", &json!({})));
        assert!(!passes_filters(&cfg, "TYPING_START", &json!({})));
        // Lifecycle events always pass.
        assert!(passes_filters(&cfg, "READY", &json!({})));
        assert!(passes_filters(&cfg, "RESUMED", &json!({})));
    }

    #[test]
    fn test_guild_filter_missing_field_passes() {
        let cfg = config(None, Some(vec!["g-1".into()]));
        assert!(passes_filters(
            &cfg,
            "MESSAGE_CREATE",
            &json!({"guild_id": "g-1"})
        ));
        assert!(!passes_filters(
            &cfg,
            "MESSAGE_CREATE",
            &json!({"guild_id": "g-2"})
        ));
        // No guild_id on the payload: passes (lifecycle safety).
        assert!(passes_filters(&cfg, "READY", &json!({"v": 10})));
    }

    #[test]
    fn test_user_filter_checks_author_then_user() {
        let mut cfg = config(None, None);
        cfg.user_ids = Some(vec!["u-1".into()]);
        assert!(passes_filters(
            &cfg,
            "MESSAGE_CREATE",
            &json!({"author": {"id": "u-1"}})
        ));
        assert!(!passes_filters(
            &cfg,
            "MESSAGE_CREATE",
            &json!({"user": {"id": "u-2"}})
        ));
        assert!(passes_filters(&cfg, "GUILD_CREATE", &json!({})));
    }

    #[test]
    fn test_idempotency_key_shape() {
        assert_eq!(
            dispatch_idempotency_key("discord-main", Some("sess-1"), Some(42)).as_deref(),
            Some("discord:discord-main:sess-1:seq:42")
        );
        assert_eq!(
            dispatch_idempotency_key("discord-main", None, Some(7)).as_deref(),
            Some("discord:discord-main:nosess:seq:7")
        );
        assert_eq!(dispatch_idempotency_key("discord-main", None, None), None);
    }

    #[test]
    fn test_payload_parsing() {
        let payload: GatewayPayload =
            serde_json::from_str(r#"{"op":0,"d":{"content":"hi"},"s":3,"t":"MESSAGE_CREATE"}"#)
                .unwrap();
        assert_eq!(payload.op, OP_DISPATCH);
        assert_eq!(payload.s, Some(3));
        assert_eq!(payload.t.as_deref(), Some("MESSAGE_CREATE"));

        let hello: GatewayPayload =
            serde_json::from_str(r#"{"op":10,"d":{"heartbeat_interval":41250}}"#).unwrap();
        assert_eq!(hello.op, OP_HELLO);
    }
}
