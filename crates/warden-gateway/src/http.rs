//! The plaintext HTTP surface.
//!
//! Only the handshake, the opaque `/request` frames, webhook intake, and a
//! health probe live here. Non-200 plaintext statuses are limited to the
//! cases where no channel exists to carry an error: unknown session (401),
//! rejected handshake or webhook (403/404), and rate limiting (429).

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::{info, warn};
use warden_core::session::{PendingHandshake, Session};
use warden_crypto::handshake::{respond_to_init, verify_finish_payload};
use warden_crypto::EncryptedChannel;
use warden_ingest::WebhookDispatch;

use crate::pipeline::{
    dispatch_tool, error_response, pong_response, success_response, InboundMessage, ToolContext,
};
use crate::Gateway;

const SESSION_HEADER: &str = "x-session-id";

/// Build the gateway router.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/handshake/init", post(handshake_init))
        .route("/handshake/finish", post(handshake_finish))
        .route("/request", post(request))
        .route("/webhooks/:path", post(webhook))
        .route("/health", get(health))
        .with_state(gateway)
}

fn octet_stream(frame: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        frame,
    )
        .into_response()
}

async fn handshake_init(State(gateway): State<Arc<Gateway>>, body: Bytes) -> Response {
    match respond_to_init(&gateway.key_bundle, &gateway.peers, &body) {
        Ok(outcome) => {
            let session_id = outcome.keys.session_id.clone();
            let channel = EncryptedChannel::new(&outcome.keys);
            let routes = gateway.routes_for(&outcome.peer_alias);
            info!(
                event = "handshake_init",
                caller = outcome.peer_alias.as_str(),
                session_id = session_id.as_str(),
                routes = routes.len(),
                "handshake reply issued"
            );
            gateway.sessions.insert_pending(
                session_id,
                PendingHandshake {
                    channel,
                    caller_alias: outcome.peer_alias,
                    routes,
                    created_at: std::time::Instant::now(),
                },
            );
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                outcome.reply_bytes,
            )
                .into_response()
        }
        Err(e) => {
            // Detail stays in the audit log; the client learns nothing.
            warn!(event = "handshake_rejected", reason = %e, "handshake init rejected");
            (
                StatusCode::FORBIDDEN,
                Json(json!({"error": "handshake failed"})),
            )
                .into_response()
        }
    }
}

async fn handshake_finish(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(session_id) = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
    else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown handshake"})),
        )
            .into_response();
    };

    let Some(mut pending) = gateway.sessions.take_pending(&session_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown handshake"})),
        )
            .into_response();
    };

    let finish = pending
        .channel
        .decrypt(&body)
        .and_then(|plaintext| verify_finish_payload(&plaintext));
    match finish {
        Ok(()) => {
            info!(
                event = "handshake_complete",
                caller = pending.caller_alias.as_str(),
                session_id = session_id.as_str(),
                "session established"
            );
            gateway.sessions.insert_session(
                session_id.clone(),
                Session::new(pending.channel, pending.caller_alias, pending.routes),
            );
            (
                StatusCode::OK,
                Json(json!({"status": "established", "sessionId": session_id})),
            )
                .into_response()
        }
        Err(e) => {
            // Wrong finish proves a transcript or key mismatch; both the
            // pending entry and any derived state are discarded.
            warn!(
                event = "handshake_rejected",
                session_id = session_id.as_str(),
                reason = %e,
                "handshake finish rejected"
            );
            gateway.sessions.remove(&session_id);
            (
                StatusCode::FORBIDDEN,
                Json(json!({"error": "handshake failed"})),
            )
                .into_response()
        }
    }
}

async fn request(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(session_id) = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
    else {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unknown session"})))
            .into_response();
    };
    let Some(session) = gateway.sessions.get(&session_id) else {
        // The proxy uses this signal to tear down its cached channel and
        // rehandshake on the next call.
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unknown session"})))
            .into_response();
    };

    if !gateway.sessions.check_rate_limit(&session) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "rate limit exceeded"})),
        )
            .into_response();
    }
    session.touch();

    // One in-flight request per session: the lock spans
    // decrypt → dispatch → encrypt so send counters stay monotone.
    let mut channel = session.channel.lock().await;

    let response_value = match channel.decrypt(&body) {
        Ok(plaintext) => match serde_json::from_slice::<InboundMessage>(&plaintext) {
            Ok(InboundMessage::ProxyRequest {
                id,
                tool_name,
                tool_input,
                ..
            }) => {
                let result = dispatch_tool(
                    &gateway,
                    &tool_name,
                    tool_input,
                    &session.routes,
                    ToolContext {
                        caller_alias: &session.caller_alias,
                        ingestors: &gateway.ingestors,
                    },
                )
                .await;
                match result {
                    Ok(value) => success_response(&id, value),
                    Err(e) => error_response(&id, &e.to_string()),
                }
            }
            Ok(InboundMessage::Ping { timestamp }) => pong_response(timestamp),
            Err(e) => error_response(&serde_json::Value::Null, &format!("invalid request: {e}")),
        },
        Err(e) => {
            // Replay, tamper, or wrong key. The send direction may still be
            // intact; report through the channel when it is.
            warn!(
                event = "decrypt_failed",
                session_id = session_id.as_str(),
                caller = session.caller_alias.as_str(),
                reason = %e,
                "inbound frame rejected"
            );
            error_response(&serde_json::Value::Null, &e.to_string())
        }
    };

    let payload = response_value.to_string().into_bytes();
    match channel.encrypt(&payload) {
        Ok(frame) => octet_stream(frame),
        Err(e) => {
            drop(channel);
            // Channel broken beyond repair: drop the session; the proxy
            // must rehandshake.
            warn!(
                event = "channel_failed",
                session_id = session_id.as_str(),
                reason = %e,
                "encrypt failed, destroying session"
            );
            gateway.sessions.remove(&session_id);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "session destroyed"})),
            )
                .into_response()
        }
    }
}

async fn webhook(
    State(gateway): State<Arc<Gateway>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header_map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(key, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (key.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();

    match gateway.ingestors.dispatch_webhook(&path, &header_map, &body) {
        WebhookDispatch::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "no webhook registered"})),
        )
            .into_response(),
        WebhookDispatch::Accepted => {
            (StatusCode::OK, Json(json!({"received": true}))).into_response()
        }
        WebhookDispatch::Rejected(reasons) => {
            let reasons: serde_json::Map<String, serde_json::Value> = reasons
                .into_iter()
                .map(|(key, reason)| (key, json!(reason)))
                .collect();
            (
                StatusCode::FORBIDDEN,
                Json(json!({"error": "webhook rejected", "reasons": reasons})),
            )
                .into_response()
        }
    }
}

async fn health(State(gateway): State<Arc<Gateway>>) -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "activeSessions": gateway.sessions.active_count(),
            "uptime": gateway.uptime_secs(),
        })),
    )
        .into_response()
}
