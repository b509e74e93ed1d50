//! Tool dispatch inside the encrypted channel.
//!
//! Decrypted frames carry a small JSON envelope; `proxy_request` names one
//! of four operations in a static dispatch table. Handlers receive the
//! session's pinned routes and a context naming the caller, so a tool can
//! never see another caller's routes or buffers.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use warden_core::route::{build_request_headers, select_route, ResolvedRoute};
use warden_core::GatewayError;
use warden_ingest::IngestorManager;

use crate::Gateway;

/// Messages a proxy may send through the channel.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum InboundMessage {
    /// A tool invocation.
    ProxyRequest {
        /// Correlation ID echoed back in the response.
        id: Value,
        /// Operation name.
        tool_name: String,
        /// Operation input.
        #[serde(default)]
        tool_input: Value,
        /// Sender clock, unix milliseconds.
        #[serde(default)]
        timestamp: Option<u64>,
    },
    /// Keepalive.
    Ping {
        /// Sender clock, unix milliseconds.
        #[serde(default)]
        timestamp: Option<u64>,
    },
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Successful `proxy_response`.
#[must_use]
pub fn success_response(id: &Value, result: Value) -> Value {
    json!({
        "type": "proxy_response",
        "id": id,
        "success": true,
        "result": result,
        "timestamp": now_ms(),
    })
}

/// Failed `proxy_response`.
#[must_use]
pub fn error_response(id: &Value, error: &str) -> Value {
    json!({
        "type": "proxy_response",
        "id": id,
        "success": false,
        "error": error,
        "timestamp": now_ms(),
    })
}

/// `pong` keepalive reply.
#[must_use]
pub fn pong_response(echo_timestamp: Option<u64>) -> Value {
    json!({
        "type": "pong",
        "timestamp": now_ms(),
        "echoTimestamp": echo_timestamp,
    })
}

/// Ambient context handed to every tool.
pub struct ToolContext<'a> {
    /// Which caller this session belongs to.
    pub caller_alias: &'a str,
    /// The gateway's ingestor manager.
    pub ingestors: &'a IngestorManager,
}

/// The static tool table. Adding a tool means adding an arm here.
pub async fn dispatch_tool(
    gateway: &Gateway,
    tool_name: &str,
    input: Value,
    routes: &[ResolvedRoute],
    ctx: ToolContext<'_>,
) -> Result<Value, GatewayError> {
    debug!(tool = tool_name, caller = ctx.caller_alias, "dispatching tool");
    match tool_name {
        "http_request" => http_request_tool(gateway, input, routes).await,
        "list_routes" => list_routes_tool(routes),
        "poll_events" => poll_events_tool(input, ctx),
        "ingestor_status" => ingestor_status_tool(ctx),
        other => Err(GatewayError::UnknownTool(other.to_string())),
    }
}

#[derive(Debug, Deserialize)]
struct HttpRequestInput {
    method: String,
    url: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
}

async fn http_request_tool(
    gateway: &Gateway,
    input: Value,
    routes: &[ResolvedRoute],
) -> Result<Value, GatewayError> {
    let input: HttpRequestInput = serde_json::from_value(input)
        .map_err(|e| GatewayError::InvalidRequest(format!("http_request input: {e}")))?;

    let (route, url) = select_route(routes, &input.url).ok_or(GatewayError::RouteDenied)?;
    let mut headers = build_request_headers(&input.headers, route)?;

    // Body policy: pass through verbatim unless the route opted in to
    // secret substitution. Structured bodies default to JSON.
    let body_bytes = match &input.body {
        None => None,
        Some(Value::String(text)) => {
            let rendered = if route.resolve_secrets_in_body {
                route.substitute_secrets(text)
            } else {
                text.clone()
            };
            Some(rendered.into_bytes())
        }
        Some(structured) => {
            let serialized = structured.to_string();
            let rendered = if route.resolve_secrets_in_body {
                route.substitute_secrets(&serialized)
            } else {
                serialized
            };
            if !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
                headers.insert("Content-Type".to_string(), "application/json".to_string());
            }
            Some(rendered.into_bytes())
        }
    };

    // Belt-and-braces: the fully resolved URL must still pass the
    // allowlist, whatever substitution produced it.
    if !route.is_endpoint_allowed(&url) {
        return Err(GatewayError::RouteDenied);
    }

    let method: reqwest::Method = input
        .method
        .to_ascii_uppercase()
        .parse()
        .map_err(|_| GatewayError::InvalidRequest(format!("invalid method {:?}", input.method)))?;

    let mut request = gateway.http.request(method, &url);
    for (key, value) in &headers {
        request = request.header(key.as_str(), value);
    }
    if let Some(body) = body_bytes {
        request = request.body(body);
    }

    let response = request
        .send()
        .await
        .map_err(|e| GatewayError::Upstream(e.to_string()))?;

    let status = response.status();
    let status_text = status.canonical_reason().unwrap_or("").to_string();
    let mut response_headers = HashMap::new();
    for (key, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            response_headers.insert(key.as_str().to_string(), value.to_string());
        }
    }
    let is_json = response_headers
        .get("content-type")
        .map_or(false, |ct| ct.contains("application/json"));

    let raw = response
        .bytes()
        .await
        .map_err(|e| GatewayError::Upstream(e.to_string()))?;
    let body: Value = if is_json {
        serde_json::from_slice(&raw)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&raw).into_owned()))
    } else {
        Value::String(String::from_utf8_lossy(&raw).into_owned())
    };

    Ok(json!({
        "status": status.as_u16(),
        "statusText": status_text,
        "headers": response_headers,
        "body": body,
    }))
}

fn list_routes_tool(routes: &[ResolvedRoute]) -> Result<Value, GatewayError> {
    let summaries: Vec<_> = routes
        .iter()
        .enumerate()
        .map(|(index, route)| route.summary(index))
        .collect();
    serde_json::to_value(summaries).map_err(|e| GatewayError::InvalidRequest(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct PollEventsInput {
    #[serde(default)]
    connection: Option<String>,
    #[serde(default)]
    after_id: Option<u64>,
}

fn poll_events_tool(input: Value, ctx: ToolContext<'_>) -> Result<Value, GatewayError> {
    let input: PollEventsInput = serde_json::from_value(input)
        .map_err(|e| GatewayError::InvalidRequest(format!("poll_events input: {e}")))?;

    let events = match &input.connection {
        Some(connection) => ctx
            .ingestors
            .get_events(ctx.caller_alias, connection, input.after_id)
            .ok_or_else(|| {
                GatewayError::InvalidRequest(format!("no ingestor for connection {connection:?}"))
            })?,
        // Merged view across ingestors: ordered by arrival; after_id cursors
        // are only reliable when scoped to one connection.
        None => ctx.ingestors.get_all_events(ctx.caller_alias, input.after_id),
    };
    serde_json::to_value(events).map_err(|e| GatewayError::InvalidRequest(e.to_string()))
}

fn ingestor_status_tool(ctx: ToolContext<'_>) -> Result<Value, GatewayError> {
    serde_json::to_value(ctx.ingestors.statuses(ctx.caller_alias))
        .map_err(|e| GatewayError::InvalidRequest(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_message_parsing() {
        let message: InboundMessage = serde_json::from_str(
            r#"{"type":"proxy_request","id":"r-1","toolName":"list_routes","toolInput":{},"timestamp":1}"#,
        )
        .unwrap();
        match message {
            InboundMessage::ProxyRequest { id, tool_name, .. } => {
                assert_eq!(id, json!("r-1"));
                assert_eq!(tool_name, "list_routes");
            }
            other => panic!("unexpected message {other:?}"),
        }

        let ping: InboundMessage =
            serde_json::from_str(r#"{"type":"ping","timestamp":42}"#).unwrap();
        assert!(matches!(ping, InboundMessage::Ping { timestamp: Some(42) }));
    }

    #[test]
    fn test_response_shapes() {
        let ok = success_response(&json!("r-1"), json!({"n": 1}));
        assert_eq!(ok["type"], "proxy_response");
        assert_eq!(ok["success"], json!(true));
        assert_eq!(ok["result"]["n"], json!(1));

        let err = error_response(&json!(7), "Endpoint not allowed");
        assert_eq!(err["success"], json!(false));
        assert_eq!(err["error"], json!("Endpoint not allowed"));

        let pong = pong_response(Some(5));
        assert_eq!(pong["type"], "pong");
        assert_eq!(pong["echoTimestamp"], json!(5));
    }
}
