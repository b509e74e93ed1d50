//! Shared helpers for Warden integration tests.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::Request;
use axum::routing::{any, get};
use axum::{Json, Router};
use serde_json::{json, Value};
use warden_core::config::{RouteConfig, ServerConfig};
use warden_crypto::handshake::AuthorizedPeer;
use warden_gateway::{http, Gateway};
use warden_proxy::ProxyClient;

/// Fresh caller and server identities.
pub fn test_identities() -> (warden_crypto::KeyBundle, warden_crypto::KeyBundle) {
    let mut rng = rand::rngs::OsRng;
    (
        warden_crypto::KeyBundle::generate(&mut rng),
        warden_crypto::KeyBundle::generate(&mut rng),
    )
}

/// A server config with one caller ("agent") wired to the given connectors.
pub fn config_with_connectors(connectors: Vec<(&str, RouteConfig)>) -> ServerConfig {
    let connections: Vec<String> = connectors.iter().map(|(a, _)| a.to_string()).collect();
    let mut config: ServerConfig = serde_json::from_value(json!({
        "keyDir": "/tmp/warden-test-keys",
        "callers": {
            "agent": {
                "peerKeyDir": "/tmp/warden-test-peer",
                "connections": connections,
            }
        }
    }))
    .expect("static config");
    for (alias, connector) in connectors {
        config.connectors.insert(alias.to_string(), connector);
    }
    config
}

/// A connector with fixed headers and an allowlist (no env resolution).
pub fn connector(
    allowed_endpoints: &[&str],
    headers: &[(&str, &str)],
    secrets: &[(&str, &str)],
) -> RouteConfig {
    RouteConfig {
        headers: headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>(),
        secrets: secrets
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>(),
        allowed_endpoints: allowed_endpoints.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// Spawn a gateway for one caller ("agent"); returns its base URL and state.
pub async fn spawn_gateway(
    config: ServerConfig,
    caller_bundle: &warden_crypto::KeyBundle,
    server_bundle: warden_crypto::KeyBundle,
) -> (String, Arc<Gateway>) {
    let peers = vec![AuthorizedPeer {
        alias: "agent".to_string(),
        name: None,
        keys: caller_bundle.public_bundle(),
    }];
    let gateway = Arc::new(Gateway::new(config, server_bundle, peers).expect("gateway assembles"));
    gateway.start_ingestors().await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind gateway");
    let addr = listener.local_addr().expect("gateway addr");
    let router = http::router(Arc::clone(&gateway));
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    (format!("http://{addr}"), gateway)
}

/// Gateway plus a connected proxy client in one step.
pub async fn spawn_gateway_with_proxy(config: ServerConfig) -> (ProxyClient, Arc<Gateway>) {
    let (caller_bundle, server_bundle) = test_identities();
    let server_public = server_bundle.public_bundle();
    let (base_url, gateway) = spawn_gateway(config, &caller_bundle, server_bundle).await;
    let proxy =
        ProxyClient::new(base_url, caller_bundle, server_public).expect("proxy client builds");
    (proxy, gateway)
}

/// A mock upstream API. `GET /user` echoes the Authorization header back in
/// its JSON body; any other path echoes method and path.
pub async fn spawn_upstream() -> String {
    async fn user(request: Request) -> Json<Value> {
        let authorization = request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        Json(json!({"login": "octocat", "authorization": authorization}))
    }

    async fn echo(request: Request) -> Json<Value> {
        Json(json!({
            "method": request.method().as_str(),
            "path": request.uri().path(),
        }))
    }

    let app = Router::new().route("/user", get(user)).route("/*rest", any(echo));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}
