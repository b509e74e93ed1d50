//! Passive webhook ingestors.
//!
//! The HTTP surface hands every `POST /webhooks/{path}` delivery (headers
//! plus the raw, pre-parse body bytes) to the manager, which fans it out to
//! every ingestor registered on that path. Each ingestor runs the same
//! pipeline: verify the signature over the raw bytes, parse JSON, apply its
//! instance content filter, extract the event type, apply the event-type
//! filter, shape the event data, and push with a service-specific
//! idempotency key (the base deduplicates).
//!
//! Header names arrive lowercased.

pub mod generic;
pub mod github;
pub mod stripe;
pub mod trello;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::base::{Ingestor, IngestorCore, IngestorState, WebhookDecision};
use crate::error::IngestError;

/// Per-service verification and extraction hooks.
pub trait WebhookScheme: Send + Sync {
    /// Verify the delivery signature over the raw body bytes.
    fn verify(&self, headers: &HashMap<String, String>, raw_body: &[u8]) -> Result<(), String>;

    /// Content filter for multi-instance discrimination.
    fn accepts(&self, _body: &Value) -> bool {
        true
    }

    /// Service-level event type.
    fn event_type(&self, headers: &HashMap<String, String>, body: &Value) -> String;

    /// Service-shaped event record.
    fn event_data(&self, _headers: &HashMap<String, String>, body: &Value) -> Value {
        body.clone()
    }

    /// Service-specific idempotency key; `None` falls back to a UUID.
    fn idempotency_key(&self, headers: &HashMap<String, String>, body: &Value) -> Option<String>;
}

/// A webhook-fed ingestor: one scheme plus the shared core.
pub struct WebhookIngestor {
    core: Arc<IngestorCore>,
    path: String,
    event_types: Option<Vec<String>>,
    scheme: Box<dyn WebhookScheme>,
}

impl WebhookIngestor {
    /// Assemble an ingestor from its parts.
    #[must_use]
    pub fn new(
        core: Arc<IngestorCore>,
        path: String,
        event_types: Option<Vec<String>>,
        scheme: Box<dyn WebhookScheme>,
    ) -> Self {
        Self {
            core,
            path,
            event_types,
            scheme,
        }
    }
}

#[async_trait]
impl Ingestor for WebhookIngestor {
    fn core(&self) -> &IngestorCore {
        &self.core
    }

    async fn start(&self) -> Result<(), IngestError> {
        // Passive: nothing to connect; deliveries arrive via the manager.
        self.core.set_state(IngestorState::Connected);
        Ok(())
    }

    async fn stop(&self) {
        self.core.set_state(IngestorState::Stopped);
    }

    fn webhook_path(&self) -> Option<&str> {
        Some(&self.path)
    }

    fn handle_webhook(
        &self,
        headers: &HashMap<String, String>,
        raw_body: &[u8],
    ) -> WebhookDecision {
        if self.core.state() != IngestorState::Connected {
            return WebhookDecision::rejected("ingestor not running");
        }

        if let Err(reason) = self.scheme.verify(headers, raw_body) {
            return WebhookDecision::rejected(reason);
        }

        let body: Value = match serde_json::from_slice(raw_body) {
            Ok(body) => body,
            Err(_) => return WebhookDecision::rejected("Invalid JSON body"),
        };

        if !self.scheme.accepts(&body) {
            return WebhookDecision::rejected("payload does not match this instance");
        }

        let event_type = self.scheme.event_type(headers, &body);
        if let Some(wanted) = &self.event_types {
            if !wanted.is_empty() && !wanted.contains(&event_type) {
                // Valid delivery, just unwanted: accept so the provider
                // stops retrying, without buffering.
                return WebhookDecision::accepted();
            }
        }

        let data = self.scheme.event_data(headers, &body);
        let key = self.scheme.idempotency_key(headers, &body);
        self.core.push_event(&event_type, data, key);
        WebhookDecision::accepted()
    }
}

/// Constant-time byte comparison; unequal lengths are unequal.
#[must_use]
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// HMAC-SHA256 over a sequence of parts.
pub(crate) fn hmac_sha256(secret: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(secret).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

/// HMAC-SHA1 over a sequence of parts.
pub(crate) fn hmac_sha1(secret: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let mut mac =
        <Hmac<Sha1> as Mac>::new_from_slice(secret).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

/// Walk a dot-separated path into a JSON value.
#[must_use]
pub(crate) fn walk_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Resolve a `"${VAR}"`-style config value against route secrets.
pub(crate) fn resolve_config_value(
    value: &Option<String>,
    secrets: &HashMap<String, String>,
) -> Option<String> {
    value
        .as_ref()
        .map(|v| warden_core::route::resolve_placeholders(v, secrets))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NoopScheme;

    impl WebhookScheme for NoopScheme {
        fn verify(&self, _: &HashMap<String, String>, _: &[u8]) -> Result<(), String> {
            Ok(())
        }

        fn event_type(&self, _: &HashMap<String, String>, body: &Value) -> String {
            body.get("kind")
                .and_then(Value::as_str)
                .unwrap_or("event")
                .to_string()
        }

        fn idempotency_key(&self, _: &HashMap<String, String>, body: &Value) -> Option<String> {
            body.get("id").and_then(Value::as_str).map(String::from)
        }
    }

    fn ingestor(event_types: Option<Vec<String>>) -> WebhookIngestor {
        let core = IngestorCore::new("svc", None, "webhook:generic", 10);
        core.set_state(IngestorState::Connected);
        WebhookIngestor::new(core, "svc".into(), event_types, Box::new(NoopScheme))
    }

    #[test]
    fn test_pipeline_accepts_and_buffers() {
        let ing = ingestor(None);
        let body = serde_json::to_vec(&json!({"kind": "ping", "id": "e-1"})).unwrap();
        let decision = ing.handle_webhook(&HashMap::new(), &body);
        assert!(decision.accepted);
        assert_eq!(ing.core().get_events(None).len(), 1);
    }

    #[test]
    fn test_invalid_json_rejected() {
        let ing = ingestor(None);
        let decision = ing.handle_webhook(&HashMap::new(), b"not json");
        assert!(!decision.accepted);
        assert_eq!(decision.reason.as_deref(), Some("Invalid JSON body"));
    }

    #[test]
    fn test_event_type_filter_accepts_without_buffering() {
        let ing = ingestor(Some(vec!["wanted".into()]));
        let body = serde_json::to_vec(&json!({"kind": "other", "id": "e-1"})).unwrap();
        let decision = ing.handle_webhook(&HashMap::new(), &body);
        assert!(decision.accepted);
        assert!(ing.core().get_events(None).is_empty());
    }

    #[test]
    fn test_stopped_ingestor_rejects() {
        let ing = ingestor(None);
        ing.core().set_state(IngestorState::Stopped);
        let body = serde_json::to_vec(&json!({"kind": "ping"})).unwrap();
        assert!(!ing.handle_webhook(&HashMap::new(), &body).accepted);
    }

    #[test]
    fn test_constant_time_eq_lengths() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn test_walk_path() {
        let value = json!({"a": {"b": {"c": 42}}});
        assert_eq!(walk_path(&value, "a.b.c"), Some(&json!(42)));
        assert_eq!(walk_path(&value, "a.x"), None);
    }
}
