//! GitHub webhook receiver.
//!
//! Verifies `X-Hub-Signature-256: sha256={hex}` as HMAC-SHA256 over the raw
//! delivery body; deduplicates on `X-GitHub-Delivery`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use warden_core::config::IngestorConfig;

use super::{constant_time_eq, hmac_sha256, resolve_config_value, WebhookIngestor, WebhookScheme};
use crate::base::{Ingestor, IngestorCore};
use crate::error::IngestError;
use crate::registry::SpawnContext;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const EVENT_HEADER: &str = "x-github-event";
const DELIVERY_HEADER: &str = "x-github-delivery";

pub(crate) struct GithubScheme {
    secret: Option<String>,
    /// `{"repository": "owner/name"}` instance filter.
    repository: Option<String>,
}

impl WebhookScheme for GithubScheme {
    fn verify(&self, headers: &HashMap<String, String>, raw_body: &[u8]) -> Result<(), String> {
        let Some(secret) = &self.secret else {
            // No secret configured: verification skipped (localhost dev).
            return Ok(());
        };
        let header = headers
            .get(SIGNATURE_HEADER)
            .ok_or_else(|| format!("missing {SIGNATURE_HEADER} header"))?;
        let hex_sig = header
            .strip_prefix("sha256=")
            .ok_or_else(|| "malformed signature header".to_string())?;
        let claimed = hex::decode(hex_sig).map_err(|_| "signature not hex".to_string())?;
        let expected = hmac_sha256(secret.as_bytes(), &[raw_body]);
        if constant_time_eq(&claimed, &expected) {
            Ok(())
        } else {
            Err("signature mismatch".to_string())
        }
    }

    fn accepts(&self, body: &Value) -> bool {
        match &self.repository {
            Some(full_name) => body
                .pointer("/repository/full_name")
                .and_then(Value::as_str)
                .map_or(false, |name| name == full_name),
            None => true,
        }
    }

    fn event_type(&self, headers: &HashMap<String, String>, _body: &Value) -> String {
        headers
            .get(EVENT_HEADER)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn event_data(&self, headers: &HashMap<String, String>, body: &Value) -> Value {
        json!({
            "deliveryId": headers.get(DELIVERY_HEADER),
            "event": self.event_type(headers, body),
            "payload": body,
        })
    }

    fn idempotency_key(&self, headers: &HashMap<String, String>, _body: &Value) -> Option<String> {
        headers
            .get(DELIVERY_HEADER)
            .map(|delivery| format!("github:{delivery}"))
    }
}

/// Factory registered under `webhook:github`.
pub(crate) fn spawn(ctx: SpawnContext) -> Result<Arc<dyn Ingestor>, IngestError> {
    let IngestorConfig::Webhook(cfg) = ctx.config else {
        return Err(IngestError::MissingConfig("webhook config expected".into()));
    };

    let repository = ctx
        .instance_id
        .as_ref()
        .and_then(|id| {
            cfg.instances
                .iter()
                .find(|instance| &instance.id == id)
                .and_then(|instance| instance.filter.as_ref())
        })
        .and_then(|filter| filter.get("repository"))
        .and_then(Value::as_str)
        .map(String::from);

    let core = IngestorCore::new(
        &ctx.connection_alias,
        ctx.instance_id.clone(),
        "webhook:github",
        ctx.buffer_size,
    );
    Ok(Arc::new(WebhookIngestor::new(
        core,
        cfg.path.clone(),
        cfg.event_types.clone(),
        Box::new(GithubScheme {
            secret: resolve_config_value(&cfg.secret, &ctx.secrets),
            repository,
        }),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn signed_headers(secret: &str, body: &[u8], delivery: &str) -> HashMap<String, String> {
        let sig = format!("sha256={}", hex::encode(hmac_sha256(secret.as_bytes(), &[body])));
        headers(&[
            (SIGNATURE_HEADER, sig.as_str()),
            (EVENT_HEADER, "push"),
            (DELIVERY_HEADER, delivery),
        ])
    }

    #[test]
    fn test_valid_signature_accepted() {
        let scheme = GithubScheme {
            secret: Some("whsec".into()),
            repository: None,
        };
        let body = br#"{"action":"opened"}"#;
        assert!(scheme.verify(&signed_headers("whsec", body, "d-1"), body).is_ok());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let scheme = GithubScheme {
            secret: Some("whsec".into()),
            repository: None,
        };
        let body = br#"{"action":"opened"}"#;
        assert!(scheme.verify(&signed_headers("other", body, "d-1"), body).is_err());
    }

    #[test]
    fn test_non_hex_signature_rejected() {
        let scheme = GithubScheme {
            secret: Some("whsec".into()),
            repository: None,
        };
        let hdrs = headers(&[(SIGNATURE_HEADER, "sha256=zzzz")]);
        assert!(scheme.verify(&hdrs, b"{}").is_err());
    }

    #[test]
    fn test_no_secret_skips_verification() {
        let scheme = GithubScheme {
            secret: None,
            repository: None,
        };
        assert!(scheme.verify(&HashMap::new(), b"{}").is_ok());
    }

    #[test]
    fn test_idempotency_key_from_delivery() {
        let scheme = GithubScheme {
            secret: None,
            repository: None,
        };
        let hdrs = headers(&[(DELIVERY_HEADER, "d-1")]);
        assert_eq!(
            scheme.idempotency_key(&hdrs, &Value::Null).as_deref(),
            Some("github:d-1")
        );
    }

    #[test]
    fn test_repository_filter() {
        let scheme = GithubScheme {
            secret: None,
            repository: Some("octo/repo".into()),
        };
        let matching = serde_json::json!({"repository": {"full_name": "octo/repo"}});
        let other = serde_json::json!({"repository": {"full_name": "octo/other"}});
        assert!(scheme.accepts(&matching));
        assert!(!scheme.accepts(&other));
    }
}
