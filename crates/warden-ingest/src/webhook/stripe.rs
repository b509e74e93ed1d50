//! Stripe webhook receiver.
//!
//! Verifies `Stripe-Signature: t={ts},v1={hex}[,v1={hex}...]` as HMAC-SHA256
//! over `"{ts}.{raw_body}"`, rejecting timestamps outside the tolerance.
//! Deduplicates on the event object's `id`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use warden_core::config::IngestorConfig;

use super::{constant_time_eq, hmac_sha256, resolve_config_value, WebhookIngestor, WebhookScheme};
use crate::base::{Ingestor, IngestorCore};
use crate::error::IngestError;
use crate::registry::SpawnContext;

const SIGNATURE_HEADER: &str = "stripe-signature";

/// Maximum allowed skew between the signature timestamp and now.
const DEFAULT_TOLERANCE_SECS: i64 = 300;

pub(crate) struct StripeScheme {
    secret: Option<String>,
    tolerance_secs: i64,
}

fn parse_signature_header(header: &str) -> (Option<i64>, Vec<String>) {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for pair in header.split(',') {
        let Some((key, value)) = pair.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" => signatures.push(value.to_string()),
            _ => {}
        }
    }
    (timestamp, signatures)
}

impl StripeScheme {
    fn verify_at(
        &self,
        headers: &HashMap<String, String>,
        raw_body: &[u8],
        now: i64,
    ) -> Result<(), String> {
        let Some(secret) = &self.secret else {
            return Ok(());
        };
        let header = headers
            .get(SIGNATURE_HEADER)
            .ok_or_else(|| format!("missing {SIGNATURE_HEADER} header"))?;
        let (timestamp, signatures) = parse_signature_header(header);
        let timestamp = timestamp.ok_or_else(|| "missing signature timestamp".to_string())?;
        if signatures.is_empty() {
            return Err("missing v1 signature".to_string());
        }
        if (now - timestamp).abs() > self.tolerance_secs {
            return Err("signature timestamp outside tolerance".to_string());
        }

        let expected = hmac_sha256(
            secret.as_bytes(),
            &[timestamp.to_string().as_bytes(), b".", raw_body],
        );
        let valid = signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|claimed| constant_time_eq(&claimed, &expected))
                .unwrap_or(false)
        });
        if valid {
            Ok(())
        } else {
            Err("signature mismatch".to_string())
        }
    }
}

impl WebhookScheme for StripeScheme {
    fn verify(&self, headers: &HashMap<String, String>, raw_body: &[u8]) -> Result<(), String> {
        self.verify_at(headers, raw_body, unix_now())
    }

    fn event_type(&self, _headers: &HashMap<String, String>, body: &Value) -> String {
        body.get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    }

    fn idempotency_key(&self, _headers: &HashMap<String, String>, body: &Value) -> Option<String> {
        body.get("id")
            .and_then(Value::as_str)
            .map(|id| format!("stripe:{id}"))
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Factory registered under `webhook:stripe`.
pub(crate) fn spawn(ctx: SpawnContext) -> Result<Arc<dyn Ingestor>, IngestError> {
    let IngestorConfig::Webhook(cfg) = ctx.config else {
        return Err(IngestError::MissingConfig("webhook config expected".into()));
    };

    let core = IngestorCore::new(
        &ctx.connection_alias,
        ctx.instance_id.clone(),
        "webhook:stripe",
        ctx.buffer_size,
    );
    Ok(Arc::new(WebhookIngestor::new(
        core,
        cfg.path.clone(),
        cfg.event_types.clone(),
        Box::new(StripeScheme {
            secret: resolve_config_value(&cfg.secret, &ctx.secrets),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }),
    )))
}
