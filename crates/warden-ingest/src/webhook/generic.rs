//! Generic webhook receiver.
//!
//! No signature scheme: accepts any JSON delivery on its path. Intended for
//! services without a supported dialect, behind network-level trust. The
//! event type comes from a configurable body path, falling back to
//! `"webhook"`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use warden_core::config::IngestorConfig;

use super::{walk_path, WebhookIngestor, WebhookScheme};
use crate::base::{Ingestor, IngestorCore};
use crate::error::IngestError;
use crate::registry::SpawnContext;

pub(crate) struct GenericScheme {
    event_type_path: Option<String>,
}

impl WebhookScheme for GenericScheme {
    fn verify(&self, _headers: &HashMap<String, String>, _raw_body: &[u8]) -> Result<(), String> {
        Ok(())
    }

    fn event_type(&self, _headers: &HashMap<String, String>, body: &Value) -> String {
        self.event_type_path
            .as_ref()
            .and_then(|path| walk_path(body, path))
            .and_then(Value::as_str)
            .unwrap_or("webhook")
            .to_string()
    }

    fn idempotency_key(&self, _headers: &HashMap<String, String>, _body: &Value) -> Option<String> {
        None
    }
}

/// Factory registered under `webhook:generic`.
pub(crate) fn spawn(ctx: SpawnContext) -> Result<Arc<dyn Ingestor>, IngestError> {
    let IngestorConfig::Webhook(cfg) = ctx.config else {
        return Err(IngestError::MissingConfig("webhook config expected".into()));
    };

    let core = IngestorCore::new(
        &ctx.connection_alias,
        ctx.instance_id.clone(),
        "webhook:generic",
        ctx.buffer_size,
    );
    Ok(Arc::new(WebhookIngestor::new(
        core,
        cfg.path.clone(),
        cfg.event_types.clone(),
        Box::new(GenericScheme {
            event_type_path: cfg.event_type_path.clone(),
        }),
    )))
}
