//! Trello webhook receiver.
//!
//! Verifies `X-Trello-Webhook: {base64}` as HMAC-SHA1 over the raw body
//! concatenated with the registered callback URL. The callback URL must be
//! resolved from secrets at start time; without it every signed delivery is
//! rejected. Deduplicates on `action.id`.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use serde_json::Value;
use warden_core::config::IngestorConfig;

use super::{constant_time_eq, hmac_sha1, resolve_config_value, WebhookIngestor, WebhookScheme};
use crate::base::{Ingestor, IngestorCore};
use crate::error::IngestError;
use crate::registry::SpawnContext;

const SIGNATURE_HEADER: &str = "x-trello-webhook";

pub(crate) struct TrelloScheme {
    secret: Option<String>,
    callback_url: Option<String>,
    /// `{"boardId": "..."}` instance filter.
    board_id: Option<String>,
}

impl WebhookScheme for TrelloScheme {
    fn verify(&self, headers: &HashMap<String, String>, raw_body: &[u8]) -> Result<(), String> {
        let Some(secret) = &self.secret else {
            return Ok(());
        };
        let callback_url = self
            .callback_url
            .as_ref()
            .ok_or_else(|| "callback URL not configured".to_string())?;
        let header = headers
            .get(SIGNATURE_HEADER)
            .ok_or_else(|| format!("missing {SIGNATURE_HEADER} header"))?;
        let claimed = base64::engine::general_purpose::STANDARD
            .decode(header)
            .map_err(|_| "signature not base64".to_string())?;
        let expected = hmac_sha1(secret.as_bytes(), &[raw_body, callback_url.as_bytes()]);
        if constant_time_eq(&claimed, &expected) {
            Ok(())
        } else {
            Err("signature mismatch".to_string())
        }
    }

    fn accepts(&self, body: &Value) -> bool {
        let Some(board_id) = &self.board_id else {
            return true;
        };
        let action_board = body
            .pointer("/action/data/board/id")
            .and_then(Value::as_str);
        let model = body.pointer("/model/id").and_then(Value::as_str);
        action_board == Some(board_id.as_str()) || model == Some(board_id.as_str())
    }

    fn event_type(&self, _headers: &HashMap<String, String>, body: &Value) -> String {
        body.pointer("/action/type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    }

    fn idempotency_key(&self, _headers: &HashMap<String, String>, body: &Value) -> Option<String> {
        body.pointer("/action/id")
            .and_then(Value::as_str)
            .map(|id| format!("trello:{id}"))
    }
}

/// Factory registered under `webhook:trello`.
pub(crate) fn spawn(ctx: SpawnContext) -> Result<Arc<dyn Ingestor>, IngestError> {
    let IngestorConfig::Webhook(cfg) = ctx.config else {
        return Err(IngestError::MissingConfig("webhook config expected".into()));
    };

    let board_id = ctx
        .instance_id
        .as_ref()
        .and_then(|id| {
            cfg.instances
                .iter()
                .find(|instance| &instance.id == id)
                .and_then(|instance| instance.filter.as_ref())
        })
        .and_then(|filter| filter.get("boardId"))
        .and_then(Value::as_str)
        .map(String::from);

    let core = IngestorCore::new(
        &ctx.connection_alias,
        ctx.instance_id.clone(),
        "webhook:trello",
        ctx.buffer_size,
    );
    Ok(Arc::new(WebhookIngestor::new(
        core,
        cfg.path.clone(),
        cfg.event_types.clone(),
        Box::new(TrelloScheme {
            secret: resolve_config_value(&cfg.secret, &ctx.secrets),
            callback_url: resolve_config_value(&cfg.callback_url, &ctx.secrets),
            board_id,
        }),
    )))
}
