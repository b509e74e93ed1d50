//! Ownership of live ingestors, keyed `caller:connection[:instance]`.
//!
//! The manager walks caller × connection at boot, applies per-caller
//! overrides, builds instances through the registry, and isolates each
//! start failure so one bad ingestor cannot block the rest. Ingestors hold
//! no reference back to the manager; it reads their buffers out.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};
use warden_core::config::{CallerConfig, IngestorConfig};
use warden_core::events::IngestedEvent;
use warden_core::ring_buffer::DEFAULT_CAPACITY;
use warden_core::route::ResolvedRoute;

use crate::base::{Ingestor, IngestorStatus};
use crate::registry::{IngestorRegistry, SpawnContext};

/// Outcome of fanning a webhook delivery out to a path's ingestors.
#[derive(Debug)]
pub enum WebhookDispatch {
    /// No ingestor is registered on this path.
    NotFound,
    /// At least one ingestor accepted (providers should stop retrying).
    Accepted,
    /// Every ingestor rejected; reasons keyed by ingestor.
    Rejected(Vec<(String, String)>),
}

/// Owns every live ingestor instance.
pub struct IngestorManager {
    registry: IngestorRegistry,
    ingestors: DashMap<String, Arc<dyn Ingestor>>,
}

fn instance_key(caller: &str, connection: &str, instance: Option<&str>) -> String {
    match instance {
        Some(instance) => format!("{caller}:{connection}:{instance}"),
        None => format!("{caller}:{connection}"),
    }
}

/// Merge events from several ingestors into arrival order.
fn merge_by_arrival(mut events: Vec<IngestedEvent>) -> Vec<IngestedEvent> {
    events.sort_by(|a, b| {
        a.received_at_ms
            .cmp(&b.received_at_ms)
            .then(a.id.cmp(&b.id))
    });
    events
}

impl IngestorManager {
    /// Create a manager over a registry.
    #[must_use]
    pub fn new(registry: IngestorRegistry) -> Self {
        Self {
            registry,
            ingestors: DashMap::new(),
        }
    }

    /// Build and start every configured ingestor.
    ///
    /// `caller_routes` holds each caller's resolved routes (secrets already
    /// resolved with the caller's env). Failures are logged per ingestor and
    /// never abort the walk.
    pub async fn start_all(
        &self,
        callers: &BTreeMap<String, CallerConfig>,
        caller_routes: &HashMap<String, Vec<ResolvedRoute>>,
    ) {
        for (caller_alias, caller) in callers {
            let Some(routes) = caller_routes.get(caller_alias) else {
                continue;
            };
            for route in routes {
                let Some(base_config) = &route.ingestor else {
                    continue;
                };
                let overrides = caller.ingestor_overrides.get(&route.alias);
                if overrides.and_then(|o| o.enabled) == Some(false) {
                    info!(
                        caller = caller_alias.as_str(),
                        connection = route.alias.as_str(),
                        "ingestor disabled by caller override"
                    );
                    continue;
                }

                let mut config = base_config.clone();
                if let Some(event_types) = overrides.and_then(|o| o.event_types.clone()) {
                    match &mut config {
                        IngestorConfig::Websocket(cfg) => cfg.event_types = Some(event_types),
                        IngestorConfig::Webhook(cfg) => cfg.event_types = Some(event_types),
                        IngestorConfig::Poll(_) => {}
                    }
                }
                let buffer_size = overrides
                    .and_then(|o| o.buffer_size)
                    .or_else(|| config.buffer_size())
                    .unwrap_or(DEFAULT_CAPACITY);

                let instance_ids: Vec<Option<String>> = match &config {
                    IngestorConfig::Webhook(cfg) if !cfg.instances.is_empty() => cfg
                        .instances
                        .iter()
                        .map(|instance| Some(instance.id.clone()))
                        .collect(),
                    _ => vec![None],
                };

                for instance_id in instance_ids {
                    self.start_one(
                        caller_alias,
                        route,
                        config.clone(),
                        instance_id,
                        buffer_size,
                    )
                    .await;
                }
            }
        }
    }

    async fn start_one(
        &self,
        caller_alias: &str,
        route: &ResolvedRoute,
        config: IngestorConfig,
        instance_id: Option<String>,
        buffer_size: usize,
    ) {
        let key = instance_key(caller_alias, &route.alias, instance_id.as_deref());
        let ctx = SpawnContext {
            connection_alias: route.alias.clone(),
            instance_id,
            config,
            secrets: route.secrets.clone(),
            route_headers: route.headers.clone(),
            buffer_size,
        };
        match self.registry.create(ctx) {
            Ok(ingestor) => {
                if let Err(e) = ingestor.start().await {
                    warn!(key = key.as_str(), error = %e, "ingestor failed to start");
                    ingestor.core().fail(e.to_string());
                } else {
                    info!(
                        key = key.as_str(),
                        kind = ingestor.core().kind(),
                        "ingestor started"
                    );
                }
                self.ingestors.insert(key, ingestor);
            }
            Err(e) => {
                warn!(key = key.as_str(), error = %e, "ingestor construction failed");
            }
        }
    }

    /// Stop every ingestor, cancelling outstanding I/O and timers.
    pub async fn stop_all(&self) {
        let ingestors: Vec<Arc<dyn Ingestor>> = self
            .ingestors
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for ingestor in ingestors {
            ingestor.stop().await;
        }
    }

    /// Events for one caller's connection (all instances merged), cursored.
    ///
    /// Returns `None` when the caller has no such ingestor.
    #[must_use]
    pub fn get_events(
        &self,
        caller: &str,
        connection: &str,
        after_id: Option<u64>,
    ) -> Option<Vec<IngestedEvent>> {
        let exact = instance_key(caller, connection, None);
        let prefix = format!("{exact}:");
        let mut found = false;
        let mut events = Vec::new();
        for entry in self.ingestors.iter() {
            if entry.key() == &exact || entry.key().starts_with(&prefix) {
                found = true;
                events.extend(entry.value().core().get_events(after_id));
            }
        }
        found.then(|| merge_by_arrival(events))
    }

    /// Every event buffered for a caller, across ingestors, in arrival
    /// order. IDs are per-ingestor, so `after_id` cursors are only reliable
    /// when scoped to one connection; here it still filters per ingestor.
    #[must_use]
    pub fn get_all_events(&self, caller: &str, after_id: Option<u64>) -> Vec<IngestedEvent> {
        let prefix = format!("{caller}:");
        let mut events = Vec::new();
        for entry in self.ingestors.iter() {
            if entry.key().starts_with(&prefix) {
                events.extend(entry.value().core().get_events(after_id));
            }
        }
        merge_by_arrival(events)
    }

    /// Status snapshots for a caller's ingestors.
    #[must_use]
    pub fn statuses(&self, caller: &str) -> Vec<IngestorStatus> {
        let prefix = format!("{caller}:");
        let mut statuses: Vec<IngestorStatus> = self
            .ingestors
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| entry.value().core().status())
            .collect();
        statuses.sort_by(|a, b| {
            (a.connection.clone(), a.instance_id.clone())
                .cmp(&(b.connection.clone(), b.instance_id.clone()))
        });
        statuses
    }

    /// Fan a webhook delivery out to every ingestor on `path`.
    ///
    /// Multiple callers may subscribe to the same path; each accepting
    /// ingestor buffers its own copy.
    #[must_use]
    pub fn dispatch_webhook(
        &self,
        path: &str,
        headers: &HashMap<String, String>,
        raw_body: &[u8],
    ) -> WebhookDispatch {
        let mut any_matched = false;
        let mut any_accepted = false;
        let mut rejections = Vec::new();

        for entry in self.ingestors.iter() {
            let ingestor = entry.value();
            if ingestor.webhook_path() != Some(path) {
                continue;
            }
            any_matched = true;
            let decision = ingestor.handle_webhook(headers, raw_body);
            if decision.accepted {
                any_accepted = true;
            } else {
                rejections.push((
                    entry.key().clone(),
                    decision.reason.unwrap_or_else(|| "rejected".into()),
                ));
            }
        }

        if !any_matched {
            WebhookDispatch::NotFound
        } else if any_accepted {
            WebhookDispatch::Accepted
        } else {
            WebhookDispatch::Rejected(rejections)
        }
    }

    /// Number of live ingestors.
    #[must_use]
    pub fn count(&self) -> usize {
        self.ingestors.len()
    }
}
