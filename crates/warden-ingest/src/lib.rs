//! # Warden Ingest
//!
//! Long-lived event sources feeding per-caller ring buffers:
//!
//! - WebSocket gateway clients (Discord-style opcode protocol, Slack-style
//!   socket mode) with heartbeat, resume, and backoff-reconnect state
//!   machines
//! - Passive webhook receivers with raw-body signature verification
//!   (GitHub, Stripe, Trello, plus an unverified generic receiver)
//! - Periodic HTTP pollers with response-path extraction and field-based
//!   deduplication
//!
//! A process-wide [`registry::IngestorRegistry`] maps `kind[:protocol]`
//! keys to factories; it is populated by an explicit
//! [`registry::IngestorRegistry::with_builtin`] call at boot rather than by
//! import side effects. The [`manager::IngestorManager`] owns every live
//! instance, keyed `caller:connection[:instance]`; ingestors carry no
//! backreference to it. They push into their own buffer and the manager
//! reads buffers out.

#![warn(clippy::all)]

pub mod base;
pub mod error;
pub mod manager;
pub mod poll;
pub mod registry;
pub mod webhook;
pub mod websocket;

pub use base::{Ingestor, IngestorCore, IngestorState, IngestorStatus, WebhookDecision};
pub use error::IngestError;
pub use manager::{IngestorManager, WebhookDispatch};
pub use registry::{IngestorRegistry, SpawnContext};
