//! # Warden Core
//!
//! Gateway-side model for the Warden secrets-isolation gateway:
//!
//! - Route (connector) definitions, placeholder resolution, and glob
//!   endpoint allowlists
//! - Session lifecycle: pending handshakes, active sessions, TTL sweeps,
//!   and per-session rate limiting
//! - Ingested-event shapes and the fixed-capacity ring buffer behind every
//!   ingestor
//! - The resolved configuration data model (server, callers, connectors)
//!
//! Secrets only ever live inside [`route::ResolvedRoute`]; they substitute
//! into outbound requests for their own route and are never logged or
//! returned to clients.

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod events;
pub mod ring_buffer;
pub mod route;
pub mod session;
pub mod templates;

pub use config::{CallerConfig, IngestorConfig, RouteConfig, ServerConfig};
pub use error::GatewayError;
pub use events::IngestedEvent;
pub use ring_buffer::EventBuffer;
pub use route::ResolvedRoute;
pub use session::{Session, SessionManager};
