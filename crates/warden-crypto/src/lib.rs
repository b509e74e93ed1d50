//! # Warden Crypto
//!
//! Cryptographic core for the Warden secrets-isolation gateway.
//!
//! This crate provides:
//! - Identity key bundles (Ed25519 signing + X25519 key exchange) with PEM
//!   serialization and an on-disk store
//! - The three-message mutual-authentication handshake (static responder,
//!   ephemeral ECDH, transcript-bound key derivation)
//! - The encrypted channel: HKDF-SHA256 key derivation, AES-256-GCM framing,
//!   and sliding-window anti-replay
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | Key Exchange | X25519 (ephemeral) |
//! | Signatures | Ed25519 |
//! | AEAD | AES-256-GCM |
//! | Hash / KDF | SHA-256 / HKDF-SHA256 |
//!
//! The channel is the security boundary between the local proxy and the
//! remote gateway; no transport TLS is assumed underneath it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod error;
pub mod handshake;
pub mod keys;
pub mod keystore;
pub mod replay;

pub use channel::{EncryptedChannel, Role, SessionKeys};
pub use error::CryptoError;
pub use handshake::{AuthorizedPeer, HandshakeInitiator, respond_to_init};
pub use keys::{KeyBundle, PublicKeyBundle};

/// Ed25519 public key size
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// Handshake nonce size
pub const NONCE_SIZE: usize = 32;

/// Supported handshake protocol version
pub const HANDSHAKE_VERSION: u32 = 1;
