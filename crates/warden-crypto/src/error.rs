//! Error types for Warden cryptographic operations.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Frame shorter than the fixed header
    #[error("Message too short: expected at least {expected} bytes, got {actual}")]
    MessageTooShort {
        /// Minimum frame length
        expected: usize,
        /// Actual length received
        actual: usize,
    },

    /// Counter already accepted once
    #[error("duplicate counter {0}")]
    DuplicateCounter(u64),

    /// Counter fell out of the sliding window
    #[error("counter {0} too old")]
    CounterTooOld(u64),

    /// AEAD authentication failed
    #[error("decryption failed: tampered ciphertext or wrong key")]
    DecryptionFailed,

    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// Key derivation failed
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// Public key bytes were not a valid curve point
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Signature verification failed or bytes malformed
    #[error("invalid signature")]
    InvalidSignature,

    /// PEM armor missing, mislabeled, or wrong payload size
    #[error("invalid PEM: {0}")]
    InvalidPem(String),

    /// Key exchange produced an all-zero shared secret
    #[error("key exchange rejected: low-order peer point")]
    LowOrderPoint,

    /// Handshake-level failure; the detail stays server-side
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Peer requested a protocol version we do not speak
    #[error("unsupported handshake version {0}")]
    UnsupportedVersion(u32),

    /// Wire message was not valid JSON for its type
    #[error("malformed handshake message: {0}")]
    MalformedMessage(String),

    /// Key file I/O
    #[error("key file error: {0}")]
    Io(#[from] std::io::Error),
}
