//! Three-message mutual-authentication handshake.
//!
//! Noise-NK flavor: the initiator already knows the responder's static keys;
//! both sides sign fresh X25519 ephemerals with their long-term Ed25519 keys
//! and derive directional session keys bound to the full transcript.
//!
//! ```text
//! Initiator                              Responder
//!     |                                       |
//!     |-- Init: signing pub, eph pub,  ------>|  verify sig, authorize peer
//!     |         nonce, sig(eph || nonce)      |
//!     |                                       |
//!     |<- Reply: eph pub, nonce, -------------|  sign(eph || nonceR || nonceI)
//!     |                                       |
//!     |-- Finish: AES-GCM frame of ---------->|  decrypt proves matching keys
//!     |   {"status":"ready",...}              |
//! ```
//!
//! The transcript hash is SHA-256 over the exact Init and Reply JSON bytes
//! both sides observed; a mismatch anywhere surfaces as a Finish decryption
//! failure. All failure modes collapse to a generic "handshake failed" for
//! the client while the detailed reason goes to the server audit log.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::channel::{derive_session_keys, Role, SessionKeys};
use crate::keys::{
    exchange_key_from_pem, verify_signature, verifying_key_from_pem, ExchangeKeypair, KeyBundle,
    PublicKeyBundle,
};
use crate::{CryptoError, HANDSHAKE_VERSION, NONCE_SIZE};

/// Init message, initiator to responder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeInit {
    /// Protocol version; only [`HANDSHAKE_VERSION`] is accepted.
    pub version: u32,
    /// Initiator's Ed25519 public key, PEM.
    pub signing_pub_key: String,
    /// Initiator's ephemeral X25519 public key, PEM.
    pub ephemeral_pub_key: String,
    /// 32 random bytes, hex.
    pub nonce: String,
    /// Ed25519 over `ephemeral_pub_key || nonce_raw`, hex.
    pub signature: String,
}

/// Reply message, responder to initiator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeReply {
    /// Responder's ephemeral X25519 public key, PEM.
    pub ephemeral_pub_key: String,
    /// 32 random bytes, hex.
    pub nonce: String,
    /// Ed25519 over `ephemeral_pub_key || nonce_raw || init_nonce_raw`, hex.
    pub signature: String,
}

/// Plaintext carried inside the encrypted Finish frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishPayload {
    /// Always `"ready"`.
    pub status: String,
    /// Sender clock, unix milliseconds.
    pub timestamp: u64,
}

/// A peer the responder will accept handshakes from.
#[derive(Clone, Debug)]
pub struct AuthorizedPeer {
    /// Stable identifier used for routing and audit.
    pub alias: String,
    /// Human-readable label.
    pub name: Option<String>,
    /// The peer's public keys.
    pub keys: PublicKeyBundle,
}

/// Everything the responder needs after a valid Init: the Reply to send,
/// the derived keys, and who the initiator turned out to be.
#[derive(Debug)]
pub struct ResponderOutcome {
    /// Exact Reply bytes to return; they are part of the transcript.
    pub reply_bytes: Vec<u8>,
    /// Derived directional keys (responder role).
    pub keys: SessionKeys,
    /// Alias of the authorized peer that signed the Init.
    pub peer_alias: String,
}

fn decode_nonce(hex_nonce: &str) -> Result<[u8; NONCE_SIZE], CryptoError> {
    let bytes = hex::decode(hex_nonce)
        .map_err(|e| CryptoError::MalformedMessage(format!("nonce not hex: {e}")))?;
    if bytes.len() != NONCE_SIZE {
        return Err(CryptoError::MalformedMessage(format!(
            "nonce must be {NONCE_SIZE} bytes, got {}",
            bytes.len()
        )));
    }
    let mut out = [0u8; NONCE_SIZE];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn transcript_hash(init_bytes: &[u8], reply_bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(init_bytes);
    hasher.update(reply_bytes);
    hasher.finalize().into()
}

/// Initiator side of the handshake.
///
/// Holds the ephemeral secret and the exact Init bytes between sending Init
/// and receiving Reply.
pub struct HandshakeInitiator {
    remote: PublicKeyBundle,
    ephemeral: ExchangeKeypair,
    nonce: [u8; NONCE_SIZE],
    init_bytes: Vec<u8>,
}

impl HandshakeInitiator {
    /// Build the Init message for a responder whose keys we already trust.
    pub fn start(local: &KeyBundle, remote: PublicKeyBundle) -> Result<Self, CryptoError> {
        let mut rng = rand::rngs::OsRng;
        let ephemeral = ExchangeKeypair::generate(&mut rng);

        let mut nonce = [0u8; NONCE_SIZE];
        rand::RngCore::fill_bytes(&mut rng, &mut nonce);

        let ephemeral_pem = ephemeral.public_pem();
        let mut signed = Vec::with_capacity(ephemeral_pem.len() + NONCE_SIZE);
        signed.extend_from_slice(ephemeral_pem.as_bytes());
        signed.extend_from_slice(&nonce);
        let signature = local.signing.sign(&signed);

        let init = HandshakeInit {
            version: HANDSHAKE_VERSION,
            signing_pub_key: local.signing.public_pem(),
            ephemeral_pub_key: ephemeral_pem,
            nonce: hex::encode(nonce),
            signature: hex::encode(signature),
        };
        let init_bytes = serde_json::to_vec(&init)
            .map_err(|e| CryptoError::MalformedMessage(e.to_string()))?;

        Ok(Self {
            remote,
            ephemeral,
            nonce,
            init_bytes,
        })
    }

    /// The exact Init bytes to send; they are part of the transcript.
    #[must_use]
    pub fn init_bytes(&self) -> &[u8] {
        &self.init_bytes
    }

    /// Process the responder's Reply and derive session keys.
    pub fn complete(self, reply_bytes: &[u8]) -> Result<SessionKeys, CryptoError> {
        let reply: HandshakeReply = serde_json::from_slice(reply_bytes)
            .map_err(|e| CryptoError::MalformedMessage(format!("reply not JSON: {e}")))?;

        let reply_nonce = decode_nonce(&reply.nonce)?;
        let signature = hex::decode(&reply.signature)
            .map_err(|_| CryptoError::HandshakeFailed("responder signature invalid".into()))?;

        let mut signed =
            Vec::with_capacity(reply.ephemeral_pub_key.len() + NONCE_SIZE * 2);
        signed.extend_from_slice(reply.ephemeral_pub_key.as_bytes());
        signed.extend_from_slice(&reply_nonce);
        signed.extend_from_slice(&self.nonce);
        verify_signature(&self.remote.signing, &signed, &signature)
            .map_err(|_| CryptoError::HandshakeFailed("responder signature invalid".into()))?;

        let responder_ephemeral = exchange_key_from_pem(&reply.ephemeral_pub_key)?;
        let shared = self.ephemeral.diffie_hellman(&responder_ephemeral)?;
        let transcript = transcript_hash(&self.init_bytes, reply_bytes);

        derive_session_keys(&shared, Role::Initiator, &transcript)
    }
}

/// Responder side: process an Init, authorize the peer, emit the Reply.
///
/// # Errors
///
/// Every invalid input collapses to a [`CryptoError`] whose message names the
/// reason; callers must forward only a generic failure to the network.
pub fn respond_to_init(
    local: &KeyBundle,
    peers: &[AuthorizedPeer],
    init_bytes: &[u8],
) -> Result<ResponderOutcome, CryptoError> {
    let init: HandshakeInit = serde_json::from_slice(init_bytes)
        .map_err(|e| CryptoError::MalformedMessage(format!("init not JSON: {e}")))?;

    if init.version != HANDSHAKE_VERSION {
        return Err(CryptoError::UnsupportedVersion(init.version));
    }

    let initiator_signing = verifying_key_from_pem(&init.signing_pub_key)?;
    let peer = authorize(peers, &initiator_signing)
        .ok_or_else(|| CryptoError::HandshakeFailed("initiator not authorized".into()))?;

    let init_nonce = decode_nonce(&init.nonce)?;
    let signature = hex::decode(&init.signature)
        .map_err(|_| CryptoError::HandshakeFailed("initiator signature invalid".into()))?;

    let mut signed = Vec::with_capacity(init.ephemeral_pub_key.len() + NONCE_SIZE);
    signed.extend_from_slice(init.ephemeral_pub_key.as_bytes());
    signed.extend_from_slice(&init_nonce);
    verify_signature(&initiator_signing, &signed, &signature)
        .map_err(|_| CryptoError::HandshakeFailed("initiator signature invalid".into()))?;

    let initiator_ephemeral = exchange_key_from_pem(&init.ephemeral_pub_key)?;

    let mut rng = rand::rngs::OsRng;
    let ephemeral = ExchangeKeypair::generate(&mut rng);
    let mut reply_nonce = [0u8; NONCE_SIZE];
    rand::RngCore::fill_bytes(&mut rng, &mut reply_nonce);

    let ephemeral_pem = ephemeral.public_pem();
    let mut to_sign = Vec::with_capacity(ephemeral_pem.len() + NONCE_SIZE * 2);
    to_sign.extend_from_slice(ephemeral_pem.as_bytes());
    to_sign.extend_from_slice(&reply_nonce);
    to_sign.extend_from_slice(&init_nonce);
    let reply_signature = local.signing.sign(&to_sign);

    let reply = HandshakeReply {
        ephemeral_pub_key: ephemeral_pem,
        nonce: hex::encode(reply_nonce),
        signature: hex::encode(reply_signature),
    };
    let reply_bytes = serde_json::to_vec(&reply)
        .map_err(|e| CryptoError::MalformedMessage(e.to_string()))?;

    let shared = ephemeral.diffie_hellman(&initiator_ephemeral)?;
    let transcript = transcript_hash(init_bytes, &reply_bytes);
    let keys = derive_session_keys(&shared, Role::Responder, &transcript)?;

    Ok(ResponderOutcome {
        reply_bytes,
        keys,
        peer_alias: peer.alias.clone(),
    })
}

/// Find the authorized peer matching a signing key, comparing in constant
/// time and scanning the whole set regardless of where the match sits.
fn authorize<'a>(
    peers: &'a [AuthorizedPeer],
    signing: &ed25519_dalek::VerifyingKey,
) -> Option<&'a AuthorizedPeer> {
    let mut found: Option<&AuthorizedPeer> = None;
    for peer in peers {
        let matches: bool = peer
            .keys
            .signing
            .as_bytes()
            .ct_eq(signing.as_bytes())
            .into();
        if matches && found.is_none() {
            found = Some(peer);
        }
    }
    found
}

/// Build the plaintext for the Finish frame.
#[must_use]
pub fn finish_payload() -> Vec<u8> {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    serde_json::to_vec(&FinishPayload {
        status: "ready".into(),
        timestamp,
    })
    .unwrap_or_default()
}

/// Validate a decrypted Finish payload.
pub fn verify_finish_payload(plaintext: &[u8]) -> Result<(), CryptoError> {
    let payload: FinishPayload = serde_json::from_slice(plaintext)
        .map_err(|e| CryptoError::MalformedMessage(format!("finish not JSON: {e}")))?;
    if payload.status != "ready" {
        return Err(CryptoError::HandshakeFailed(format!(
            "unexpected finish status {:?}",
            payload.status
        )));
    }
    Ok(())
}
