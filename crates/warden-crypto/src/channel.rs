//! Post-handshake encrypted channel: key derivation and AES-256-GCM framing.
//!
//! Wire format of every frame:
//!
//! ```text
//! IV (12) || auth tag (16) || counter (8, big-endian) || ciphertext
//! ```
//!
//! The counter is the sender's frame counter at encryption time, starting at
//! zero. It doubles as the GCM associated data, so tampering with it fails
//! authentication. The receive side runs the frame through a sliding-window
//! replay check (see [`crate::replay`]) before and after decryption.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::replay::ReplayWindow;
use crate::CryptoError;

pub use crate::replay::REPLAY_WINDOW;

/// GCM IV length in bytes.
pub const IV_LEN: usize = 12;
/// GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;
/// Frame counter length in bytes.
pub const COUNTER_LEN: usize = 8;
/// Smallest parseable frame: header with an empty ciphertext.
pub const MIN_FRAME_LEN: usize = IV_LEN + TAG_LEN + COUNTER_LEN;

const INFO_INITIATOR_TO_RESPONDER: &[u8] = b"initiator-to-responder";
const INFO_RESPONDER_TO_INITIATOR: &[u8] = b"responder-to-initiator";
const INFO_SESSION_ID: &[u8] = b"session-id";

/// Which side of the handshake this party played.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Sent the Init message
    Initiator,
    /// Holds the static keys the initiator dialed
    Responder,
}

/// Directional session keys plus the derived session identifier.
///
/// The initiator's `send_key` equals the responder's `recv_key` and vice
/// versa; both sides derive the same `session_id`.
#[derive(Debug, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// AES-256 key for frames this party sends
    pub send_key: [u8; 32],
    /// AES-256 key for frames this party receives
    pub recv_key: [u8; 32],
    /// Hex of 16 HKDF-derived bytes; shared by both sides
    #[zeroize(skip)]
    pub session_id: String,
}

/// Derive directional keys and the session ID from handshake output.
///
/// `transcript_hash` is the SHA-256 over the exact Init and Reply bytes both
/// sides observed; using it as the HKDF salt binds the keys to this one
/// exchange.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivationFailed`] if HKDF expansion fails
/// (output lengths here are fixed and valid, so this is unreachable in
/// practice).
pub fn derive_session_keys(
    shared_secret: &[u8; 32],
    role: Role,
    transcript_hash: &[u8; 32],
) -> Result<SessionKeys, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(transcript_hash), shared_secret);

    let mut i_to_r = [0u8; 32];
    let mut r_to_i = [0u8; 32];
    let mut sid = [0u8; 16];
    hk.expand(INFO_INITIATOR_TO_RESPONDER, &mut i_to_r)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    hk.expand(INFO_RESPONDER_TO_INITIATOR, &mut r_to_i)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    hk.expand(INFO_SESSION_ID, &mut sid)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;

    let session_id = hex::encode(sid);
    let (send_key, recv_key) = match role {
        Role::Initiator => (i_to_r, r_to_i),
        Role::Responder => (r_to_i, i_to_r),
    };

    Ok(SessionKeys {
        send_key,
        recv_key,
        session_id,
    })
}

/// Bidirectional encrypted channel over one session's keys.
///
/// Sends must be serialized by the caller (the gateway holds a per-session
/// lock across decrypt, dispatch, and encrypt); the send counter is unique
/// and monotone under that discipline.
pub struct EncryptedChannel {
    send_cipher: Aes256Gcm,
    recv_cipher: Aes256Gcm,
    session_id: String,
    send_counter: u64,
    replay: ReplayWindow,
}

impl EncryptedChannel {
    /// Build a channel from derived session keys.
    #[must_use]
    pub fn new(keys: &SessionKeys) -> Self {
        Self {
            send_cipher: Aes256Gcm::new((&keys.send_key).into()),
            recv_cipher: Aes256Gcm::new((&keys.recv_key).into()),
            session_id: keys.session_id.clone(),
            send_counter: 0,
            replay: ReplayWindow::new(),
        }
    }

    /// The session identifier both sides derived.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Counter the next encrypt will use.
    #[must_use]
    pub fn send_counter(&self) -> u64 {
        self.send_counter
    }

    /// Encrypt a plaintext into a wire frame.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] on AEAD failure.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let counter = self.send_counter;
        let counter_bytes = counter.to_be_bytes();

        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let sealed = self
            .send_cipher
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: plaintext,
                    aad: &counter_bytes,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;
        // aes-gcm appends the tag; the wire format carries it up front.
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut frame = Vec::with_capacity(MIN_FRAME_LEN + ciphertext.len());
        frame.extend_from_slice(&iv);
        frame.extend_from_slice(tag);
        frame.extend_from_slice(&counter_bytes);
        frame.extend_from_slice(ciphertext);

        self.send_counter += 1;
        Ok(frame)
    }

    /// Decrypt a wire frame, enforcing the anti-replay window.
    ///
    /// Window state only changes after the frame authenticates, so forged
    /// frames cannot poison it.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::MessageTooShort`] for frames under the fixed header
    /// - [`CryptoError::CounterTooOld`] / [`CryptoError::DuplicateCounter`]
    ///   for replay-window violations
    /// - [`CryptoError::DecryptionFailed`] when authentication fails
    pub fn decrypt(&mut self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(CryptoError::MessageTooShort {
                expected: MIN_FRAME_LEN,
                actual: frame.len(),
            });
        }

        let iv = &frame[..IV_LEN];
        let tag = &frame[IV_LEN..IV_LEN + TAG_LEN];
        let mut counter_bytes = [0u8; COUNTER_LEN];
        counter_bytes.copy_from_slice(&frame[IV_LEN + TAG_LEN..MIN_FRAME_LEN]);
        let ciphertext = &frame[MIN_FRAME_LEN..];
        let counter = u64::from_be_bytes(counter_bytes);

        self.replay.precheck(counter)?;

        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let plaintext = self
            .recv_cipher
            .decrypt(
                Nonce::from_slice(iv),
                Payload {
                    msg: &sealed,
                    aad: &counter_bytes,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;

        self.replay.commit(counter);
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_channels() -> (EncryptedChannel, EncryptedChannel) {
        let shared = [7u8; 32];
        let transcript = [9u8; 32];
        let initiator = derive_session_keys(&shared, Role::Initiator, &transcript).unwrap();
        let responder = derive_session_keys(&shared, Role::Responder, &transcript).unwrap();
        (
            EncryptedChannel::new(&initiator),
            EncryptedChannel::new(&responder),
        )
    }

    #[test]
    fn test_derived_keys_complementary() {
        let shared = [1u8; 32];
        let transcript = [2u8; 32];
        let initiator = derive_session_keys(&shared, Role::Initiator, &transcript).unwrap();
        let responder = derive_session_keys(&shared, Role::Responder, &transcript).unwrap();

        assert_eq!(initiator.send_key, responder.recv_key);
        assert_eq!(initiator.recv_key, responder.send_key);
        assert_eq!(initiator.session_id, responder.session_id);
        assert_eq!(initiator.session_id.len(), 32);
    }

    #[test]
    fn test_transcript_changes_keys() {
        let shared = [1u8; 32];
        let a = derive_session_keys(&shared, Role::Initiator, &[3u8; 32]).unwrap();
        let b = derive_session_keys(&shared, Role::Initiator, &[4u8; 32]).unwrap();
        assert_ne!(a.send_key, b.send_key);
        assert_ne!(a.session_id, b.session_id);
    }

    #[test]
    fn test_roundtrip() {
        let (mut alice, mut bob) = paired_channels();
        let frame = alice.encrypt(b"hello bob").unwrap();
        assert_eq!(bob.decrypt(&frame).unwrap(), b"hello bob");

        let reply = bob.encrypt(b"hello alice").unwrap();
        assert_eq!(alice.decrypt(&reply).unwrap(), b"hello alice");
    }

    #[test]
    fn test_counters_increase() {
        let (mut alice, _) = paired_channels();
        for expected in 0..5u64 {
            assert_eq!(alice.send_counter(), expected);
            alice.encrypt(b"x").unwrap();
        }
    }

    #[test]
    fn test_replay_rejected() {
        let (mut alice, mut bob) = paired_channels();
        let frame = alice.encrypt(b"once").unwrap();
        bob.decrypt(&frame).unwrap();
        assert!(matches!(
            bob.decrypt(&frame),
            Err(CryptoError::DuplicateCounter(0))
        ));
    }

    #[test]
    fn test_out_of_order_accepted_once() {
        let (mut alice, mut bob) = paired_channels();
        let first = alice.encrypt(b"first").unwrap();
        let second = alice.encrypt(b"second").unwrap();

        assert_eq!(bob.decrypt(&second).unwrap(), b"second");
        assert_eq!(bob.decrypt(&first).unwrap(), b"first");
        assert!(bob.decrypt(&second).is_err());
        assert!(bob.decrypt(&first).is_err());
    }

    #[test]
    fn test_frame_beyond_window_too_old() {
        let (mut alice, mut bob) = paired_channels();
        let stale = alice.encrypt(b"stale").unwrap();
        for _ in 0..=REPLAY_WINDOW {
            let frame = alice.encrypt(b"filler").unwrap();
            bob.decrypt(&frame).unwrap();
        }
        assert!(matches!(
            bob.decrypt(&stale),
            Err(CryptoError::CounterTooOld(0))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let (mut alice, mut bob) = paired_channels();
        let mut frame = alice.encrypt(b"integrity").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(matches!(
            bob.decrypt(&frame),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_tampered_counter_rejected() {
        let (mut alice, mut bob) = paired_channels();
        let mut frame = alice.encrypt(b"counter bound").unwrap();
        // Counter sits after IV and tag; flipping it must break the AAD.
        frame[IV_LEN + TAG_LEN + 7] ^= 0x01;
        assert!(matches!(
            bob.decrypt(&frame),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_tamper_does_not_poison_window() {
        let (mut alice, mut bob) = paired_channels();
        let good = alice.encrypt(b"good").unwrap();
        let mut bad = good.clone();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;

        assert!(bob.decrypt(&bad).is_err());
        // The genuine frame with the same counter still decrypts.
        assert_eq!(bob.decrypt(&good).unwrap(), b"good");
    }

    #[test]
    fn test_short_frame_rejected() {
        let (_, mut bob) = paired_channels();
        assert!(matches!(
            bob.decrypt(&[0u8; MIN_FRAME_LEN - 1]),
            Err(CryptoError::MessageTooShort { .. })
        ));
    }

    #[test]
    fn test_cross_session_frame_rejected() {
        let (mut alice, _) = paired_channels();

        let other_keys =
            derive_session_keys(&[42u8; 32], Role::Responder, &[43u8; 32]).unwrap();
        let mut other_responder = EncryptedChannel::new(&other_keys);

        let frame = alice.encrypt(b"wrong session").unwrap();
        assert!(matches!(
            other_responder.decrypt(&frame),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let (mut alice, mut bob) = paired_channels();
        let frame = alice.encrypt(b"").unwrap();
        assert_eq!(frame.len(), MIN_FRAME_LEN);
        assert_eq!(bob.decrypt(&frame).unwrap(), b"");
    }
}
