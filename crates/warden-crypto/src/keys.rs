//! Identity key bundles: Ed25519 signing plus X25519 key exchange.
//!
//! Every party (the gateway and each caller) owns one [`KeyBundle`]; the
//! shareable halves travel as a [`PublicKeyBundle`]. Keys serialize as PEM
//! with raw 32-byte payloads under explicit tags, so a bundle on disk is
//! self-describing without any ASN.1 machinery.

use ed25519_dalek::{Signer, Verifier};
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};

use crate::CryptoError;

/// PEM tag for Ed25519 public keys.
pub const ED25519_PUBLIC_TAG: &str = "ED25519 PUBLIC KEY";
/// PEM tag for Ed25519 private keys.
pub const ED25519_PRIVATE_TAG: &str = "ED25519 PRIVATE KEY";
/// PEM tag for X25519 public keys.
pub const X25519_PUBLIC_TAG: &str = "X25519 PUBLIC KEY";
/// PEM tag for X25519 private keys.
pub const X25519_PRIVATE_TAG: &str = "X25519 PRIVATE KEY";

/// Encode a raw key as PEM under the given tag.
#[must_use]
pub fn encode_pem(tag: &str, bytes: &[u8]) -> String {
    pem::encode(&pem::Pem::new(tag, bytes.to_vec()))
}

/// Decode a PEM block, checking its tag and expecting a 32-byte payload.
pub fn decode_pem_32(tag: &str, input: &str) -> Result<[u8; 32], CryptoError> {
    let block = pem::parse(input).map_err(|e| CryptoError::InvalidPem(e.to_string()))?;
    if block.tag() != tag {
        return Err(CryptoError::InvalidPem(format!(
            "expected tag {tag:?}, found {:?}",
            block.tag()
        )));
    }
    let contents = block.contents();
    if contents.len() != 32 {
        return Err(CryptoError::InvalidPem(format!(
            "expected 32-byte payload, found {}",
            contents.len()
        )));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(contents);
    Ok(out)
}

/// Ed25519 signing keypair.
///
/// The private half is zeroized on drop by `ed25519-dalek`.
pub struct SigningKeypair {
    inner: ed25519_dalek::SigningKey,
}

impl SigningKeypair {
    /// Generate a new random signing keypair.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::generate(rng),
        }
    }

    /// Sign a message, producing a 64-byte Ed25519 signature.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.inner.sign(message).to_bytes()
    }

    /// The corresponding verifying (public) key.
    #[must_use]
    pub fn verifying_key(&self) -> ed25519_dalek::VerifyingKey {
        self.inner.verifying_key()
    }

    /// Public half as PEM.
    #[must_use]
    pub fn public_pem(&self) -> String {
        encode_pem(ED25519_PUBLIC_TAG, self.inner.verifying_key().as_bytes())
    }

    /// Private half as PEM.
    ///
    /// # Security
    ///
    /// The output contains the raw seed. Write it only through
    /// [`crate::keystore`], which applies restrictive file modes.
    #[must_use]
    pub fn private_pem(&self) -> String {
        encode_pem(ED25519_PRIVATE_TAG, &self.inner.to_bytes())
    }

    /// Restore a keypair from its private PEM.
    pub fn from_private_pem(input: &str) -> Result<Self, CryptoError> {
        let seed = decode_pem_32(ED25519_PRIVATE_TAG, input)?;
        Ok(Self {
            inner: ed25519_dalek::SigningKey::from_bytes(&seed),
        })
    }
}

/// X25519 key-exchange keypair.
pub struct ExchangeKeypair {
    secret: x25519_dalek::StaticSecret,
    public: x25519_dalek::PublicKey,
}

impl ExchangeKeypair {
    /// Generate a new random exchange keypair.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = x25519_dalek::StaticSecret::random_from_rng(rng);
        let public = x25519_dalek::PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public half.
    #[must_use]
    pub fn public_key(&self) -> x25519_dalek::PublicKey {
        self.public
    }

    /// Public half as PEM.
    #[must_use]
    pub fn public_pem(&self) -> String {
        encode_pem(X25519_PUBLIC_TAG, self.public.as_bytes())
    }

    /// Private half as PEM. See [`SigningKeypair::private_pem`] for handling.
    #[must_use]
    pub fn private_pem(&self) -> String {
        encode_pem(X25519_PRIVATE_TAG, &self.secret.to_bytes())
    }

    /// Restore a keypair from its private PEM.
    pub fn from_private_pem(input: &str) -> Result<Self, CryptoError> {
        let bytes = decode_pem_32(X25519_PRIVATE_TAG, input)?;
        let secret = x25519_dalek::StaticSecret::from(bytes);
        let public = x25519_dalek::PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    /// Perform Diffie-Hellman with a peer public key.
    ///
    /// Rejects low-order peer points (all-zero shared secret).
    pub fn diffie_hellman(
        &self,
        peer: &x25519_dalek::PublicKey,
    ) -> Result<[u8; 32], CryptoError> {
        let shared = self.secret.diffie_hellman(peer);
        if shared.as_bytes() == &[0u8; 32] {
            return Err(CryptoError::LowOrderPoint);
        }
        Ok(*shared.as_bytes())
    }
}

/// Parse an Ed25519 verifying key from PEM.
pub fn verifying_key_from_pem(input: &str) -> Result<ed25519_dalek::VerifyingKey, CryptoError> {
    let bytes = decode_pem_32(ED25519_PUBLIC_TAG, input)?;
    ed25519_dalek::VerifyingKey::from_bytes(&bytes).map_err(|_| CryptoError::InvalidPublicKey)
}

/// Parse an X25519 public key from PEM.
pub fn exchange_key_from_pem(input: &str) -> Result<x25519_dalek::PublicKey, CryptoError> {
    let bytes = decode_pem_32(X25519_PUBLIC_TAG, input)?;
    Ok(x25519_dalek::PublicKey::from(bytes))
}

/// Verify an Ed25519 signature.
pub fn verify_signature(
    key: &ed25519_dalek::VerifyingKey,
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    if signature.len() != 64 {
        return Err(CryptoError::InvalidSignature);
    }
    let mut sig = [0u8; 64];
    sig.copy_from_slice(signature);
    key.verify(message, &ed25519_dalek::Signature::from_bytes(&sig))
        .map_err(|_| CryptoError::InvalidSignature)
}

/// One identity: signing plus exchange keypairs.
pub struct KeyBundle {
    /// Ed25519 signing keypair
    pub signing: SigningKeypair,
    /// X25519 key-exchange keypair
    pub exchange: ExchangeKeypair,
}

impl KeyBundle {
    /// Generate a fresh identity.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            signing: SigningKeypair::generate(rng),
            exchange: ExchangeKeypair::generate(rng),
        }
    }

    /// The shareable halves.
    #[must_use]
    pub fn public_bundle(&self) -> PublicKeyBundle {
        PublicKeyBundle {
            signing: self.signing.verifying_key(),
            exchange: self.exchange.public_key(),
        }
    }
}

/// The shareable halves of a [`KeyBundle`], stored on disk per peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKeyBundle {
    /// Ed25519 verifying key
    pub signing: ed25519_dalek::VerifyingKey,
    /// X25519 public key
    pub exchange: x25519_dalek::PublicKey,
}

impl PublicKeyBundle {
    /// Signing key as PEM.
    #[must_use]
    pub fn signing_pem(&self) -> String {
        encode_pem(ED25519_PUBLIC_TAG, self.signing.as_bytes())
    }

    /// Exchange key as PEM.
    #[must_use]
    pub fn exchange_pem(&self) -> String {
        encode_pem(X25519_PUBLIC_TAG, self.exchange.as_bytes())
    }

    /// Restore from the two public PEMs.
    pub fn from_pems(signing: &str, exchange: &str) -> Result<Self, CryptoError> {
        Ok(Self {
            signing: verifying_key_from_pem(signing)?,
            exchange: exchange_key_from_pem(exchange)?,
        })
    }

    /// Short fingerprint for human verification during setup.
    ///
    /// First 16 hex characters of SHA-256 over the signing key, grouped by
    /// four: `ab12:cd34:ef56:7890`.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.signing.as_bytes());
        let hex = hex::encode(&digest[..8]);
        hex.as_bytes()
            .chunks(4)
            .map(|c| std::str::from_utf8(c).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(":")
    }
}
