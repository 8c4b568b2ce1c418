//! Validator key management using Ed25519.
//!
//! Thin wrappers around `ed25519-dalek` keeping raw bytes on the wire and in
//! the store. Inner bytes are `pub(crate)` so unvalidated keys cannot be
//! constructed outside the crate; use [`SigningKeypair::generate`] or
//! deserialization.

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};

use crate::Hash;

/// Byte length of an Ed25519 public key.
pub const PUBLIC_KEY_BYTES: usize = 32;
/// Byte length of an Ed25519 signature.
pub const SIGNATURE_BYTES: usize = 64;

/// An Ed25519 verifying key (32 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey(pub(crate) [u8; PUBLIC_KEY_BYTES]);

impl PublicKey {
    /// Access the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_BYTES] {
        &self.0
    }

    /// Short identity fingerprint, used as a stable validator address.
    pub fn fingerprint(&self) -> Hash {
        crate::hash_domain(b"aphelion.pubkey.fingerprint", &self.0)
    }

    /// Verify a detached signature over `message`.
    ///
    /// Malformed keys and signatures verify as `false` rather than erroring;
    /// callers only care whether the claimed signer signed the bytes.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify(message, &sig).is_ok()
    }
}

/// A detached Ed25519 signature (64 bytes).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub(crate) [u8; SIGNATURE_BYTES]);

impl Signature {
    /// The all-zero signature, used for unsigned synthetic events (genesis).
    /// Always fails verification.
    pub fn zero() -> Self {
        Signature([0u8; SIGNATURE_BYTES])
    }

    /// Access the raw signature bytes.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_BYTES] {
        &self.0
    }

    /// Rebuild from raw bytes (wire decoding).
    pub fn from_bytes(bytes: [u8; SIGNATURE_BYTES]) -> Self {
        Signature(bytes)
    }
}

impl Default for Signature {
    fn default() -> Self {
        Signature::zero()
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}…)", hex::encode(&self.0[..8]))
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(self.0.as_slice(), s)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        let arr: [u8; SIGNATURE_BYTES] = bytes.as_slice().try_into().map_err(|_| {
            serde::de::Error::custom(format!(
                "invalid Ed25519 signature: expected {} bytes, got {}",
                SIGNATURE_BYTES,
                bytes.len()
            ))
        })?;
        Ok(Signature(arr))
    }
}

/// An Ed25519 signing keypair.
#[derive(Clone)]
pub struct SigningKeypair {
    key: ed25519_dalek::SigningKey,
}

impl SigningKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        SigningKeypair {
            key: ed25519_dalek::SigningKey::generate(&mut rng),
        }
    }

    /// Deterministic keypair from a 32-byte seed. Test and fakenet use only.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        SigningKeypair {
            key: ed25519_dalek::SigningKey::from_bytes(&seed),
        }
    }

    /// The matching public key.
    pub fn public(&self) -> PublicKey {
        PublicKey(self.key.verifying_key().to_bytes())
    }

    /// Sign a message, producing a detached signature.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.key.sign(message).to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let keypair = SigningKeypair::generate();
        let sig = keypair.sign(b"hello");
        assert!(keypair.public().verify(b"hello", &sig));
        assert!(!keypair.public().verify(b"other", &sig));
    }

    #[test]
    fn zero_signature_never_verifies() {
        let keypair = SigningKeypair::generate();
        assert!(!keypair.public().verify(b"hello", &Signature::zero()));
    }

    #[test]
    fn seeded_keypair_is_deterministic() {
        let a = SigningKeypair::from_seed([7u8; 32]);
        let b = SigningKeypair::from_seed([7u8; 32]);
        assert_eq!(a.public(), b.public());
    }
}
