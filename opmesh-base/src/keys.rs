//! Signing keys and the 65-byte wire signature.

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::Id;

pub use ed25519_dalek::SignatureError;

/// A node or member signing key.
#[derive(Clone)]
pub struct SecretKey {
    key: SigningKey,
    id: Id,
}

impl SecretKey {
    pub fn generate<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        SigningKey::generate(rng).into()
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        SigningKey::from_bytes(bytes).into()
    }

    /// The identifier derived from this key's public half.
    pub fn id(&self) -> Id {
        self.id
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.key.verifying_key())
    }

    /// Signs a preimage, producing the 65-byte wire signature.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        Signature::from_dalek(&self.key.sign(msg))
    }
}

impl From<SigningKey> for SecretKey {
    fn from(key: SigningKey) -> Self {
        let id = Id::from_parts(Id::TAG_ED25519, key.verifying_key().as_bytes());
        SecretKey { key, id }
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey({})", self.id.fmt_short())
    }
}

/// The public half of a [`SecretKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Recovers the public key embedded in an identifier.
    ///
    /// Fails when the tag byte is unknown or the key bytes are not a valid
    /// curve point.
    pub fn from_id(id: &Id) -> Result<Self, SignatureError> {
        if id.tag() != Id::TAG_ED25519 {
            return Err(SignatureError::new());
        }
        let bytes: [u8; 32] = id.key_bytes().try_into().map_err(|_| SignatureError::new())?;
        Ok(PublicKey(VerifyingKey::from_bytes(&bytes)?))
    }

    pub fn id(&self) -> Id {
        Id::from_parts(Id::TAG_ED25519, self.0.as_bytes())
    }

    pub fn verify(&self, msg: &[u8], sig: &Signature) -> Result<(), SignatureError> {
        self.0.verify_strict(msg, &sig.to_dalek()?)
    }
}

/// A 65-byte wire signature: 64 ed25519 signature bytes plus a version byte.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; Signature::LEN]);

impl Signature {
    /// Byte length of a wire signature.
    pub const LEN: usize = 65;

    /// Version byte appended to the raw signature bytes.
    pub const VERSION: u8 = 0;

    pub fn from_bytes(bytes: [u8; Signature::LEN]) -> Self {
        Signature(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; Signature::LEN] = bytes.try_into().ok()?;
        Some(Signature(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; Signature::LEN] {
        &self.0
    }

    fn from_dalek(sig: &ed25519_dalek::Signature) -> Self {
        let mut bytes = [0u8; Signature::LEN];
        bytes[..64].copy_from_slice(&sig.to_bytes());
        bytes[64] = Signature::VERSION;
        Signature(bytes)
    }

    fn to_dalek(self) -> Result<ed25519_dalek::Signature, SignatureError> {
        if self.0[64] != Signature::VERSION {
            return Err(SignatureError::new());
        }
        let bytes: [u8; 64] = self.0[..64].try_into().expect("fixed split");
        Ok(ed25519_dalek::Signature::from_bytes(&bytes))
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0[..8]))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SigVisitor;
        impl de::Visitor<'_> for SigVisitor {
            type Value = Signature;
            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "{} bytes", Signature::LEN)
            }
            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Signature, E> {
                Signature::from_slice(v).ok_or_else(|| E::invalid_length(v.len(), &self))
            }
        }
        deserializer.deserialize_bytes(SigVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::SeedableRng;

    #[test]
    fn test_sign_verify() {
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(1);
        let key = SecretKey::generate(&mut rng);
        let sig = key.sign(b"hello");
        key.public().verify(b"hello", &sig).unwrap();
        assert!(key.public().verify(b"other", &sig).is_err());
    }

    #[test]
    fn test_public_key_from_id() {
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(2);
        let key = SecretKey::generate(&mut rng);
        let recovered = PublicKey::from_id(&key.id()).unwrap();
        assert_eq!(recovered, key.public());

        assert!(PublicKey::from_id(&Id::ZERO).is_err());
    }
}
