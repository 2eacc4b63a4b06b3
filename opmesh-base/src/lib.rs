//! Base types for opmesh: identifiers, timestamps and signing keys.
//!
//! Everything here is shared between the replication core and any
//! instantiation of it. The types are deliberately small and wire-stable:
//! [`Id`] is 33 bytes, [`Timestamp`] marshals to 12 big-endian bytes and
//! [`Signature`] to 65 bytes.

pub mod id;
pub mod keys;
pub mod timestamp;

pub use id::Id;
pub use keys::{PublicKey, SecretKey, Signature, SignatureError};
pub use timestamp::{Clock, SystemClock, Timestamp};

/// A 24-byte random salt mixed into every signed preimage.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Salt(pub [u8; Salt::LEN]);

impl Salt {
    /// Byte length of a salt.
    pub const LEN: usize = 24;

    /// An all-zero salt, only used as a placeholder before signing.
    pub const ZERO: Salt = Salt([0u8; Salt::LEN]);

    /// Generates a fresh random salt.
    pub fn generate<R: rand_core::RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; Salt::LEN];
        rng.fill_bytes(&mut bytes);
        Salt(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Salt::LEN] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; Salt::LEN]) -> Self {
        Salt(bytes)
    }
}

impl std::fmt::Debug for Salt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Salt({})", hex::encode(self.0))
    }
}

impl serde::Serialize for Salt {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Salt {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SaltVisitor;
        impl serde::de::Visitor<'_> for SaltVisitor {
            type Value = Salt;
            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "{} bytes", Salt::LEN)
            }
            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Salt, E> {
                let bytes: [u8; Salt::LEN] = v
                    .try_into()
                    .map_err(|_| E::invalid_length(v.len(), &self))?;
                Ok(Salt(bytes))
            }
        }
        deserializer.deserialize_bytes(SaltVisitor)
    }
}
