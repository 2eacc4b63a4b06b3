//! The 33-byte identifier that addresses everything in the network.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// A 33-byte opaque identifier.
///
/// The first byte tags the key algorithm, the remaining 32 bytes are the
/// public key the identifier was derived from. Entities, objects, oplogs and
/// nodes all share this addressing unit; total ordering is lexicographic on
/// the raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id([u8; Id::LEN]);

impl Id {
    /// Byte length of an identifier.
    pub const LEN: usize = 33;

    /// Algorithm tag for ed25519-derived identifiers.
    pub const TAG_ED25519: u8 = 0x01;

    /// Tag for randomly drawn identifiers (oplog records).
    pub const TAG_RANDOM: u8 = 0x02;

    /// The all-zero identifier, used on the wire for empty optional ids.
    pub const ZERO: Id = Id([0u8; Id::LEN]);

    pub fn from_bytes(bytes: [u8; Id::LEN]) -> Self {
        Id(bytes)
    }

    /// Parses an identifier from a byte slice of exactly [`Id::LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; Id::LEN] = bytes.try_into().ok()?;
        Some(Id(bytes))
    }

    /// Builds an identifier from an algorithm tag and 32 key bytes.
    pub fn from_parts(tag: u8, key: &[u8; 32]) -> Self {
        let mut bytes = [0u8; Id::LEN];
        bytes[0] = tag;
        bytes[1..].copy_from_slice(key);
        Id(bytes)
    }

    /// Draws a fresh random identifier, tagged [`Id::TAG_RANDOM`].
    pub fn random<R: rand_core::RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut key = [0u8; 32];
        rng.fill_bytes(&mut key);
        Id::from_parts(Id::TAG_RANDOM, &key)
    }

    pub fn as_bytes(&self) -> &[u8; Id::LEN] {
        &self.0
    }

    /// The algorithm tag byte.
    pub fn tag(&self) -> u8 {
        self.0[0]
    }

    /// The 32 key bytes following the tag.
    pub fn key_bytes(&self) -> &[u8] {
        &self.0[1..]
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; Id::LEN]
    }

    /// Short hex form for logs.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Id({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::str::FromStr for Id {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Id::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;
        impl de::Visitor<'_> for IdVisitor {
            type Value = Id;
            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "{} bytes", Id::LEN)
            }
            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Id, E> {
                Id::from_slice(v).ok_or_else(|| E::invalid_length(v.len(), &self))
            }
        }
        deserializer.deserialize_bytes(IdVisitor)
    }
}
