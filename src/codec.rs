//! NIP-19 identity codec: 32-byte public keys as hex and `npub` strings.

use std::fmt;

use bech32::{
    primitives::iter::{ByteIterExt, Fe32IterExt},
    Bech32, Hrp,
};
use serde::{Deserialize, Serialize};

use crate::error::FormatError;

/// NIP-19 human-readable prefixes this crate reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    Npub,
    Nsec,
}

impl Prefix {
    pub fn as_str(self) -> &'static str {
        match self {
            Prefix::Npub => "npub",
            Prefix::Nsec => "nsec",
        }
    }

    fn hrp(self) -> Hrp {
        Hrp::parse_unchecked(self.as_str())
    }
}

/// Binary public key of a Nostr actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse the lowercase hex form used on the wire.
    pub fn from_hex(s: &str) -> Result<Self, FormatError> {
        let bytes = hex::decode(s).map_err(|e| FormatError::Hex(e.to_string()))?;
        to_array(bytes).map(Self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_npub(s: &str) -> Result<Self, FormatError> {
        decode(Prefix::Npub, s).map(Self)
    }

    pub fn to_npub(&self) -> String {
        encode(Prefix::Npub, &self.0)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Encode 32 bytes under `prefix`.
pub fn encode(prefix: Prefix, data: &[u8; 32]) -> String {
    let hrp = prefix.hrp();
    data.iter()
        .copied()
        .bytes_to_fes()
        .with_checksum::<Bech32>(&hrp)
        .chars()
        .collect()
}

/// Decode a bech32 string, requiring the given prefix and a 32-byte payload.
pub fn decode(prefix: Prefix, encoded: &str) -> Result<[u8; 32], FormatError> {
    let (hrp, data) = bech32::decode(encoded).map_err(|e| FormatError::Bech32(e.to_string()))?;
    if hrp != prefix.hrp() {
        return Err(FormatError::Prefix {
            expected: prefix.as_str().to_string(),
            got: hrp.to_string(),
        });
    }
    to_array(data)
}

fn to_array(bytes: Vec<u8>) -> Result<[u8; 32], FormatError> {
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| FormatError::Length(bytes.len()))
}
