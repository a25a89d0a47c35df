//! Nostr event model.

use anyhow::{anyhow, Result};
use secp256k1::{schnorr::Signature, Message, XOnlyPublicKey, SECP256K1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codec::PublicKey;

/// Kind 1: short text note.
pub const KIND_TEXT_NOTE: u32 = 1;
/// Kind 4: NIP-04 encrypted direct message.
pub const KIND_ENCRYPTED_DM: u32 = 4;
/// Kind 14: NIP-17 private direct message (sealed inside a gift wrap).
pub const KIND_PRIVATE_DM: u32 = 14;
/// Kind 15: NIP-17 private file message.
pub const KIND_PRIVATE_FILE: u32 = 15;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. The one this crate cares about is
/// `["p", <hex pubkey>, ...]`, which addresses an event to another actor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Nostr event as received from a relay.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "3bf0c63f...",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [["p", "6e46..."]],
///   "content": "hello",
///   "sig": "deadbeef"
/// }
/// ```
///
/// `id` is whatever the relay sent; it is only trusted after [`verify_event`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key.
    pub pubkey: PublicKey,
    /// Kind number, e.g. `1` or `4`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// Public keys referenced by `p` tags, in tag order. Malformed values are
    /// skipped.
    pub fn tagged_pubkeys(&self) -> impl Iterator<Item = PublicKey> + '_ {
        self.tags
            .iter()
            .filter(|t| t.name() == Some("p"))
            .filter_map(|t| t.value())
            .filter_map(|v| PublicKey::from_hex(v).ok())
    }
}

/// Recompute the Nostr event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}

/// Verify an event's ID and Schnorr signature.
pub fn verify_event(ev: &Event) -> Result<()> {
    let hash = event_hash(ev)?;
    let calc_id = hex::encode(hash);
    if calc_id != ev.id {
        return Err(anyhow!("id mismatch"));
    }
    let sig = Signature::from_slice(&hex::decode(&ev.sig)?)?;
    let pk = XOnlyPublicKey::from_slice(ev.pubkey.as_bytes())?;
    let msg = Message::from_digest(hash);
    SECP256K1.verify_schnorr(&sig, &msg, &pk)?;
    Ok(())
}
