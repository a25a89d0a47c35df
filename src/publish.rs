//! Signing and publishing test notes.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use secp256k1::{Keypair, Message as Digest, SECP256K1};
use tokio_tungstenite::tungstenite::Message;

use crate::{
    codec::{self, Prefix, PublicKey},
    config::Settings,
    error::RelayError,
    event::{event_hash, Event, Tag, KIND_TEXT_NOTE},
    message::{ClientMessage, RelayMessage},
    relay::connect_ws,
};

/// Secret key decoded from an `nsec`.
pub fn keypair_from_nsec(nsec: &str) -> Result<Keypair> {
    let bytes = codec::decode(Prefix::Nsec, nsec.trim()).context("decoding SENDER_NSEC")?;
    Ok(Keypair::from_seckey_slice(SECP256K1, &bytes)?)
}

/// Fill in `pubkey`, `id`, and `sig` for an unsigned note.
pub fn sign_event(
    kp: &Keypair,
    kind: u32,
    tags: Vec<Tag>,
    content: &str,
    created_at: u64,
) -> Result<Event> {
    let mut ev = Event {
        id: String::new(),
        pubkey: PublicKey::from_bytes(kp.x_only_public_key().0.serialize()),
        kind,
        created_at,
        tags,
        content: content.to_string(),
        sig: String::new(),
    };
    let hash = event_hash(&ev)?;
    ev.id = hex::encode(hash);
    let sig = SECP256K1.sign_schnorr_no_aux_rand(&Digest::from_digest(hash), kp);
    ev.sig = hex::encode(sig.as_ref());
    Ok(ev)
}

/// Kind-1 note that mentions `recipient` and is tagged `#testing`.
pub fn test_note(kp: &Keypair, recipient: &PublicKey, msg: &str) -> Result<Event> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let tags = vec![
        Tag(vec!["p".into(), recipient.to_hex(), String::new(), "mention".into()]),
        Tag(vec!["t".into(), "testing".into()]),
    ];
    sign_event(kp, KIND_TEXT_NOTE, tags, msg, now)
}

/// What a relay said about a published event.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishReply {
    Accepted(String),
    Rejected(String),
    Notice(String),
    /// Nothing relevant arrived before the deadline.
    NoReply,
}

impl PublishReply {
    /// Anything short of an explicit rejection counts.
    pub fn is_success(&self) -> bool {
        !matches!(self, PublishReply::Rejected(_))
    }
}

/// Send `event` to `relay` and wait up to `wait` for its `OK` or a `NOTICE`.
pub async fn publish(
    relay: &str,
    event: &Event,
    tor_socks: Option<&str>,
    connect_timeout: Duration,
    wait: Duration,
) -> Result<PublishReply, RelayError> {
    let mut ws = tokio::time::timeout(connect_timeout, connect_ws(relay, tor_socks))
        .await
        .map_err(|_| RelayError::Timeout(connect_timeout.as_secs()))??;
    ws.send(Message::Text(ClientMessage::Event(event).to_json()))
        .await?;

    let deadline = tokio::time::Instant::now() + wait;
    let reply = loop {
        let next = match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => break PublishReply::NoReply,
            Ok(None) => break PublishReply::NoReply,
            Ok(Some(frame)) => frame?,
        };
        let Message::Text(txt) = next else {
            continue;
        };
        match RelayMessage::parse(&txt) {
            Some(RelayMessage::Ok {
                event_id,
                accepted,
                message,
            }) if event_id == event.id => {
                break if accepted {
                    PublishReply::Accepted(message)
                } else {
                    PublishReply::Rejected(message)
                };
            }
            Some(RelayMessage::Notice(text)) => break PublishReply::Notice(text),
            _ => {}
        }
    };
    if let Err(e) = ws.close(None).await {
        tracing::debug!(%relay, error = %e, "websocket close failed");
    }
    Ok(reply)
}

/// `send-test`: publish a signed mention of `to` to every configured relay.
pub async fn send_test(cfg: &Settings, to: &str, msg: &str) -> Result<()> {
    let Some(nsec) = cfg.sender_nsec.as_deref() else {
        bail!("SENDER_NSEC is not set");
    };
    if cfg.relays.is_empty() {
        bail!("no relays configured (RELAYS)");
    }
    let kp = keypair_from_nsec(nsec)?;
    let recipient = PublicKey::from_npub(to.trim()).context("decoding --to")?;
    let event = test_note(&kp, &recipient, msg)?;
    println!("event {} from {}", event.id, event.pubkey.to_npub());

    let mut ok = 0;
    for relay in &cfg.relays {
        let res = publish(
            relay,
            &event,
            cfg.tor_socks.as_deref(),
            cfg.connect_timeout,
            cfg.read_timeout,
        )
        .await;
        match res {
            Ok(reply) => {
                println!("{relay}: {reply:?}");
                if reply.is_success() {
                    ok += 1;
                }
            }
            Err(e) => {
                tracing::warn!(%relay, error = %e, "publish failed");
                println!("{relay}: error: {e}");
            }
        }
    }
    if ok == 0 {
        bail!("no relay accepted the test note");
    }
    println!("published to {ok}/{} relays", cfg.relays.len());
    Ok(())
}
