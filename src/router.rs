//! Classifies relay events, matches them to watched users, and hands
//! notification jobs to the mailer.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio_util::task::TaskTracker;

use crate::{
    config::DedupScope,
    dedup::DedupStore,
    event::{verify_event, Event, KIND_ENCRYPTED_DM, KIND_PRIVATE_DM, KIND_PRIVATE_FILE, KIND_TEXT_NOTE},
    notify::{render, Links, Mailer, NoticeKind},
    verify::{TrustPolicy, Verifier},
    watch::{WatchEntry, WatchList},
};

/// What an event is, judged by its kind alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Mention,
    DirectMessage,
    /// Gift-wrapped private messages; reading them needs the recipient's key.
    PrivateEnvelope,
    Unclassified,
}

pub fn classify(kind: u32) -> Classification {
    match kind {
        KIND_TEXT_NOTE => Classification::Mention,
        KIND_ENCRYPTED_DM => Classification::DirectMessage,
        KIND_PRIVATE_DM | KIND_PRIVATE_FILE => Classification::PrivateEnvelope,
        _ => Classification::Unclassified,
    }
}

/// Watched users an event is addressed to. `p` tags match for every class;
/// mentions also match on content.
pub fn recipients<'a>(
    watch: &'a WatchList,
    class: Classification,
    event: &Event,
) -> Vec<&'a WatchEntry> {
    let mut out: Vec<&WatchEntry> = Vec::new();
    if !matches!(class, Classification::Mention | Classification::DirectMessage) {
        return out;
    }
    for pk in event.tagged_pubkeys() {
        if let Some(entry) = watch.by_pubkey(&pk) {
            if !out.iter().any(|e| e.pubkey == entry.pubkey) {
                out.push(entry);
            }
        }
    }
    if class == Classification::Mention {
        for entry in watch.entries() {
            if !out.iter().any(|e| e.pubkey == entry.pubkey) && entry.mentioned_in(&event.content) {
                out.push(entry);
            }
        }
    }
    out
}

/// Does `content` look like a NIP-04 payload (`<base64>?iv=<base64>`)?
pub fn is_nip04_payload(content: &str) -> bool {
    let Some((cipher, iv)) = content.split_once("?iv=") else {
        return false;
    };
    let cipher_ok = STANDARD.decode(cipher).map(|c| !c.is_empty()).unwrap_or(false);
    let iv_ok = STANDARD.decode(iv).map(|v| v.len() == 16).unwrap_or(false);
    cipher_ok && iv_ok
}

/// Result of routing one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Failed signature or payload checks.
    Invalid,
    /// Kind this router does not notify on.
    Ignored,
    Duplicate,
    NoMatch,
    /// Sender unverified under the strict policy.
    Untrusted,
    /// Number of jobs handed to the mailer.
    Dispatched(usize),
}

/// Policy knobs for a [`Router`].
#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub policy: TrustPolicy,
    pub scope: DedupScope,
    pub verify_sig: bool,
    pub links: Links,
}

/// Shared by every dispatch task; holds only read-only state and handles
/// that are safe to use concurrently.
pub struct Router {
    watch: Arc<WatchList>,
    store: DedupStore,
    verifier: Verifier,
    mailer: Arc<dyn Mailer>,
    opts: RouterOptions,
    deliveries: TaskTracker,
}

impl Router {
    pub fn new(
        watch: Arc<WatchList>,
        store: DedupStore,
        verifier: Verifier,
        mailer: Arc<dyn Mailer>,
        opts: RouterOptions,
    ) -> Self {
        Self {
            watch,
            store,
            verifier,
            mailer,
            opts,
            deliveries: TaskTracker::new(),
        }
    }

    /// Route `event` received from relay `origin`.
    pub async fn handle(&self, origin: &str, event: Event) -> Outcome {
        let class = classify(event.kind);
        match class {
            Classification::PrivateEnvelope => {
                tracing::info!(relay = %origin, event_id = %event.id, kind = event.kind, "private envelope skipped, cannot decrypt");
                return Outcome::Ignored;
            }
            Classification::Unclassified => {
                tracing::debug!(relay = %origin, event_id = %event.id, kind = event.kind, "unclassified kind");
                return Outcome::Ignored;
            }
            _ => {}
        }
        if self.opts.verify_sig {
            if let Err(e) = verify_event(&event) {
                tracing::warn!(relay = %origin, event_id = %event.id, error = %e, "invalid event dropped");
                return Outcome::Invalid;
            }
        }
        if class == Classification::DirectMessage && !is_nip04_payload(&event.content) {
            tracing::warn!(relay = %origin, event_id = %event.id, "malformed direct message payload");
            return Outcome::Invalid;
        }

        if self.opts.scope == DedupScope::Event {
            match self.store.has(&event.id).await {
                Ok(true) => {
                    tracing::debug!(event_id = %event.id, "already processed");
                    return Outcome::Duplicate;
                }
                Ok(false) => {}
                Err(e) => tracing::error!(event_id = %event.id, error = %e, "dedup lookup failed"),
            }
        }

        let matched = recipients(&self.watch, class, &event);
        if matched.is_empty() {
            tracing::debug!(event_id = %event.id, "no watched recipient");
            return Outcome::NoMatch;
        }
        let pending = match self.opts.scope {
            DedupScope::Event => matched,
            DedupScope::Recipient => self.unprocessed(&event.id, matched).await,
        };
        if pending.is_empty() {
            tracing::debug!(event_id = %event.id, "already processed for every recipient");
            return Outcome::Duplicate;
        }

        // Verification depends only on the sender, so one lookup serves
        // every recipient of this event.
        let verification = self.verifier.verify(&event.pubkey).await;
        let Some(label) = self.opts.policy.resolve(&verification) else {
            tracing::info!(event_id = %event.id, sender = %event.pubkey.to_npub(), "unverified sender skipped");
            return Outcome::Untrusted;
        };

        let kind = match class {
            Classification::DirectMessage => NoticeKind::DirectMessage,
            _ => NoticeKind::Mention,
        };
        let mut dispatched = 0;
        for (i, entry) in pending.iter().enumerate() {
            // The insert is the claim: whoever inserts first dispatches.
            match self.store.mark(&event.id, origin, &entry.email).await {
                Ok(true) => {}
                Ok(false) if self.opts.scope == DedupScope::Event && i == 0 => {
                    tracing::debug!(event_id = %event.id, "lost dedup race");
                    return Outcome::Duplicate;
                }
                Ok(false) => {
                    tracing::debug!(event_id = %event.id, recipient = %entry.email, "lost dedup race");
                    continue;
                }
                Err(e) => {
                    tracing::error!(event_id = %event.id, recipient = %entry.email, error = %e, "failed to record processed event");
                }
            }
            let ctx = self.opts.links.context(kind, &event, entry, &label);
            match render(kind, &ctx, &entry.email) {
                Ok(job) => {
                    tracing::info!(relay = %origin, event_id = %event.id, recipient = %entry.email, sender = %label, ?kind, "notification dispatched");
                    self.hand_off(job);
                    dispatched += 1;
                }
                Err(e) => {
                    tracing::error!(event_id = %event.id, error = %e, "failed to render notification")
                }
            }
        }
        if dispatched == 0 {
            Outcome::Duplicate
        } else {
            Outcome::Dispatched(dispatched)
        }
    }

    async fn unprocessed<'a>(&self, event_id: &str, matched: Vec<&'a WatchEntry>) -> Vec<&'a WatchEntry> {
        let mut out = Vec::with_capacity(matched.len());
        for entry in matched {
            match self.store.has_for(event_id, &entry.email).await {
                Ok(true) => {}
                Ok(false) => out.push(entry),
                Err(e) => {
                    tracing::error!(event_id, error = %e, "dedup lookup failed");
                    out.push(entry)
                }
            }
        }
        out
    }

    fn hand_off(&self, job: crate::notify::NotificationJob) {
        let mailer = self.mailer.clone();
        self.deliveries.spawn(async move {
            let to = job.to.clone();
            if let Err(e) = mailer.deliver(job).await {
                tracing::warn!(recipient = %to, error = %e, "delivery failed");
            }
        });
    }

    /// Wait for deliveries already handed off.
    pub async fn drain(&self) {
        self.deliveries.close();
        self.deliveries.wait().await;
        self.deliveries.reopen();
    }
}
