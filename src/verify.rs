//! Sender trust: does a sender have an account in the identity directory?

use std::{sync::Arc, time::Duration};

use crate::{codec::PublicKey, directory::IdentityDirectory};

/// Outcome of one directory lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Verification {
    /// The sender has an account; `label` is `<username>@<domain>`.
    Verified { label: String },
    /// The directory answered and has no matching account.
    NotFound,
    /// The directory could not be consulted (error or timeout).
    Unavailable(String),
}

/// Trust policy applied to an unverified sender.
#[derive(Debug, Clone, PartialEq)]
pub enum TrustPolicy {
    /// Unverified senders produce no notification.
    Strict,
    /// Unverified senders are reported under a fixed label.
    Permissive { fallback_label: String },
}

impl TrustPolicy {
    /// Sender label to notify under, or `None` to skip.
    pub fn resolve(&self, v: &Verification) -> Option<String> {
        match (v, self) {
            (Verification::Verified { label }, _) => Some(label.clone()),
            (_, TrustPolicy::Strict) => None,
            (_, TrustPolicy::Permissive { fallback_label }) => Some(fallback_label.clone()),
        }
    }
}

/// Looks senders up in an [`IdentityDirectory`] with a bounded wait.
#[derive(Clone)]
pub struct Verifier {
    directory: Arc<dyn IdentityDirectory>,
    domain: String,
    timeout: Duration,
}

impl Verifier {
    pub fn new(directory: Arc<dyn IdentityDirectory>, domain: &str, timeout: Duration) -> Self {
        Self {
            directory,
            domain: domain.to_string(),
            timeout,
        }
    }

    pub async fn verify(&self, sender: &PublicKey) -> Verification {
        let npub = sender.to_npub();
        match tokio::time::timeout(self.timeout, self.directory.lookup(&npub)).await {
            Ok(Ok(Some(username))) => {
                tracing::debug!(%npub, %username, "sender verified");
                Verification::Verified {
                    label: format!("{username}@{}", self.domain),
                }
            }
            Ok(Ok(None)) => {
                tracing::debug!(%npub, "sender not in directory");
                Verification::NotFound
            }
            Ok(Err(e)) => {
                tracing::error!(%npub, error = %e, "identity lookup failed");
                Verification::Unavailable(e.to_string())
            }
            Err(_) => {
                tracing::error!(%npub, timeout = ?self.timeout, "identity lookup timed out");
                Verification::Unavailable("timed out".into())
            }
        }
    }
}
