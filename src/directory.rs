//! User roster: the source of the watch-list and the identity directory
//! consulted when deciding whether a sender is trusted.

use std::{collections::BTreeMap, path::PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{codec::PublicKey, error::DirectoryError, watch::WatchEntry};

/// Supplies the identities to watch. Queried once at startup.
#[async_trait]
pub trait WatchListProvider: Send + Sync {
    async fn watch_entries(&self) -> Result<Vec<WatchEntry>, DirectoryError>;
}

/// Maps an encoded identity to a canonical username.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// `Ok(None)` when no account carries `npub`.
    async fn lookup(&self, npub: &str) -> Result<Option<String>, DirectoryError>;
}

/// One account record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(rename = "nostrNpub", default, skip_serializing_if = "Option::is_none")]
    pub nostr_npub: Option<String>,
}

/// Users split by the state of their `npub` field.
#[derive(Debug, Default)]
pub struct UserCategories {
    /// Decodes to a 32-byte key.
    pub valid: Vec<(User, PublicKey)>,
    /// Present but malformed.
    pub invalid: Vec<User>,
    pub empty: Vec<User>,
}

impl UserCategories {
    pub fn total(&self) -> usize {
        self.valid.len() + self.invalid.len() + self.empty.len()
    }

    /// Email domains of valid users with their counts.
    pub fn email_domains(&self) -> BTreeMap<String, usize> {
        let mut out = BTreeMap::new();
        for (user, _) in &self.valid {
            let domain = match user.email.rsplit_once('@') {
                Some((_, d)) if !d.is_empty() => d.to_lowercase(),
                _ => "(none)".to_string(),
            };
            *out.entry(domain).or_insert(0) += 1;
        }
        out
    }

    /// Human-readable listing for the `users` command.
    pub fn report(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Valid npubs ({}):\n", self.valid.len()));
        for (user, _) in &self.valid {
            let npub = user.nostr_npub.as_deref().unwrap_or_default().trim();
            out.push_str(&format!("  {} <{}> {}\n", user.username, user.email, npub));
        }
        out.push_str(&format!("Invalid npubs ({}):\n", self.invalid.len()));
        for user in &self.invalid {
            let npub = user.nostr_npub.as_deref().unwrap_or_default();
            out.push_str(&format!("  {}: {}\n", user.username, npub));
        }
        out.push_str(&format!("Empty npub ({}):\n", self.empty.len()));
        for user in &self.empty {
            out.push_str(&format!("  {}\n", user.username));
        }
        out.push_str(&format!("Total users: {}\n", self.total()));
        out.push_str("Email domains of valid users:\n");
        for (domain, count) in self.email_domains() {
            out.push_str(&format!("  {domain}: {count}\n"));
        }
        out
    }
}

pub fn categorize(users: Vec<User>) -> UserCategories {
    let mut cats = UserCategories::default();
    for user in users {
        match user.nostr_npub.as_deref().map(str::trim) {
            None | Some("") => cats.empty.push(user),
            Some(npub) => match PublicKey::from_npub(npub) {
                Ok(pk) => cats.valid.push((user, pk)),
                Err(e) => {
                    tracing::debug!(username = %user.username, error = %e, "invalid npub");
                    cats.invalid.push(user)
                }
            },
        }
    }
    cats
}

/// JSON file holding an array of [`User`] records.
#[derive(Debug, Clone)]
pub struct Roster {
    path: PathBuf,
}

impl Roster {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Read every record. The file is re-read on each call so account changes
    /// are visible without a restart.
    pub async fn users(&self) -> Result<Vec<User>, DirectoryError> {
        let data = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| DirectoryError::Unavailable(format!("{}: {e}", self.path.display())))?;
        serde_json::from_str(&data)
            .map_err(|e| DirectoryError::Corrupt(format!("{}: {e}", self.path.display())))
    }
}

#[async_trait]
impl WatchListProvider for Roster {
    async fn watch_entries(&self) -> Result<Vec<WatchEntry>, DirectoryError> {
        let cats = categorize(self.users().await?);
        for user in &cats.invalid {
            tracing::warn!(username = %user.username, "skipping user with malformed npub");
        }
        Ok(cats
            .valid
            .into_iter()
            .filter_map(|(user, pk)| {
                if user.email.trim().is_empty() {
                    tracing::warn!(username = %user.username, "skipping user without email");
                    return None;
                }
                Some(WatchEntry::new(pk, &user.username, user.email.trim()))
            })
            .collect())
    }
}

#[async_trait]
impl IdentityDirectory for Roster {
    async fn lookup(&self, npub: &str) -> Result<Option<String>, DirectoryError> {
        Ok(self
            .users()
            .await?
            .into_iter()
            .find(|u| u.nostr_npub.as_deref().map(str::trim) == Some(npub))
            .map(|u| u.username))
    }
}
