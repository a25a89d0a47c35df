//! Notification jobs: rendering and hand-off to delivery.

use std::path::PathBuf;

use anyhow::Result;
use askama::Template;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{event::Event, watch::WatchEntry};

/// Body shown for direct messages, whose content is never decrypted.
pub const DM_PLACEHOLDER: &str = "[Encrypted Direct Message - Content not available]";

/// Email handed to the delivery collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationJob {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
    pub event_id: String,
}

/// Best-effort delivery of notification jobs.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn deliver(&self, job: NotificationJob) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NoticeKind {
    Mention,
    DirectMessage,
}

/// Values substituted into the email templates.
#[derive(Debug, Clone)]
pub struct NoticeContext {
    pub title: String,
    pub recipient_name: String,
    pub recipient_npub: String,
    pub sender_label: String,
    pub sender_npub: String,
    pub event_id: String,
    pub created_at: String,
    pub content: String,
    pub profile_url: String,
    pub sender_profile_url: String,
    /// Empty when there is nothing to link to.
    pub button_url: String,
    pub button_text: String,
}

#[derive(Template)]
#[template(path = "mention.html")]
struct MentionHtml<'a> {
    ctx: &'a NoticeContext,
}

#[derive(Template)]
#[template(path = "mention.txt")]
struct MentionText<'a> {
    ctx: &'a NoticeContext,
}

#[derive(Template)]
#[template(path = "direct_message.html")]
struct DirectMessageHtml<'a> {
    ctx: &'a NoticeContext,
}

#[derive(Template)]
#[template(path = "direct_message.txt")]
struct DirectMessageText<'a> {
    ctx: &'a NoticeContext,
}

/// Links and labels that do not depend on the event.
#[derive(Debug, Clone)]
pub struct Links {
    pub site_url: String,
    pub chat_url: String,
}

impl Links {
    /// Build the template context for `event` addressed to `recipient`.
    pub fn context(
        &self,
        kind: NoticeKind,
        event: &Event,
        recipient: &WatchEntry,
        sender_label: &str,
    ) -> NoticeContext {
        let site = self.site_url.trim_end_matches('/');
        let sender_user = sender_label.split('@').next().unwrap_or_default();
        let sender_npub = event.pubkey.to_npub();
        let (title, content, button_url, button_text) = match kind {
            NoticeKind::Mention => ("New Nostr Mention", event.content.clone(), String::new(), ""),
            NoticeKind::DirectMessage => (
                "New Encrypted Direct Message",
                DM_PLACEHOLDER.to_string(),
                format!("{}/#dm:{}", self.chat_url.trim_end_matches('/'), sender_npub),
                "Open conversation",
            ),
        };
        NoticeContext {
            title: title.to_string(),
            recipient_name: recipient.name.clone(),
            recipient_npub: recipient.npub.clone(),
            sender_label: sender_label.to_string(),
            sender_npub,
            event_id: event.id.clone(),
            created_at: format_timestamp(event.created_at),
            content,
            profile_url: format!("{site}/profile/{}", recipient.name),
            sender_profile_url: format!("{site}/profile/{sender_user}"),
            button_url,
            button_text: button_text.to_string(),
        }
    }
}

/// Render subject, HTML, and text bodies into a job for `to`.
pub fn render(kind: NoticeKind, ctx: &NoticeContext, to: &str) -> askama::Result<NotificationJob> {
    let (subject, html, text) = match kind {
        NoticeKind::Mention => (
            format!("Nostr mention from {}", ctx.sender_label),
            MentionHtml { ctx }.render()?,
            MentionText { ctx }.render()?,
        ),
        NoticeKind::DirectMessage => (
            format!("Encrypted DM from {}", ctx.sender_label),
            DirectMessageHtml { ctx }.render()?,
            DirectMessageText { ctx }.render()?,
        ),
    };
    Ok(NotificationJob {
        to: to.to_string(),
        subject,
        html,
        text,
        event_id: ctx.event_id.clone(),
    })
}

/// `2006-01-02 15:04:05 UTC` style timestamp.
pub fn format_timestamp(unix: u64) -> String {
    chrono::DateTime::from_timestamp(unix as i64, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| unix.to_string())
}

/// A spooled message as written to disk.
#[derive(Debug, Serialize, Deserialize)]
pub struct SpoolEntry {
    pub from_name: String,
    pub from_email: String,
    pub queued_at: i64,
    #[serde(flatten)]
    pub job: NotificationJob,
}

/// Writes each job as a JSON file into a spool directory, where an external
/// mail transfer agent picks it up.
#[derive(Debug, Clone)]
pub struct SpoolMailer {
    dir: PathBuf,
    from_name: String,
    from_email: String,
}

impl SpoolMailer {
    pub fn new(dir: PathBuf, from_name: &str, from_email: &str) -> Self {
        Self {
            dir,
            from_name: from_name.to_string(),
            from_email: from_email.to_string(),
        }
    }

    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    fn write(&self, job: NotificationJob) -> Result<PathBuf> {
        let now = chrono::Utc::now();
        // Event ids come from relays; hash them before using them in a path.
        let digest = Sha256::digest(format!("{}\n{}", job.event_id, job.to));
        let name = format!(
            "{}-{}.json",
            now.timestamp_millis(),
            &hex::encode(digest)[..16]
        );
        let path = self.dir.join(name);
        let entry = SpoolEntry {
            from_name: self.from_name.clone(),
            from_email: self.from_email.clone(),
            queued_at: now.timestamp(),
            job,
        };
        std::fs::create_dir_all(&self.dir)?;
        let tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(&tmp, &entry)?;
        tmp.persist(&path)?;
        Ok(path)
    }
}

#[async_trait]
impl Mailer for SpoolMailer {
    async fn deliver(&self, job: NotificationJob) -> Result<()> {
        let this = self.clone();
        let to = job.to.clone();
        let path = tokio::task::spawn_blocking(move || this.write(job)).await??;
        tracing::info!(%to, path = %path.display(), "notification spooled");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{codec::PublicKey, event::Tag};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Mailer that keeps every job in memory.
    #[derive(Default)]
    pub(crate) struct RecordingMailer(pub Mutex<Vec<NotificationJob>>);

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn deliver(&self, job: NotificationJob) -> Result<()> {
            self.0.lock().unwrap().push(job);
            Ok(())
        }
    }

    fn links() -> Links {
        Links {
            site_url: "https://www.trustroots.org/".into(),
            chat_url: "https://tripch.at".into(),
        }
    }

    fn event(content: &str, kind: u32) -> Event {
        Event {
            id: "e1".into(),
            pubkey: PublicKey::from_bytes([2; 32]),
            kind,
            created_at: 1_700_000_000,
            tags: vec![Tag(vec!["p".into(), "01".repeat(32)])],
            content: content.into(),
            sig: String::new(),
        }
    }

    fn alice() -> WatchEntry {
        WatchEntry::new(PublicKey::from_bytes([1; 32]), "alice", "alice@example")
    }

    #[test]
    fn renders_mention() {
        let ev = event("hi <b>alice</b>", 1);
        let ctx = links().context(NoticeKind::Mention, &ev, &alice(), "bob@trustroots.org");
        let job = render(NoticeKind::Mention, &ctx, "alice@example").unwrap();
        assert_eq!(job.to, "alice@example");
        assert_eq!(job.subject, "Nostr mention from bob@trustroots.org");
        assert!(job.text.contains("hi <b>alice</b>"));
        assert!(job.text.contains("2023-11-14 22:13:20 UTC"));
        assert!(job.text.contains("https://www.trustroots.org/profile/bob"));
        assert!(job.html.contains("&lt;b&gt;alice&lt;"));
        assert!(!job.html.contains("<b>alice</b>"));
    }

    #[test]
    fn renders_direct_message_with_placeholder() {
        let ev = event("c2VjcmV0?iv=aXY=", 4);
        let ctx = links().context(NoticeKind::DirectMessage, &ev, &alice(), "bob@trustroots.org");
        let job = render(NoticeKind::DirectMessage, &ctx, "alice@example").unwrap();
        assert_eq!(job.subject, "Encrypted DM from bob@trustroots.org");
        assert!(job.text.contains(DM_PLACEHOLDER));
        assert!(!job.text.contains("c2VjcmV0"));
        assert!(job
            .text
            .contains(&format!("https://tripch.at/#dm:{}", ev.pubkey.to_npub())));
    }

    #[tokio::test]
    async fn spool_writes_json_file() {
        let dir = TempDir::new().unwrap();
        let mailer = SpoolMailer::new(dir.path().join("outbox"), "Trustroots Nostr", "noreply@x");
        let job = NotificationJob {
            to: "alice@example".into(),
            subject: "s".into(),
            html: "<p>h</p>".into(),
            text: "t".into(),
            event_id: "../../etc/passwd".into(),
        };
        mailer.deliver(job.clone()).await.unwrap();
        let files: Vec<_> = std::fs::read_dir(dir.path().join("outbox"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);
        let entry: SpoolEntry =
            serde_json::from_str(&std::fs::read_to_string(&files[0]).unwrap()).unwrap();
        assert_eq!(entry.job, job);
        assert_eq!(entry.from_email, "noreply@x");
    }
}
