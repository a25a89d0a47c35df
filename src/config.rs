//! Configuration loading from `.env` files.

use std::{collections::HashMap, env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Relay WebSocket URLs to listen on.
    pub relays: Vec<String>,
    /// SQLite database holding processed records and relay cursors.
    pub dedup_db: PathBuf,
    /// JSON roster of users with their `npub` and email.
    pub users_file: PathBuf,
    /// Spool directory notification jobs are written to.
    pub outbox_dir: PathBuf,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// Event kinds requested from relays.
    pub kinds: Vec<u32>,
    /// Strategy for determining the `since` of the subscription filter.
    pub since_mode: SinceMode,
    pub read_timeout: Duration,
    pub lookup_timeout: Duration,
    pub connect_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Capacity of the queue between relay readers and the dispatcher.
    pub dispatch_queue: usize,
    /// Maximum events dispatched at the same time.
    pub dispatch_concurrency: usize,
    /// Recompute ids and check Schnorr signatures before routing.
    pub verify_sig: bool,
    /// Drop notifications from senders without a verified identity.
    pub strict_verify: bool,
    pub dedup_scope: DedupScope,
    /// Domain appended to resolved usernames, e.g. `trustroots.org`.
    pub nip5_domain: String,
    /// Extra content aliases per username, lowercased.
    pub aliases: HashMap<String, Vec<String>>,
    pub sender_email: String,
    pub sender_name: String,
    /// Secret key (`nsec`) used by `send-test`.
    pub sender_nsec: Option<String>,
    pub site_url: String,
    pub chat_url: String,
    pub bind_preview: String,
}

/// Determines how the `since` value of the subscription is derived.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SinceMode {
    /// Only events created after the subscription is issued.
    Now,
    /// Resume from the last timestamp stored per relay.
    Cursor,
    /// Start from a fixed Unix timestamp.
    Fixed(u64),
}

impl SinceMode {
    fn parse(s: &str) -> Self {
        if let Some(rest) = s.strip_prefix("fixed:") {
            SinceMode::Fixed(rest.parse().unwrap_or(0))
        } else if s == "cursor" {
            SinceMode::Cursor
        } else {
            SinceMode::Now
        }
    }
}

/// Granularity of the processed-event gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DedupScope {
    /// A record blocks only the same (event, recipient) pair.
    Recipient,
    /// Any record for an event blocks every recipient.
    Event,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let relays = csv_strings(env::var("RELAYS").unwrap_or_default());
        let dedup_db = PathBuf::from(env::var("DEDUP_DB").context("DEDUP_DB")?);
        let users_file = PathBuf::from(env::var("USERS_FILE").context("USERS_FILE")?);
        let outbox_dir = PathBuf::from(env::var("OUTBOX_DIR").context("OUTBOX_DIR")?);
        let tor_socks = non_empty("TOR_SOCKS");
        let kinds = match csv_u32(env::var("KINDS").unwrap_or_default()) {
            k if k.is_empty() => vec![1, 4, 14, 15],
            k => k,
        };
        let since_mode = SinceMode::parse(&env::var("SINCE_MODE").unwrap_or_default());
        let dedup_scope = match env::var("DEDUP_SCOPE").as_deref() {
            Ok("event") => DedupScope::Event,
            _ => DedupScope::Recipient,
        };
        let nip5_domain = non_empty("NIP5_DOMAIN").unwrap_or_else(|| "trustroots.org".into());
        Ok(Self {
            relays,
            dedup_db,
            users_file,
            outbox_dir,
            tor_socks,
            kinds,
            since_mode,
            read_timeout: secs("READ_TIMEOUT_SECS", 5),
            lookup_timeout: secs("LOOKUP_TIMEOUT_SECS", 5),
            connect_timeout: secs("CONNECT_TIMEOUT_SECS", 10),
            shutdown_grace: secs("SHUTDOWN_GRACE_SECS", 5),
            dispatch_queue: number("DISPATCH_QUEUE", 256).max(1),
            dispatch_concurrency: number("DISPATCH_CONCURRENCY", 8).max(1),
            verify_sig: env::var("VERIFY_SIG").unwrap_or_else(|_| "0".into()) == "1",
            strict_verify: env::var("STRICT_VERIFY").unwrap_or_else(|_| "1".into()) != "0",
            dedup_scope,
            aliases: parse_aliases(&env::var("ALIASES").unwrap_or_default()),
            sender_email: non_empty("SENDER_EMAIL")
                .unwrap_or_else(|| format!("noreply@{nip5_domain}")),
            sender_name: non_empty("SENDER_NAME").unwrap_or_else(|| "Trustroots Nostr".into()),
            sender_nsec: non_empty("SENDER_NSEC"),
            site_url: non_empty("SITE_URL").unwrap_or_else(|| "https://www.trustroots.org".into()),
            chat_url: non_empty("CHAT_URL").unwrap_or_else(|| "https://tripch.at".into()),
            bind_preview: non_empty("BIND_PREVIEW").unwrap_or_else(|| "127.0.0.1:8080".into()),
            nip5_domain,
        })
    }

    /// Label used for senders that could not be verified in permissive mode.
    pub fn fallback_label(&self) -> String {
        format!("unverified@{}", self.nip5_domain)
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn number(key: &str, default: u64) -> usize {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default) as usize
}

fn secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(number(key, default) as u64)
}

/// Parse `user:alias|alias,user2:alias` into lowercased alias lists.
pub fn parse_aliases(input: &str) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for entry in csv_strings(input) {
        let Some((user, aliases)) = entry.split_once(':') else {
            continue;
        };
        let list = out.entry(user.trim().to_lowercase()).or_default();
        list.extend(
            aliases
                .split('|')
                .map(|a| a.trim().to_lowercase())
                .filter(|a| !a.is_empty()),
        );
    }
    out
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

/// Split a comma-separated string into `u32` values, skipping invalid entries.
pub fn csv_u32(input: impl AsRef<str>) -> Vec<u32> {
    let s = input.as_ref();
    s.split(',').filter_map(|s| s.trim().parse().ok()).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{env, fs, sync::Mutex};
    use tempfile::tempdir;

    pub(crate) static ENV_MUTEX: Mutex<()> = Mutex::new(());

    pub(crate) const VARS: &[&str] = &[
        "RELAYS",
        "DEDUP_DB",
        "USERS_FILE",
        "OUTBOX_DIR",
        "TOR_SOCKS",
        "KINDS",
        "SINCE_MODE",
        "READ_TIMEOUT_SECS",
        "LOOKUP_TIMEOUT_SECS",
        "CONNECT_TIMEOUT_SECS",
        "SHUTDOWN_GRACE_SECS",
        "DISPATCH_QUEUE",
        "DISPATCH_CONCURRENCY",
        "VERIFY_SIG",
        "STRICT_VERIFY",
        "DEDUP_SCOPE",
        "NIP5_DOMAIN",
        "ALIASES",
        "SENDER_EMAIL",
        "SENDER_NAME",
        "SENDER_NSEC",
        "SITE_URL",
        "CHAT_URL",
        "BIND_PREVIEW",
    ];

    pub(crate) fn clear_env() {
        for v in VARS {
            env::remove_var(v);
        }
    }

    /// Defaults rooted in `dir`, without touching the environment.
    pub(crate) fn test_settings(dir: &std::path::Path) -> Settings {
        Settings {
            relays: vec![],
            dedup_db: dir.join("processed.db"),
            users_file: dir.join("users.json"),
            outbox_dir: dir.join("outbox"),
            tor_socks: None,
            kinds: vec![1, 4, 14, 15],
            since_mode: SinceMode::Now,
            read_timeout: Duration::from_millis(200),
            lookup_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(2),
            dispatch_queue: 16,
            dispatch_concurrency: 2,
            verify_sig: false,
            strict_verify: true,
            dedup_scope: DedupScope::Recipient,
            nip5_domain: "trustroots.org".into(),
            aliases: HashMap::new(),
            sender_email: "noreply@trustroots.org".into(),
            sender_name: "Trustroots Nostr".into(),
            sender_nsec: None,
            site_url: "https://www.trustroots.org".into(),
            chat_url: "https://tripch.at".into(),
            bind_preview: "127.0.0.1:0".into(),
        }
    }

    const REQUIRED: &str = "DEDUP_DB=/tmp/d.db\nUSERS_FILE=/tmp/users.json\nOUTBOX_DIR=/tmp/outbox\n";

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            format!(
                "{REQUIRED}{}",
                concat!(
                    "RELAYS=wss://r1, wss://r2\n",
                    "TOR_SOCKS=127.0.0.1:9050\n",
                    "KINDS=1,4\n",
                    "SINCE_MODE=fixed:1700000000\n",
                    "READ_TIMEOUT_SECS=2\n",
                    "VERIFY_SIG=1\n",
                    "STRICT_VERIFY=0\n",
                    "DEDUP_SCOPE=event\n",
                    "NIP5_DOMAIN=example.org\n",
                    "ALIASES=thefriendlyhost:TFH|host,nostroots:nostr\n",
                )
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.relays, vec!["wss://r1", "wss://r2"]);
        assert_eq!(cfg.dedup_db, PathBuf::from("/tmp/d.db"));
        assert_eq!(cfg.tor_socks.as_deref(), Some("127.0.0.1:9050"));
        assert_eq!(cfg.kinds, vec![1, 4]);
        assert_eq!(cfg.since_mode, SinceMode::Fixed(1700000000));
        assert_eq!(cfg.read_timeout, Duration::from_secs(2));
        assert!(cfg.verify_sig);
        assert!(!cfg.strict_verify);
        assert_eq!(cfg.dedup_scope, DedupScope::Event);
        assert_eq!(cfg.fallback_label(), "unverified@example.org");
        assert_eq!(cfg.sender_email, "noreply@example.org");
        assert_eq!(
            cfg.aliases.get("thefriendlyhost").unwrap(),
            &vec!["tfh".to_string(), "host".to_string()]
        );
    }

    #[test]
    fn defaults_when_optional_absent() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, REQUIRED).unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert!(cfg.relays.is_empty());
        assert!(cfg.tor_socks.is_none());
        assert_eq!(cfg.kinds, vec![1, 4, 14, 15]);
        assert_eq!(cfg.since_mode, SinceMode::Now);
        assert_eq!(cfg.read_timeout, Duration::from_secs(5));
        assert_eq!(cfg.dispatch_queue, 256);
        assert!(cfg.strict_verify);
        assert!(!cfg.verify_sig);
        assert_eq!(cfg.dedup_scope, DedupScope::Recipient);
        assert_eq!(cfg.fallback_label(), "unverified@trustroots.org");
        assert!(cfg.aliases.is_empty());
    }

    #[test]
    fn missing_required_fields_error() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "RELAYS=wss://r1\n").unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn since_mode_parsing() {
        assert_eq!(SinceMode::parse("cursor"), SinceMode::Cursor);
        assert_eq!(SinceMode::parse(""), SinceMode::Now);
        assert_eq!(SinceMode::parse("fixed:notanumber"), SinceMode::Fixed(0));
    }

    #[test]
    fn csv_helpers() {
        assert_eq!(csv_strings("a, b , ,c"), vec!["a", "b", "c"]);
        assert!(csv_strings("").is_empty());
        assert_eq!(csv_u32("1, 2, x,3"), vec![1, 2, 3]);
        assert!(csv_u32("").is_empty());
    }

    #[test]
    fn alias_parsing_skips_malformed() {
        let a = parse_aliases("alice:Al|ALLY, bogus, bob:");
        assert_eq!(a.get("alice").unwrap(), &vec!["al".to_string(), "ally".to_string()]);
        assert!(a.get("bob").unwrap().is_empty());
        assert!(!a.contains_key("bogus"));
    }
}
