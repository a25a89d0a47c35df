//! Command line interface for the Nostr-to-email notifier. Supports
//! initialization, listening to relays, inspecting users and processed
//! events, publishing test notes, and previewing notification emails.

mod codec;
mod config;
mod dedup;
mod directory;
mod error;
mod event;
mod listen;
mod message;
mod notify;
mod preview;
mod publish;
mod relay;
mod router;
mod verify;
mod watch;

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use config::Settings;
use dedup::DedupStore;
use directory::Roster;
use notify::{Links, SpoolMailer};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "nostremail",
    author,
    version,
    about = "Email notifications for Nostr mentions and direct messages"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create the env file, dedup database, roster, and outbox.
    Init,
    /// Listen to relays and spool notifications until interrupted.
    Listen {
        /// Notify for senders without a verified identity, under a fallback label.
        #[arg(long)]
        skip_nip5: bool,
    },
    /// List users by the state of their npub.
    Users,
    /// Show the most recently processed events.
    Processed {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Publish a signed test note mentioning a user.
    SendTest {
        /// Recipient npub.
        #[arg(long)]
        to: String,
        /// Note content.
        #[arg(long)]
        msg: String,
    },
    /// Serve rendered sample notifications over HTTP.
    Preview,
    /// Manage the relay list in the env file.
    Relay {
        #[command(subcommand)]
        action: RelayAction,
    },
}

/// Operations available under `nostremail relay`.
#[derive(Subcommand)]
enum RelayAction {
    /// Add a relay after verifying connectivity.
    Add { url: String },
    /// Remove a relay from the configuration.
    Remove { url: String },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    match cli.command {
        Commands::Init => {
            DedupStore::open(&cfg.dedup_db)
                .with_context(|| format!("creating {}", cfg.dedup_db.display()))?;
            spool(&cfg).init()?;
            if !cfg.users_file.exists() {
                if let Some(parent) = cfg.users_file.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&cfg.users_file, "[]\n")?;
            }
            println!("initialized {}", cli.env);
        }
        Commands::Listen { skip_nip5 } => {
            let roster = Roster::new(cfg.users_file.clone());
            let mailer = spool(&cfg);
            mailer.init()?;
            let strict = cfg.strict_verify && !skip_nip5;
            if !strict {
                tracing::warn!(fallback = %cfg.fallback_label(), "sender verification is permissive");
            }
            let pipeline = listen::Pipeline::build(
                &cfg,
                strict,
                &roster,
                Arc::new(roster.clone()),
                Arc::new(mailer),
            )
            .await?;
            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => signal.cancel(),
                    Err(e) => tracing::error!(error = %e, "cannot listen for ctrl-c"),
                }
            });
            pipeline.run(shutdown).await?;
        }
        Commands::Users => {
            let users = Roster::new(cfg.users_file.clone()).users().await?;
            print!("{}", directory::categorize(users).report());
        }
        Commands::Processed { limit } => {
            let store = DedupStore::open(&cfg.dedup_db)?;
            for rec in store.recent(limit).await? {
                println!(
                    "{}  {}  {}  {}",
                    notify::format_timestamp(rec.processed_at.max(0) as u64),
                    rec.event_id,
                    rec.recipient,
                    rec.relay_url
                );
            }
        }
        Commands::SendTest { to, msg } => publish::send_test(&cfg, &to, &msg).await?,
        Commands::Preview => {
            let addr: SocketAddr = cfg.bind_preview.as_str().parse()?;
            let links = Links {
                site_url: cfg.site_url.clone(),
                chat_url: cfg.chat_url.clone(),
            };
            preview::serve_preview(addr, links, &cfg.nip5_domain, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
        }
        Commands::Relay { action } => handle_relay(action, &cli.env, &cfg).await?,
    }
    Ok(())
}

fn spool(cfg: &Settings) -> SpoolMailer {
    SpoolMailer::new(cfg.outbox_dir.clone(), &cfg.sender_name, &cfg.sender_email)
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let data = base_dir.join("nostremail-data");
    let mut content = String::new();
    content.push_str("RELAYS=wss://relay.trustroots.org,wss://relay.nomadwiki.org\n");
    content.push_str(&format!("DEDUP_DB={}\n", display_path(&data.join("processed.db"))));
    content.push_str(&format!("USERS_FILE={}\n", display_path(&data.join("users.json"))));
    content.push_str(&format!("OUTBOX_DIR={}\n", display_path(&data.join("outbox"))));
    content.push_str("KINDS=1,4,14,15\n");
    content.push_str("SINCE_MODE=now\n");
    content.push_str("STRICT_VERIFY=1\n");
    content.push_str("DEDUP_SCOPE=recipient\n");
    content.push_str("VERIFY_SIG=0\n");
    content.push_str("NIP5_DOMAIN=trustroots.org\n");
    content.push_str("ALIASES=thefriendlyhost:tfh,nostroots:nostr\n");
    content.push_str("SENDER_EMAIL=\n");
    content.push_str("SENDER_NSEC=\n");
    content.push_str("BIND_PREVIEW=127.0.0.1:8080\n");
    content.push_str("TOR_SOCKS=\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

async fn handle_relay(action: RelayAction, env_path: &str, cfg: &Settings) -> anyhow::Result<()> {
    match action {
        RelayAction::Add { url } => add_relay(env_path, cfg, url).await?,
        RelayAction::Remove { url } => remove_relay(env_path, cfg, url)?,
    }
    Ok(())
}

async fn add_relay(env_path: &str, cfg: &Settings, url: String) -> anyhow::Result<()> {
    if cfg.relays.iter().any(|existing| existing == &url) {
        bail!("relay already configured: {url}");
    }
    relay::probe(&url, cfg.tor_socks.as_deref(), cfg.connect_timeout).await?;
    let mut relays = cfg.relays.clone();
    relays.push(url);
    write_relays_to_env(env_path, &relays)?;
    Ok(())
}

fn remove_relay(env_path: &str, cfg: &Settings, url: String) -> anyhow::Result<()> {
    let mut relays = cfg.relays.clone();
    let before = relays.len();
    relays.retain(|existing| existing != &url);
    if relays.len() == before {
        bail!("relay not configured: {url}");
    }
    write_relays_to_env(env_path, &relays)?;
    Ok(())
}

fn write_relays_to_env(env_path: &str, relays: &[String]) -> anyhow::Result<()> {
    let content = fs::read_to_string(env_path)?;
    let joined = relays.join(",");
    let mut new_content = String::new();
    let mut replaced = false;
    for line in content.lines() {
        if line.starts_with("RELAYS=") {
            new_content.push_str(&format!("RELAYS={joined}\n"));
            replaced = true;
        } else {
            new_content.push_str(line);
            new_content.push('\n');
        }
    }
    if !replaced {
        new_content.push_str(&format!("RELAYS={joined}\n"));
    }
    fs::write(env_path, new_content)?;
    std::env::set_var("RELAYS", joined);
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    run(cli).await
}
