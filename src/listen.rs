//! The `listen` pipeline: relay tasks feeding a bounded dispatch queue,
//! supervised under one cancellation token.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Context, Result};
use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Settings, SinceMode},
    dedup::DedupStore,
    directory::{IdentityDirectory, WatchListProvider},
    message::SubscriptionFilter,
    notify::{Links, Mailer},
    relay::{Inbound, RelayManager, RelayOptions},
    router::{Router, RouterOptions},
    verify::{TrustPolicy, Verifier},
    watch::WatchList,
};

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Everything `listen` needs, assembled before any relay task starts.
pub struct Pipeline {
    relays: Vec<String>,
    filter: SubscriptionFilter,
    since_mode: SinceMode,
    store: DedupStore,
    router: Arc<Router>,
    relay_opts: RelayOptions,
    queue: usize,
    concurrency: usize,
    grace: Duration,
}

impl Pipeline {
    /// Load the watch-list and open the dedup store. Both failures are fatal.
    pub async fn build(
        cfg: &Settings,
        strict: bool,
        provider: &dyn WatchListProvider,
        directory: Arc<dyn IdentityDirectory>,
        mailer: Arc<dyn Mailer>,
    ) -> Result<Self> {
        if cfg.relays.is_empty() {
            bail!("no relays configured (RELAYS)");
        }
        let entries = provider
            .watch_entries()
            .await
            .context("loading watch list")?;
        let watch = WatchList::new(entries, &cfg.aliases);
        if watch.is_empty() {
            bail!("watch list is empty: no user has both a valid npub and an email");
        }
        let store = DedupStore::open(&cfg.dedup_db)
            .with_context(|| format!("opening dedup store {}", cfg.dedup_db.display()))?;
        tracing::info!(users = watch.len(), relays = cfg.relays.len(), strict, "watch list loaded");

        let filter = watch.filter(&cfg.kinds, 0);
        let policy = if strict {
            TrustPolicy::Strict
        } else {
            TrustPolicy::Permissive {
                fallback_label: cfg.fallback_label(),
            }
        };
        let verifier = Verifier::new(directory, &cfg.nip5_domain, cfg.lookup_timeout);
        let router = Router::new(
            Arc::new(watch),
            store.clone(),
            verifier,
            mailer,
            RouterOptions {
                policy,
                scope: cfg.dedup_scope,
                verify_sig: cfg.verify_sig,
                links: Links {
                    site_url: cfg.site_url.clone(),
                    chat_url: cfg.chat_url.clone(),
                },
            },
        );
        Ok(Self {
            relays: cfg.relays.clone(),
            filter,
            since_mode: cfg.since_mode,
            store,
            router: Arc::new(router),
            relay_opts: RelayOptions {
                tor_socks: cfg.tor_socks.clone(),
                connect_timeout: cfg.connect_timeout,
                read_timeout: cfg.read_timeout,
            },
            queue: cfg.dispatch_queue,
            concurrency: cfg.dispatch_concurrency,
            grace: cfg.shutdown_grace,
        })
    }

    async fn since_for(&self, relay: &str) -> u64 {
        match self.since_mode {
            SinceMode::Now => unix_now(),
            SinceMode::Fixed(ts) => ts,
            SinceMode::Cursor => match self.store.cursor(relay).await {
                Ok(Some(ts)) => ts,
                Ok(None) => unix_now(),
                Err(e) => {
                    tracing::warn!(%relay, error = %e, "cursor lookup failed, starting from now");
                    unix_now()
                }
            },
        }
    }

    /// Run until `shutdown` fires or every relay connection has ended.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let (tx, rx) = mpsc::channel::<Inbound>(self.queue);
        let mut dispatcher = tokio::spawn(dispatch(rx, self.router.clone(), self.concurrency));

        let mut relays = JoinSet::new();
        for (index, url) in self.relays.iter().enumerate() {
            let filter = self.filter.with_since(self.since_for(url).await);
            let mut manager = RelayManager::new(index, url, self.relay_opts.clone());
            let (tx, cancel, store) = (tx.clone(), shutdown.child_token(), self.store.clone());
            let save_cursor = self.since_mode == SinceMode::Cursor;
            relays.spawn(async move {
                match manager.run(&filter, tx, cancel).await {
                    Ok(()) => tracing::debug!(
                        relay = %manager.url(),
                        state = ?manager.state(),
                        forwarded = manager.forwarded(),
                        "relay task ended"
                    ),
                    Err(e) => tracing::warn!(
                        relay = %manager.url(),
                        state = ?manager.state(),
                        error = %e,
                        "relay task ended"
                    ),
                }
                if let (true, Some(latest)) = (save_cursor, manager.latest()) {
                    if let Err(e) = store.set_cursor(manager.url(), latest).await {
                        tracing::error!(relay = %manager.url(), error = %e, "failed to save cursor");
                    }
                }
            });
        }
        drop(tx);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("shutting down");
                    break;
                }
                joined = relays.join_next() => match joined {
                    Some(Ok(())) => {}
                    Some(Err(e)) => tracing::error!(error = %e, "relay task panicked"),
                    None => {
                        tracing::warn!("every relay connection has ended");
                        break;
                    }
                },
            }
        }
        shutdown.cancel();

        let drain = async {
            while relays.join_next().await.is_some() {}
            if let Err(e) = (&mut dispatcher).await {
                tracing::error!(error = %e, "dispatcher panicked");
            }
            self.router.drain().await;
        };
        if tokio::time::timeout(self.grace, drain).await.is_err() {
            tracing::warn!(grace = ?self.grace, "abandoning in-flight work");
            relays.abort_all();
            dispatcher.abort();
        }
        Ok(())
    }
}

/// Route queued events with at most `concurrency` in flight.
async fn dispatch(mut rx: mpsc::Receiver<Inbound>, router: Arc<Router>, concurrency: usize) {
    let limit = Arc::new(Semaphore::new(concurrency));
    let mut tasks = JoinSet::new();
    while let Some(inbound) = rx.recv().await {
        let Ok(permit) = limit.clone().acquire_owned().await else {
            break;
        };
        let router = router.clone();
        tasks.spawn(async move {
            let event_id = inbound.event.id.clone();
            let outcome = router.handle(&inbound.relay, inbound.event).await;
            tracing::debug!(relay = %inbound.relay, %event_id, ?outcome, "event routed");
            drop(permit);
        });
        while let Some(done) = tasks.try_join_next() {
            if let Err(e) = done {
                tracing::error!(error = %e, "dispatch task panicked");
            }
        }
    }
    while let Some(done) = tasks.join_next().await {
        if let Err(e) = done {
            tracing::error!(error = %e, "dispatch task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::PublicKey, config::tests::test_settings, directory::Roster,
        notify::tests::RecordingMailer,
    };
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, tungstenite::Message};

    fn alice() -> PublicKey {
        PublicKey::from_bytes([0xa1; 32])
    }

    fn bob() -> PublicKey {
        PublicKey::from_bytes([0xb2; 32])
    }

    fn write_roster(dir: &TempDir) -> Roster {
        let users = json!([
            {"username": "alice", "email": "alice@example", "nostrNpub": alice().to_npub()},
            {"username": "bob", "email": "bob@example", "nostrNpub": bob().to_npub()},
        ]);
        let path = dir.path().join("users.json");
        std::fs::write(&path, users.to_string()).unwrap();
        Roster::new(path)
    }

    /// Mock relay that answers the first REQ with one mention of alice by bob,
    /// sent twice, then waits for the client to go away.
    async fn mock_relay() -> (String, tokio::task::JoinHandle<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let Some(Ok(Message::Text(txt))) = ws.next().await else {
                panic!("expected REQ");
            };
            let req: Value = serde_json::from_str(&txt).unwrap();
            let ev = json!({
                "id": "e1", "pubkey": bob(), "kind": 1, "created_at": 1_700_000_123,
                "tags": [["p", alice().to_hex()]], "content": "hi", "sig": "00"
            });
            for _ in 0..2 {
                ws.send(Message::Text(json!(["EVENT", req[1], ev]).to_string()))
                    .await
                    .unwrap();
            }
            while let Some(Ok(_)) = ws.next().await {}
            req
        });
        (url, handle)
    }

    async fn wait_for_jobs(mailer: &RecordingMailer, n: usize) {
        for _ in 0..100 {
            if mailer.0.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn same_event_on_two_relays_notifies_once() {
        let dir = TempDir::new().unwrap();
        let roster = write_roster(&dir);
        let (r1, s1) = mock_relay().await;
        let (r2, s2) = mock_relay().await;
        let mut cfg = test_settings(dir.path());
        cfg.relays = vec![r1, r2];
        cfg.since_mode = SinceMode::Cursor;

        let mailer = Arc::new(RecordingMailer::default());
        let pipeline = Pipeline::build(&cfg, true, &roster, Arc::new(roster.clone()), mailer.clone())
            .await
            .unwrap();
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(pipeline.run(shutdown.clone()));

        wait_for_jobs(&mailer, 1).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        run.await.unwrap().unwrap();

        let jobs = mailer.0.lock().unwrap().clone();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].to, "alice@example");
        assert_eq!(jobs[0].subject, "Nostr mention from bob@trustroots.org");

        for server in [s1, s2] {
            let req = server.await.unwrap();
            let mut keys = vec![alice().to_hex(), bob().to_hex()];
            keys.sort();
            assert_eq!(req[2]["#p"], json!(keys));
            assert_eq!(req[2]["kinds"], json!([1, 4, 14, 15]));
        }

        let store = DedupStore::open(&cfg.dedup_db).unwrap();
        assert_eq!(store.recent(10).await.unwrap().len(), 1);
        for relay in &cfg.relays {
            assert_eq!(store.cursor(relay).await.unwrap(), Some(1_700_000_123));
        }
    }

    #[tokio::test]
    async fn run_returns_when_every_relay_is_gone() {
        let dir = TempDir::new().unwrap();
        let roster = write_roster(&dir);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);
        let mut cfg = test_settings(dir.path());
        cfg.relays = vec![dead];
        let pipeline = Pipeline::build(
            &cfg,
            true,
            &roster,
            Arc::new(roster.clone()),
            Arc::new(RecordingMailer::default()),
        )
        .await
        .unwrap();
        tokio::time::timeout(Duration::from_secs(5), pipeline.run(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn startup_failures_are_fatal() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_settings(dir.path());
        cfg.relays = vec!["ws://127.0.0.1:1".into()];
        let mailer: Arc<dyn Mailer> = Arc::new(RecordingMailer::default());

        let missing = Roster::new(dir.path().join("missing.json"));
        assert!(
            Pipeline::build(&cfg, true, &missing, Arc::new(missing.clone()), mailer.clone())
                .await
                .is_err()
        );

        let path = dir.path().join("empty.json");
        std::fs::write(&path, r#"[{"username":"x","email":"x@example","nostrNpub":""}]"#).unwrap();
        let empty = Roster::new(path);
        assert!(
            Pipeline::build(&cfg, true, &empty, Arc::new(empty.clone()), mailer.clone())
                .await
                .is_err()
        );

        let roster = write_roster(&dir);
        cfg.dedup_db = dir.path().to_path_buf();
        assert!(
            Pipeline::build(&cfg, true, &roster, Arc::new(roster.clone()), mailer)
                .await
                .is_err()
        );
    }
}
