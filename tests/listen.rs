use assert_cmd::prelude::*;
use bech32::{Bech32, Hrp};
use futures_util::{SinkExt, StreamExt};
use std::{fs, process::Command, time::Duration};
use tempfile::TempDir;
use tokio::{net::TcpListener, time::sleep};
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};

fn npub(byte: u8) -> String {
    bech32::encode::<Bech32>(Hrp::parse("npub").unwrap(), &[byte; 32]).unwrap()
}

fn spooled(dir: &std::path::Path) -> Vec<serde_json::Value> {
    let Ok(entries) = fs::read_dir(dir) else {
        return vec![];
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
        .map(|e| serde_json::from_str(&fs::read_to_string(e.path()).unwrap()).unwrap())
        .collect()
}

#[tokio::test]
async fn listen_spools_mention_from_relay() {
    let dir = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_url = format!("ws://{}", listener.local_addr().unwrap());
    let env_path = dir.path().join("env");
    fs::write(
        &env_path,
        format!(
            "RELAYS={relay}\nDEDUP_DB={0}/processed.db\nUSERS_FILE={0}/users.json\nOUTBOX_DIR={0}/outbox\nREAD_TIMEOUT_SECS=1\n",
            dir.path().display(),
            relay = relay_url,
        ),
    )
    .unwrap();
    let users = serde_json::json!([
        {"username": "alice", "email": "alice@example.org", "nostrNpub": npub(0xa1)},
        {"username": "bob", "email": "bob@example.org", "nostrNpub": npub(0xb2)}
    ]);
    fs::write(dir.path().join("users.json"), users.to_string()).unwrap();

    let relay = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let Some(Ok(Message::Text(req))) = ws.next().await else {
            panic!("expected REQ");
        };
        let req: serde_json::Value = serde_json::from_str(&req).unwrap();
        let event = serde_json::json!({
            "id": "e1",
            "pubkey": hex::encode([0xb2; 32]),
            "kind": 1,
            "created_at": 1_700_000_000,
            "tags": [["p", hex::encode([0xa1; 32])]],
            "content": "hi alice",
            "sig": "00"
        });
        for _ in 0..2 {
            ws.send(Message::Text(
                serde_json::json!(["EVENT", req[1], event]).to_string(),
            ))
            .await
            .unwrap();
        }
        while let Some(Ok(_)) = ws.next().await {}
    });

    let mut child = Command::cargo_bin("nostremail")
        .unwrap()
        .args(["--env", env_path.to_str().unwrap(), "listen"])
        .spawn()
        .unwrap();

    let outbox = dir.path().join("outbox");
    for _ in 0..50 {
        if !spooled(&outbox).is_empty() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    // Leave time for the repeated frame to be routed.
    sleep(Duration::from_millis(300)).await;
    let jobs = spooled(&outbox);

    child.kill().unwrap();
    let _ = child.wait();
    relay.abort();

    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["to"], "alice@example.org");
    assert_eq!(jobs[0]["subject"], "Nostr mention from bob@trustroots.org");
    assert_eq!(jobs[0]["event_id"], "e1");
    assert!(jobs[0]["text"].as_str().unwrap().contains("hi alice"));
}
