//! HTTP preview of rendered notification emails.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    codec::PublicKey,
    event::{Event, Tag, KIND_ENCRYPTED_DM, KIND_TEXT_NOTE},
    notify::{render, Links, NoticeKind, NotificationJob},
    watch::WatchEntry,
};

#[derive(Clone)]
struct PreviewState {
    links: Links,
    domain: String,
}

/// Response body for the `/healthz` endpoint.
#[derive(Serialize, Deserialize)]
struct Health {
    status: String,
}

/// Build the preview routes.
pub fn app(links: Links, domain: &str) -> Router {
    let state = Arc::new(PreviewState {
        links,
        domain: domain.to_string(),
    });
    Router::new()
        .route("/", get(index))
        .route("/healthz", get(healthz))
        .route("/preview/:kind/:format", get(preview))
        .with_state(state)
}

/// Serve previews on `addr` until `shutdown` resolves.
pub async fn serve_preview(
    addr: SocketAddr,
    links: Links,
    domain: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "preview server listening");
    axum::serve(listener, app(links, domain).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

async fn index() -> Html<&'static str> {
    Html(concat!(
        "<!DOCTYPE html><html><head><title>Notification previews</title></head><body>",
        "<h1>Notification previews</h1><ul>",
        "<li>Mention: <a href=\"/preview/mention/html\">HTML</a> | <a href=\"/preview/mention/text\">text</a></li>",
        "<li>Direct message: <a href=\"/preview/dm/html\">HTML</a> | <a href=\"/preview/dm/text\">text</a></li>",
        "</ul></body></html>"
    ))
}

async fn preview(
    State(state): State<Arc<PreviewState>>,
    Path((kind, format)): Path<(String, String)>,
) -> Response {
    let kind = match kind.as_str() {
        "mention" => NoticeKind::Mention,
        "dm" => NoticeKind::DirectMessage,
        _ => return StatusCode::NOT_FOUND.into_response(),
    };
    let job = match sample_job(&state, kind) {
        Ok(job) => job,
        Err(e) => {
            tracing::error!(error = %e, "preview render failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    match format.as_str() {
        "html" => Html(job.html).into_response(),
        "text" => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            format!("Subject: {}\n\n{}", job.subject, job.text),
        )
            .into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Render a fixed sample notification.
fn sample_job(state: &PreviewState, kind: NoticeKind) -> askama::Result<NotificationJob> {
    let recipient = WatchEntry::new(PublicKey::from_bytes([0x11; 32]), "alice", "alice@example.com");
    let sender = PublicKey::from_bytes([0x22; 32]);
    let (ev_kind, content) = match kind {
        NoticeKind::Mention => (
            KIND_TEXT_NOTE,
            format!("Hey nostr:{}, are you hosting this weekend?", recipient.npub),
        ),
        NoticeKind::DirectMessage => (KIND_ENCRYPTED_DM, "c2FtcGxl?iv=AAAAAAAAAAAAAAAAAAAAAA==".into()),
    };
    let event = Event {
        id: "5c83da77af1dec6d7289834998ad7aafbd9e2191396d75ec3cc27f5a77226f36".into(),
        pubkey: sender,
        kind: ev_kind,
        created_at: 1_700_000_000,
        tags: vec![Tag(vec!["p".into(), recipient.pubkey.to_hex()])],
        content,
        sig: String::new(),
    };
    let label = format!("nostroots@{}", state.domain);
    let ctx = state.links.context(kind, &event, &recipient, &label);
    render(kind, &ctx, &recipient.email)
}
