// src/store/firebase.rs
//! Firebase Realtime Database backend over the REST streaming API.
//!
//! `GET {db_url}/{root}.json` with `Accept: text/event-stream` yields
//! server-sent events:
//!
//! ```text
//! event: put
//! data: {"path":"/t1/chats","data":{"c1":{"active":true}}}
//! ```
//!
//! `put` replaces the value at `root + path`, `patch` merges children into it.
//! The first event after (re)connecting is a `put` of the whole subtree, so a
//! reconnect doubles as a full resync.
use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use futures_util::StreamExt;
use reqwest::{Client, header::ACCEPT};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConfigTree, split_path};
use crate::error::RunnerError;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// One server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser; chunks may split events anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, get back every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend(chunk.iter().filter(|b| **b != b'\r'));
        let mut events = Vec::new();
        while let Some(end) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buf.drain(..end + 2).collect();
            if let Some(event) = parse_block(&String::from_utf8_lossy(&block)) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }
    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data.join("\n"),
    })
}

#[derive(Debug, Deserialize)]
struct PathData {
    path: String,
    data: Value,
}

/// What the stream loop should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamAction {
    Continue,
    Reconnect,
}

pub struct FirebaseSource {
    client: Client,
    db_url: String,
    root: String,
    auth: Option<String>,
    tree: ConfigTree,
    min_backoff: Duration,
    max_backoff: Duration,
    synced: Mutex<Option<oneshot::Sender<()>>>,
}

impl FirebaseSource {
    pub fn new(db_url: &str, root: &str, auth: Option<String>, tree: ConfigTree) -> Self {
        Self {
            client: Client::new(),
            db_url: db_url.trim_end_matches('/').to_string(),
            root: split_path(root).join("/"),
            auth,
            tree,
            min_backoff: MIN_BACKOFF,
            max_backoff: MAX_BACKOFF,
            synced: Mutex::new(None),
        }
    }

    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_backoff = min;
        self.max_backoff = max.max(min);
        self
    }

    /// Resolves once the first `put` has landed in the tree.
    pub fn first_sync(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.synced.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    pub fn stream_url(&self) -> String {
        format!("{}/{}.json", self.db_url, self.root)
    }

    /// Apply one event to the tree.
    pub fn apply(&self, event: &SseEvent) -> Result<StreamAction> {
        match event.event.as_str() {
            "put" | "patch" => {
                let body: PathData = serde_json::from_str(&event.data)
                    .with_context(|| format!("bad `{}` payload", event.event))?;
                let path = format!("{}/{}", self.root, body.path.trim_start_matches('/'));
                if event.event == "put" {
                    self.tree.set(&path, body.data);
                    if let Some(tx) = self.synced.lock().unwrap_or_else(PoisonError::into_inner).take() {
                        let _ = tx.send(());
                    }
                } else {
                    let Value::Object(children) = body.data else {
                        bail!("`patch` data at {path} is not an object");
                    };
                    self.tree.update(&path, children);
                }
                debug!(%path, kind = %event.event, "applied remote change");
                Ok(StreamAction::Continue)
            }
            "keep-alive" => Ok(StreamAction::Continue),
            "cancel" => {
                warn!(data = %event.data, "stream cancelled by the database, check security rules");
                Ok(StreamAction::Reconnect)
            }
            "auth_revoked" => {
                warn!("stream credential expired");
                Ok(StreamAction::Reconnect)
            }
            other => {
                debug!(event = other, "ignoring unknown stream event");
                Ok(StreamAction::Continue)
            }
        }
    }

    /// Follow the stream until `cancel` fires, reconnecting with backoff.
    /// A connection that delivered anything resets the delay, however it ended.
    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = self.min_backoff;
        loop {
            let mut delivered = false;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.stream_once(&cancel, &mut delivered) => outcome,
            };
            if let Err(e) = outcome {
                let err = RunnerError::store(format!("{e:#}"));
                warn!(url = %self.stream_url(), kind = %err.kind(), "{err}");
            }
            if delivered {
                backoff = self.min_backoff;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.max_backoff);
        }
        info!("config stream stopped");
    }

    /// One connection. Sets `delivered` as soon as an event is accepted.
    async fn stream_once(&self, cancel: &CancellationToken, delivered: &mut bool) -> Result<()> {
        let mut request = self
            .client
            .get(self.stream_url())
            .header(ACCEPT, "text/event-stream");
        if let Some(auth) = &self.auth {
            request = request.query(&[("auth", auth.as_str())]);
        }
        let response = request
            .send()
            .await
            .context("connecting")?
            .error_for_status()
            .context("stream rejected")?;
        info!(url = %self.stream_url(), "config stream connected");

        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else {
                bail!("stream closed by server");
            };
            for event in decoder.feed(&chunk.context("reading stream")?) {
                match self.apply(&event) {
                    Ok(StreamAction::Continue) => *delivered = true,
                    Ok(StreamAction::Reconnect) => return Ok(()),
                    Err(e) => {
                        let err = RunnerError::store(format!("{e:#}"));
                        warn!(kind = %err.kind(), "skipping stream event: {err}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, http::header, routing::get};
    use serde_json::json;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };
    use tokio::net::TcpListener;

    #[test]
    fn test_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"event: put\r\ndata: {\"path\":\"/\",").is_empty());
        let events = decoder.feed(b"\"data\":null}\r\n\r\nevent: keep-alive\ndata: null\n\n: comment\n\n");
        assert_eq!(
            events,
            vec![
                SseEvent { event: "put".into(), data: "{\"path\":\"/\",\"data\":null}".into() },
                SseEvent { event: "keep-alive".into(), data: "null".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_put_and_patch_land_under_root() {
        let tree = ConfigTree::new();
        let source = FirebaseSource::new("https://example.firebaseio.com/", "/bots/", None, tree.clone());
        assert_eq!(source.stream_url(), "https://example.firebaseio.com/bots.json");

        let put = SseEvent {
            event: "put".into(),
            data: json!({ "path": "/", "data": { "t1": { "token": "A", "active": true } } }).to_string(),
        };
        assert_eq!(source.apply(&put).unwrap(), StreamAction::Continue);
        assert_eq!(tree.read("bots/t1/token"), Some(json!("A")));

        let patch = SseEvent {
            event: "patch".into(),
            data: json!({ "path": "/t1", "data": { "active": false, "chats/c1": { "active": true } } }).to_string(),
        };
        source.apply(&patch).unwrap();
        assert_eq!(tree.read("bots/t1/active"), Some(json!(false)));
        assert_eq!(tree.read("bots/t1/chats/c1/active"), Some(json!(true)));

        let delete = SseEvent {
            event: "put".into(),
            data: json!({ "path": "/t1", "data": null }).to_string(),
        };
        source.apply(&delete).unwrap();
        assert_eq!(tree.read("bots"), None);
    }

    #[tokio::test]
    async fn test_control_events() {
        let tree = ConfigTree::new();
        let source = FirebaseSource::new("https://db", "bots", None, tree);
        let event = |name: &str| SseEvent { event: name.into(), data: "null".into() };

        assert_eq!(source.apply(&event("keep-alive")).unwrap(), StreamAction::Continue);
        assert_eq!(source.apply(&event("cancel")).unwrap(), StreamAction::Reconnect);
        assert_eq!(source.apply(&event("auth_revoked")).unwrap(), StreamAction::Reconnect);
        assert!(source.apply(&SseEvent { event: "patch".into(), data: "{\"path\":\"/\",\"data\":1}".into() }).is_err());
    }

    #[tokio::test]
    async fn test_first_put_resolves_first_sync() {
        let tree = ConfigTree::new();
        let source = FirebaseSource::new("https://db", "bots", None, tree);
        let mut synced = source.first_sync();

        let put = |data: Value| SseEvent {
            event: "put".into(),
            data: json!({ "path": "/", "data": data }).to_string(),
        };
        source.apply(&SseEvent { event: "keep-alive".into(), data: "null".into() }).unwrap();
        assert!(synced.try_recv().is_err());
        source.apply(&put(json!({ "t1": { "active": false } }))).unwrap();
        assert!(synced.try_recv().is_ok());
        // later puts are fine without a listener
        source.apply(&put(json!(null))).unwrap();
    }

    /// A server that sends one `put` per connection and then hangs up.
    async fn one_shot_server(hits: Arc<AtomicUsize>) -> String {
        let app = Router::new().route(
            "/bots.json",
            get(move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (
                        [(header::CONTENT_TYPE, "text/event-stream")],
                        "event: put\ndata: {\"path\":\"/\",\"data\":{\"t1\":{\"active\":false}}}\n\n",
                    )
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_server_close_after_delivery_reconnects_quickly() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = one_shot_server(hits.clone()).await;
        let tree = ConfigTree::new();
        let source = FirebaseSource::new(&url, "bots", None, tree.clone())
            .with_backoff(Duration::from_millis(10), Duration::from_secs(1));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(source.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
        task.await.unwrap();

        // doubling from 10ms would allow at most 6 connections in 500ms
        assert!(hits.load(Ordering::SeqCst) >= 12, "only {} connections", hits.load(Ordering::SeqCst));
        assert_eq!(tree.read("bots/t1/active"), Some(json!(false)));
    }
}
