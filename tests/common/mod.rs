//! Mock ledger node shared by the integration tests.
#![allow(dead_code, clippy::panic)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

type StreamKey = (String, String, String);

#[derive(Debug, Default)]
struct NodeState {
    streams: HashMap<StreamKey, Vec<serde_json::Value>>,
    failures: HashMap<StreamKey, usize>,
    requests: Vec<(StreamKey, u64, u64)>,
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    start: Option<u64>,
    limit: Option<u64>,
}

/// In-process stand-in for the node's events endpoint.
#[derive(Debug, Clone)]
pub struct MockNode {
    addr: SocketAddr,
    state: Arc<Mutex<NodeState>>,
}

impl MockNode {
    /// Binds an ephemeral port and serves until the test ends.
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(NodeState::default()));
        let app = Router::new()
            .route("/accounts/{address}/events/{handle}/{field}", get(events))
            .with_state(Arc::clone(&state));

        let Ok(listener) = TcpListener::bind("127.0.0.1:0").await else {
            panic!("failed to bind mock node");
        };
        let Ok(addr) = listener.local_addr() else {
            panic!("mock node has no address");
        };
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { addr, state }
    }

    /// Base URL to hand to `EventSource`.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Appends events to a stream.
    pub async fn push(&self, address: &str, handle: &str, field: &str, events: Vec<serde_json::Value>) {
        self.state
            .lock()
            .await
            .streams
            .entry(key(address, handle, field))
            .or_default()
            .extend(events);
    }

    /// Makes the next `count` requests to a stream answer 500.
    pub async fn fail_next(&self, address: &str, handle: &str, field: &str, count: usize) {
        self.state
            .lock()
            .await
            .failures
            .insert(key(address, handle, field), count);
    }

    /// `(start, limit)` of every request made to a stream, in arrival order.
    pub async fn requests(&self, address: &str, handle: &str, field: &str) -> Vec<(u64, u64)> {
        let wanted = key(address, handle, field);
        self.state
            .lock()
            .await
            .requests
            .iter()
            .filter(|(k, _, _)| *k == wanted)
            .map(|(_, start, limit)| (*start, *limit))
            .collect()
    }
}

fn key(address: &str, handle: &str, field: &str) -> StreamKey {
    (address.to_string(), handle.to_string(), field.to_string())
}

async fn events(
    State(state): State<Arc<Mutex<NodeState>>>,
    Path((address, handle, field)): Path<(String, String, String)>,
    Query(page): Query<PageQuery>,
) -> Response {
    let start = page.start.unwrap_or(0);
    let limit = page.limit.unwrap_or(25);
    let stream = (address, handle, field);

    let mut state = state.lock().await;
    state.requests.push((stream.clone(), start, limit));

    if let Some(remaining) = state.failures.get_mut(&stream)
        && *remaining > 0
    {
        *remaining -= 1;
        return (StatusCode::INTERNAL_SERVER_ERROR, "node unavailable").into_response();
    }

    let page: Vec<serde_json::Value> = state
        .streams
        .get(&stream)
        .map(|events| {
            events
                .iter()
                .filter(|e| sequence_of(e) >= start)
                .take(usize::try_from(limit).unwrap_or(usize::MAX))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    Json(page).into_response()
}

fn sequence_of(event: &serde_json::Value) -> u64 {
    event
        .get("sequence_number")
        .and_then(serde_json::Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// An event as the node serializes it: integers as strings.
pub fn node_event(sequence_number: u64, data: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "version": (1_000_000 + sequence_number).to_string(),
        "sequence_number": sequence_number.to_string(),
        "type": "0x1::module::Event",
        "data": data,
    })
}
