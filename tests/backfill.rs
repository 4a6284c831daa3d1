//! Collection backfill against a mock node.
#![allow(clippy::panic)]

mod common;

use aptos_event_indexer::backfill::{
    self, BackfillReport, COLLECTION_EVENTS_FIELD, Dumper, Fetcher, TOKEN_COLLECTIONS_HANDLE,
    TOKEN_DATA_EVENTS_FIELD,
};
use aptos_event_indexer::source::EventSource;
use aptos_event_indexer::store::MemoryStore;
use common::{MockNode, node_event};

const ACCOUNT: &str = "0xcreator";

fn collection(seq: u64, name: &str, maximum: &str) -> serde_json::Value {
    node_event(
        seq,
        serde_json::json!({
            "creator": ACCOUNT,
            "collection_name": name,
            "uri": format!("ipfs://{name}"),
            "maximum": maximum,
            "description": ""
        }),
    )
}

fn token(seq: u64, collection: &str, name: &str) -> serde_json::Value {
    node_event(
        seq,
        serde_json::json!({
            "id": {"creator": ACCOUNT, "collection": collection, "name": name},
            "description": "",
            "uri": format!("ipfs://{name}")
        }),
    )
}

async fn node_with_two_collections() -> MockNode {
    let node = MockNode::start().await;
    node.push(
        ACCOUNT,
        TOKEN_COLLECTIONS_HANDLE,
        COLLECTION_EVENTS_FIELD,
        vec![collection(0, "Apes", "150"), collection(1, "Cats", "10")],
    )
    .await;

    let mut tokens = Vec::new();
    for seq in 0..130 {
        tokens.push(token(seq, "Apes", &format!("Ape #{seq}")));
    }
    tokens.push(token(130, "Cats", "Cat #1"));
    tokens.push(token(131, "Cats", "Cat #2"));
    node.push(ACCOUNT, TOKEN_COLLECTIONS_HANDLE, TOKEN_DATA_EVENTS_FIELD, tokens)
        .await;
    node
}

fn fetcher(node: &MockNode) -> Fetcher {
    Fetcher::new(EventSource::new(reqwest::Client::new(), node.url()), ACCOUNT)
}

#[tokio::test]
async fn imports_every_collection_and_its_tokens() {
    let node = node_with_two_collections().await;
    let store = MemoryStore::new();

    let report = backfill::run(&fetcher(&node), &Dumper::new(store.clone()), None).await;

    // "Cats" has maximum 10, so only the first page is scanned and its
    // tokens (sequence 130, 131) are out of reach.
    assert_eq!(
        report,
        BackfillReport {
            collections: 2,
            collections_failed: 0,
            tokens: 130,
            tokens_failed: 0,
        }
    );
    assert_eq!(store.collections().await.len(), 2);
    assert_eq!(store.tokens().await.len(), 130);

    let token_pages = node
        .requests(ACCOUNT, TOKEN_COLLECTIONS_HANDLE, TOKEN_DATA_EVENTS_FIELD)
        .await;
    let mut starts: Vec<u64> = token_pages.iter().map(|(start, _)| *start).collect();
    starts.sort_unstable();
    assert_eq!(starts, vec![0, 0, 100]);
}

#[tokio::test]
async fn collection_filter_limits_the_import() {
    let node = node_with_two_collections().await;
    let store = MemoryStore::new();

    let report = backfill::run(&fetcher(&node), &Dumper::new(store.clone()), Some("Apes")).await;

    assert_eq!(report.collections, 1);
    assert_eq!(report.tokens, 130);
    let names: Vec<String> = store.collections().await.into_iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["Apes".to_string()]);
}

#[tokio::test]
async fn rerun_converges_on_same_rows() {
    let node = node_with_two_collections().await;
    let store = MemoryStore::new();
    let dumper = Dumper::new(store.clone());
    let fetcher = fetcher(&node);

    backfill::run(&fetcher, &dumper, Some("Apes")).await;
    let first = store.tokens().await;
    backfill::run(&fetcher, &dumper, Some("Apes")).await;
    let second = store.tokens().await;

    assert_eq!(first.len(), second.len());
    assert_eq!(
        first.iter().map(|t| t.id).collect::<Vec<_>>(),
        second.iter().map(|t| t.id).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn node_failure_is_logged_not_fatal() {
    let node = node_with_two_collections().await;
    node.fail_next(ACCOUNT, TOKEN_COLLECTIONS_HANDLE, COLLECTION_EVENTS_FIELD, 1)
        .await;
    let store = MemoryStore::new();

    let report = backfill::run(&fetcher(&node), &Dumper::new(store.clone()), None).await;
    assert_eq!(report, BackfillReport::default());
    assert!(store.collections().await.is_empty());
}

#[tokio::test]
async fn unlimited_collection_stops_at_first_short_page() {
    let node = MockNode::start().await;
    node.push(
        ACCOUNT,
        TOKEN_COLLECTIONS_HANDLE,
        COLLECTION_EVENTS_FIELD,
        vec![collection(0, "Forever", &u64::MAX.to_string())],
    )
    .await;
    let tokens = (0..130)
        .map(|seq| token(seq, "Forever", &format!("F #{seq}")))
        .collect();
    node.push(ACCOUNT, TOKEN_COLLECTIONS_HANDLE, TOKEN_DATA_EVENTS_FIELD, tokens)
        .await;
    let store = MemoryStore::new();

    let report = backfill::run(&fetcher(&node), &Dumper::new(store.clone()), None).await;

    assert_eq!(report.collections, 1);
    assert_eq!(report.tokens, 130);
    let mut starts: Vec<u64> = node
        .requests(ACCOUNT, TOKEN_COLLECTIONS_HANDLE, TOKEN_DATA_EVENTS_FIELD)
        .await
        .iter()
        .map(|(start, _)| *start)
        .collect();
    starts.sort_unstable();
    assert_eq!(starts, vec![0, 100, 200]);
}
