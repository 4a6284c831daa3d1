//! `EventSource` and `Subject` against a mock node.
#![allow(clippy::panic)]

mod common;

use aptos_event_indexer::domain::EventKind;
use aptos_event_indexer::error::FetchError;
use aptos_event_indexer::source::{EventFeed, EventSource, StreamLocator, Subject};
use common::{MockNode, node_event};

const ADDR: &str = "0x1";
const HANDLE: &str = "0x1::marketplace::OrderStore";
const FIELD: &str = "delist_events";

fn source(node: &MockNode) -> EventSource {
    EventSource::new(reqwest::Client::new(), node.url())
}

fn locator() -> StreamLocator {
    StreamLocator::from_handle(HANDLE, FIELD)
}

async fn seeded_node(count: u64) -> MockNode {
    let node = MockNode::start().await;
    let events = (0..count)
        .map(|seq| node_event(seq, serde_json::json!({"n": seq})))
        .collect();
    node.push(ADDR, HANDLE, FIELD, events).await;
    node
}

#[tokio::test]
async fn try_fetch_honours_start_and_limit() {
    let node = seeded_node(10).await;
    let Ok(events) = source(&node).try_fetch(&locator(), 4, 3).await else {
        panic!("fetch should succeed");
    };
    let seqs: Vec<u64> = events.iter().map(|e| e.sequence_number).collect();
    assert_eq!(seqs, vec![4, 5, 6]);
    assert_eq!(node.requests(ADDR, HANDLE, FIELD).await, vec![(4, 3)]);
}

#[tokio::test]
async fn non_success_status_is_typed() {
    let node = seeded_node(3).await;
    node.fail_next(ADDR, HANDLE, FIELD, 1).await;
    let result = source(&node).try_fetch(&locator(), 0, 10).await;
    assert!(matches!(result, Err(FetchError::Status { status: 500, .. })));
}

#[tokio::test]
async fn soft_fetch_reports_failure_as_empty() {
    let node = seeded_node(3).await;
    node.fail_next(ADDR, HANDLE, FIELD, 1).await;
    let source = source(&node);
    assert!(source.fetch(&locator(), 0, 10).await.is_empty());
    assert_eq!(source.fetch(&locator(), 0, 10).await.len(), 3);
}

#[tokio::test]
async fn pages_come_back_in_request_order() {
    let node = seeded_node(25).await;
    let pages = vec![(0, 10), (10, 10), (20, 10)];
    let result = source(&node).fetch_pages(&locator(), pages, 2).await;

    let sizes: Vec<usize> = result.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![10, 10, 5]);
    let flat: Vec<u64> = result
        .iter()
        .flatten()
        .map(|e| e.sequence_number)
        .collect();
    assert_eq!(flat, (0..25).collect::<Vec<_>>());
}

#[tokio::test]
async fn subject_resumes_after_committed_offset() {
    let node = seeded_node(6).await;
    let subject = Subject::new(EventKind::Delist, source(&node), locator(), 2);

    let Ok(first) = subject.next_batch(None).await else {
        panic!("first batch");
    };
    assert_eq!(first.iter().map(|e| e.sequence_number).collect::<Vec<_>>(), vec![0, 1]);

    let Ok(next) = subject.next_batch(Some(3)).await else {
        panic!("resumed batch");
    };
    assert_eq!(next.iter().map(|e| e.sequence_number).collect::<Vec<_>>(), vec![4, 5]);

    let Ok(done) = subject.next_batch(Some(5)).await else {
        panic!("caught-up batch");
    };
    assert!(done.is_empty());
    assert_eq!(
        node.requests(ADDR, HANDLE, FIELD).await,
        vec![(0, 2), (4, 2), (6, 2)]
    );
}

#[tokio::test]
async fn subject_surfaces_transient_failures() {
    let node = seeded_node(2).await;
    node.fail_next(ADDR, HANDLE, FIELD, 1).await;
    let subject = Subject::new(EventKind::Delist, source(&node), locator(), 10);
    assert!(subject.next_batch(None).await.is_err());
    let Ok(events) = subject.next_batch(None).await else {
        panic!("node recovered");
    };
    assert_eq!(events.len(), 2);
}
