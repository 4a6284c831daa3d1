//! One-shot import of an account's `0x3::token` collections and tokens.
//!
//! Unlike the pipeline, the backfill is best effort: a failing item is
//! logged and skipped, and the run always completes. It writes through
//! [`Store::upsert_collection`] and [`Store::upsert_token`], so running it
//! twice converges on the same rows.

use futures_util::stream::{self, StreamExt};

use crate::domain::entities::{collection_primary_key, token_primary_key};
use crate::domain::payload::{CollectionCreatedData, TokenDataCreatedData};
use crate::domain::{Chain, Collection, RawEvent, Token};
use crate::source::{EventSource, StreamLocator};
use crate::store::Store;

/// Resource holding the token module's event handles.
pub const TOKEN_COLLECTIONS_HANDLE: &str = "0x3::token::Collections";
/// Field of collection creation events.
pub const COLLECTION_EVENTS_FIELD: &str = "create_collection_events";
/// Field of token data creation events.
pub const TOKEN_DATA_EVENTS_FIELD: &str = "create_token_data_events";
/// Events per request.
pub const PAGE_SIZE: u32 = 100;
/// Maximum concurrent requests to the node.
pub const FETCH_CONCURRENCY: usize = 3;
/// Maximum concurrent token writes.
pub const WRITE_CONCURRENCY: usize = 5;

/// Upper bound on the token-data pages to scan for a collection of
/// `maximum` tokens.
///
/// An unparsable maximum scans a single page. The bound is never
/// materialised; see [`Fetcher::token_data_events`].
#[must_use]
pub fn page_count(maximum: &str) -> u64 {
    match maximum.trim().parse::<u64>() {
        Ok(max) => max / u64::from(PAGE_SIZE) + 1,
        Err(e) => {
            tracing::warn!(maximum, error = %e, "unparsable collection maximum; scanning one page");
            1
        }
    }
}

/// Reads an account's collection and token-data events from the node.
#[derive(Debug, Clone)]
pub struct Fetcher {
    source: EventSource,
    collections: StreamLocator,
    token_data: StreamLocator,
}

impl Fetcher {
    /// Creates a fetcher for `account`'s token store.
    #[must_use]
    pub fn new(source: EventSource, account: &str) -> Self {
        Self {
            collections: StreamLocator::at_account(
                account,
                TOKEN_COLLECTIONS_HANDLE,
                COLLECTION_EVENTS_FIELD,
            ),
            token_data: StreamLocator::at_account(
                account,
                TOKEN_COLLECTIONS_HANDLE,
                TOKEN_DATA_EVENTS_FIELD,
            ),
            source,
        }
    }

    /// Every collection creation event of the account, in sequence order.
    ///
    /// Pages are read until the node returns a short page. A failed page
    /// ends the scan early.
    pub async fn collection_events(&self) -> Vec<RawEvent> {
        let mut events = Vec::new();
        let mut start = 0u64;
        loop {
            let page = self.source.fetch(&self.collections, start, PAGE_SIZE).await;
            let len = page.len();
            events.extend(page);
            if len < PAGE_SIZE as usize {
                return events;
            }
            start = start.saturating_add(u64::from(PAGE_SIZE));
        }
    }

    /// Token-data creation events belonging to `collection`, in page order.
    ///
    /// At most [`page_count`] pages are scanned, [`FETCH_CONCURRENCY`] at a
    /// time. The scan stops at the first short page, so an unlimited
    /// collection costs only as many requests as the stream has events. A
    /// failed page counts as short.
    pub async fn token_data_events(&self, collection: &Collection) -> Vec<RawEvent> {
        let total = page_count(&collection.maximum);
        let window = FETCH_CONCURRENCY as u64;
        let mut next = 0u64;
        let mut fetched = Vec::new();

        while next < total {
            let end = total.min(next.saturating_add(window));
            let pages: Vec<(u64, u32)> = (next..end)
                .map(|i| (i.saturating_mul(u64::from(PAGE_SIZE)), PAGE_SIZE))
                .collect();
            tracing::debug!(
                collection = %collection.name,
                first_page = next,
                pages = pages.len(),
                "fetching token data pages"
            );
            next = end;

            let mut exhausted = false;
            for page in self
                .source
                .fetch_pages(&self.token_data, pages, FETCH_CONCURRENCY)
                .await
            {
                exhausted = page.len() < PAGE_SIZE as usize;
                fetched.extend(page);
                if exhausted {
                    break;
                }
            }
            if exhausted {
                break;
            }
        }

        fetched
            .into_iter()
            .filter(|event| {
                event
                    .data
                    .get("id")
                    .and_then(|id| id.get("collection"))
                    .and_then(serde_json::Value::as_str)
                    == Some(collection.name.as_str())
            })
            .collect()
    }
}

/// Upserts backfilled collections and tokens.
#[derive(Debug, Clone)]
pub struct Dumper<S: Store> {
    store: S,
}

impl<S: Store> Dumper<S> {
    /// Creates a dumper writing to `store`.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Upserts the collection described by a creation event.
    ///
    /// Returns the stored row, or `None` (after logging) on failure.
    pub async fn dump_collection(&self, event: &RawEvent) -> Option<Collection> {
        let data: CollectionCreatedData = match event.parse_data() {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(sequence_number = event.sequence_number, error = %e, "failed to parse collection event");
                return None;
            }
        };

        let collection = Collection {
            id: collection_primary_key(Chain::Aptos, &data.creator, &data.collection_name),
            chain: Chain::Aptos,
            creator: data.creator,
            name: data.collection_name,
            description: data.description,
            uri: data.uri,
            maximum: data.maximum,
        };
        match self.store.upsert_collection(&collection).await {
            Ok(stored) => Some(stored),
            Err(e) => {
                tracing::error!(collection = %collection.name, error = %e, "failed to save collection");
                None
            }
        }
    }

    /// Upserts one token of `collection`. Returns whether it was saved.
    pub async fn dump_token(&self, collection: &Collection, event: &RawEvent) -> bool {
        let data: TokenDataCreatedData = match event.parse_data() {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(sequence_number = event.sequence_number, error = %e, "failed to parse token data event");
                return false;
            }
        };
        let Ok(seqno) = i64::try_from(event.sequence_number) else {
            tracing::error!(sequence_number = event.sequence_number, "sequence number exceeds i64");
            return false;
        };

        let id = data.id;
        let token = Token {
            id: token_primary_key(&id.creator, &id.collection, &id.name),
            collection_id: collection.id,
            owner: id.creator.clone(),
            creator: id.creator,
            collection: id.collection,
            name: id.name,
            description: data.description,
            uri: data.uri,
            property_version: "0".to_string(),
            seqno,
        };
        match self.store.upsert_token(&token).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(token = %token.name, collection = %token.collection, error = %e, "failed to save token");
                false
            }
        }
    }

    /// Upserts `events` with at most [`WRITE_CONCURRENCY`] writes in flight.
    /// Returns how many were saved.
    pub async fn dump_tokens(&self, collection: &Collection, events: &[RawEvent]) -> usize {
        stream::iter(events)
            .map(|event| self.dump_token(collection, event))
            .buffer_unordered(WRITE_CONCURRENCY)
            .filter(|saved| std::future::ready(*saved))
            .count()
            .await
    }
}

/// Totals of a backfill run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Collections saved.
    pub collections: usize,
    /// Collection events that failed.
    pub collections_failed: usize,
    /// Tokens saved.
    pub tokens: usize,
    /// Token events that failed.
    pub tokens_failed: usize,
}

/// Imports the account's collections, optionally only the one named
/// `only`, and their tokens.
pub async fn run<S: Store>(
    fetcher: &Fetcher,
    dumper: &Dumper<S>,
    only: Option<&str>,
) -> BackfillReport {
    let mut report = BackfillReport::default();

    let events: Vec<RawEvent> = fetcher
        .collection_events()
        .await
        .into_iter()
        .filter(|event| {
            only.is_none_or(|name| {
                event.data.get("collection_name").and_then(serde_json::Value::as_str) == Some(name)
            })
        })
        .collect();
    tracing::info!(collections = events.len(), "collection events to import");

    for event in &events {
        let Some(collection) = dumper.dump_collection(event).await else {
            report.collections_failed += 1;
            continue;
        };
        report.collections += 1;

        let tokens = fetcher.token_data_events(&collection).await;
        let saved = dumper.dump_tokens(&collection, &tokens).await;
        report.tokens += saved;
        report.tokens_failed += tokens.len().saturating_sub(saved);
        tracing::info!(
            collection = %collection.name,
            tokens = tokens.len(),
            saved,
            "collection imported"
        );
    }

    report
}
