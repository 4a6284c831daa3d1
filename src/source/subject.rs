//! Per-stream batch cursor.
//!
//! A [`Subject`] keeps no cursor of its own. Each call to
//! [`EventFeed::next_batch`] receives the last committed offset and fetches
//! the page that follows it, so the next fetch always reflects the previous
//! commit rather than what was merely fetched.

use async_trait::async_trait;

use super::{EventSource, StreamLocator};
use crate::domain::{EventKind, RawEvent};
use crate::error::FetchError;

/// Pull-based supplier of the next unconsumed batch of one stream.
#[async_trait]
pub trait EventFeed: Send + Sync {
    /// Stream this feed serves.
    fn kind(&self) -> EventKind;

    /// Returns the events following `committed`, in ascending sequence order.
    ///
    /// An empty batch means "caught up".
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] when the page could not be retrieved or does
    /// not continue from `committed`; the caller should back off and retry
    /// from the same offset.
    async fn next_batch(&self, committed: Option<u64>) -> Result<Vec<RawEvent>, FetchError>;
}

/// [`EventFeed`] backed by the node REST API.
#[derive(Debug, Clone)]
pub struct Subject {
    kind: EventKind,
    source: EventSource,
    locator: StreamLocator,
    limit: u32,
}

impl Subject {
    /// Creates a subject for `kind` reading `locator` in pages of `limit`.
    #[must_use]
    pub fn new(kind: EventKind, source: EventSource, locator: StreamLocator, limit: u32) -> Self {
        Self {
            kind,
            source,
            locator,
            limit: limit.max(1),
        }
    }

    /// Returns the stream location.
    #[must_use]
    pub fn locator(&self) -> &StreamLocator {
        &self.locator
    }
}

#[async_trait]
impl EventFeed for Subject {
    fn kind(&self) -> EventKind {
        self.kind
    }

    async fn next_batch(&self, committed: Option<u64>) -> Result<Vec<RawEvent>, FetchError> {
        let start = committed.map_or(0, |n| n.saturating_add(1));
        let events = self.source.try_fetch(&self.locator, start, self.limit).await?;
        normalize_batch(self.kind, committed, events)
    }
}

/// Orders a fetched page and drops anything already committed.
///
/// The node returns pages in ascending order, but the pipeline's
/// correctness depends on it, so the order is enforced here. Duplicate
/// sequence numbers keep their first occurrence. The result is a gapless
/// run starting right after `committed`: a page that continues past a
/// hole is cut at the hole.
///
/// # Errors
///
/// Returns [`FetchError::SequenceGap`] when the page does not start at the
/// sequence number following `committed`.
pub fn normalize_batch(
    kind: EventKind,
    committed: Option<u64>,
    mut events: Vec<RawEvent>,
) -> Result<Vec<RawEvent>, FetchError> {
    let fetched = events.len();
    events.retain(|e| committed.is_none_or(|n| e.sequence_number > n));
    events.sort_by_key(|e| e.sequence_number);
    events.dedup_by_key(|e| e.sequence_number);

    if events.len() != fetched {
        tracing::warn!(
            %kind,
            fetched,
            kept = events.len(),
            "dropped already-committed or duplicate events from page"
        );
    }

    let expected = committed.map_or(0, |n| n.saturating_add(1));
    if let Some(first) = events.first()
        && first.sequence_number != expected
    {
        return Err(FetchError::SequenceGap {
            kind,
            expected,
            got: first.sequence_number,
        });
    }

    let contiguous = events
        .iter()
        .zip(expected..)
        .take_while(|(e, want)| e.sequence_number == *want)
        .count();
    if contiguous < events.len() {
        tracing::warn!(
            %kind,
            kept = contiguous,
            dropped = events.len() - contiguous,
            "page has a hole; keeping the run before it"
        );
        events.truncate(contiguous);
    }

    Ok(events)
}
