//! Paginated retrieval of raw events from the ledger node REST API.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::domain::RawEvent;
use crate::error::FetchError;

/// Location of one append-only event stream on the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLocator {
    /// Account whose resource holds the event handle.
    pub address: String,
    /// Fully qualified handle struct, e.g. `0x1::marketplace::OrderStore`.
    pub handle: String,
    /// Field of the handle struct that holds the events.
    pub field: String,
}

impl StreamLocator {
    /// Builds a locator whose account is the handle's module address.
    #[must_use]
    pub fn from_handle(handle: impl Into<String>, field: impl Into<String>) -> Self {
        let handle = handle.into();
        let address = handle
            .split("::")
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            address,
            handle,
            field: field.into(),
        }
    }

    /// Builds a locator for a handle living under an explicit account.
    #[must_use]
    pub fn at_account(
        address: impl Into<String>,
        handle: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            handle: handle.into(),
            field: field.into(),
        }
    }
}

impl std::fmt::Display for StreamLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.handle, self.field)
    }
}

/// HTTP client for the node's `/accounts/{address}/events/{handle}/{field}`
/// endpoint.
///
/// Cheap to clone: the inner [`reqwest::Client`] is reference counted.
#[derive(Debug, Clone)]
pub struct EventSource {
    client: reqwest::Client,
    node_url: String,
}

impl EventSource {
    /// Creates a source for the node at `node_url` (e.g. `https://.../v1`).
    #[must_use]
    pub fn new(client: reqwest::Client, node_url: impl Into<String>) -> Self {
        let node_url = node_url.into().trim_end_matches('/').to_string();
        Self { client, node_url }
    }

    /// Returns the node base URL.
    #[must_use]
    pub fn node_url(&self) -> &str {
        &self.node_url
    }

    /// Builds the request URL for a page of `locator`'s events.
    #[must_use]
    pub fn url(&self, locator: &StreamLocator, start: u64, limit: u32) -> String {
        format!(
            "{}/accounts/{}/events/{}/{}?start={start}&limit={limit}",
            self.node_url, locator.address, locator.handle, locator.field
        )
    }

    /// Fetches up to `limit` events starting at sequence number `start`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Status`] on a non-success response,
    /// [`FetchError::Network`] on transport failure and
    /// [`FetchError::Decode`] when the body is not an event array.
    pub async fn try_fetch(
        &self,
        locator: &StreamLocator,
        start: u64,
        limit: u32,
    ) -> Result<Vec<RawEvent>, FetchError> {
        let url = self.url(locator, start, limit);
        tracing::trace!(%url, "fetching events");

        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = resp.bytes().await?;
        serde_json::from_slice::<Vec<RawEvent>>(&bytes).map_err(|e| FetchError::Decode(e.to_string()))
    }

    /// Soft-failure variant of [`EventSource::try_fetch`].
    ///
    /// Any failure is logged and reported as an empty page. Callers must
    /// read an empty page as "no progress", never as "stream ended".
    pub async fn fetch(&self, locator: &StreamLocator, start: u64, limit: u32) -> Vec<RawEvent> {
        match self.try_fetch(locator, start, limit).await {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(stream = %locator, start, error = %e, "event fetch failed");
                Vec::new()
            }
        }
    }

    /// Fetches many pages with at most `concurrency` requests in flight.
    ///
    /// Pages are `(start, limit)` pairs. Results come back in the order the
    /// pages were given, regardless of completion order; a failed page
    /// contributes an empty slot (see [`EventSource::fetch`]).
    pub async fn fetch_pages(
        &self,
        locator: &StreamLocator,
        pages: Vec<(u64, u32)>,
        concurrency: usize,
    ) -> Vec<Vec<RawEvent>> {
        if pages.is_empty() {
            return Vec::new();
        }

        let total = pages.len();
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut join_set = JoinSet::new();

        for (idx, (start, limit)) in pages.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let source = self.clone();
            let locator = locator.clone();
            join_set.spawn(async move {
                // Permit is taken inside the task so spawning never blocks.
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (idx, Vec::new());
                };
                (idx, source.fetch(&locator, start, limit).await)
            });
        }

        let mut indexed: Vec<(usize, Vec<RawEvent>)> = Vec::with_capacity(total);
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(page) => indexed.push(page),
                Err(e) => tracing::error!(stream = %locator, error = %e, "page fetch task failed"),
            }
        }

        indexed.sort_by_key(|(idx, _)| *idx);
        indexed.into_iter().map(|(_, events)| events).collect()
    }
}
