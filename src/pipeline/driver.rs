//! Per-stream polling loop.
//!
//! Each enabled stream runs in its own task with its own copy of the
//! [`State`]. Streams touch disjoint offset columns and disjoint rows, so
//! they need no coordination beyond the shared shutdown signal.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;

use super::Backoff;
use crate::config::{IndexerConfig, PollPolicy};
use crate::domain::{EventKind, State};
use crate::error::{IndexerError, ProcessError, Severity};
use crate::observer::{Observer, Processor, observer_for};
use crate::source::{EventFeed, EventSource, Subject};
use crate::store::Store;

/// A feed paired with the observer for the same stream.
pub struct Stream<S: Store> {
    feed: Arc<dyn EventFeed>,
    observer: Arc<dyn Observer<S>>,
}

impl<S: Store> std::fmt::Debug for Stream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

impl<S: Store> Stream<S> {
    /// Pairs `feed` with `observer`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::KindMismatch`] if they serve different
    /// streams.
    pub fn new(
        feed: Arc<dyn EventFeed>,
        observer: Arc<dyn Observer<S>>,
    ) -> Result<Self, ProcessError> {
        if feed.kind() != observer.kind() {
            return Err(ProcessError::KindMismatch {
                expected: observer.kind(),
                actual: feed.kind(),
            });
        }
        Ok(Self { feed, observer })
    }

    /// Stream served by this pair.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.observer.kind()
    }
}

/// Builds one node-backed stream per enabled kind in `config`.
///
/// # Errors
///
/// Returns [`ProcessError::KindMismatch`] only if the observer registry is
/// inconsistent with [`EventKind`].
pub fn streams_from_config<S: Store>(
    config: &IndexerConfig,
    source: &EventSource,
) -> Result<Vec<Stream<S>>, ProcessError> {
    config
        .streams
        .iter()
        .map(|(kind, locator)| {
            let feed = Subject::new(*kind, source.clone(), locator.clone(), config.page_limit);
            Stream::new(Arc::new(feed), observer_for::<S>(*kind, config))
        })
        .collect()
}

/// What one iteration of a stream loop achieved.
#[derive(Debug)]
pub enum StepOutcome {
    /// This many events were committed.
    Advanced(usize),
    /// The stream is caught up.
    Idle,
    /// A transient failure; retry from the committed offset after a delay.
    Retry,
    /// A fatal failure; the stream must stop.
    Halted(ProcessError),
}

/// Drives every stream until shutdown or a fatal error.
pub struct Driver<S: Store> {
    processor: Arc<Processor<S>>,
    poll: PollPolicy,
    shutdown: watch::Receiver<bool>,
}

impl<S: Store> Clone for Driver<S> {
    fn clone(&self) -> Self {
        Self {
            processor: Arc::clone(&self.processor),
            poll: self.poll,
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S: Store> std::fmt::Debug for Driver<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("processor", &self.processor)
            .field("poll", &self.poll)
            .finish_non_exhaustive()
    }
}

impl<S: Store> Driver<S> {
    /// Creates a driver. Sending `true` on the paired `watch::Sender` (or
    /// dropping it) stops every stream after its in-flight batch.
    #[must_use]
    pub fn new(processor: Processor<S>, poll: PollPolicy, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            processor: Arc::new(processor),
            poll,
            shutdown,
        }
    }

    /// Fetches and applies one batch of `stream` starting after `state`.
    ///
    /// Returns the state after whatever was committed, which may be
    /// ahead of `state` even when the outcome is `Retry` or `Halted`.
    pub async fn step(&self, stream: &Stream<S>, state: State) -> (State, StepOutcome) {
        let kind = stream.kind();
        let committed = state.offset(kind);

        let events = match stream.feed.next_batch(committed).await {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(%kind, ?committed, error = %e, "event fetch failed");
                return (state, StepOutcome::Retry);
            }
        };
        if events.is_empty() {
            tracing::trace!(%kind, ?committed, "stream caught up");
            return (state, StepOutcome::Idle);
        }

        let outcome = self
            .processor
            .process_all(stream.observer.as_ref(), state, &events)
            .await;
        tracing::debug!(
            %kind,
            fetched = events.len(),
            applied = outcome.applied,
            offset = ?outcome.state.offset(kind),
            "batch processed"
        );

        match outcome.error {
            None => (outcome.state, StepOutcome::Advanced(outcome.applied)),
            Some(e) if e.severity() == Severity::Transient => {
                tracing::warn!(%kind, error = %e, "transient processing failure");
                (outcome.state, StepOutcome::Retry)
            }
            Some(e) => (outcome.state, StepOutcome::Halted(e)),
        }
    }

    /// Loops [`Driver::step`] until shutdown or a fatal error.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::StreamHalted`] when the stream stops on a
    /// fatal processing error.
    pub async fn run_stream(&self, stream: Stream<S>, start: State) -> Result<State, IndexerError> {
        let kind = stream.kind();
        let mut state = start;
        let mut backoff = Backoff::new(&self.poll);
        let mut shutdown = self.shutdown.clone();
        tracing::info!(%kind, offset = ?state.offset(kind), "stream started");

        loop {
            if *shutdown.borrow() {
                tracing::info!(%kind, offset = ?state.offset(kind), "stream stopped");
                return Ok(state);
            }

            let (next, outcome) = self.step(&stream, state).await;
            state = next;

            let delay = match outcome {
                StepOutcome::Advanced(_) => {
                    backoff.reset();
                    continue;
                }
                StepOutcome::Idle => {
                    backoff.reset();
                    self.poll.idle_interval
                }
                StepOutcome::Retry => {
                    let delay = backoff.next_delay();
                    tracing::info!(
                        %kind,
                        attempt = backoff.attempts(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "retrying stream"
                    );
                    delay
                }
                StepOutcome::Halted(e) => {
                    tracing::error!(
                        %kind,
                        offset = ?state.offset(kind),
                        error = %e,
                        "stream halted; operator action required"
                    );
                    return Err(IndexerError::StreamHalted { kind, source: e });
                }
            };

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        tracing::info!(%kind, "shutdown sender dropped");
                        return Ok(state);
                    }
                }
            }
        }
    }

    /// Loads the committed offsets and runs every stream concurrently.
    ///
    /// A halted stream does not stop the others. Returns once every stream
    /// has stopped.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::Store`] if the offsets cannot be loaded and
    /// the first [`IndexerError::StreamHalted`] (or task failure) otherwise.
    pub async fn run(&self, streams: Vec<Stream<S>>) -> Result<(), IndexerError> {
        let state = self.processor.store().load_offsets().await?;
        for (kind, offset) in state.iter() {
            tracing::info!(%kind, ?offset, "loaded committed offset");
        }

        let mut tasks: JoinSet<Result<State, IndexerError>> = JoinSet::new();
        for stream in streams {
            let driver = self.clone();
            tasks.spawn(async move { driver.run_stream(stream, state).await });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| IndexerError::Task(e.to_string())).and_then(|r| r);
            if let Err(e) = result {
                tracing::error!(error = %e, "stream task ended with error");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::cache::{CacheKeys, MemoryCache};
    use crate::config::DefaultCollection;
    use crate::domain::{Chain, Collection, RawEvent};
    use crate::error::FetchError;
    use crate::observer::{CreateTokenObserver, ListObserver};
    use crate::source::normalize_batch;
    use crate::store::{Fault, MemoryStore};

    /// Serves a fixed event log, failing the first `failures` calls.
    struct LogFeed {
        kind: EventKind,
        log: Vec<RawEvent>,
        limit: usize,
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    impl LogFeed {
        fn new(kind: EventKind, log: Vec<RawEvent>) -> Self {
            Self {
                kind,
                log,
                limit: 2,
                failures: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EventFeed for LogFeed {
        fn kind(&self) -> EventKind {
            self.kind
        }

        async fn next_batch(&self, committed: Option<u64>) -> Result<Vec<RawEvent>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(FetchError::Decode("injected".to_string()));
            }
            let start = committed.map_or(0, |n| n + 1);
            let page = self
                .log
                .iter()
                .filter(|e| e.sequence_number >= start)
                .take(self.limit)
                .cloned()
                .collect();
            normalize_batch(self.kind, committed, page)
        }
    }

    fn mint(seq: u64) -> RawEvent {
        RawEvent {
            version: 100 + seq,
            sequence_number: seq,
            data: serde_json::json!({
                "user": "0xuser",
                "name": format!("T{seq}"),
                "description": "",
                "uri": ""
            }),
        }
    }

    async fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        let defaults = DefaultCollection::default();
        store
            .seed_collection(Collection {
                id: Uuid::new_v4(),
                chain: Chain::Aptos,
                creator: defaults.creator,
                name: defaults.name,
                description: String::new(),
                uri: String::new(),
                maximum: "0".to_string(),
            })
            .await;
        store
    }

    fn driver(store: &MemoryStore) -> (Driver<MemoryStore>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let processor = Processor::new(
            store.clone(),
            Arc::new(MemoryCache::new()),
            CacheKeys::new("cache:imart"),
            Duration::from_secs(5),
        );
        let poll = PollPolicy {
            idle_interval: Duration::from_millis(5),
            retry_base: Duration::from_millis(1),
            retry_max: Duration::from_millis(4),
        };
        (Driver::new(processor, poll, rx), tx)
    }

    fn mint_stream(feed: LogFeed) -> (Arc<LogFeed>, Stream<MemoryStore>) {
        let feed = Arc::new(feed);
        let observer: Arc<dyn Observer<MemoryStore>> =
            Arc::new(CreateTokenObserver::new(DefaultCollection::default()));
        let Ok(stream) = Stream::new(Arc::clone(&feed) as Arc<dyn EventFeed>, observer) else {
            panic!("kinds match");
        };
        (feed, stream)
    }

    #[test]
    fn mismatched_pair_is_rejected() {
        let feed: Arc<dyn EventFeed> = Arc::new(LogFeed::new(EventKind::Delist, Vec::new()));
        let observer: Arc<dyn Observer<MemoryStore>> = Arc::new(ListObserver);
        let result = Stream::new(feed, observer);
        assert!(matches!(
            result,
            Err(ProcessError::KindMismatch {
                expected: EventKind::List,
                actual: EventKind::Delist,
            })
        ));
    }

    #[tokio::test]
    async fn step_fetches_from_committed_offset() {
        let store = seeded_store().await;
        let (driver, _tx) = driver(&store);
        let (_, stream) = mint_stream(LogFeed::new(
            EventKind::CreateToken,
            (0..5).map(mint).collect(),
        ));

        let (state, outcome) = driver.step(&stream, State::default()).await;
        assert!(matches!(outcome, StepOutcome::Advanced(2)));
        assert_eq!(state.offset(EventKind::CreateToken), Some(1));

        let (state, outcome) = driver.step(&stream, state).await;
        assert!(matches!(outcome, StepOutcome::Advanced(2)));
        assert_eq!(state.offset(EventKind::CreateToken), Some(3));
        assert_eq!(store.tokens().await.len(), 4);
    }

    #[tokio::test]
    async fn fetch_failure_is_retried_without_progress() {
        let store = seeded_store().await;
        let (driver, _tx) = driver(&store);
        let feed = LogFeed::new(EventKind::CreateToken, vec![mint(0)]);
        feed.failures.store(1, Ordering::SeqCst);
        let (_, stream) = mint_stream(feed);

        let (state, outcome) = driver.step(&stream, State::default()).await;
        assert!(matches!(outcome, StepOutcome::Retry));
        assert_eq!(state, State::default());
    }

    #[tokio::test]
    async fn unavailable_store_is_retried_then_recovers() {
        let store = seeded_store().await;
        store.inject(Fault::Unavailable).await;
        let (driver, _tx) = driver(&store);
        let (_, stream) = mint_stream(LogFeed::new(EventKind::CreateToken, vec![mint(0)]));

        let (state, outcome) = driver.step(&stream, State::default()).await;
        assert!(matches!(outcome, StepOutcome::Retry));

        let (state, outcome) = driver.step(&stream, state).await;
        assert!(matches!(outcome, StepOutcome::Advanced(1)));
        assert_eq!(state.offset(EventKind::CreateToken), Some(0));
    }

    #[tokio::test]
    async fn run_stream_halts_on_fatal_error() {
        let store = MemoryStore::new();
        let (driver, _tx) = driver(&store);
        let (_, stream) = mint_stream(LogFeed::new(EventKind::CreateToken, vec![mint(0)]));

        let result = driver.run_stream(stream, State::default()).await;
        let Err(IndexerError::StreamHalted { kind, source }) = result else {
            panic!("missing collection must halt the stream");
        };
        assert_eq!(kind, EventKind::CreateToken);
        assert!(matches!(source, ProcessError::MissingReference { .. }));
    }

    #[tokio::test]
    async fn run_stream_stops_on_shutdown() {
        let store = seeded_store().await;
        let (driver, tx) = driver(&store);
        let (feed, stream) = mint_stream(LogFeed::new(
            EventKind::CreateToken,
            (0..3).map(mint).collect(),
        ));

        let handle = tokio::spawn(async move { driver.run_stream(stream, State::default()).await });
        while feed.calls.load(Ordering::SeqCst) < 4 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let _ = tx.send(true);

        let Ok(Ok(state)) = handle.await else {
            panic!("stream should stop cleanly");
        };
        assert_eq!(state.offset(EventKind::CreateToken), Some(2));
    }

    /// Hands out its pages verbatim, one per call.
    struct RawFeed {
        kind: EventKind,
        pages: tokio::sync::Mutex<Vec<Vec<RawEvent>>>,
    }

    #[async_trait]
    impl EventFeed for RawFeed {
        fn kind(&self) -> EventKind {
            self.kind
        }

        async fn next_batch(&self, _committed: Option<u64>) -> Result<Vec<RawEvent>, FetchError> {
            let mut pages = self.pages.lock().await;
            if pages.is_empty() {
                return Ok(Vec::new());
            }
            Ok(pages.remove(0))
        }
    }

    #[tokio::test]
    async fn gap_in_feed_is_retried_without_commit() {
        let store = seeded_store().await;
        let (driver, _tx) = driver(&store);
        let (_, stream) = mint_stream(LogFeed::new(
            EventKind::CreateToken,
            vec![mint(0), mint(2)],
        ));

        let (state, outcome) = driver.step(&stream, State::default()).await;
        assert!(matches!(outcome, StepOutcome::Advanced(1)));
        assert_eq!(state.offset(EventKind::CreateToken), Some(0));

        let (state, outcome) = driver.step(&stream, state).await;
        assert!(matches!(outcome, StepOutcome::Retry));
        assert_eq!(state.offset(EventKind::CreateToken), Some(0));
        let Ok(offsets) = store.load_offsets().await else {
            panic!("offsets row exists");
        };
        assert_eq!(offsets.offset(EventKind::CreateToken), Some(0));
        assert_eq!(store.tokens().await.len(), 1);
    }

    #[tokio::test]
    async fn unordered_batch_halts_before_any_write() {
        let store = seeded_store().await;
        let (driver, _tx) = driver(&store);
        let feed: Arc<dyn EventFeed> = Arc::new(RawFeed {
            kind: EventKind::CreateToken,
            pages: tokio::sync::Mutex::new(vec![vec![mint(1), mint(0)]]),
        });
        let observer: Arc<dyn Observer<MemoryStore>> =
            Arc::new(CreateTokenObserver::new(DefaultCollection::default()));
        let Ok(stream) = Stream::new(feed, observer) else {
            panic!("kinds match");
        };

        let (state, outcome) = driver.step(&stream, State::default()).await;
        assert!(matches!(
            outcome,
            StepOutcome::Halted(ProcessError::OutOfSequence {
                sequence_number: 1,
                expected: 0,
                ..
            })
        ));
        assert_eq!(state, State::default());
        assert!(store.tokens().await.is_empty());
    }

    #[tokio::test]
    async fn run_reports_halted_stream() {
        let store = MemoryStore::new();
        let (driver, _tx) = driver(&store);
        let (_, stream) = mint_stream(LogFeed::new(EventKind::CreateToken, vec![mint(0)]));

        let result = driver.run(vec![stream]).await;
        assert!(matches!(result, Err(IndexerError::StreamHalted { .. })));
    }
}
