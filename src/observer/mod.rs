//! Observers: per-stream business logic plus the shared transaction protocol.
//!
//! An [`Observer`] turns one raw event into a [`Mutation`]. It parses the
//! payload and resolves references by lookup, outside any transaction. The
//! [`Processor`] then runs the same protocol for every stream:
//!
//! 1. reject events at or behind the committed offset
//! 2. plan the mutation (observer)
//! 3. begin → apply with write verification → guarded offset update → commit,
//!    all under the transaction deadline
//! 4. advance the in-memory [`State`] by exactly one field
//! 5. invalidate cache keys, best effort
//!
//! A failure anywhere in 1–3 leaves the store untouched for that event.

pub mod creation;
pub mod curation;
pub mod order;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::cache::{CacheInvalidator, CacheKeys, invalidate_all};
use crate::config::IndexerConfig;
use crate::domain::{
    Activity, CurationOffer, CurationOfferStatus, EventKind, Gallery, Order, OrderStatus,
    RawEvent, State, Token, TxType,
};
use crate::error::ProcessError;
use crate::store::{Store, StoreTx};

pub use creation::CreateTokenObserver;
pub use curation::{GalleryCreateObserver, OfferCreateObserver, OfferRejectObserver};
pub use order::{DelistObserver, ListObserver};

/// Plans the effect of one event type on the projection.
#[async_trait]
pub trait Observer<S: Store>: Send + Sync {
    /// Stream this observer owns.
    fn kind(&self) -> EventKind;

    /// Parses `event` and resolves everything it references.
    ///
    /// Must not write. The returned mutation is applied by the
    /// [`Processor`] inside the event's transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::MalformedPayload`] when the payload does not
    /// parse and [`ProcessError::MissingReference`] when a referenced row is
    /// absent.
    async fn plan(&self, store: &S, event: &RawEvent) -> Result<Mutation, ProcessError>;
}

/// Returns the observer for `kind`, configured from `config`.
#[must_use]
pub fn observer_for<S: Store>(kind: EventKind, config: &IndexerConfig) -> Arc<dyn Observer<S>> {
    match kind {
        EventKind::CreateToken => Arc::new(CreateTokenObserver::new(
            config.default_collection.clone(),
        )),
        EventKind::List => Arc::new(ListObserver),
        EventKind::Delist => Arc::new(DelistObserver),
        EventKind::GalleryCreate => {
            Arc::new(GalleryCreateObserver::new(config.curation_address.clone()))
        }
        EventKind::CurationOfferCreate => {
            Arc::new(OfferCreateObserver::new(config.curation_address.clone()))
        }
        EventKind::CurationOfferReject => {
            Arc::new(OfferRejectObserver::new(config.curation_address.clone()))
        }
    }
}

/// Writes one event makes, decided before the transaction opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Insert a freshly minted token.
    CreateToken(Token),
    /// Open a listing and record it in the activity feed.
    List {
        /// New `LISTING` order.
        order: Order,
        /// Matching `LIST` activity.
        activity: Activity,
    },
    /// Cancel the token's open listings and record it in the activity feed.
    Delist {
        /// Token whose listings are cancelled.
        token_id: Uuid,
        /// Collection of the token, for cache invalidation.
        collection_id: Uuid,
        /// Matching `CANCEL` activity.
        activity: Activity,
    },
    /// Insert or refresh a gallery.
    UpsertGallery(Gallery),
    /// Insert or refresh a pending curation offer.
    UpsertOffer(CurationOffer),
    /// Mark an existing curation offer as rejected.
    RejectOffer {
        /// Offer index under the curation root.
        index: i64,
        /// Curation root account.
        root: String,
    },
}

impl Mutation {
    /// Applies the writes through `tx` and checks what the store returned.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::WriteVerification`] when a write did not
    /// produce the expected row and [`ProcessError::Store`] when the store
    /// failed.
    pub async fn apply<T: StoreTx>(
        &self,
        tx: &mut T,
        kind: EventKind,
        sequence_number: u64,
    ) -> Result<(), ProcessError> {
        let verify = |ok: bool, reason: &dyn Fn() -> String| {
            if ok {
                Ok(())
            } else {
                Err(ProcessError::WriteVerification {
                    kind,
                    sequence_number,
                    reason: reason(),
                })
            }
        };

        match self {
            Self::CreateToken(token) => {
                let stored = tx.insert_token(token).await?;
                verify(stored.id == token.id, &|| {
                    format!("token {} stored as {}", token.id, stored.id)
                })
            }
            Self::List { order, activity } => {
                let stored = tx.insert_order(order).await?;
                verify(stored.status == OrderStatus::Listing, &|| {
                    format!("order {} stored with status {}", stored.id, stored.status)
                })?;
                let stored = tx.insert_activity(activity).await?;
                verify(stored.tx_type == TxType::List, &|| {
                    format!("activity {} stored as {}", stored.id, stored.tx_type)
                })
            }
            Self::Delist {
                token_id, activity, ..
            } => {
                let cancelled = tx.cancel_listings(*token_id).await?;
                if cancelled == 0 {
                    tracing::warn!(
                        %kind,
                        sequence_number,
                        token_id = %token_id,
                        "delist found no open listing"
                    );
                }
                let stored = tx.insert_activity(activity).await?;
                verify(stored.tx_type == TxType::Cancel, &|| {
                    format!("activity {} stored as {}", stored.id, stored.tx_type)
                })
            }
            Self::UpsertGallery(gallery) => {
                let stored = tx.upsert_gallery(gallery).await?;
                verify(
                    stored.index == gallery.index && stored.root == gallery.root,
                    &|| format!("gallery {}/{} not stored", gallery.root, gallery.index),
                )
            }
            Self::UpsertOffer(offer) => {
                let stored = tx.upsert_offer(offer).await?;
                verify(stored.status == CurationOfferStatus::Pending, &|| {
                    format!("offer {}/{} stored as {}", offer.root, offer.index, stored.status)
                })
            }
            Self::RejectOffer { index, root } => {
                let stored = tx
                    .set_offer_status(*index, root, CurationOfferStatus::Rejected)
                    .await?;
                match stored {
                    Some(offer) => verify(offer.status == CurationOfferStatus::Rejected, &|| {
                        format!("offer {root}/{index} stored as {}", offer.status)
                    }),
                    None => verify(false, &|| format!("no curation offer {root}/{index}")),
                }
            }
        }
    }

    /// Cache keys made stale by this mutation.
    #[must_use]
    pub fn cache_keys(&self, keys: &CacheKeys) -> Vec<String> {
        match self {
            Self::List { order, .. } => vec![
                keys.order(order.token_id),
                keys.collection_stats(order.collection_id),
            ],
            Self::Delist {
                token_id,
                collection_id,
                ..
            } => vec![keys.order(*token_id), keys.collection_stats(*collection_id)],
            Self::CreateToken(_)
            | Self::UpsertGallery(_)
            | Self::UpsertOffer(_)
            | Self::RejectOffer { .. } => Vec::new(),
        }
    }
}

/// Result of [`Processor::process_all`].
#[derive(Debug)]
pub struct BatchOutcome {
    /// State after the last committed event.
    pub state: State,
    /// Number of events committed.
    pub applied: usize,
    /// Error that stopped the batch, if any. Events after it were not
    /// attempted.
    pub error: Option<ProcessError>,
}

/// Default budget for the post-commit cache deletes of one event.
pub const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs the per-event transaction protocol against a store.
pub struct Processor<S: Store> {
    store: S,
    cache: Arc<dyn CacheInvalidator>,
    keys: CacheKeys,
    tx_timeout: Duration,
    cache_timeout: Duration,
}

impl<S: Store> std::fmt::Debug for Processor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("keys", &self.keys)
            .field("tx_timeout", &self.tx_timeout)
            .field("cache_timeout", &self.cache_timeout)
            .finish_non_exhaustive()
    }
}

impl<S: Store> Processor<S> {
    /// Creates a processor writing to `store` and invalidating `cache`.
    #[must_use]
    pub fn new(
        store: S,
        cache: Arc<dyn CacheInvalidator>,
        keys: CacheKeys,
        tx_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            keys,
            tx_timeout,
            cache_timeout: DEFAULT_CACHE_TIMEOUT,
        }
    }

    /// Bounds the cache deletes that follow each commit.
    #[must_use]
    pub fn with_cache_timeout(mut self, cache_timeout: Duration) -> Self {
        self.cache_timeout = cache_timeout;
        self
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Applies one event and returns the state with its stream advanced to
    /// `event.sequence_number`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::StaleEvent`] for an event at or behind the
    /// committed offset, [`ProcessError::OutOfSequence`] for an event that
    /// does not directly follow it, [`ProcessError::TransactionTimeout`] when the
    /// transaction exceeds its deadline, [`ProcessError::OffsetNotApplied`]
    /// when the guarded offset update did not land, and whatever the
    /// observer or store reports. Nothing is committed in any error case.
    pub async fn process(
        &self,
        observer: &dyn Observer<S>,
        state: State,
        event: &RawEvent,
    ) -> Result<State, ProcessError> {
        let kind = observer.kind();
        let sequence_number = event.sequence_number;

        if let Some(committed) = state.offset(kind)
            && sequence_number <= committed
        {
            return Err(ProcessError::StaleEvent {
                kind,
                sequence_number,
                committed,
            });
        }

        let expected = state.next_start(kind);
        if sequence_number != expected {
            return Err(ProcessError::OutOfSequence {
                kind,
                sequence_number,
                expected,
            });
        }

        let mutation = observer.plan(&self.store, event).await?;

        tokio::time::timeout(
            self.tx_timeout,
            self.commit_mutation(kind, sequence_number, &mutation),
        )
        .await
        .map_err(|_| ProcessError::TransactionTimeout {
            kind,
            sequence_number,
            timeout_ms: u64::try_from(self.tx_timeout.as_millis()).unwrap_or(u64::MAX),
        })??;

        let next = state
            .advance(kind, sequence_number)
            .map_err(|e| ProcessError::StaleEvent {
                kind,
                sequence_number,
                committed: e.current.unwrap_or_default(),
            })?;

        tracing::info!(%kind, sequence_number, version = event.version, "event applied");

        invalidate_all(
            self.cache.as_ref(),
            &mutation.cache_keys(&self.keys),
            self.cache_timeout,
        )
        .await;
        Ok(next)
    }

    /// Applies `events` in order, stopping at the first failure.
    ///
    /// Events before the failing one stay committed. A batch that is not a
    /// gapless run starting right after the committed offset is rejected
    /// whole with [`ProcessError::OutOfSequence`] and nothing is applied.
    pub async fn process_all(
        &self,
        observer: &dyn Observer<S>,
        state: State,
        events: &[RawEvent],
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            state,
            applied: 0,
            error: None,
        };

        let kind = observer.kind();
        let mut expected = state.next_start(kind);
        for event in events {
            if event.sequence_number != expected {
                tracing::error!(
                    %kind,
                    sequence_number = event.sequence_number,
                    expected,
                    "batch is not contiguous with the committed offset"
                );
                outcome.error = Some(ProcessError::OutOfSequence {
                    kind,
                    sequence_number: event.sequence_number,
                    expected,
                });
                return outcome;
            }
            expected = expected.saturating_add(1);
        }

        for event in events {
            match self.process(observer, outcome.state, event).await {
                Ok(next) => {
                    outcome.state = next;
                    outcome.applied += 1;
                }
                Err(e) => {
                    outcome.error = Some(e);
                    break;
                }
            }
        }
        outcome
    }

    async fn commit_mutation(
        &self,
        kind: EventKind,
        sequence_number: u64,
        mutation: &Mutation,
    ) -> Result<(), ProcessError> {
        let mut tx = self.store.begin().await?;
        mutation.apply(&mut tx, kind, sequence_number).await?;

        let stored = tx.advance_offset(kind, sequence_number).await?;
        if stored != Some(sequence_number) {
            return Err(ProcessError::OffsetNotApplied {
                kind,
                expected: sequence_number,
                actual: stored,
            });
        }

        tx.commit().await?;
        Ok(())
    }
}

/// Parses the payload of `event`, mapping failures to
/// [`ProcessError::MalformedPayload`].
pub(crate) fn parse_payload<T: serde::de::DeserializeOwned>(
    kind: EventKind,
    event: &RawEvent,
) -> Result<T, ProcessError> {
    event
        .parse_data()
        .map_err(|reason| ProcessError::MalformedPayload {
            kind,
            sequence_number: event.sequence_number,
            reason,
        })
}
