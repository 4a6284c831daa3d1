//! Persistence layer: the relational projection and the offsets row.
//!
//! [`Store`] exposes lookups by natural key, the backfill upserts and
//! [`Store::begin`], which opens a [`StoreTx`]. Every observer write and the
//! matching offset advance go through one `StoreTx` so they commit or roll
//! back together. Dropping a `StoreTx` without calling
//! [`StoreTx::commit`] rolls it back.
//!
//! [`PgStore`] is the production implementation; [`MemoryStore`] backs the
//! test suite and supports fault injection.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{
    Activity, Chain, Collection, CurationOffer, CurationOfferStatus, EventKind, Gallery, Order,
    State, Token, TokenDataId,
};
use crate::error::StoreError;

pub use memory::{Fault, MemoryStore};
pub use postgres::PgStore;

/// Id of the single row holding every stream offset.
pub const OFFSETS_ROW_ID: i32 = 0;

/// Read access and transaction factory for the projection.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Transaction handle returned by [`Store::begin`].
    type Tx: StoreTx;

    /// Loads the committed offsets of every stream.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::OffsetRowMissing`] when the offsets row has not
    /// been seeded.
    async fn load_offsets(&self) -> Result<State, StoreError>;

    /// Finds a collection by `(chain, creator, name)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn find_collection(
        &self,
        chain: Chain,
        creator: &str,
        name: &str,
    ) -> Result<Option<Collection>, StoreError>;

    /// Finds a token by its definition id and property version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn find_token(
        &self,
        id: &TokenDataId,
        property_version: &str,
    ) -> Result<Option<Token>, StoreError>;

    /// Finds a gallery by `(index, root)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn find_gallery(&self, index: i64, root: &str) -> Result<Option<Gallery>, StoreError>;

    /// Inserts or updates a collection by its natural key, outside any
    /// pipeline transaction. Returns the stored row (with its existing id on
    /// update).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn upsert_collection(&self, collection: &Collection) -> Result<Collection, StoreError>;

    /// Inserts or updates a token by its natural key, outside any pipeline
    /// transaction. Returns the stored row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn upsert_token(&self, token: &Token) -> Result<Token, StoreError>;

    /// Opens an atomic transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when no connection can be obtained.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

/// One atomic unit of work against the projection.
#[async_trait]
pub trait StoreTx: Send {
    /// Inserts a new token row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the token already exists.
    async fn insert_token(&mut self, token: &Token) -> Result<Token, StoreError>;

    /// Inserts a new order row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn insert_order(&mut self, order: &Order) -> Result<Order, StoreError>;

    /// Moves every `LISTING` order of `token_id` to `CANCELED`, returning
    /// how many rows changed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn cancel_listings(&mut self, token_id: Uuid) -> Result<u64, StoreError>;

    /// Inserts an activity-feed row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn insert_activity(&mut self, activity: &Activity) -> Result<Activity, StoreError>;

    /// Inserts or updates a gallery by `(index, root)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn upsert_gallery(&mut self, gallery: &Gallery) -> Result<Gallery, StoreError>;

    /// Inserts or updates a curation offer by `(index, root)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn upsert_offer(&mut self, offer: &CurationOffer) -> Result<CurationOffer, StoreError>;

    /// Sets the status of the offer at `(index, root)`, returning the updated
    /// row or `None` if no such offer exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn set_offer_status(
        &mut self,
        index: i64,
        root: &str,
        status: CurationOfferStatus,
    ) -> Result<Option<CurationOffer>, StoreError>;

    /// Sets `kind`'s offset to `sequence_number` if that moves it forward,
    /// and returns the offset the row holds afterwards.
    ///
    /// A returned value different from `sequence_number` means the guard
    /// rejected the write.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::OffsetRowMissing`] when the row does not exist.
    async fn advance_offset(
        &mut self,
        kind: EventKind,
        sequence_number: u64,
    ) -> Result<Option<u64>, StoreError>;

    /// Commits every write made through this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the commit fails; nothing is applied then.
    async fn commit(self) -> Result<(), StoreError>;
}

/// Converts a stored offset (`-1` = empty) into the in-memory form.
#[must_use]
pub fn offset_from_db(raw: i64) -> Option<u64> {
    u64::try_from(raw).ok()
}

/// Converts a sequence number into the signed column type.
///
/// # Errors
///
/// Returns [`StoreError::Query`] for values beyond `i64::MAX`.
pub fn offset_to_db(sequence_number: u64) -> Result<i64, StoreError> {
    i64::try_from(sequence_number)
        .map_err(|_| StoreError::Query(format!("sequence number {sequence_number} exceeds i64")))
}
