//! In-memory [`Store`] with copy-on-begin transactions and fault injection.
//!
//! A transaction holds the table lock for its whole lifetime and works on a
//! private copy of the tables; `commit` swaps the copy in, dropping the
//! transaction discards it. That gives serializable, all-or-nothing
//! semantics without a database.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{Store, StoreTx};
use crate::domain::{
    Activity, Chain, Collection, CurationOffer, CurationOfferStatus, EventKind, Gallery, Order,
    OrderStatus, State, Token, TokenDataId,
};
use crate::error::StoreError;

/// Failure to inject into the next matching store call. Each fault fires once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// [`Store::begin`] reports the store as unreachable.
    Unavailable,
    /// The offset write for this event fails with a query error.
    FailOffsetWrite {
        /// Stream of the event.
        kind: EventKind,
        /// Sequence number of the event.
        sequence_number: u64,
    },
    /// The offset write for this event is silently not applied.
    IgnoreOffsetWrite {
        /// Stream of the event.
        kind: EventKind,
        /// Sequence number of the event.
        sequence_number: u64,
    },
    /// The next commit fails.
    FailCommit,
    /// The next commit sleeps before applying.
    StallCommit(Duration),
}

#[derive(Debug, Clone, Default)]
struct Tables {
    offsets: Option<State>,
    collections: Vec<Collection>,
    tokens: Vec<Token>,
    orders: Vec<Order>,
    activities: Vec<Activity>,
    galleries: Vec<Gallery>,
    offers: Vec<CurationOffer>,
}

/// Shared in-memory projection. Clones share the same tables.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<Mutex<Vec<Fault>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates a store with a seeded, empty offsets row.
    #[must_use]
    pub fn new() -> Self {
        Self::with_tables(Tables {
            offsets: Some(State::default()),
            ..Tables::default()
        })
    }

    /// Creates a store whose offsets row is missing.
    #[must_use]
    pub fn without_offsets_row() -> Self {
        Self::with_tables(Tables::default())
    }

    fn with_tables(tables: Tables) -> Self {
        Self {
            tables: Arc::new(Mutex::new(tables)),
            faults: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queues a fault for the next matching call.
    pub async fn inject(&self, fault: Fault) {
        self.faults.lock().await.push(fault);
    }

    /// Returns faults that have not fired yet.
    pub async fn pending_faults(&self) -> Vec<Fault> {
        self.faults.lock().await.clone()
    }

    /// Overwrites the committed offsets.
    pub async fn set_offsets(&self, state: State) {
        self.tables.lock().await.offsets = Some(state);
    }

    /// Inserts a collection row directly.
    pub async fn seed_collection(&self, collection: Collection) {
        self.tables.lock().await.collections.push(collection);
    }

    /// Inserts a token row directly.
    pub async fn seed_token(&self, token: Token) {
        self.tables.lock().await.tokens.push(token);
    }

    /// Inserts an order row directly.
    pub async fn seed_order(&self, order: Order) {
        self.tables.lock().await.orders.push(order);
    }

    /// Inserts a gallery row directly.
    pub async fn seed_gallery(&self, gallery: Gallery) {
        self.tables.lock().await.galleries.push(gallery);
    }

    /// Inserts a curation offer row directly.
    pub async fn seed_offer(&self, offer: CurationOffer) {
        self.tables.lock().await.offers.push(offer);
    }

    /// Returns all collections.
    pub async fn collections(&self) -> Vec<Collection> {
        self.tables.lock().await.collections.clone()
    }

    /// Returns all tokens.
    pub async fn tokens(&self) -> Vec<Token> {
        self.tables.lock().await.tokens.clone()
    }

    /// Returns all orders.
    pub async fn orders(&self) -> Vec<Order> {
        self.tables.lock().await.orders.clone()
    }

    /// Returns all activities.
    pub async fn activities(&self) -> Vec<Activity> {
        self.tables.lock().await.activities.clone()
    }

    /// Returns all galleries.
    pub async fn galleries(&self) -> Vec<Gallery> {
        self.tables.lock().await.galleries.clone()
    }

    /// Returns all curation offers.
    pub async fn offers(&self) -> Vec<CurationOffer> {
        self.tables.lock().await.offers.clone()
    }

    async fn take_fault(&self, matches: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let mut faults = self.faults.lock().await;
        let pos = faults.iter().position(matches)?;
        Some(faults.remove(pos))
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn load_offsets(&self) -> Result<State, StoreError> {
        self.tables
            .lock()
            .await
            .offsets
            .ok_or(StoreError::OffsetRowMissing(super::OFFSETS_ROW_ID))
    }

    async fn find_collection(
        &self,
        chain: Chain,
        creator: &str,
        name: &str,
    ) -> Result<Option<Collection>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .collections
            .iter()
            .find(|c| c.chain == chain && c.creator == creator && c.name == name)
            .cloned())
    }

    async fn find_token(
        &self,
        id: &TokenDataId,
        property_version: &str,
    ) -> Result<Option<Token>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .tokens
            .iter()
            .find(|t| token_matches(t, &id.creator, &id.collection, &id.name, property_version))
            .cloned())
    }

    async fn find_gallery(&self, index: i64, root: &str) -> Result<Option<Gallery>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .galleries
            .iter()
            .find(|g| g.index == index && g.root == root)
            .cloned())
    }

    async fn upsert_collection(&self, collection: &Collection) -> Result<Collection, StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables.collections.iter_mut().find(|c| {
            c.chain == collection.chain && c.creator == collection.creator && c.name == collection.name
        }) {
            existing.description.clone_from(&collection.description);
            existing.uri.clone_from(&collection.uri);
            existing.maximum.clone_from(&collection.maximum);
            return Ok(existing.clone());
        }
        tables.collections.push(collection.clone());
        Ok(collection.clone())
    }

    async fn upsert_token(&self, token: &Token) -> Result<Token, StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables.tokens.iter_mut().find(|t| {
            token_matches(
                t,
                &token.creator,
                &token.collection,
                &token.name,
                &token.property_version,
            )
        }) {
            existing.collection_id = token.collection_id;
            existing.description.clone_from(&token.description);
            existing.uri.clone_from(&token.uri);
            existing.seqno = token.seqno;
            return Ok(existing.clone());
        }
        tables.tokens.push(token.clone());
        Ok(token.clone())
    }

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        if self
            .take_fault(|f| matches!(f, Fault::Unavailable))
            .await
            .is_some()
        {
            return Err(StoreError::Unavailable("injected fault".to_string()));
        }
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let work = guard.clone();
        Ok(MemoryTx {
            guard,
            work,
            store: self.clone(),
        })
    }
}

/// Transaction over a [`MemoryStore`]. Holds the table lock until dropped.
#[derive(Debug)]
pub struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    work: Tables,
    store: MemoryStore,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn insert_token(&mut self, token: &Token) -> Result<Token, StoreError> {
        let duplicate = self.work.tokens.iter().any(|t| {
            t.id == token.id
                || token_matches(
                    t,
                    &token.creator,
                    &token.collection,
                    &token.name,
                    &token.property_version,
                )
        });
        if duplicate {
            return Err(StoreError::Query(format!(
                "duplicate key value violates unique constraint on tokens: {}",
                token.id
            )));
        }
        self.work.tokens.push(token.clone());
        Ok(token.clone())
    }

    async fn insert_order(&mut self, order: &Order) -> Result<Order, StoreError> {
        self.work.orders.push(order.clone());
        Ok(order.clone())
    }

    async fn cancel_listings(&mut self, token_id: Uuid) -> Result<u64, StoreError> {
        let mut changed = 0;
        for order in self
            .work
            .orders
            .iter_mut()
            .filter(|o| o.token_id == token_id && o.status == OrderStatus::Listing)
        {
            order.status = OrderStatus::Canceled;
            changed += 1;
        }
        Ok(changed)
    }

    async fn insert_activity(&mut self, activity: &Activity) -> Result<Activity, StoreError> {
        self.work.activities.push(activity.clone());
        Ok(activity.clone())
    }

    async fn upsert_gallery(&mut self, gallery: &Gallery) -> Result<Gallery, StoreError> {
        if let Some(existing) = self
            .work
            .galleries
            .iter_mut()
            .find(|g| g.index == gallery.index && g.root == gallery.root)
        {
            existing.name.clone_from(&gallery.name);
            existing.owner.clone_from(&gallery.owner);
            existing.space_type.clone_from(&gallery.space_type);
            existing.metadata_uri.clone_from(&gallery.metadata_uri);
            return Ok(existing.clone());
        }
        self.work.galleries.push(gallery.clone());
        Ok(gallery.clone())
    }

    async fn upsert_offer(&mut self, offer: &CurationOffer) -> Result<CurationOffer, StoreError> {
        if let Some(existing) = self
            .work
            .offers
            .iter_mut()
            .find(|o| o.index == offer.index && o.root == offer.root)
        {
            let id = existing.id;
            *existing = CurationOffer {
                id,
                ..offer.clone()
            };
            return Ok(existing.clone());
        }
        self.work.offers.push(offer.clone());
        Ok(offer.clone())
    }

    async fn set_offer_status(
        &mut self,
        index: i64,
        root: &str,
        status: CurationOfferStatus,
    ) -> Result<Option<CurationOffer>, StoreError> {
        Ok(self
            .work
            .offers
            .iter_mut()
            .find(|o| o.index == index && o.root == root)
            .map(|offer| {
                offer.status = status;
                offer.clone()
            }))
    }

    async fn advance_offset(
        &mut self,
        kind: EventKind,
        sequence_number: u64,
    ) -> Result<Option<u64>, StoreError> {
        let targets = |f: &Fault| match f {
            Fault::FailOffsetWrite {
                kind: k,
                sequence_number: s,
            }
            | Fault::IgnoreOffsetWrite {
                kind: k,
                sequence_number: s,
            } => *k == kind && *s == sequence_number,
            _ => false,
        };
        let fault = self.store.take_fault(targets).await;

        let state = self
            .work
            .offsets
            .ok_or(StoreError::OffsetRowMissing(super::OFFSETS_ROW_ID))?;

        match fault {
            Some(Fault::FailOffsetWrite { .. }) => {
                Err(StoreError::Query("injected offset write failure".to_string()))
            }
            Some(_) => Ok(state.offset(kind)),
            None => {
                // same guard as the SQL `WHERE col < $1`
                let next = state.advance(kind, sequence_number).unwrap_or(state);
                self.work.offsets = Some(next);
                Ok(next.offset(kind))
            }
        }
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        let fault = self
            .store
            .take_fault(|f| matches!(f, Fault::FailCommit | Fault::StallCommit(_)))
            .await;
        match fault {
            Some(Fault::FailCommit) => {
                return Err(StoreError::Query("injected commit failure".to_string()));
            }
            Some(Fault::StallCommit(delay)) => tokio::time::sleep(delay).await,
            _ => {}
        }
        *self.guard = std::mem::take(&mut self.work);
        Ok(())
    }
}

fn token_matches(
    token: &Token,
    creator: &str,
    collection: &str,
    name: &str,
    property_version: &str,
) -> bool {
    token.creator == creator
        && token.collection == collection
        && token.name == name
        && token.property_version == property_version
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::entities::token_primary_key;

    fn token(name: &str) -> Token {
        Token {
            id: token_primary_key("0xC", "Col", name),
            collection_id: Uuid::new_v4(),
            owner: "0xO".to_string(),
            creator: "0xC".to_string(),
            collection: "Col".to_string(),
            name: name.to_string(),
            description: String::new(),
            uri: String::new(),
            property_version: "0".to_string(),
            seqno: 0,
        }
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = MemoryStore::new();
        {
            let Ok(mut tx) = store.begin().await else {
                panic!("begin");
            };
            let Ok(_) = tx.insert_token(&token("a")).await else {
                panic!("insert");
            };
        }
        assert!(store.tokens().await.is_empty());
    }

    #[tokio::test]
    async fn committed_transaction_is_visible() {
        let store = MemoryStore::new();
        let Ok(mut tx) = store.begin().await else {
            panic!("begin");
        };
        let Ok(_) = tx.insert_token(&token("a")).await else {
            panic!("insert");
        };
        let Ok(Some(5)) = tx.advance_offset(EventKind::CreateToken, 5).await else {
            panic!("offset write");
        };
        let Ok(()) = tx.commit().await else {
            panic!("commit");
        };
        assert_eq!(store.tokens().await.len(), 1);
        let Ok(state) = store.load_offsets().await else {
            panic!("offsets");
        };
        assert_eq!(state.offset(EventKind::CreateToken), Some(5));
    }

    #[tokio::test]
    async fn offset_guard_refuses_regression() {
        let store = MemoryStore::new();
        store
            .set_offsets(State::from_offsets([(EventKind::List, Some(9))]))
            .await;
        let Ok(mut tx) = store.begin().await else {
            panic!("begin");
        };
        let Ok(stored) = tx.advance_offset(EventKind::List, 4).await else {
            panic!("offset write");
        };
        assert_eq!(stored, Some(9));
    }

    #[tokio::test]
    async fn faults_fire_once() {
        let store = MemoryStore::new();
        store.inject(Fault::Unavailable).await;
        assert!(matches!(store.begin().await, Err(StoreError::Unavailable(_))));
        assert!(store.begin().await.is_ok());
        assert!(store.pending_faults().await.is_empty());
    }

    #[tokio::test]
    async fn missing_offsets_row_is_reported() {
        let store = MemoryStore::without_offsets_row();
        assert!(matches!(
            store.load_offsets().await,
            Err(StoreError::OffsetRowMissing(0))
        ));
    }

    #[tokio::test]
    async fn duplicate_token_insert_fails() {
        let store = MemoryStore::new();
        store.seed_token(token("a")).await;
        let Ok(mut tx) = store.begin().await else {
            panic!("begin");
        };
        assert!(tx.insert_token(&token("a")).await.is_err());
    }
}
