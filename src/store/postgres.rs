//! PostgreSQL implementation of the projection store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{OFFSETS_ROW_ID, Store, StoreTx, offset_from_db, offset_to_db};
use crate::config::IndexerConfig;
use crate::domain::{
    Activity, Chain, Collection, CurationOffer, CurationOfferStatus, EventKind, Gallery, Order,
    OrderStatus, State, Token, TokenDataId,
};
use crate::error::StoreError;

const COLLECTION_COLUMNS: &str = "id, chain, creator, name, description, uri, maximum";
const TOKEN_COLUMNS: &str = "id, collection_id, owner, creator, collection, name, description, \
                             uri, property_version, seqno";
const ORDER_COLUMNS: &str = "id, token_id, collection_id, seller, price, quantity, status, listed_at";
const ACTIVITY_COLUMNS: &str = "id, order_id, collection_id, token_id, source, destination, \
                                tx_hash, tx_type, quantity, price, tx_timestamp";
const GALLERY_COLUMNS: &str = "id, index, root, name, owner, space_type, metadata_uri";
const OFFER_COLUMNS: &str = "id, index, root, token_id, gallery_id, source, destination, price, \
                             commission_feerate_numerator, commission_feerate_denominator, \
                             offer_start_at, offer_expired_at, exhibit_duration, url, detail, status";

/// PostgreSQL-backed store using `sqlx::PgPool`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    statement_timeout: Duration,
}

impl PgStore {
    /// Creates a store over an existing pool.
    #[must_use]
    pub fn new(pool: PgPool, statement_timeout: Duration) -> Self {
        Self {
            pool,
            statement_timeout,
        }
    }

    /// Opens a connection pool sized from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the database cannot be reached.
    pub async fn connect(config: &IndexerConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connect_timeout_secs))
            .connect(&config.database_url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        tracing::info!(
            max_connections = config.database_max_connections,
            "database connection pool created"
        );
        Ok(Self::new(pool, config.tx_timeout))
    }

    /// Applies the embedded schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Migration`] on failure.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("database migrations applied");
        Ok(())
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgTx;

    async fn load_offsets(&self) -> Result<State, StoreError> {
        let row = sqlx::query_as::<_, (i64, i64, i64, i64, i64, i64)>(
            "SELECT create_token_executed_offset, list_event_executed_offset, \
             delist_event_executed_offset, gallery_create_executed_offset, \
             curation_offer_create_executed_offset, curation_offer_reject_executed_offset \
             FROM event_offsets WHERE id = $1",
        )
        .bind(OFFSETS_ROW_ID)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::OffsetRowMissing(OFFSETS_ROW_ID))?;

        let (create_token, list, delist, gallery, offer_create, offer_reject) = row;
        Ok(State::from_offsets([
            (EventKind::CreateToken, offset_from_db(create_token)),
            (EventKind::List, offset_from_db(list)),
            (EventKind::Delist, offset_from_db(delist)),
            (EventKind::GalleryCreate, offset_from_db(gallery)),
            (EventKind::CurationOfferCreate, offset_from_db(offer_create)),
            (EventKind::CurationOfferReject, offset_from_db(offer_reject)),
        ]))
    }

    async fn find_collection(
        &self,
        chain: Chain,
        creator: &str,
        name: &str,
    ) -> Result<Option<Collection>, StoreError> {
        let sql = format!(
            "SELECT {COLLECTION_COLUMNS} FROM collections \
             WHERE chain = $1 AND creator = $2 AND name = $3"
        );
        sqlx::query_as::<_, CollectionRow>(&sql)
            .bind(chain.as_str())
            .bind(creator)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .map(Collection::try_from)
            .transpose()
    }

    async fn find_token(
        &self,
        id: &TokenDataId,
        property_version: &str,
    ) -> Result<Option<Token>, StoreError> {
        let sql = format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens \
             WHERE creator = $1 AND collection = $2 AND name = $3 AND property_version = $4"
        );
        let row = sqlx::query_as::<_, TokenRow>(&sql)
            .bind(&id.creator)
            .bind(&id.collection)
            .bind(&id.name)
            .bind(property_version)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Token::from))
    }

    async fn find_gallery(&self, index: i64, root: &str) -> Result<Option<Gallery>, StoreError> {
        let sql =
            format!("SELECT {GALLERY_COLUMNS} FROM curation_galleries WHERE index = $1 AND root = $2");
        let row = sqlx::query_as::<_, GalleryRow>(&sql)
            .bind(index)
            .bind(root)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Gallery::from))
    }

    async fn upsert_collection(&self, collection: &Collection) -> Result<Collection, StoreError> {
        let sql = format!(
            "INSERT INTO collections ({COLLECTION_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (chain, creator, name) DO UPDATE SET \
             description = EXCLUDED.description, uri = EXCLUDED.uri, maximum = EXCLUDED.maximum \
             RETURNING {COLLECTION_COLUMNS}"
        );
        let row = sqlx::query_as::<_, CollectionRow>(&sql)
            .bind(collection.id)
            .bind(collection.chain.as_str())
            .bind(&collection.creator)
            .bind(&collection.name)
            .bind(&collection.description)
            .bind(&collection.uri)
            .bind(&collection.maximum)
            .fetch_one(&self.pool)
            .await?;
        Collection::try_from(row)
    }

    async fn upsert_token(&self, token: &Token) -> Result<Token, StoreError> {
        let sql = format!(
            "INSERT INTO tokens ({TOKEN_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (creator, collection, name, property_version) DO UPDATE SET \
             collection_id = EXCLUDED.collection_id, description = EXCLUDED.description, \
             uri = EXCLUDED.uri, seqno = EXCLUDED.seqno \
             RETURNING {TOKEN_COLUMNS}"
        );
        let row = bind_token(sqlx::query_as::<_, TokenRow>(&sql), token)
            .fetch_one(&self.pool)
            .await?;
        Ok(Token::from(row))
    }

    async fn begin(&self) -> Result<PgTx, StoreError> {
        let mut tx = self.pool.begin().await?;
        let timeout_ms = self.statement_timeout.as_millis();
        // SET does not take bind parameters; the value is an integer we own.
        sqlx::query(&format!("SET LOCAL statement_timeout = {timeout_ms}"))
            .execute(&mut *tx)
            .await?;
        Ok(PgTx { tx })
    }
}

/// An open PostgreSQL transaction. Rolls back when dropped uncommitted.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

impl std::fmt::Debug for PgTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTx").finish_non_exhaustive()
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn insert_token(&mut self, token: &Token) -> Result<Token, StoreError> {
        let sql = format!(
            "INSERT INTO tokens ({TOKEN_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING {TOKEN_COLUMNS}"
        );
        let row = bind_token(sqlx::query_as::<_, TokenRow>(&sql), token)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(Token::from(row))
    }

    async fn insert_order(&mut self, order: &Order) -> Result<Order, StoreError> {
        let sql = format!(
            "INSERT INTO orders ({ORDER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {ORDER_COLUMNS}"
        );
        let row = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(order.id)
            .bind(order.token_id)
            .bind(order.collection_id)
            .bind(&order.seller)
            .bind(&order.price)
            .bind(&order.quantity)
            .bind(order.status.as_str())
            .bind(order.listed_at)
            .fetch_one(&mut *self.tx)
            .await?;
        Order::try_from(row)
    }

    async fn cancel_listings(&mut self, token_id: Uuid) -> Result<u64, StoreError> {
        let result =
            sqlx::query("UPDATE orders SET status = $1 WHERE token_id = $2 AND status = $3")
                .bind(OrderStatus::Canceled.as_str())
                .bind(token_id)
                .bind(OrderStatus::Listing.as_str())
                .execute(&mut *self.tx)
                .await?;
        Ok(result.rows_affected())
    }

    async fn insert_activity(&mut self, activity: &Activity) -> Result<Activity, StoreError> {
        let sql = format!(
            "INSERT INTO activities ({ACTIVITY_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             RETURNING {ACTIVITY_COLUMNS}"
        );
        let row = sqlx::query_as::<_, ActivityRow>(&sql)
            .bind(activity.id)
            .bind(activity.order_id)
            .bind(activity.collection_id)
            .bind(activity.token_id)
            .bind(&activity.source)
            .bind(&activity.destination)
            .bind(&activity.tx_hash)
            .bind(activity.tx_type.as_str())
            .bind(&activity.quantity)
            .bind(&activity.price)
            .bind(activity.tx_timestamp)
            .fetch_one(&mut *self.tx)
            .await?;
        Activity::try_from(row)
    }

    async fn upsert_gallery(&mut self, gallery: &Gallery) -> Result<Gallery, StoreError> {
        let sql = format!(
            "INSERT INTO curation_galleries ({GALLERY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (index, root) DO UPDATE SET \
             name = EXCLUDED.name, owner = EXCLUDED.owner, space_type = EXCLUDED.space_type, \
             metadata_uri = EXCLUDED.metadata_uri \
             RETURNING {GALLERY_COLUMNS}"
        );
        let row = sqlx::query_as::<_, GalleryRow>(&sql)
            .bind(gallery.id)
            .bind(gallery.index)
            .bind(&gallery.root)
            .bind(&gallery.name)
            .bind(&gallery.owner)
            .bind(&gallery.space_type)
            .bind(&gallery.metadata_uri)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(Gallery::from(row))
    }

    async fn upsert_offer(&mut self, offer: &CurationOffer) -> Result<CurationOffer, StoreError> {
        let sql = format!(
            "INSERT INTO curation_offers ({OFFER_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
             ON CONFLICT (index, root) DO UPDATE SET \
             token_id = EXCLUDED.token_id, gallery_id = EXCLUDED.gallery_id, \
             source = EXCLUDED.source, destination = EXCLUDED.destination, \
             price = EXCLUDED.price, \
             commission_feerate_numerator = EXCLUDED.commission_feerate_numerator, \
             commission_feerate_denominator = EXCLUDED.commission_feerate_denominator, \
             offer_start_at = EXCLUDED.offer_start_at, offer_expired_at = EXCLUDED.offer_expired_at, \
             exhibit_duration = EXCLUDED.exhibit_duration, url = EXCLUDED.url, \
             detail = EXCLUDED.detail, status = EXCLUDED.status \
             RETURNING {OFFER_COLUMNS}"
        );
        let row = sqlx::query_as::<_, OfferRow>(&sql)
            .bind(offer.id)
            .bind(offer.index)
            .bind(&offer.root)
            .bind(offer.token_id)
            .bind(offer.gallery_id)
            .bind(&offer.source)
            .bind(&offer.destination)
            .bind(&offer.price)
            .bind(&offer.commission_feerate_numerator)
            .bind(&offer.commission_feerate_denominator)
            .bind(&offer.offer_start_at)
            .bind(&offer.offer_expired_at)
            .bind(&offer.exhibit_duration)
            .bind(&offer.url)
            .bind(&offer.detail)
            .bind(offer.status.as_str())
            .fetch_one(&mut *self.tx)
            .await?;
        CurationOffer::try_from(row)
    }

    async fn set_offer_status(
        &mut self,
        index: i64,
        root: &str,
        status: CurationOfferStatus,
    ) -> Result<Option<CurationOffer>, StoreError> {
        let sql = format!(
            "UPDATE curation_offers SET status = $1 WHERE index = $2 AND root = $3 \
             RETURNING {OFFER_COLUMNS}"
        );
        sqlx::query_as::<_, OfferRow>(&sql)
            .bind(status.as_str())
            .bind(index)
            .bind(root)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(CurationOffer::try_from)
            .transpose()
    }

    async fn advance_offset(
        &mut self,
        kind: EventKind,
        sequence_number: u64,
    ) -> Result<Option<u64>, StoreError> {
        let column = kind.offset_column();
        let value = offset_to_db(sequence_number)?;

        let update = format!(
            "UPDATE event_offsets SET {column} = $1 WHERE id = $2 AND {column} < $1 \
             RETURNING {column}"
        );
        let updated = sqlx::query_scalar::<_, i64>(&update)
            .bind(value)
            .bind(OFFSETS_ROW_ID)
            .fetch_optional(&mut *self.tx)
            .await?;
        if let Some(stored) = updated {
            return Ok(offset_from_db(stored));
        }

        // Guard rejected the write or the row is gone; report what is there.
        let select = format!("SELECT {column} FROM event_offsets WHERE id = $1");
        let current = sqlx::query_scalar::<_, i64>(&select)
            .bind(OFFSETS_ROW_ID)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or(StoreError::OffsetRowMissing(OFFSETS_ROW_ID))?;
        Ok(offset_from_db(current))
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

fn bind_token<'q>(
    query: sqlx::query::QueryAs<'q, Postgres, TokenRow, sqlx::postgres::PgArguments>,
    token: &'q Token,
) -> sqlx::query::QueryAs<'q, Postgres, TokenRow, sqlx::postgres::PgArguments> {
    query
        .bind(token.id)
        .bind(token.collection_id)
        .bind(&token.owner)
        .bind(&token.creator)
        .bind(&token.collection)
        .bind(&token.name)
        .bind(&token.description)
        .bind(&token.uri)
        .bind(&token.property_version)
        .bind(token.seqno)
}

fn corrupt(table: &'static str) -> impl Fn(String) -> StoreError {
    move |message| StoreError::CorruptRow { table, message }
}

#[derive(sqlx::FromRow)]
struct CollectionRow {
    id: Uuid,
    chain: String,
    creator: String,
    name: String,
    description: String,
    uri: String,
    maximum: String,
}

impl TryFrom<CollectionRow> for Collection {
    type Error = StoreError;

    fn try_from(row: CollectionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            chain: row.chain.parse().map_err(corrupt("collections"))?,
            creator: row.creator,
            name: row.name,
            description: row.description,
            uri: row.uri,
            maximum: row.maximum,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TokenRow {
    id: Uuid,
    collection_id: Uuid,
    owner: String,
    creator: String,
    collection: String,
    name: String,
    description: String,
    uri: String,
    property_version: String,
    seqno: i64,
}

impl From<TokenRow> for Token {
    fn from(row: TokenRow) -> Self {
        Self {
            id: row.id,
            collection_id: row.collection_id,
            owner: row.owner,
            creator: row.creator,
            collection: row.collection,
            name: row.name,
            description: row.description,
            uri: row.uri,
            property_version: row.property_version,
            seqno: row.seqno,
        }
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    token_id: Uuid,
    collection_id: Uuid,
    seller: String,
    price: String,
    quantity: String,
    status: String,
    listed_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            token_id: row.token_id,
            collection_id: row.collection_id,
            seller: row.seller,
            price: row.price,
            quantity: row.quantity,
            status: row.status.parse().map_err(corrupt("orders"))?,
            listed_at: row.listed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ActivityRow {
    id: Uuid,
    order_id: Option<Uuid>,
    collection_id: Uuid,
    token_id: Uuid,
    source: String,
    destination: String,
    tx_hash: String,
    tx_type: String,
    quantity: String,
    price: String,
    tx_timestamp: DateTime<Utc>,
}

impl TryFrom<ActivityRow> for Activity {
    type Error = StoreError;

    fn try_from(row: ActivityRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            order_id: row.order_id,
            collection_id: row.collection_id,
            token_id: row.token_id,
            source: row.source,
            destination: row.destination,
            tx_hash: row.tx_hash,
            tx_type: row.tx_type.parse().map_err(corrupt("activities"))?,
            quantity: row.quantity,
            price: row.price,
            tx_timestamp: row.tx_timestamp,
        })
    }
}

#[derive(sqlx::FromRow)]
struct GalleryRow {
    id: Uuid,
    index: i64,
    root: String,
    name: String,
    owner: String,
    space_type: String,
    metadata_uri: String,
}

impl From<GalleryRow> for Gallery {
    fn from(row: GalleryRow) -> Self {
        Self {
            id: row.id,
            index: row.index,
            root: row.root,
            name: row.name,
            owner: row.owner,
            space_type: row.space_type,
            metadata_uri: row.metadata_uri,
        }
    }
}

#[derive(sqlx::FromRow)]
struct OfferRow {
    id: Uuid,
    index: i64,
    root: String,
    token_id: Uuid,
    gallery_id: Uuid,
    source: String,
    destination: String,
    price: String,
    commission_feerate_numerator: String,
    commission_feerate_denominator: String,
    offer_start_at: String,
    offer_expired_at: String,
    exhibit_duration: String,
    url: String,
    detail: String,
    status: String,
}

impl TryFrom<OfferRow> for CurationOffer {
    type Error = StoreError;

    fn try_from(row: OfferRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            index: row.index,
            root: row.root,
            token_id: row.token_id,
            gallery_id: row.gallery_id,
            source: row.source,
            destination: row.destination,
            price: row.price,
            commission_feerate_numerator: row.commission_feerate_numerator,
            commission_feerate_denominator: row.commission_feerate_denominator,
            offer_start_at: row.offer_start_at,
            offer_expired_at: row.offer_expired_at,
            exhibit_duration: row.exhibit_duration,
            url: row.url,
            detail: row.detail,
            status: row.status.parse().map_err(corrupt("curation_offers"))?,
        })
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_status_is_reported_with_table() {
        let row = OrderRow {
            id: Uuid::new_v4(),
            token_id: Uuid::new_v4(),
            collection_id: Uuid::new_v4(),
            seller: "0xA".to_string(),
            price: "1".to_string(),
            quantity: "1".to_string(),
            status: "EXPIRED".to_string(),
            listed_at: Utc::now(),
        };
        let Err(StoreError::CorruptRow { table, .. }) = Order::try_from(row) else {
            panic!("unknown status must be rejected");
        };
        assert_eq!(table, "orders");
    }

    #[test]
    fn offer_row_maps_status() {
        let row = OfferRow {
            id: Uuid::new_v4(),
            index: 3,
            root: "0xroot".to_string(),
            token_id: Uuid::new_v4(),
            gallery_id: Uuid::new_v4(),
            source: "0xs".to_string(),
            destination: "0xd".to_string(),
            price: "10".to_string(),
            commission_feerate_numerator: "1".to_string(),
            commission_feerate_denominator: "100".to_string(),
            offer_start_at: "0".to_string(),
            offer_expired_at: "1".to_string(),
            exhibit_duration: "60".to_string(),
            url: String::new(),
            detail: String::new(),
            status: "rejected".to_string(),
        };
        let Ok(offer) = CurationOffer::try_from(row) else {
            panic!("valid row");
        };
        assert_eq!(offer.status, CurationOfferStatus::Rejected);
    }
}
