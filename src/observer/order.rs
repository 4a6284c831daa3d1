//! Marketplace listings and delistings.

use async_trait::async_trait;
use uuid::Uuid;

use super::{Mutation, Observer, parse_payload};
use crate::domain::payload::{DelistEventData, ListEventData, TokenId, parse_micros};
use crate::domain::{Activity, EventKind, Order, OrderStatus, RawEvent, Token, TxType};
use crate::error::ProcessError;
use crate::store::Store;

async fn resolve_token<S: Store>(
    store: &S,
    kind: EventKind,
    event: &RawEvent,
    token_id: &TokenId,
) -> Result<Token, ProcessError> {
    store
        .find_token(&token_id.token_data_id, &token_id.property_version)
        .await?
        .ok_or_else(|| ProcessError::MissingReference {
            kind,
            sequence_number: event.sequence_number,
            entity: "token",
            key: token_id.token_data_id.to_string(),
        })
}

fn timestamp(
    kind: EventKind,
    event: &RawEvent,
    raw: &str,
) -> Result<chrono::DateTime<chrono::Utc>, ProcessError> {
    parse_micros(raw).map_err(|reason| ProcessError::MalformedPayload {
        kind,
        sequence_number: event.sequence_number,
        reason,
    })
}

/// Opens a `LISTING` order and logs a `LIST` activity.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListObserver;

#[async_trait]
impl<S: Store> Observer<S> for ListObserver {
    fn kind(&self) -> EventKind {
        EventKind::List
    }

    async fn plan(&self, store: &S, event: &RawEvent) -> Result<Mutation, ProcessError> {
        let kind = EventKind::List;
        let data: ListEventData = parse_payload(kind, event)?;
        let listed_at = timestamp(kind, event, &data.timestamp)?;
        let token = resolve_token(store, kind, event, &data.token_id).await?;

        let order = Order {
            id: Uuid::new_v4(),
            token_id: token.id,
            collection_id: token.collection_id,
            seller: data.seller.clone(),
            price: data.price.clone(),
            quantity: data.token_amount.clone(),
            status: OrderStatus::Listing,
            listed_at,
        };
        let activity = Activity {
            id: Uuid::new_v4(),
            order_id: Some(order.id),
            collection_id: token.collection_id,
            token_id: token.id,
            source: data.seller,
            destination: String::new(),
            tx_hash: event.version.to_string(),
            tx_type: TxType::List,
            quantity: data.token_amount,
            price: data.price,
            tx_timestamp: listed_at,
        };
        Ok(Mutation::List { order, activity })
    }
}

/// Cancels a token's open listings and logs a `CANCEL` activity.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelistObserver;

#[async_trait]
impl<S: Store> Observer<S> for DelistObserver {
    fn kind(&self) -> EventKind {
        EventKind::Delist
    }

    async fn plan(&self, store: &S, event: &RawEvent) -> Result<Mutation, ProcessError> {
        let kind = EventKind::Delist;
        let data: DelistEventData = parse_payload(kind, event)?;
        let tx_timestamp = timestamp(kind, event, &data.timestamp)?;
        let token = resolve_token(store, kind, event, &data.token_id).await?;

        Ok(Mutation::Delist {
            token_id: token.id,
            collection_id: token.collection_id,
            activity: Activity {
                id: Uuid::new_v4(),
                order_id: None,
                collection_id: token.collection_id,
                token_id: token.id,
                source: data.seller,
                destination: String::new(),
                tx_hash: event.version.to_string(),
                tx_type: TxType::Cancel,
                quantity: data.token_amount,
                price: "0".to_string(),
                tx_timestamp,
            },
        })
    }
}
