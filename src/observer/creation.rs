//! Token minting through the creation module.

use async_trait::async_trait;

use super::{Mutation, Observer, parse_payload};
use crate::config::DefaultCollection;
use crate::domain::entities::token_primary_key;
use crate::domain::payload::CreateTokenEventData;
use crate::domain::{Chain, EventKind, RawEvent, Token};
use crate::error::ProcessError;
use crate::store::Store;

/// Creates a token under the platform's default collection for every mint.
///
/// The collection must already exist (it is created by the backfill tool or
/// by hand); its absence halts the stream.
#[derive(Debug, Clone)]
pub struct CreateTokenObserver {
    collection: DefaultCollection,
}

impl CreateTokenObserver {
    /// Creates an observer minting into `collection`.
    #[must_use]
    pub fn new(collection: DefaultCollection) -> Self {
        Self { collection }
    }
}

#[async_trait]
impl<S: Store> Observer<S> for CreateTokenObserver {
    fn kind(&self) -> EventKind {
        EventKind::CreateToken
    }

    async fn plan(&self, store: &S, event: &RawEvent) -> Result<Mutation, ProcessError> {
        let kind = EventKind::CreateToken;
        let data: CreateTokenEventData = parse_payload(kind, event)?;

        let collection = store
            .find_collection(Chain::Aptos, &self.collection.creator, &self.collection.name)
            .await?
            .ok_or_else(|| ProcessError::MissingReference {
                kind,
                sequence_number: event.sequence_number,
                entity: "collection",
                key: format!("{}::{}", self.collection.creator, self.collection.name),
            })?;

        let seqno =
            i64::try_from(event.sequence_number).map_err(|_| ProcessError::MalformedPayload {
                kind,
                sequence_number: event.sequence_number,
                reason: "sequence number exceeds i64".to_string(),
            })?;

        let creator = self.collection.resource_account.clone();
        Ok(Mutation::CreateToken(Token {
            id: token_primary_key(&creator, &collection.name, &data.name),
            collection_id: collection.id,
            owner: data.user,
            creator,
            collection: collection.name,
            name: data.name,
            description: data.description,
            uri: data.uri,
            property_version: "0".to_string(),
            seqno,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::domain::Collection;
    use crate::store::MemoryStore;

    fn event(seq: u64) -> RawEvent {
        RawEvent {
            version: 77,
            sequence_number: seq,
            data: serde_json::json!({
                "user": "0xminter",
                "name": "Sunset #4",
                "description": "orange",
                "uri": "ipfs://sunset"
            }),
        }
    }

    #[tokio::test]
    async fn mint_targets_default_collection() {
        let defaults = DefaultCollection::default();
        let store = MemoryStore::new();
        let collection_id = Uuid::new_v4();
        store
            .seed_collection(Collection {
                id: collection_id,
                chain: Chain::Aptos,
                creator: defaults.creator.clone(),
                name: defaults.name.clone(),
                description: String::new(),
                uri: String::new(),
                maximum: "0".to_string(),
            })
            .await;

        let observer = CreateTokenObserver::new(defaults.clone());
        let Ok(Mutation::CreateToken(token)) = Observer::plan(&observer, &store, &event(12)).await
        else {
            panic!("mint should plan a token insert");
        };
        assert_eq!(token.collection_id, collection_id);
        assert_eq!(token.owner, "0xminter");
        assert_eq!(token.creator, defaults.resource_account);
        assert_eq!(token.property_version, "0");
        assert_eq!(token.seqno, 12);
        assert_eq!(
            token.id,
            token_primary_key(&defaults.resource_account, &defaults.name, "Sunset #4")
        );
        assert_ne!(
            token.id,
            token_primary_key("0xminter", &defaults.name, "Sunset #4")
        );
    }

    #[tokio::test]
    async fn missing_collection_is_fatal() {
        let store = MemoryStore::new();
        let observer = CreateTokenObserver::new(DefaultCollection::default());
        let result = Observer::plan(&observer, &store, &event(0)).await;
        assert!(matches!(
            result,
            Err(ProcessError::MissingReference {
                entity: "collection",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn malformed_payload_is_reported() {
        let store = MemoryStore::new();
        let observer = CreateTokenObserver::new(DefaultCollection::default());
        let bad = RawEvent {
            version: 1,
            sequence_number: 0,
            data: serde_json::json!({"user": 5}),
        };
        let result = Observer::plan(&observer, &store, &bad).await;
        assert!(matches!(result, Err(ProcessError::MalformedPayload { .. })));
    }
}
