//! Curation galleries and exhibition offers.
//!
//! Galleries and offers are keyed by `(index, root)`, where `root` is the
//! curation module's account and `index` the on-chain id from the payload.

use async_trait::async_trait;
use uuid::Uuid;

use super::{Mutation, Observer, parse_payload};
use crate::domain::payload::{
    GalleryCreateEventData, OfferCreateEventData, OfferRejectEventData, parse_index,
};
use crate::domain::{CurationOffer, CurationOfferStatus, EventKind, Gallery, RawEvent};
use crate::error::ProcessError;
use crate::store::Store;

fn index(kind: EventKind, event: &RawEvent, raw: &str) -> Result<i64, ProcessError> {
    parse_index(raw).map_err(|reason| ProcessError::MalformedPayload {
        kind,
        sequence_number: event.sequence_number,
        reason,
    })
}

/// Upserts a gallery for every creation event.
#[derive(Debug, Clone)]
pub struct GalleryCreateObserver {
    root: String,
}

impl GalleryCreateObserver {
    /// Creates an observer for galleries under `root`.
    #[must_use]
    pub fn new(root: String) -> Self {
        Self { root }
    }
}

#[async_trait]
impl<S: Store> Observer<S> for GalleryCreateObserver {
    fn kind(&self) -> EventKind {
        EventKind::GalleryCreate
    }

    async fn plan(&self, _store: &S, event: &RawEvent) -> Result<Mutation, ProcessError> {
        let kind = EventKind::GalleryCreate;
        let data: GalleryCreateEventData = parse_payload(kind, event)?;
        Ok(Mutation::UpsertGallery(Gallery {
            id: Uuid::new_v4(),
            index: index(kind, event, &data.id)?,
            root: self.root.clone(),
            name: data.name,
            owner: data.owner,
            space_type: data.space_type,
            metadata_uri: data.metadata_uri,
        }))
    }
}

/// Upserts a pending offer. Both the token and the target gallery must exist.
#[derive(Debug, Clone)]
pub struct OfferCreateObserver {
    root: String,
}

impl OfferCreateObserver {
    /// Creates an observer for offers under `root`.
    #[must_use]
    pub fn new(root: String) -> Self {
        Self { root }
    }
}

#[async_trait]
impl<S: Store> Observer<S> for OfferCreateObserver {
    fn kind(&self) -> EventKind {
        EventKind::CurationOfferCreate
    }

    async fn plan(&self, store: &S, event: &RawEvent) -> Result<Mutation, ProcessError> {
        let kind = EventKind::CurationOfferCreate;
        let data: OfferCreateEventData = parse_payload(kind, event)?;
        let offer_index = index(kind, event, &data.id)?;
        let gallery_index = index(kind, event, &data.gallery_id)?;

        let token_key = &data.token_id.token_data_id;
        let token = store
            .find_token(token_key, &data.token_id.property_version)
            .await?
            .ok_or_else(|| ProcessError::MissingReference {
                kind,
                sequence_number: event.sequence_number,
                entity: "token",
                key: token_key.to_string(),
            })?;

        let gallery = store
            .find_gallery(gallery_index, &self.root)
            .await?
            .ok_or_else(|| ProcessError::MissingReference {
                kind,
                sequence_number: event.sequence_number,
                entity: "gallery",
                key: format!("{}/{gallery_index}", self.root),
            })?;

        Ok(Mutation::UpsertOffer(CurationOffer {
            id: Uuid::new_v4(),
            index: offer_index,
            root: self.root.clone(),
            token_id: token.id,
            gallery_id: gallery.id,
            source: data.source,
            destination: data.destination,
            price: data.price,
            commission_feerate_numerator: data.commission_feerate_numerator,
            commission_feerate_denominator: data.commission_feerate_denominator,
            offer_start_at: data.offer_start_at,
            offer_expired_at: data.offer_expired_at,
            exhibit_duration: data.exhibit_duration,
            url: data.url,
            detail: data.detail,
            status: CurationOfferStatus::Pending,
        }))
    }
}

/// Marks an existing offer as rejected.
#[derive(Debug, Clone)]
pub struct OfferRejectObserver {
    root: String,
}

impl OfferRejectObserver {
    /// Creates an observer for offers under `root`.
    #[must_use]
    pub fn new(root: String) -> Self {
        Self { root }
    }
}

#[async_trait]
impl<S: Store> Observer<S> for OfferRejectObserver {
    fn kind(&self) -> EventKind {
        EventKind::CurationOfferReject
    }

    async fn plan(&self, _store: &S, event: &RawEvent) -> Result<Mutation, ProcessError> {
        let kind = EventKind::CurationOfferReject;
        let data: OfferRejectEventData = parse_payload(kind, event)?;
        Ok(Mutation::RejectOffer {
            index: index(kind, event, &data.id)?,
            root: self.root.clone(),
        })
    }
}
