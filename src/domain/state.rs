//! In-memory snapshot of the committed per-stream offsets.
//!
//! [`State`] mirrors the persisted offsets row. It is a plain value: every
//! transition returns a new copy with exactly one stream's offset changed,
//! and only after the store has committed that offset.

use serde::{Deserialize, Serialize};

use super::EventKind;

/// Committed offsets for every stream.
///
/// `None` means no event of that stream has been applied yet; `Some(n)`
/// means every event with `sequence_number <= n` has been applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    create_token: Option<u64>,
    list: Option<u64>,
    delist: Option<u64>,
    gallery_create: Option<u64>,
    curation_offer_create: Option<u64>,
    curation_offer_reject: Option<u64>,
}

/// Rejected attempt to move an offset backwards or sideways.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{kind} offset cannot move from {current:?} to {requested}")]
pub struct NonMonotonicOffset {
    /// Stream whose offset was being advanced.
    pub kind: EventKind,
    /// Offset currently held.
    pub current: Option<u64>,
    /// Offset that was requested.
    pub requested: u64,
}

impl State {
    /// Builds a state from `(stream, offset)` pairs; unnamed streams start empty.
    #[must_use]
    pub fn from_offsets(offsets: impl IntoIterator<Item = (EventKind, Option<u64>)>) -> Self {
        offsets
            .into_iter()
            .fold(Self::default(), |state, (kind, offset)| {
                state.with_slot(kind, offset)
            })
    }

    /// Returns the committed offset of `kind`.
    #[must_use]
    pub const fn offset(&self, kind: EventKind) -> Option<u64> {
        match kind {
            EventKind::CreateToken => self.create_token,
            EventKind::List => self.list,
            EventKind::Delist => self.delist,
            EventKind::GalleryCreate => self.gallery_create,
            EventKind::CurationOfferCreate => self.curation_offer_create,
            EventKind::CurationOfferReject => self.curation_offer_reject,
        }
    }

    /// Returns the first sequence number not yet applied for `kind`.
    ///
    /// Saturates at `u64::MAX`, which a real stream never reaches.
    #[must_use]
    pub fn next_start(&self, kind: EventKind) -> u64 {
        self.offset(kind).map_or(0, |n| n.saturating_add(1))
    }

    /// Returns a copy with `kind`'s offset set to `sequence_number`.
    ///
    /// # Errors
    ///
    /// Returns [`NonMonotonicOffset`] if `sequence_number` is not strictly
    /// greater than the current offset.
    pub fn advance(self, kind: EventKind, sequence_number: u64) -> Result<Self, NonMonotonicOffset> {
        let current = self.offset(kind);
        if current.is_some_and(|n| sequence_number <= n) {
            return Err(NonMonotonicOffset {
                kind,
                current,
                requested: sequence_number,
            });
        }
        Ok(self.with_slot(kind, Some(sequence_number)))
    }

    /// Iterates `(stream, offset)` pairs in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (EventKind, Option<u64>)> + '_ {
        EventKind::ALL.into_iter().map(|kind| (kind, self.offset(kind)))
    }

    fn with_slot(mut self, kind: EventKind, value: Option<u64>) -> Self {
        let slot = match kind {
            EventKind::CreateToken => &mut self.create_token,
            EventKind::List => &mut self.list,
            EventKind::Delist => &mut self.delist,
            EventKind::GalleryCreate => &mut self.gallery_create,
            EventKind::CurationOfferCreate => &mut self.curation_offer_create,
            EventKind::CurationOfferReject => &mut self.curation_offer_reject,
        };
        *slot = value;
        self
    }
}
