//! Ledger events and the streams they arrive on.
//!
//! An [`Event`] is one entry of an append-only on-chain event stream. The
//! node encodes 64-bit integers as decimal strings, so `version` and
//! `sequence_number` accept both strings and JSON numbers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// Event type indexed by the pipeline.
///
/// Each kind is a separate stream with its own durable offset column and a
/// disjoint set of business tables it writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A token minted by the creation module.
    CreateToken,
    /// A token listed for sale on the marketplace.
    List,
    /// A marketplace listing withdrawn by its seller.
    Delist,
    /// A curation gallery created or re-registered.
    GalleryCreate,
    /// A curation offer made to a gallery.
    CurationOfferCreate,
    /// A curation offer rejected by the gallery owner.
    CurationOfferReject,
}

impl EventKind {
    /// Every stream, in registration order.
    pub const ALL: [Self; 6] = [
        Self::CreateToken,
        Self::List,
        Self::Delist,
        Self::GalleryCreate,
        Self::CurationOfferCreate,
        Self::CurationOfferReject,
    ];

    /// Returns the stream name used in logs and configuration.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CreateToken => "create_token",
            Self::List => "list",
            Self::Delist => "delist",
            Self::GalleryCreate => "gallery_create",
            Self::CurationOfferCreate => "curation_offer_create",
            Self::CurationOfferReject => "curation_offer_reject",
        }
    }

    /// Returns the column of the offsets row that tracks this stream.
    #[must_use]
    pub const fn offset_column(&self) -> &'static str {
        match self {
            Self::CreateToken => "create_token_executed_offset",
            Self::List => "list_event_executed_offset",
            Self::Delist => "delist_event_executed_offset",
            Self::GalleryCreate => "gallery_create_executed_offset",
            Self::CurationOfferCreate => "curation_offer_create_executed_offset",
            Self::CurationOfferReject => "curation_offer_reject_executed_offset",
        }
    }

    /// Returns the `module::Struct` that owns this stream's event handle.
    #[must_use]
    pub const fn handle_suffix(&self) -> &'static str {
        match self {
            Self::CreateToken => "creation::CreationStore",
            Self::List | Self::Delist => "marketplace::OrderStore",
            Self::GalleryCreate | Self::CurationOfferCreate | Self::CurationOfferReject => {
                "curation::CurationStore"
            }
        }
    }

    /// Returns the default event field name inside the handle struct.
    #[must_use]
    pub const fn default_field(&self) -> &'static str {
        match self {
            Self::CreateToken => "create_token_events",
            Self::List => "list_events",
            Self::Delist => "delist_events",
            Self::GalleryCreate => "gallery_create_events",
            Self::CurationOfferCreate => "offer_create_events",
            Self::CurationOfferReject => "offer_reject_events",
        }
    }

    /// Returns the upper-case prefix for per-stream environment overrides.
    #[must_use]
    pub const fn env_prefix(&self) -> &'static str {
        match self {
            Self::CreateToken => "CREATE_TOKEN",
            Self::List => "LIST",
            Self::Delist => "DELIST",
            Self::GalleryCreate => "GALLERY_CREATE",
            Self::CurationOfferCreate => "CURATION_OFFER_CREATE",
            Self::CurationOfferReject => "CURATION_OFFER_REJECT",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| s.to_string())
    }
}

/// One entry of an event stream.
///
/// Immutable once fetched. Within a stream `sequence_number` is strictly
/// increasing; `version` is the global transaction version that emitted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<T> {
    /// Global ledger transaction version.
    #[serde(deserialize_with = "u64_from_str_or_num")]
    pub version: u64,
    /// Per-stream monotonic index; the resumption cursor.
    #[serde(deserialize_with = "u64_from_str_or_num")]
    pub sequence_number: u64,
    /// Event-type specific payload.
    pub data: T,
}

/// An event whose payload has not been validated yet.
pub type RawEvent = Event<serde_json::Value>;

impl RawEvent {
    /// Parses the payload into the typed event data for its stream.
    ///
    /// # Errors
    ///
    /// Returns the [`serde_json`] error text when the payload does not
    /// match `T`.
    pub fn parse_data<T: serde::de::DeserializeOwned>(&self) -> Result<T, String> {
        T::deserialize(&self.data).map_err(|e| e.to_string())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StrOrNum {
    Str(String),
    Num(u64),
}

/// Deserializes a `u64` written either as a JSON number or a decimal string.
///
/// # Errors
///
/// Fails when the value is neither, or the string is not a valid `u64`.
pub fn u64_from_str_or_num<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match StrOrNum::deserialize(deserializer)? {
        StrOrNum::Num(n) => Ok(n),
        StrOrNum::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
