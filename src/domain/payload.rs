//! Typed event payloads as emitted by the on-chain modules.
//!
//! Field names mirror the Move structs. Numeric fields stay as decimal
//! strings unless the projection needs them as numbers; the helpers at the
//! bottom do those conversions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies a token definition: creator, collection and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenDataId {
    /// Account that created the collection.
    pub creator: String,
    /// Collection name.
    pub collection: String,
    /// Token name within the collection.
    pub name: String,
}

impl std::fmt::Display for TokenDataId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}::{}", self.creator, self.collection, self.name)
    }
}

/// Identifies a concrete token: definition plus property version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenId {
    /// Token definition.
    pub token_data_id: TokenDataId,
    /// Property version, `"0"` for unmutated tokens.
    pub property_version: String,
}

/// Payload of the creation module's token mint event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTokenEventData {
    /// Account that minted (and owns) the token.
    pub user: String,
    /// Token name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Metadata URI.
    pub uri: String,
}

/// Payload of the marketplace listing event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEventData {
    /// Token being listed.
    pub token_id: TokenId,
    /// Listing account.
    pub seller: String,
    /// Asking price in octas.
    pub price: String,
    /// Number of units listed.
    pub token_amount: String,
    /// Microseconds since the epoch.
    pub timestamp: String,
}

/// Payload of the marketplace delisting event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelistEventData {
    /// Token whose listing is withdrawn.
    pub token_id: TokenId,
    /// Microseconds since the epoch.
    pub timestamp: String,
    /// Account that had listed the token.
    pub seller: String,
    /// Number of units withdrawn.
    pub token_amount: String,
}

/// Payload of the curation gallery creation event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GalleryCreateEventData {
    /// Gallery index under the curation root.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Gallery owner.
    pub owner: String,
    /// Exhibition space type.
    pub space_type: String,
    /// Metadata URI.
    pub metadata_uri: String,
}

/// Payload of the curation offer creation event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferCreateEventData {
    /// Offer index under the curation root.
    pub id: String,
    /// Token offered for exhibition.
    pub token_id: TokenId,
    /// Offering account.
    pub source: String,
    /// Gallery owner receiving the offer.
    pub destination: String,
    /// Offered price in octas.
    pub price: String,
    /// Index of the target gallery.
    pub gallery_id: String,
    /// Commission fee rate numerator.
    pub commission_feerate_numerator: String,
    /// Commission fee rate denominator.
    pub commission_feerate_denominator: String,
    /// Offer start, seconds since the epoch.
    pub offer_start_at: String,
    /// Offer expiry, seconds since the epoch.
    pub offer_expired_at: String,
    /// Exhibition duration in seconds.
    pub exhibit_duration: String,
    /// Link to the exhibit.
    pub url: String,
    /// Free-form detail.
    pub detail: String,
}

/// Payload of the curation offer rejection event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferRejectEventData {
    /// Index of the rejected offer.
    pub id: String,
}

/// Payload of `0x3::token` collection creation events (backfill only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionCreatedData {
    /// Collection creator.
    pub creator: String,
    /// Collection name.
    pub collection_name: String,
    /// Metadata URI.
    pub uri: String,
    /// Maximum supply, `"0"` for unlimited.
    pub maximum: String,
    /// Free-form description.
    pub description: String,
}

/// Payload of `0x3::token` token data creation events (backfill only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDataCreatedData {
    /// Token definition being created.
    pub id: TokenDataId,
    /// Free-form description.
    pub description: String,
    /// Metadata URI.
    pub uri: String,
}

/// Converts a microsecond timestamp string into a UTC instant.
///
/// # Errors
///
/// Returns a message when the string is not an integer or is out of range.
pub fn parse_micros(raw: &str) -> Result<DateTime<Utc>, String> {
    let micros: i64 = raw
        .trim()
        .parse()
        .map_err(|e| format!("timestamp {raw:?}: {e}"))?;
    DateTime::from_timestamp_micros(micros).ok_or_else(|| format!("timestamp {raw:?} out of range"))
}

/// Parses an on-chain `u64` index into the signed column type used by the store.
///
/// # Errors
///
/// Returns a message when the string is not an integer or exceeds `i64::MAX`.
pub fn parse_index(raw: &str) -> Result<i64, String> {
    let value: u64 = raw
        .trim()
        .parse()
        .map_err(|e| format!("index {raw:?}: {e}"))?;
    i64::try_from(value).map_err(|_| format!("index {raw:?} exceeds i64"))
}
