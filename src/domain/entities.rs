//! Projection rows written by the observers.
//!
//! Every entity has a surrogate `id` plus a natural composite key. Foreign
//! references (`collection_id`, `token_id`, `gallery_id`) are resolved by
//! lookup before a write; nothing is copied across rows.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deterministic token ids.
const TOKEN_NAMESPACE: Uuid = Uuid::from_u128(0x6a1f_43c2_9d0e_4b57_8e21_c0d3_5f7a_9b14);

/// Namespace for deterministic collection ids.
const COLLECTION_NAMESPACE: Uuid = Uuid::from_u128(0x2c8e_71b0_5a4d_4f96_b3e7_18d2_0c6f_a845);

/// Returns the surrogate id of a token from its natural key.
///
/// Deterministic so that replaying a creation event after a rollback yields
/// the same id.
///
/// `creator` is the token's stored creator. For tokens minted through the
/// creation module that is the resource account, not the minting user, so
/// these ids do not match rows an earlier writer keyed on the minter's
/// address; such rows must be re-keyed or re-imported before indexing.
#[must_use]
pub fn token_primary_key(creator: &str, collection: &str, name: &str) -> Uuid {
    Uuid::new_v5(
        &TOKEN_NAMESPACE,
        format!("{creator}\u{1f}{collection}\u{1f}{name}").as_bytes(),
    )
}

/// Returns the surrogate id of a collection from its natural key.
#[must_use]
pub fn collection_primary_key(chain: Chain, creator: &str, name: &str) -> Uuid {
    Uuid::new_v5(
        &COLLECTION_NAMESPACE,
        format!("{chain}\u{1f}{creator}\u{1f}{name}").as_bytes(),
    )
}

/// Generates a `FromStr`/`Display`/`as_str` triple for a text-backed enum.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Returns the value stored in the database.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: {other}", stringify!($name))),
                }
            }
        }
    };
}

/// Ledger a collection lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Chain {
    /// Aptos mainnet/devnet.
    Aptos,
}

text_enum!(Chain { Aptos => "APTOS" });

/// Lifecycle of a marketplace order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Open for purchase.
    Listing,
    /// Withdrawn by the seller.
    Canceled,
    /// Filled by a buyer.
    Sold,
}

text_enum!(OrderStatus {
    Listing => "LISTING",
    Canceled => "CANCELED",
    Sold => "SOLD",
});

/// Kind of an activity-feed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxType {
    /// Token minted.
    Mint,
    /// Token listed.
    List,
    /// Listing withdrawn.
    Cancel,
    /// Token sold.
    Sale,
}

text_enum!(TxType {
    Mint => "MINT",
    List => "LIST",
    Cancel => "CANCEL",
    Sale => "SALE",
});

/// Lifecycle of a curation offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurationOfferStatus {
    /// Awaiting the gallery owner's decision.
    Pending,
    /// Accepted for exhibition.
    Accepted,
    /// Turned down by the gallery owner.
    Rejected,
}

text_enum!(CurationOfferStatus {
    Pending => "pending",
    Accepted => "accepted",
    Rejected => "rejected",
});

/// An NFT collection. Natural key: `(chain, creator, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    /// Surrogate id.
    pub id: Uuid,
    /// Ledger.
    pub chain: Chain,
    /// Creator account.
    pub creator: String,
    /// Collection name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Metadata URI.
    pub uri: String,
    /// Maximum supply as reported on chain.
    pub maximum: String,
}

/// A token. Natural key: `(creator, collection, name, property_version)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Surrogate id, see [`token_primary_key`].
    pub id: Uuid,
    /// Owning collection row.
    pub collection_id: Uuid,
    /// Current owner account.
    pub owner: String,
    /// Creator account (the collection's creator).
    pub creator: String,
    /// Collection name.
    pub collection: String,
    /// Token name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Metadata URI.
    pub uri: String,
    /// Property version.
    pub property_version: String,
    /// Sequence number of the event that created the row.
    pub seqno: i64,
}

/// A marketplace order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Surrogate id.
    pub id: Uuid,
    /// Token on sale.
    pub token_id: Uuid,
    /// Collection of the token.
    pub collection_id: Uuid,
    /// Listing account.
    pub seller: String,
    /// Asking price in octas.
    pub price: String,
    /// Units on sale.
    pub quantity: String,
    /// Current status.
    pub status: OrderStatus,
    /// When the listing was made.
    pub listed_at: DateTime<Utc>,
}

/// An activity-feed row recorded alongside order and token changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    /// Surrogate id.
    pub id: Uuid,
    /// Order the activity belongs to, when there is one.
    pub order_id: Option<Uuid>,
    /// Collection of the token.
    pub collection_id: Uuid,
    /// Token involved.
    pub token_id: Uuid,
    /// Originating account.
    pub source: String,
    /// Receiving account, empty when not applicable.
    pub destination: String,
    /// Ledger version of the emitting transaction.
    pub tx_hash: String,
    /// Activity kind.
    pub tx_type: TxType,
    /// Units involved.
    pub quantity: String,
    /// Price in octas, `"0"` when not applicable.
    pub price: String,
    /// On-chain timestamp.
    pub tx_timestamp: DateTime<Utc>,
}

/// A curation gallery. Natural key: `(index, root)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gallery {
    /// Surrogate id.
    pub id: Uuid,
    /// Index under the curation root.
    pub index: i64,
    /// Curation module address.
    pub root: String,
    /// Display name.
    pub name: String,
    /// Owner account.
    pub owner: String,
    /// Exhibition space type.
    pub space_type: String,
    /// Metadata URI.
    pub metadata_uri: String,
}

/// A curation offer. Natural key: `(index, root)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurationOffer {
    /// Surrogate id.
    pub id: Uuid,
    /// Index under the curation root.
    pub index: i64,
    /// Curation module address.
    pub root: String,
    /// Token offered.
    pub token_id: Uuid,
    /// Target gallery row.
    pub gallery_id: Uuid,
    /// Offering account.
    pub source: String,
    /// Receiving gallery owner.
    pub destination: String,
    /// Offered price in octas.
    pub price: String,
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
    /// Current status.
    pub status: CurationOfferStatus,
}
