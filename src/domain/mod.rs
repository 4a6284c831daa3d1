//! Domain layer: ledger events, typed payloads, projection rows and the
//! committed-offset state.
//!
//! Nothing in here performs I/O. The event source, observers and stores
//! all speak in these types.

pub mod entities;
pub mod event;
pub mod payload;
pub mod state;

pub use entities::{
    Activity, Chain, Collection, CurationOffer, CurationOfferStatus, Gallery, Order, OrderStatus,
    Token, TxType,
};
pub use event::{Event, EventKind, RawEvent};
pub use payload::{TokenDataId, TokenId};
pub use state::State;
