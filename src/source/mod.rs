//! Event source layer: the node REST client and per-stream subjects.
//!
//! [`EventSource`] knows how to address and page through one stream.
//! [`Subject`] turns it into a cursor driven by the committed offset.

pub mod event_source;
pub mod subject;

pub use event_source::{EventSource, StreamLocator};
pub use subject::{EventFeed, Subject, normalize_batch};
