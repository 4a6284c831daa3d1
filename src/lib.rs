//! # aptos-event-indexer
//!
//! Resumable, exactly-once ingestion of Aptos marketplace, creation and
//! curation events into a PostgreSQL projection.
//!
//! Every event is applied in its own transaction together with the update of
//! its stream's offset, so a crash at any point resumes from the last
//! committed event without skipping or repeating one.
//!
//! ## Architecture
//!
//! ```text
//! Ledger node (REST)
//!     │
//!     ├── EventSource (source/)        paginated GET per (handle, field)
//!     ├── Subject / EventFeed (source/) next batch after the committed offset
//!     │
//!     ├── Driver (pipeline/)           one task per stream, backoff, shutdown
//!     │
//!     ├── Observer (observer/)         parse + resolve → Mutation
//!     ├── Processor (observer/)        tx: mutation + guarded offset, commit
//!     │
//!     ├── Store (store/)               PostgreSQL or in-memory
//!     └── CacheInvalidator (cache.rs)  best-effort Redis deletes
//! ```
//!
//! The `collection-backfill` binary reuses the source and store layers for a
//! one-shot, best-effort import (see [`backfill`]).

pub mod backfill;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod observer;
pub mod pipeline;
pub mod source;
pub mod store;
