//! Indexer error types with severity classification.
//!
//! Each layer owns a small [`thiserror`] enum. [`ProcessError`] is the one
//! the pipeline branches on: [`ProcessError::severity`] tells the driver
//! whether a stream should back off and retry or halt for an operator.

use crate::domain::EventKind;

/// How the driver reacts to a failed step.
///
/// | Severity    | Driver reaction                                   |
/// |-------------|---------------------------------------------------|
/// | `Transient` | log, back off, re-fetch from the committed offset |
/// | `Fatal`     | log, halt this stream, leave other streams running |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Safe to retry: nothing was committed for the failing event.
    Transient,
    /// Requires remediation before the stream may continue.
    Fatal,
}

/// Failure to retrieve a page of events from the ledger node.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Connection, TLS or timeout failure.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The node answered with a non-success status.
    #[error("node returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, as text.
        body: String,
    },

    /// The response body was not a JSON array of events.
    #[error("failed to decode event page: {0}")]
    Decode(String),

    /// The page does not start right after the committed offset.
    #[error("{kind} page starts at {got}, expected {expected}")]
    SequenceGap {
        /// Stream the page came from.
        kind: EventKind,
        /// Sequence number following the committed offset.
        expected: u64,
        /// First sequence number on the page.
        got: u64,
    },
}

/// Failure reported by the relational store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached (pool exhausted, connection dropped).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A statement failed.
    #[error("query failed: {0}")]
    Query(String),

    /// The distinguished offsets row is missing.
    #[error("offsets row {0} not found")]
    OffsetRowMissing(i32),

    /// A row could not be mapped back into a domain value.
    #[error("corrupt row in {table}: {message}")]
    CorruptRow {
        /// Table the row was read from.
        table: &'static str,
        /// What was wrong with it.
        message: String,
    },

    /// Schema migration failed.
    #[error("migration failed: {0}")]
    Migration(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => Self::Unavailable(err.to_string()),
            other => Self::Query(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Migration(err.to_string())
    }
}

/// Failure to delete a cache entry. Never escalated past a log line.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Redis returned an error or was unreachable.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Any other backend failure.
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Failure while applying one event.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The payload did not match the expected schema for its stream.
    #[error("malformed {kind} payload at sequence {sequence_number}: {reason}")]
    MalformedPayload {
        /// Stream the event came from.
        kind: EventKind,
        /// Sequence number of the offending event.
        sequence_number: u64,
        /// Parse failure detail.
        reason: String,
    },

    /// An entity the event refers to does not exist in the projection.
    #[error("{kind} event {sequence_number} references missing {entity}: {key}")]
    MissingReference {
        /// Stream the event came from.
        kind: EventKind,
        /// Sequence number of the offending event.
        sequence_number: u64,
        /// Entity type that was looked up.
        entity: &'static str,
        /// Natural key used for the lookup.
        key: String,
    },

    /// A business write did not produce the expected row.
    #[error("{kind} event {sequence_number}: write verification failed: {reason}")]
    WriteVerification {
        /// Stream the event came from.
        kind: EventKind,
        /// Sequence number of the offending event.
        sequence_number: u64,
        /// What the store returned instead.
        reason: String,
    },

    /// The guarded offset update did not land on the expected value.
    #[error("{kind} offset update not applied: expected {expected}, store holds {actual:?}")]
    OffsetNotApplied {
        /// Stream whose offset was written.
        kind: EventKind,
        /// Value the update should have stored.
        expected: u64,
        /// Value the store reported back, if any.
        actual: Option<u64>,
    },

    /// The event is at or behind the committed offset.
    #[error("{kind} event {sequence_number} is not after committed offset {committed}")]
    StaleEvent {
        /// Stream the event came from.
        kind: EventKind,
        /// Sequence number of the offending event.
        sequence_number: u64,
        /// Offset already committed for the stream.
        committed: u64,
    },

    /// The event does not immediately follow the committed offset.
    #[error("{kind} event {sequence_number} is out of sequence, expected {expected}")]
    OutOfSequence {
        /// Stream the event came from.
        kind: EventKind,
        /// Sequence number of the offending event.
        sequence_number: u64,
        /// Sequence number that must be applied next.
        expected: u64,
    },

    /// The event was routed to an observer for a different stream.
    #[error("observer for {expected} received a {actual} event")]
    KindMismatch {
        /// Stream the observer owns.
        expected: EventKind,
        /// Stream the event claimed to belong to.
        actual: EventKind,
    },

    /// The per-event transaction exceeded its deadline and was rolled back.
    #[error("{kind} event {sequence_number}: transaction timed out after {timeout_ms} ms")]
    TransactionTimeout {
        /// Stream the event came from.
        kind: EventKind,
        /// Sequence number of the offending event.
        sequence_number: u64,
        /// Deadline that elapsed.
        timeout_ms: u64,
    },

    /// The store failed underneath the transaction.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ProcessError {
    /// Returns how the driver should react to this error.
    ///
    /// Only connectivity failures are retried; every data anomaly halts the
    /// stream because re-running it would hit the same anomaly.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::Store(StoreError::Unavailable(_)) => Severity::Transient,
            Self::MalformedPayload { .. }
            | Self::MissingReference { .. }
            | Self::WriteVerification { .. }
            | Self::OffsetNotApplied { .. }
            | Self::StaleEvent { .. }
            | Self::OutOfSequence { .. }
            | Self::KindMismatch { .. }
            | Self::TransactionTimeout { .. }
            | Self::Store(_) => Severity::Fatal,
        }
    }
}

/// Invalid or missing configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable was present but could not be parsed.
    #[error("invalid value for {key}: {value}")]
    Invalid {
        /// Environment variable name.
        key: &'static str,
        /// Raw value that failed to parse.
        value: String,
    },

    /// A required variable was absent.
    #[error("missing required variable {0}")]
    Missing(&'static str),

    /// `ENABLED_STREAMS` named a stream that does not exist.
    #[error("unknown event stream: {0}")]
    UnknownStream(String),
}

/// Top-level error for the indexer binaries.
#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Store failure outside event processing (startup, offset load).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Cache backend could not be initialised.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// A stream halted on a fatal processing error.
    #[error("stream {kind} halted: {source}")]
    StreamHalted {
        /// Stream that stopped.
        kind: EventKind,
        /// Error that stopped it.
        #[source]
        source: ProcessError,
    },

    /// A stream task panicked or was aborted.
    #[error("stream task failed: {0}")]
    Task(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_store_is_transient() {
        let err = ProcessError::Store(StoreError::Unavailable("pool timed out".to_string()));
        assert_eq!(err.severity(), Severity::Transient);
    }

    #[test]
    fn data_anomalies_are_fatal() {
        let missing = ProcessError::MissingReference {
            kind: EventKind::Delist,
            sequence_number: 3,
            entity: "token",
            key: "0xA::c::n".to_string(),
        };
        assert_eq!(missing.severity(), Severity::Fatal);

        let offset = ProcessError::OffsetNotApplied {
            kind: EventKind::List,
            expected: 9,
            actual: Some(8),
        };
        assert_eq!(offset.severity(), Severity::Fatal);

        let query = ProcessError::Store(StoreError::Query("constraint".to_string()));
        assert_eq!(query.severity(), Severity::Fatal);
    }

    #[test]
    fn sqlx_pool_timeout_maps_to_unavailable() {
        let err = StoreError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, StoreError::Unavailable(_)));

        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Query(_)));
    }

    #[test]
    fn messages_carry_context() {
        let err = ProcessError::StaleEvent {
            kind: EventKind::GalleryCreate,
            sequence_number: 4,
            committed: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("gallery_create"));
        assert!(msg.contains('4'));
        assert!(msg.contains('7'));
    }

    #[test]
    fn out_of_sequence_is_fatal() {
        let err = ProcessError::OutOfSequence {
            kind: EventKind::CreateToken,
            sequence_number: 1,
            expected: 0,
        };
        assert_eq!(err.severity(), Severity::Fatal);
    }
}
