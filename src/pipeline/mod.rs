//! Orchestration: pairs each stream's feed with its observer and loops.
//!
//! ```text
//! EventFeed ──next_batch(offset)──▶ events
//!     ▲                               │
//!     │ committed offset              ▼
//!   State ◀──── Processor::process_all(observer, state, events)
//! ```
//!
//! | Step outcome | Next action                             |
//! |--------------|-----------------------------------------|
//! | `Advanced`   | fetch again immediately                 |
//! | `Idle`       | sleep `POLL_INTERVAL_MS`                |
//! | `Retry`      | sleep with exponential backoff          |
//! | `Halted`     | stop this stream, report to the caller  |

pub mod backoff;
pub mod driver;

pub use backoff::Backoff;
pub use driver::{Driver, StepOutcome, Stream, streams_from_config};
