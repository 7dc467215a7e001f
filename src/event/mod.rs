//! Event Module - audit trail for plan application
//!
//! Key types:
//! - `Event`: envelope with id + timestamp + kind
//! - `EventKind`: apply, node and consistency events
//! - `EventLog`: thread-safe, append-only log
//! - `TraceWriter`: NDJSON file writer for `--trace`

mod log;
mod trace;

pub use log::{Event, EventKind, EventLog};
pub use trace::{calculate_template_hash, generate_generation_id, TraceWriter};
