//! Alembic Processor: attaches compiled projections to the log
//!
//! A processor runs one projection for the lifetime of the process:
//! - Topic provisioning with upstream inheritance: downstream topics adopt
//!   the highest partition and replication counts observed on input topics
//! - An optional repartition stage re-keying the raw stream through the
//!   projection's partition function into an intermediate topic
//! - A main stage folding each record into a per-key state table, mirrored
//!   to a compacted changelog topic and replayed on startup before the
//!   stage declares ready
//!
//! Delivery is at-least-once: offsets are stored only after a record is
//! fully processed (emit-then-commit), so a crash replays the tail.

pub mod error;
pub mod processor;
pub mod stage;
pub mod state;
pub mod topics;

pub use error::{ProcessorError, Result};
pub use processor::Processor;
pub use stage::StageState;
pub use state::{open_table, MemoryTable, SqliteTable, StateTable};
pub use topics::TopicManager;
