//! Alembic Core: shared types for the stream-projection engine
//!
//! This crate defines the vocabulary the other Alembic crates speak:
//! - Wire envelope: the JSON record format carried on input and output topics
//! - Event: the decoded, context-enriched record handed to projection scripts
//! - Processor configuration: brokers, parallelism floors, state storage

pub mod config;
pub mod envelope;
pub mod error;
pub mod event;

pub use config::{ProcessorConfig, IN_MEMORY_STORAGE};
pub use envelope::{EventEnvelope, Metadata, CONTENT_TYPE_JSON, EVENT_TYPE_RESULT};
pub use error::{Error, Result};
pub use event::{Event, RecordContext};
