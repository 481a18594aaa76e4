//! Alembic DSL: the projection compiler and per-event fold runtime
//!
//! A projection is written as a short script in an embedded, sandboxed
//! language (rhai) against a fluent pipeline surface:
//!
//! ```text
//! fromStream("orders")
//!     .partitionBy(|e| e.eventType)
//!     .when(#{
//!         "$init": || #{ count: 0 },
//!         "$any": |s, e| { s.count += 1; s }
//!     })
//!     .filterBy(|s| s.count == 10)
//!     .transformBy(|s| #{ Total: s.count })
//!     .outputTo("totals")
//! ```
//!
//! [`compile`] evaluates the script once, freezing the pipeline into an
//! ordered operation list; [`Projection::apply`] then folds one event at a
//! time into JSON-encoded per-key state. Handlers receive `(state, event)`
//! and return the next state; a handler returning unit leaves the state
//! unchanged. All evaluation for one projection is serialized internally.

mod builder;
pub mod error;
pub mod projection;
mod script;

pub use error::{DslError, Result};
pub use projection::{compile, FoldOutcome, Projection};
