//! Bridge between native values and the embedded evaluator.
//!
//! The interpreter is used strictly through this capability set: compile a
//! source into a module, call a script function with native arguments,
//! export any script value to JSON, import JSON back into a script value.

use rhai::{Dynamic, Engine, FnPtr, FuncArgs, AST};
use serde::Serialize;

use crate::error::{DslError, Result};

/// A compiled script module plus the engine that evaluates it.
///
/// Not reentrant; callers serialize access (see [`crate::Projection`]).
#[derive(Debug)]
pub(crate) struct ScriptRuntime {
    engine: Engine,
    ast: AST,
}

impl ScriptRuntime {
    pub fn new(engine: Engine, ast: AST) -> Self {
        Self { engine, ast }
    }

    /// Invoke a script function pointer with native arguments.
    pub fn call(&self, f: &FnPtr, args: impl FuncArgs) -> Result<Dynamic> {
        f.call::<Dynamic>(&self.engine, &self.ast, args)
            .map_err(|e| DslError::Runtime(e.to_string()))
    }
}

/// Convert a native value into a script value.
pub(crate) fn to_dynamic<T: Serialize>(value: &T) -> Result<Dynamic> {
    rhai::serde::to_dynamic(value).map_err(|e| DslError::State(e.to_string()))
}

/// Export a script value as JSON bytes. Unit exports as `null`.
pub(crate) fn export(value: &Dynamic) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| DslError::State(e.to_string()))
}

/// Import JSON bytes as a script value. `null` imports as unit.
pub(crate) fn import(raw: &[u8]) -> Result<Dynamic> {
    serde_json::from_slice(raw).map_err(|e| DslError::State(e.to_string()))
}

/// Export a script value as a JSON tree, for output envelopes.
pub(crate) fn export_value(value: &Dynamic) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| DslError::State(e.to_string()))
}
