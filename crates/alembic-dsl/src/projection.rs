//! Compiled projections and per-event fold evaluation.

use std::sync::Arc;

use parking_lot::Mutex;
use rhai::{Dynamic, Engine, FnPtr};

use alembic_core::Event;

use crate::builder::{self, CompileState, Op, SharedCompile};
use crate::error::{DslError, Result};
use crate::script::{self, ScriptRuntime};

/// Compile a projection script into a runnable [`Projection`].
///
/// The script is evaluated exactly once, here; its pipeline calls freeze
/// into an ordered operation list. Any parse or evaluation failure is a
/// compile error.
pub fn compile(name: &str, source: &str) -> Result<Projection> {
    if source.trim().is_empty() {
        return Err(DslError::Compile("empty projection script".into()));
    }

    let state: SharedCompile = Arc::new(Mutex::new(CompileState::default()));
    let mut engine = Engine::new();
    builder::register(&mut engine, state.clone());

    let ast = engine
        .compile(source)
        .map_err(|e| DslError::Compile(e.to_string()))?;
    engine
        .eval_ast::<Dynamic>(&ast)
        .map_err(|e| DslError::Compile(e.to_string()))?;

    let (def, options) = {
        let mut st = state.lock();
        let def = st.def.take().ok_or_else(|| {
            DslError::Compile("script does not define a projection pipeline".into())
        })?;
        (def, st.options.clone())
    };

    if def.input_streams.is_empty() {
        return Err(DslError::Compile("projection has no input streams".into()));
    }

    Ok(Projection {
        name: name.to_string(),
        input_streams: def.input_streams,
        result_stream: def.result_stream.or(options.result_stream),
        partition_fn: def.partition_fn,
        operations: def.operations,
        runtime: Mutex::new(ScriptRuntime::new(engine, ast)),
    })
}

/// Result of folding one event into per-key state.
#[derive(Debug)]
pub struct FoldOutcome {
    /// JSON-encoded state to persist under the key.
    pub state: Vec<u8>,

    /// Value to forward to the result stream; `None` when a filter dropped
    /// it or the pipeline produced nothing.
    pub output: Option<serde_json::Value>,
}

/// A compiled user projection.
///
/// The operation list is frozen at compile time. All script evaluation is
/// serialized under an internal mutex; the interpreter is not reentrant and
/// the engine never evaluates two events concurrently against the same
/// projection.
#[derive(Debug)]
pub struct Projection {
    name: String,
    input_streams: Vec<String>,
    result_stream: Option<String>,
    partition_fn: Option<FnPtr>,
    operations: Vec<Op>,
    runtime: Mutex<ScriptRuntime>,
}

impl Projection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_streams(&self) -> &[String] {
        &self.input_streams
    }

    /// Whether the key domain is redefined by a partition function.
    pub fn is_partitioned(&self) -> bool {
        self.partition_fn.is_some()
    }

    /// The output topic, `projections-<name>-result` unless overridden.
    pub fn result_stream(&self) -> String {
        self.result_stream
            .clone()
            .unwrap_or_else(|| format!("projections-{}-result", self.name))
    }

    /// Compute the repartition key for an event.
    pub fn partition_key(&self, event: &Event) -> Result<String> {
        let f = self.partition_fn.as_ref().ok_or_else(|| {
            DslError::Runtime("projection has no partition function".into())
        })?;

        let runtime = self.runtime.lock();
        let event = script::to_dynamic(event)?;
        runtime
            .call(f, (event,))?
            .into_immutable_string()
            .map(|s| s.to_string())
            .map_err(|t| DslError::Runtime(format!("partitionBy returned {t}, expected string")))
    }

    /// Fold one event into the given state.
    ///
    /// Operations run in script order. The fold is the only operation that
    /// mutates the persisted state; `filterBy`/`transformBy` act on an
    /// in-flight value seeded with the post-fold state. A falsy filter
    /// short-circuits the remainder: nothing is forwarded, the fold's state
    /// is still persisted. On a script error nothing is persisted.
    pub fn apply(&self, state: Option<&[u8]>, event: &Event) -> Result<FoldOutcome> {
        let runtime = self.runtime.lock();
        let event_dyn = script::to_dynamic(event)?;

        let mut persisted = match state {
            Some(raw) => script::import(raw)?,
            None => Dynamic::UNIT,
        };
        let mut in_flight = persisted.clone();

        for op in &self.operations {
            match op {
                Op::Fold(handlers) => {
                    if persisted.is_unit() {
                        if let Some(init) = &handlers.init {
                            persisted = runtime.call(init, ())?;
                        }
                    }
                    if let Some(handler) = handlers.handler_for(&event.event_type) {
                        let next =
                            runtime.call(handler, (persisted.clone(), event_dyn.clone()))?;
                        // A handler that returns unit keeps the state as-is.
                        if !next.is_unit() {
                            persisted = next;
                        }
                    }
                    in_flight = persisted.clone();
                }
                Op::Filter(f) => {
                    let keep = runtime
                        .call(f, (in_flight.clone(),))?
                        .as_bool()
                        .unwrap_or(false);
                    if !keep {
                        return Ok(FoldOutcome {
                            state: script::export(&persisted)?,
                            output: None,
                        });
                    }
                }
                Op::Transform(f) => {
                    in_flight = runtime.call(f, (in_flight.clone(),))?;
                }
            }
        }

        let output = if in_flight.is_unit() {
            None
        } else {
            Some(script::export_value(&in_flight)?)
        };

        Ok(FoldOutcome {
            state: script::export(&persisted)?,
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alembic_core::{EventEnvelope, RecordContext};
    use serde_json::json;

    fn event(event_type: &str, data: serde_json::Value) -> Event {
        let envelope = EventEnvelope {
            metadata: [("type".to_string(), event_type.to_string())].into(),
            data,
            ..Default::default()
        };
        Event::from_envelope(
            envelope,
            &RecordContext {
                key: "k".to_string(),
                topic: "s".to_string(),
                partition: 0,
                offset: 0,
                timestamp_ms: Some(0),
            },
        )
    }

    #[test]
    fn test_empty_script_is_compile_error() {
        assert!(matches!(compile("p", "  \n"), Err(DslError::Compile(_))));
    }

    #[test]
    fn test_script_without_pipeline_is_compile_error() {
        assert!(matches!(compile("p", "1 + 1"), Err(DslError::Compile(_))));
    }

    #[test]
    fn test_filter_before_when_is_compile_error() {
        let err = compile("p", r#"fromStream("x").filterBy(|s| true)"#).unwrap_err();
        assert!(matches!(err, DslError::Compile(_)));
    }

    #[test]
    fn test_partition_by_after_when_is_compile_error() {
        let err = compile(
            "p",
            r#"fromStream("x").when(#{}).partitionBy(|e| e.eventType)"#,
        )
        .unwrap_err();
        assert!(matches!(err, DslError::Compile(_)));
    }

    #[test]
    fn test_non_function_handler_is_compile_error() {
        let err = compile("p", r#"fromStream("x").when(#{ "$any": 42 })"#).unwrap_err();
        assert!(matches!(err, DslError::Compile(_)));
    }

    #[test]
    fn test_default_result_stream() {
        let p = compile("totals", r#"fromStream("x").when(#{})"#).unwrap();
        assert_eq!(p.result_stream(), "projections-totals-result");
    }

    #[test]
    fn test_output_to_overrides_result_stream() {
        let p = compile("p", r#"fromStream("x").when(#{}).outputTo("out")"#).unwrap();
        assert_eq!(p.result_stream(), "out");
    }

    #[test]
    fn test_options_set_result_stream() {
        let p = compile(
            "p",
            r#"
            options(#{ resultStreamName: "renamed", processingLag: 5 });
            fromStream("x").when(#{})
            "#,
        )
        .unwrap();
        assert_eq!(p.result_stream(), "renamed");
    }

    #[test]
    fn test_from_streams_anchors_all_inputs() {
        let p = compile("p", r#"fromStreams(["a", "b", "c"]).when(#{})"#).unwrap();
        assert_eq!(p.input_streams(), ["a", "b", "c"]);
        assert!(!p.is_partitioned());
    }

    #[test]
    fn test_init_runs_once_per_key() {
        let p = compile(
            "p",
            r#"
            fromStream("x").when(#{
                "$init": || #{ count: 0 },
                "$any": |s, e| { s.count += 1; s }
            })
            "#,
        )
        .unwrap();

        let first = p.apply(None, &event("T", json!(null))).unwrap();
        let second = p.apply(Some(&first.state), &event("T", json!(null))).unwrap();

        let state: serde_json::Value = serde_json::from_slice(&second.state).unwrap();
        assert_eq!(state["count"], 2);
    }

    #[test]
    fn test_typed_handler_beats_fallback() {
        let p = compile(
            "p",
            r#"
            fromStream("x").when(#{
                "Deposited": |s, e| "typed",
                "$any": |s, e| "fallback"
            })
            "#,
        )
        .unwrap();

        let typed = p.apply(None, &event("Deposited", json!(null))).unwrap();
        assert_eq!(typed.output.unwrap(), json!("typed"));

        let other = p.apply(None, &event("Withdrawn", json!(null))).unwrap();
        assert_eq!(other.output.unwrap(), json!("fallback"));
    }

    #[test]
    fn test_unmatched_type_without_fallback_is_noop() {
        let p = compile(
            "p",
            r#"
            fromStream("x").when(#{
                "Known": |s, e| #{ seen: true }
            })
            "#,
        )
        .unwrap();

        let outcome = p
            .apply(Some(br#"{"seen":false}"#), &event("Unknown", json!(null)))
            .unwrap();
        let state: serde_json::Value = serde_json::from_slice(&outcome.state).unwrap();
        assert_eq!(state["seen"], false);
    }

    #[test]
    fn test_handler_returning_unit_keeps_state() {
        let p = compile(
            "p",
            r#"
            fromStream("x").when(#{
                "$any": |s, e| { log(e.eventType); }
            })
            "#,
        )
        .unwrap();

        let outcome = p
            .apply(Some(br#"{"kept":1}"#), &event("T", json!(null)))
            .unwrap();
        let state: serde_json::Value = serde_json::from_slice(&outcome.state).unwrap();
        assert_eq!(state["kept"], 1);
    }

    #[test]
    fn test_filter_falsy_persists_state_without_output() {
        let p = compile(
            "p",
            r#"
            fromStream("x").when(#{
                "$init": || #{ count: 0 },
                "$any": |s, e| { s.count += 1; s }
            }).filterBy(|s| s.count >= 3)
            "#,
        )
        .unwrap();

        let first = p.apply(None, &event("T", json!(null))).unwrap();
        assert!(first.output.is_none());

        let second = p.apply(Some(&first.state), &event("T", json!(null))).unwrap();
        assert!(second.output.is_none());

        let third = p.apply(Some(&second.state), &event("T", json!(null))).unwrap();
        assert_eq!(third.output.unwrap()["count"], 3);
    }

    #[test]
    fn test_filter_non_boolean_counts_as_falsy() {
        let p = compile(
            "p",
            r#"fromStream("x").when(#{ "$any": |s, e| e.data }).filterBy(|s| "yes")"#,
        )
        .unwrap();

        let outcome = p.apply(None, &event("T", json!(1))).unwrap();
        assert!(outcome.output.is_none());
    }

    #[test]
    fn test_transform_replaces_output_not_state() {
        let p = compile(
            "p",
            r#"
            fromStream("x").when(#{
                "$init": || #{ count: 0 },
                "$any": |s, e| { s.count += 1; s }
            }).transformBy(|s| #{ Total: s.count })
            "#,
        )
        .unwrap();

        let outcome = p.apply(None, &event("T", json!(null))).unwrap();
        assert_eq!(outcome.output.unwrap(), json!({ "Total": 1 }));

        // Persisted state keeps its original shape.
        let state: serde_json::Value = serde_json::from_slice(&outcome.state).unwrap();
        assert_eq!(state, json!({ "count": 1 }));
    }

    #[test]
    fn test_passthrough_re_emits_data() {
        let p = compile("p", r#"fromStream("x").when(#{ "$any": |s, e| e.data })"#).unwrap();

        for n in 0..5 {
            let outcome = p.apply(None, &event("T", json!(n))).unwrap();
            assert_eq!(outcome.output.unwrap(), json!(n));
        }
    }

    #[test]
    fn test_runtime_error_surfaces() {
        let p = compile(
            "p",
            r#"fromStream("x").when(#{ "$any": |s, e| { throw "boom" } })"#,
        )
        .unwrap();

        let err = p.apply(None, &event("T", json!(null))).unwrap_err();
        assert!(matches!(err, DslError::Runtime(_)));
    }

    #[test]
    fn test_partition_key() {
        let p = compile(
            "p",
            r#"fromStream("x").partitionBy(|e| e.eventType).when(#{})"#,
        )
        .unwrap();
        assert!(p.is_partitioned());
        assert_eq!(p.partition_key(&event("audit", json!(null))).unwrap(), "audit");
    }

    #[test]
    fn test_partition_key_non_string_is_runtime_error() {
        let p = compile("p", r#"fromStream("x").partitionBy(|e| 42).when(#{})"#).unwrap();
        assert!(matches!(
            p.partition_key(&event("T", json!(null))),
            Err(DslError::Runtime(_))
        ));
    }

    #[test]
    fn test_fold_determinism_on_replay() {
        let p = compile(
            "p",
            r#"
            fromStream("x").when(#{
                "$init": || #{ total: 0 },
                "$any": |s, e| { s.total += e.data; s }
            })
            "#,
        )
        .unwrap();

        let run = |inputs: &[i64]| {
            let mut state: Option<Vec<u8>> = None;
            for n in inputs {
                let outcome = p.apply(state.as_deref(), &event("T", json!(n))).unwrap();
                state = Some(outcome.state);
            }
            state.unwrap()
        };

        assert_eq!(run(&[1, 2, 3, 4]), run(&[1, 2, 3, 4]));
    }
}
