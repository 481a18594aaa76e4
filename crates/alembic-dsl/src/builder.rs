//! Pipeline builder surface registered into the script engine.
//!
//! Each pipeline stage is a distinct registered type exposing only the
//! legal next calls, so ordering violations (`filterBy` before `when`,
//! `partitionBy` after `when`) surface as script evaluation errors. The
//! builders carry no projection data themselves; they are handles into a
//! single compile slot owned by [`crate::compile`], and the chain mutates
//! that slot as the script runs.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rhai::{Array, Dynamic, Engine, EvalAltResult, FnPtr, ImmutableString, Map};

/// Reserved handler key producing the initial state for a key.
pub(crate) const INIT_HANDLER: &str = "$init";

/// Reserved fallback handler key.
pub(crate) const ANY_HANDLER: &str = "$any";

/// The fold registered by `when`.
#[derive(Debug)]
pub(crate) struct FoldHandlers {
    pub init: Option<FnPtr>,
    pub any: Option<FnPtr>,
    pub by_type: HashMap<String, FnPtr>,
}

impl FoldHandlers {
    /// Dispatch: exact event-type match wins, then `$any`, then none.
    pub fn handler_for(&self, event_type: &str) -> Option<&FnPtr> {
        self.by_type.get(event_type).or(self.any.as_ref())
    }

    fn from_map(map: Map) -> Result<Self, Box<EvalAltResult>> {
        let mut handlers = Self {
            init: None,
            any: None,
            by_type: HashMap::new(),
        };

        for (key, value) in map {
            let f = value.try_cast::<FnPtr>().ok_or_else(|| -> Box<EvalAltResult> {
                format!("when handler '{key}' is not a function").into()
            })?;
            match key.as_str() {
                INIT_HANDLER => handlers.init = Some(f),
                ANY_HANDLER => handlers.any = Some(f),
                _ => {
                    handlers.by_type.insert(key.to_string(), f);
                }
            }
        }
        Ok(handlers)
    }
}

/// One step of the compiled pipeline, in script order.
#[derive(Debug)]
pub(crate) enum Op {
    Fold(FoldHandlers),
    Filter(FnPtr),
    Transform(FnPtr),
}

/// Declarative options collected from `options({...})`.
#[derive(Debug, Default, Clone)]
pub(crate) struct Options {
    pub result_stream: Option<String>,
}

/// The projection definition under construction.
#[derive(Default)]
pub(crate) struct ProjectionDef {
    pub input_streams: Vec<String>,
    pub partition_fn: Option<FnPtr>,
    pub operations: Vec<Op>,
    pub result_stream: Option<String>,
}

/// Compile slot shared between the registered host functions.
#[derive(Default)]
pub(crate) struct CompileState {
    pub def: Option<ProjectionDef>,
    pub options: Options,
}

impl CompileState {
    fn def_mut(&mut self) -> &mut ProjectionDef {
        self.def.get_or_insert_with(ProjectionDef::default)
    }
}

pub(crate) type SharedCompile = Arc<Mutex<CompileState>>;

/// Builder returned by `fromStream`/`fromStreams`: accepts `partitionBy`
/// and `when`.
#[derive(Clone)]
pub(crate) struct StreamBuilder {
    state: SharedCompile,
}

/// Builder returned by `partitionBy`: accepts only `when`.
#[derive(Clone)]
pub(crate) struct PartitionedBuilder {
    state: SharedCompile,
}

/// Builder returned by `when`: accepts `filterBy`, `transformBy`,
/// `outputTo` and `outputState`, in any order and number.
#[derive(Clone)]
pub(crate) struct FoldBuilder {
    state: SharedCompile,
}

fn anchor(state: &SharedCompile, streams: Vec<String>) -> StreamBuilder {
    let mut st = state.lock();
    st.def_mut().input_streams = streams;
    StreamBuilder {
        state: state.clone(),
    }
}

impl StreamBuilder {
    fn partition_by(&mut self, f: FnPtr) -> PartitionedBuilder {
        self.state.lock().def_mut().partition_fn = Some(f);
        PartitionedBuilder {
            state: self.state.clone(),
        }
    }

    fn when(&mut self, handlers: Map) -> Result<FoldBuilder, Box<EvalAltResult>> {
        push_fold(&self.state, handlers)?;
        Ok(FoldBuilder {
            state: self.state.clone(),
        })
    }
}

impl PartitionedBuilder {
    fn when(&mut self, handlers: Map) -> Result<FoldBuilder, Box<EvalAltResult>> {
        push_fold(&self.state, handlers)?;
        Ok(FoldBuilder {
            state: self.state.clone(),
        })
    }
}

impl FoldBuilder {
    fn filter_by(&mut self, f: FnPtr) -> FoldBuilder {
        self.state.lock().def_mut().operations.push(Op::Filter(f));
        self.clone()
    }

    fn transform_by(&mut self, f: FnPtr) -> FoldBuilder {
        self.state
            .lock()
            .def_mut()
            .operations
            .push(Op::Transform(f));
        self.clone()
    }

    fn output_to(&mut self, stream: ImmutableString) -> FoldBuilder {
        self.state.lock().def_mut().result_stream = Some(stream.to_string());
        self.clone()
    }

    // Chainable no-op; the fold's state is always the implicit output.
    fn output_state(&mut self) -> FoldBuilder {
        self.clone()
    }
}

fn push_fold(state: &SharedCompile, handlers: Map) -> Result<(), Box<EvalAltResult>> {
    let handlers = FoldHandlers::from_map(handlers)?;
    state.lock().def_mut().operations.push(Op::Fold(handlers));
    Ok(())
}

/// Bind the DSL surface into an engine, wired to the given compile slot.
pub(crate) fn register(engine: &mut Engine, state: SharedCompile) {
    engine
        .register_type_with_name::<StreamBuilder>("Pipeline")
        .register_type_with_name::<PartitionedBuilder>("PartitionedPipeline")
        .register_type_with_name::<FoldBuilder>("FoldPipeline");

    let st = state.clone();
    engine.register_fn("fromStream", move |name: ImmutableString| {
        anchor(&st, vec![name.to_string()])
    });

    let st = state.clone();
    engine.register_fn(
        "fromStreams",
        move |names: Array| -> Result<StreamBuilder, Box<EvalAltResult>> {
            let mut streams = Vec::with_capacity(names.len());
            for name in names {
                let name = name
                    .into_immutable_string()
                    .map_err(|t| format!("fromStreams expects stream names, got {t}"))?;
                streams.push(name.to_string());
            }
            if streams.is_empty() {
                return Err("fromStreams requires at least one stream".into());
            }
            Ok(anchor(&st, streams))
        },
    );

    let st = state;
    engine.register_fn("options", move |opts: Map| -> Result<(), Box<EvalAltResult>> {
        let mut state = st.lock();
        for (key, value) in opts {
            // Only resultStreamName is honored; unknown keys are accepted
            // and ignored so scripts stay portable.
            if key.as_str() == "resultStreamName" {
                let name = value
                    .into_immutable_string()
                    .map_err(|t| format!("resultStreamName must be a string, got {t}"))?;
                state.options.result_stream = Some(name.to_string());
            }
        }
        Ok(())
    });

    engine.register_fn("log", |value: Dynamic| {
        let rendered = serde_json::to_string(&value).unwrap_or_else(|_| value.to_string());
        tracing::info!(target: "alembic::script", value = %rendered, "script log");
    });

    engine.register_fn("partitionBy", StreamBuilder::partition_by);
    engine.register_fn("when", StreamBuilder::when);
    engine.register_fn("when", PartitionedBuilder::when);
    engine.register_fn("filterBy", FoldBuilder::filter_by);
    engine.register_fn("transformBy", FoldBuilder::transform_by);
    engine.register_fn("outputTo", FoldBuilder::output_to);
    engine.register_fn("outputState", FoldBuilder::output_state);
}
