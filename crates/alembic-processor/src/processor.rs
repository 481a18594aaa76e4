//! The processor: provisions topics and runs a projection's stages.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use alembic_core::ProcessorConfig;
use alembic_dsl::Projection;

use crate::error::{ProcessorError, Result};
use crate::stage::{self, StageContext, StageState};
use crate::topics::TopicManager;

/// Runs one projection against the log for the lifetime of the process.
///
/// A non-partitioned projection runs a single main stage over its input
/// streams. A partitioned projection adds a repartition stage that re-keys
/// the raw stream into `<name>-partition-by-output`, which the main stage
/// then consumes.
pub struct Processor {
    cfg: ProcessorConfig,
    projection: Arc<Projection>,
    tasks: Vec<JoinHandle<Result<()>>>,
}

impl Processor {
    /// Provision every topic the projection needs, adopting upstream
    /// parallelism first. The stages are not started yet.
    pub async fn build(projection: Arc<Projection>, mut cfg: ProcessorConfig) -> Result<Self> {
        cfg.validate()?;

        let topics = TopicManager::new(&cfg)?;
        topics.inherit_from_upstream(&mut cfg, projection.input_streams())?;

        for stream in projection.input_streams() {
            topics.ensure_stream_exists(stream, &cfg, false).await?;
        }
        topics
            .ensure_stream_exists(&projection.result_stream(), &cfg, false)
            .await?;

        let main_group = stage::main_group(projection.name());
        topics
            .ensure_stream_exists(&stage::changelog_topic(&main_group), &cfg, true)
            .await?;

        if projection.is_partitioned() {
            topics
                .ensure_stream_exists(&stage::partition_by_topic(projection.name()), &cfg, false)
                .await?;
        }

        info!(
            projection = projection.name(),
            partitions = cfg.partitions,
            replication = cfg.replication,
            "topics provisioned"
        );

        Ok(Self {
            cfg,
            projection,
            tasks: Vec::new(),
        })
    }

    /// Launch the stages and block until each reports ready.
    ///
    /// The main stage starts first; for a partitioned topology the
    /// repartition stage follows once the main stage is ready. If either
    /// fails to come up, the token is cancelled so partially started
    /// stages drain.
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<()> {
        let name = self.projection.name().to_string();

        let main_inputs = if self.projection.is_partitioned() {
            vec![stage::partition_by_topic(&name)]
        } else {
            self.projection.input_streams().to_vec()
        };

        let (ctx, state_rx) = self.stage_context(cancel);
        let main = stage::run_main_stage(
            ctx,
            main_inputs,
            self.projection.result_stream(),
            stage::main_group(&name),
        );
        if let Err(e) = self.launch_stage(main, state_rx).await {
            cancel.cancel();
            return Err(e);
        }

        if self.projection.is_partitioned() {
            let (ctx, state_rx) = self.stage_context(cancel);
            let repartition = stage::run_repartition_stage(
                ctx,
                self.projection.input_streams().to_vec(),
                stage::partition_by_topic(&name),
                stage::partition_group(&name),
            );
            if let Err(e) = self.launch_stage(repartition, state_rx).await {
                cancel.cancel();
                return Err(e);
            }
        }

        Ok(())
    }

    /// Block until every stage task has returned.
    pub async fn wait_shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(projection = self.projection.name(), error = %e, "stage exited with error")
                }
                Err(e) => {
                    error!(projection = self.projection.name(), error = %e, "stage task panicked")
                }
            }
        }
    }

    fn stage_context(
        &self,
        cancel: &CancellationToken,
    ) -> (StageContext, watch::Receiver<StageState>) {
        let (state_tx, state_rx) = watch::channel(StageState::NotStarted);
        (
            StageContext {
                cfg: self.cfg.clone(),
                projection: self.projection.clone(),
                state_tx,
                cancel: cancel.clone(),
            },
            state_rx,
        )
    }

    async fn launch_stage(
        &mut self,
        stage: impl Future<Output = Result<()>> + Send + 'static,
        state_rx: watch::Receiver<StageState>,
    ) -> Result<()> {
        let handle = await_stage_ready(tokio::spawn(stage), state_rx).await?;
        self.tasks.push(handle);
        Ok(())
    }
}

/// Wait until a stage task reports ready, surfacing its error if it exits
/// first.
pub(crate) async fn await_stage_ready(
    handle: JoinHandle<Result<()>>,
    mut state_rx: watch::Receiver<StageState>,
) -> Result<JoinHandle<Result<()>>> {
    loop {
        let state = *state_rx.borrow_and_update();
        match state {
            StageState::Ready | StageState::Running => return Ok(handle),
            StageState::Stopped => return Err(stage_start_error(handle).await),
            _ => {}
        }
        if state_rx.changed().await.is_err() {
            // The stage dropped its sender: it exited before ready.
            return Err(stage_start_error(handle).await);
        }
    }
}

async fn stage_start_error(handle: JoinHandle<Result<()>>) -> ProcessorError {
    match handle.await {
        Ok(Err(e)) => e,
        Ok(Ok(())) => ProcessorError::StartAborted("stage exited before ready".into()),
        Err(e) => ProcessorError::StartAborted(e.to_string()),
    }
}
