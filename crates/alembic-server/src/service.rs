//! Projection lifecycle management.
//!
//! The service owns the set of live projections by name and serializes
//! Create/Delete/Shutdown against a single registry lock. The lock covers
//! compile, build and start, but is released before any shutdown wait so a
//! draining projection never blocks unrelated creates; double-delete is
//! impossible because the entry leaves the registry under the lock.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use alembic_core::ProcessorConfig;
use alembic_dsl::{compile, DslError, Projection};
use alembic_processor::{Processor, ProcessorError};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("projection already exists: {0}")]
    AlreadyExists(String),

    #[error("projection not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Compile(#[from] DslError),

    #[error(transparent)]
    Processor(#[from] ProcessorError),

    #[error("service is shut down")]
    Terminated,
}

pub type Result<T> = std::result::Result<T, ServiceError>;

/// A running projection binding.
///
/// The processor sits behind this seam so registry semantics stay testable
/// without a broker.
#[async_trait]
pub trait ProjectionRuntime: Send + 'static {
    async fn start(&mut self, cancel: &CancellationToken)
        -> std::result::Result<(), ProcessorError>;

    async fn wait_shutdown(&mut self);
}

#[async_trait]
impl ProjectionRuntime for Processor {
    async fn start(
        &mut self,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), ProcessorError> {
        Processor::start(self, cancel).await
    }

    async fn wait_shutdown(&mut self) {
        Processor::wait_shutdown(self).await;
    }
}

/// Builds runtimes for newly created projections.
#[async_trait]
pub trait RuntimeFactory: Send + Sync {
    type Runtime: ProjectionRuntime;

    async fn build(
        &self,
        projection: Arc<Projection>,
        cfg: ProcessorConfig,
    ) -> std::result::Result<Self::Runtime, ProcessorError>;
}

/// The real thing: one Kafka-bound [`Processor`] per projection.
pub struct KafkaRuntimeFactory;

#[async_trait]
impl RuntimeFactory for KafkaRuntimeFactory {
    type Runtime = Processor;

    async fn build(
        &self,
        projection: Arc<Projection>,
        cfg: ProcessorConfig,
    ) -> std::result::Result<Processor, ProcessorError> {
        Processor::build(projection, cfg).await
    }
}

struct ProjectionData<R> {
    projection: Arc<Projection>,
    runtime: R,
    cancel: CancellationToken,
}

struct Registry<R> {
    projections: HashMap<String, ProjectionData<R>>,
    terminated: bool,
}

pub struct ProjectionService<F: RuntimeFactory> {
    cfg: ProcessorConfig,
    factory: F,
    registry: Mutex<Registry<F::Runtime>>,
}

impl<F: RuntimeFactory> ProjectionService<F> {
    pub fn new(cfg: ProcessorConfig, factory: F) -> Self {
        Self {
            cfg,
            factory,
            registry: Mutex::new(Registry {
                projections: HashMap::new(),
                terminated: false,
            }),
        }
    }

    /// Compile, build and start a projection, registering it on success.
    ///
    /// Atomic: either the projection ends up fully running and registered,
    /// or no resources remain allocated for it.
    pub async fn create(&self, name: &str, query: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        if registry.terminated {
            return Err(ServiceError::Terminated);
        }
        if registry.projections.contains_key(name) {
            return Err(ServiceError::AlreadyExists(name.to_string()));
        }

        let projection = Arc::new(compile(name, query)?);
        let mut runtime = self
            .factory
            .build(projection.clone(), self.cfg.clone())
            .await?;

        let cancel = CancellationToken::new();
        if let Err(e) = runtime.start(&cancel).await {
            // Release whatever the partial start allocated.
            cancel.cancel();
            runtime.wait_shutdown().await;
            return Err(e.into());
        }

        info!(
            projection = name,
            result_stream = %projection.result_stream(),
            partitioned = projection.is_partitioned(),
            "projection created"
        );

        registry.projections.insert(
            name.to_string(),
            ProjectionData {
                projection,
                runtime,
                cancel,
            },
        );
        Ok(())
    }

    /// Stop a projection and remove it from the registry.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let mut data = {
            let mut registry = self.registry.lock().await;
            registry
                .projections
                .remove(name)
                .ok_or_else(|| ServiceError::NotFound(name.to_string()))?
        };

        data.cancel.cancel();
        data.runtime.wait_shutdown().await;
        info!(projection = data.projection.name(), "projection deleted");
        Ok(())
    }

    /// Cancel every live projection, wait for all of them, and leave the
    /// service terminal.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = {
            let mut registry = self.registry.lock().await;
            registry.terminated = true;
            registry.projections.drain().collect()
        };

        for (_, data) in &drained {
            data.cancel.cancel();
        }
        for (name, mut data) in drained {
            data.runtime.wait_shutdown().await;
            info!(projection = %name, "projection stopped");
        }
    }
}
