//! Pipeline catalog and executor seams.
//!
//! The connection handler only depends on the two traits here. The
//! [`PipelineRegistry`] implements both over a lookup table of synchronous
//! [`Pipeline`]s that is built once at startup.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error};

/// Boxed future type for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Structured output of one frame.
pub type PipelineOutput = serde_json::Value;

/// Errors produced while executing a pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// No pipeline is registered under this identifier.
    #[error("unknown pipeline: {0}")]
    UnknownPipeline(String),

    /// The pipeline rejected or failed on the frame.
    #[error("pipeline {pipeline} failed: {reason}")]
    Failed {
        /// Pipeline identifier.
        pipeline: String,
        /// What went wrong.
        reason: String,
    },

    /// The pipeline panicked.
    #[error("pipeline {0} panicked")]
    Panicked(String),
}

impl PipelineError {
    /// Create a failure for `pipeline`.
    #[must_use]
    pub fn failed(pipeline: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            pipeline: pipeline.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error came from an unexpected fault rather than the
    /// pipeline reporting a failure.
    #[must_use]
    pub const fn is_unexpected(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }
}

/// Knows which pipeline identifiers exist.
pub trait PipelineCatalog: Send + Sync {
    /// Check whether `pipeline_id` names a known pipeline.
    fn is_valid_pipeline(&self, pipeline_id: &str) -> bool;
}

/// Runs one frame through a named pipeline.
///
/// Implementations are shared by every session and must tolerate concurrent
/// calls. Dropping the returned future cancels the call where the
/// implementation supports it.
pub trait PipelineExecutor: Send + Sync {
    /// Execute `frame` against `pipeline_id`.
    fn run<'a>(
        &'a self,
        pipeline_id: &'a str,
        frame_index: u64,
        frame: Arc<[u8]>,
    ) -> BoxFuture<'a, Result<PipelineOutput, PipelineError>>;
}

/// One family of synchronous inference logic.
pub trait Pipeline: Send + Sync + fmt::Debug {
    /// Identifier clients use to select this pipeline.
    fn name(&self) -> &str;

    /// Process a single, already validated frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be processed.
    fn process(&self, frame_index: u64, frame: &[u8]) -> Result<PipelineOutput, PipelineError>;
}

/// Lookup table of pipelines, built at startup.
///
/// Pipelines run on tokio's blocking pool so CPU-heavy work never stalls
/// the connection tasks sharing the runtime. A blocking call cannot be
/// interrupted once started; a cancelled session simply discards its result.
#[derive(Debug, Default, Clone)]
pub struct PipelineRegistry {
    pipelines: HashMap<String, Arc<dyn Pipeline>>,
}

impl PipelineRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pipeline under its own name, replacing any previous entry.
    #[must_use]
    pub fn with_pipeline(mut self, pipeline: impl Pipeline + 'static) -> Self {
        self.register(Arc::new(pipeline));
        self
    }

    /// Register a shared pipeline. Returns the entry it replaced, if any.
    pub fn register(&mut self, pipeline: Arc<dyn Pipeline>) -> Option<Arc<dyn Pipeline>> {
        let name = pipeline.name().to_string();
        debug!(pipeline = %name, "Registering pipeline");
        self.pipelines.insert(name, pipeline)
    }

    /// Look up a pipeline.
    #[must_use]
    pub fn get(&self, pipeline_id: &str) -> Option<Arc<dyn Pipeline>> {
        self.pipelines.get(pipeline_id).cloned()
    }

    /// Registered identifiers, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.pipelines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered pipelines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    /// Check if no pipelines are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

impl PipelineCatalog for PipelineRegistry {
    fn is_valid_pipeline(&self, pipeline_id: &str) -> bool {
        self.pipelines.contains_key(pipeline_id)
    }
}

impl PipelineExecutor for PipelineRegistry {
    fn run<'a>(
        &'a self,
        pipeline_id: &'a str,
        frame_index: u64,
        frame: Arc<[u8]>,
    ) -> BoxFuture<'a, Result<PipelineOutput, PipelineError>> {
        Box::pin(async move {
            let pipeline = self
                .get(pipeline_id)
                .ok_or_else(|| PipelineError::UnknownPipeline(pipeline_id.to_string()))?;

            let handle =
                tokio::task::spawn_blocking(move || pipeline.process(frame_index, &frame));

            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!(pipeline = %pipeline_id, frame_index, error = %e, "Pipeline task failed");
                    Err(PipelineError::Panicked(pipeline_id.to_string()))
                }
            }
        })
    }
}
