//! Inference runtime seam.
//!
//! The worker never runs a model itself. It asks a [`RuntimeLoader`] for an
//! [`InferenceRuntime`] once per worker lifetime, asks the runtime for a
//! [`Pipeline`] per model, and calls the pipeline per generation.

pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{GenerateOptions, PipelineKind};

/// Errors surfaced by a runtime. Only `Cancelled` is treated specially.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("Generation cancelled")]
    Cancelled,
    #[error("Failed to initialize inference runtime: {0}")]
    Init(String),
    #[error("{0}")]
    Load(String),
    #[error("{0}")]
    Inference(String),
}

/// Called by the runtime with raw load progress. The worker clamps and orders it.
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Incremental updates from a streaming call. Each item carries the cumulative
/// `generated_text` so far.
pub type UpdateStream = BoxStream<'static, Result<Value, RuntimeError>>;

/// What a pipeline call hands back.
pub enum PipelineOutput {
    /// A finished value (classification, embeddings, or a non-streaming answer).
    Value(Value),
    /// An incremental sequence of updates.
    Stream(UpdateStream),
}

impl std::fmt::Debug for PipelineOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineOutput::Value(v) => f.debug_tuple("Value").field(v).finish(),
            PipelineOutput::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Arguments for one pipeline call.
#[derive(Debug, Clone)]
pub struct PipelineCall {
    pub input: String,
    pub options: GenerateOptions,
    /// Ask for incremental output.
    pub stream: bool,
    /// `None` when the caller does not attach a signal.
    pub cancel: Option<CancellationToken>,
}

/// A loaded model ready for inference.
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Streaming capability, fixed when the pipeline is loaded.
    fn supports_streaming(&self) -> bool;

    async fn run(&self, call: PipelineCall) -> Result<PipelineOutput, RuntimeError>;
}

/// A pipeline factory: fetches weights and builds pipelines.
#[async_trait]
pub trait InferenceRuntime: Send + Sync {
    async fn load_pipeline(
        &self,
        kind: &PipelineKind,
        model_key: &str,
        progress: ProgressCallback,
    ) -> Result<Arc<dyn Pipeline>, RuntimeError>;
}

/// Imports/initializes the runtime. The worker calls this until it succeeds once.
#[async_trait]
pub trait RuntimeLoader: Send + Sync {
    async fn init(&self) -> Result<Arc<dyn InferenceRuntime>, RuntimeError>;
}

/// Pull the cumulative `generated_text` out of a streaming update.
pub fn generated_text(update: &Value) -> String {
    update
        .get("generated_text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
