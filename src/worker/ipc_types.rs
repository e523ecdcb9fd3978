//! Protocol types for controller ↔ worker communication.
//!
//! Every message is a `type`-tagged JSON object. Over process pipes they travel
//! as JSON Lines (one object per line).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pipeline::{GenerateOptions, PipelineKind};

/// Requests the controller sends to the worker. All fire-and-forget.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerRequest {
    /// Load (or switch to) a model.
    #[serde(rename_all = "camelCase")]
    LoadModel {
        #[serde(default)]
        model_key: Option<String>,
        /// Resolved from the catalog when omitted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pipeline: Option<PipelineKind>,
    },
    /// Run one generation against the loaded model.
    #[serde(rename_all = "camelCase")]
    Generate {
        input: String,
        /// Defaults to the loaded session's kind.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pipeline_type: Option<PipelineKind>,
        #[serde(default)]
        options: GenerateOptions,
    },
    /// Cancel the in-flight generation.
    Abort,
    /// Any other `type`; ignored by the worker.
    #[serde(other, skip_serializing)]
    Unknown,
}

impl WorkerRequest {
    pub fn load(model_key: impl Into<String>, pipeline: Option<PipelineKind>) -> Self {
        WorkerRequest::LoadModel {
            model_key: Some(model_key.into()),
            pipeline,
        }
    }

    pub fn generate(
        input: impl Into<String>,
        pipeline_type: Option<PipelineKind>,
        options: GenerateOptions,
    ) -> Self {
        WorkerRequest::Generate {
            input: input.into(),
            pipeline_type,
            options,
        }
    }
}

/// Events the worker sends back. One-way, delivered in order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerEvent {
    /// Model-loading progress in [0, 1].
    Progress { progress: f64 },
    /// Model loaded and usable.
    #[serde(rename_all = "camelCase")]
    Ready { model_key: String },
    /// Cumulative generated text so far.
    Chunk { text: String },
    /// Streaming generation finished.
    Done,
    /// Final value of a non-streaming or fallback generation.
    Result { result: Value },
    /// Generation was cancelled.
    Aborted,
    /// Failure during load or generation.
    Error { message: String },
}

impl WorkerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        WorkerEvent::Error {
            message: message.into(),
        }
    }

    /// Whether this event ends a generation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerEvent::Done | WorkerEvent::Result { .. } | WorkerEvent::Aborted | WorkerEvent::Error { .. }
        )
    }
}
