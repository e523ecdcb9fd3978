//! Pipeline kinds and generation options.
//!
//! A pipeline kind decides the input/output shape of a model and whether its
//! output streams. Kinds travel over the wire as their plain string names.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Task category a model is loaded for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PipelineKind {
    /// Text classification (label + score).
    SentimentAnalysis,
    /// Sentence embeddings.
    FeatureExtraction,
    /// Causal text generation.
    TextGeneration,
    /// Sequence-to-sequence text generation.
    Text2TextGeneration,
    /// Anything else the runtime understands, kept verbatim.
    Other(String),
}

/// How the worker drives a pipeline of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Invoke once, emit a single result.
    SingleShot,
    /// Invoke in streaming mode, emit chunks then done.
    Streaming,
    /// Unknown kind: invoke once with the cancellation token attached.
    Fallback,
}

impl PipelineKind {
    pub fn as_str(&self) -> &str {
        match self {
            PipelineKind::SentimentAnalysis => "sentiment-analysis",
            PipelineKind::FeatureExtraction => "feature-extraction",
            PipelineKind::TextGeneration => "text-generation",
            PipelineKind::Text2TextGeneration => "text2text-generation",
            PipelineKind::Other(name) => name,
        }
    }

    pub fn dispatch(&self) -> Dispatch {
        match self {
            PipelineKind::SentimentAnalysis | PipelineKind::FeatureExtraction => {
                Dispatch::SingleShot
            }
            PipelineKind::TextGeneration | PipelineKind::Text2TextGeneration => {
                Dispatch::Streaming
            }
            PipelineKind::Other(_) => Dispatch::Fallback,
        }
    }

    /// Whether this kind produces incremental text.
    pub fn is_streaming(&self) -> bool {
        self.dispatch() == Dispatch::Streaming
    }
}

impl From<&str> for PipelineKind {
    fn from(name: &str) -> Self {
        match name {
            "sentiment-analysis" | "text-classification" => PipelineKind::SentimentAnalysis,
            "feature-extraction" | "embeddings" => PipelineKind::FeatureExtraction,
            "text-generation" => PipelineKind::TextGeneration,
            "text2text-generation" => PipelineKind::Text2TextGeneration,
            other => PipelineKind::Other(other.to_string()),
        }
    }
}

impl From<String> for PipelineKind {
    fn from(name: String) -> Self {
        PipelineKind::from(name.as_str())
    }
}

impl From<PipelineKind> for String {
    fn from(kind: PipelineKind) -> Self {
        match kind {
            PipelineKind::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options forwarded to the pipeline call.
///
/// Known keys are typed; everything else is passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GenerateOptions {
    pub fn new(max_new_tokens: u32, temperature: f32) -> Self {
        Self {
            max_new_tokens: Some(max_new_tokens),
            temperature: Some(temperature),
            extra: Map::new(),
        }
    }
}
