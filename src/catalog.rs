//! Selectable models and their display metadata.

use serde::{Deserialize, Serialize};

use crate::pipeline::PipelineKind;

/// One selectable model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub key: String,
    #[serde(default)]
    pub params: String,
    #[serde(default, rename = "type")]
    pub model_type: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub description: String,
    pub pipeline: PipelineKind,
}

impl ModelInfo {
    fn builtin(
        key: &str,
        params: &str,
        model_type: &str,
        size: &str,
        task: &str,
        description: &str,
        pipeline: PipelineKind,
    ) -> Self {
        Self {
            key: key.to_string(),
            params: params.to_string(),
            model_type: model_type.to_string(),
            size: size.to_string(),
            task: task.to_string(),
            description: description.to_string(),
            pipeline,
        }
    }
}

lazy_static::lazy_static! {
    static ref DEFAULT_MODELS: Vec<ModelInfo> = vec![
        ModelInfo::builtin(
            "Xenova/blenderbot_small-90M",
            "90M",
            "BlenderBot",
            "~180MB",
            "Conversational AI",
            "Small conversational model.",
            PipelineKind::Text2TextGeneration,
        ),
        ModelInfo::builtin(
            "Xenova/distilbert-base-uncased-finetuned-sst-2-english",
            "66M",
            "DistilBERT",
            "120MB",
            "Sentiment Analysis",
            "Fine-tuned DistilBERT for sentiment.",
            PipelineKind::SentimentAnalysis,
        ),
        ModelInfo::builtin(
            "Xenova/all-MiniLM-L6-v2",
            "22M",
            "MiniLM",
            "45MB",
            "Text Embeddings",
            "Lightweight sentence embeddings.",
            PipelineKind::FeatureExtraction,
        ),
        ModelInfo::builtin(
            "Xenova/t5-small",
            "60M",
            "T5",
            "120MB",
            "Text-to-text (T5)",
            "T5 small for text-to-text tasks.",
            PipelineKind::Text2TextGeneration,
        ),
        ModelInfo::builtin(
            "Xenova/gpt2",
            "124M",
            "GPT-2",
            "250MB",
            "Text Generation",
            "GPT-2 small for creative generation.",
            PipelineKind::TextGeneration,
        ),
    ];
}

/// Ordered list of models the front end offers.
#[derive(Clone, Debug, PartialEq)]
pub struct Catalog {
    models: Vec<ModelInfo>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            models: DEFAULT_MODELS.clone(),
        }
    }
}

impl Catalog {
    pub fn new(models: Vec<ModelInfo>) -> Self {
        Self { models }
    }

    /// Built-in table unless the config supplies its own.
    pub fn from_config(models: Option<&[ModelInfo]>) -> Self {
        match models {
            Some(models) => Self::new(models.to_vec()),
            None => Self::default(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|m| m.key == key)
    }

    pub fn pipeline_for(&self, key: &str) -> Option<PipelineKind> {
        self.get(key).map(|m| m.pipeline.clone())
    }

    pub fn models(&self) -> &[ModelInfo] {
        &self.models
    }
}
