//! Chat front-end state.
//!
//! Turns user actions into worker requests (refusing the ones the UI would
//! have disabled) and folds worker events into display state. Rendering is
//! left to the caller through [`ViewUpdate`]s.

use serde_json::Value;
use thiserror::Error;

use crate::catalog::{Catalog, ModelInfo};
use crate::config::GenerationDefaults;
use crate::worker::ipc_types::{WorkerEvent, WorkerRequest};

const RESULT_PREVIEW_CHARS: usize = 1000;
const CANCELLED_SUFFIX: &str = "\n\n[Cancelled]";

/// User actions the controller refuses; the message doubles as the status line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    #[error("Please enter text first.")]
    EmptyInput,
    #[error("Choose a model first.")]
    NoModelSelected,
    #[error("Model is still loading.")]
    ModelNotReady,
    #[error("Generation already in progress")]
    Busy,
    #[error("Unknown model: {0}")]
    UnknownModel(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// A change the renderer should show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewUpdate {
    Status(String),
    /// Loading indicator, 0..=100.
    Progress(u8),
    /// New text at the end of the current assistant message.
    AppendOutput(String),
    /// The current assistant message now reads exactly this.
    ReplaceOutput(String),
    /// Input and generate controls enabled again.
    InputEnabled,
}

pub struct ChatController {
    catalog: Catalog,
    defaults: GenerationDefaults,
    selected: Option<String>,
    loaded_model: Option<String>,
    generating: bool,
    can_generate: bool,
    progress: u8,
    status: String,
    transcript: Vec<ChatMessage>,
    /// Index of the assistant message receiving output.
    assistant: Option<usize>,
}

impl ChatController {
    pub fn new(catalog: Catalog, defaults: GenerationDefaults) -> Self {
        Self {
            catalog,
            defaults,
            selected: None,
            loaded_model: None,
            generating: false,
            can_generate: false,
            progress: 0,
            status: "Select a model to load".to_string(),
            transcript: Vec::new(),
            assistant: None,
        }
    }

    pub fn models(&self) -> &[ModelInfo] {
        self.catalog.models()
    }

    pub fn selected_model(&self) -> Option<&ModelInfo> {
        self.selected.as_deref().and_then(|key| self.catalog.get(key))
    }

    pub fn loaded_model(&self) -> Option<&str> {
        self.loaded_model.as_deref()
    }

    pub fn is_generating(&self) -> bool {
        self.generating
    }

    pub fn can_generate(&self) -> bool {
        self.can_generate && !self.generating
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    /// Pick a model. `None` (or an empty key) clears the choice.
    pub fn select_model(
        &mut self,
        model_key: Option<&str>,
    ) -> Result<Option<WorkerRequest>, ControllerError> {
        // The worker refuses loads mid-generation
        if self.generating {
            return Err(ControllerError::Busy);
        }
        let Some(key) = model_key.map(str::trim).filter(|k| !k.is_empty()) else {
            self.selected = None;
            self.status = "Select a model to load".to_string();
            return Ok(None);
        };

        let info = self
            .catalog
            .get(key)
            .ok_or_else(|| ControllerError::UnknownModel(key.to_string()))?;
        let request = WorkerRequest::load(info.key.clone(), Some(info.pipeline.clone()));

        self.selected = Some(key.to_string());
        self.can_generate = false;
        self.progress = 0;
        self.status = "Preparing to load selected model...".to_string();
        Ok(Some(request))
    }

    /// Submit user input for generation.
    pub fn submit(&mut self, input: &str) -> Result<WorkerRequest, ControllerError> {
        if self.generating {
            return Err(ControllerError::Busy);
        }
        let input = input.trim();
        let outcome = if input.is_empty() {
            Err(ControllerError::EmptyInput)
        } else {
            match self.selected_model() {
                None => Err(ControllerError::NoModelSelected),
                Some(_) if !self.can_generate => Err(ControllerError::ModelNotReady),
                Some(info) => Ok(info.pipeline.clone()),
            }
        };
        let pipeline = match outcome {
            Ok(pipeline) => pipeline,
            Err(e) => {
                self.status = e.to_string();
                return Err(e);
            }
        };

        self.transcript.push(ChatMessage {
            role: Role::User,
            content: input.to_string(),
        });
        self.start_assistant_message();
        self.generating = true;
        self.status = "Generating response...".to_string();

        Ok(WorkerRequest::generate(
            input,
            Some(pipeline),
            self.defaults.to_options(),
        ))
    }

    /// Request cancellation; only meaningful while generating.
    pub fn cancel(&mut self) -> Option<WorkerRequest> {
        self.generating.then_some(WorkerRequest::Abort)
    }

    pub fn clear(&mut self) {
        self.transcript.clear();
        self.assistant = None;
        self.status = "Cleared".to_string();
    }

    /// Fold one worker event into the state.
    pub fn apply(&mut self, event: WorkerEvent) -> Vec<ViewUpdate> {
        match event {
            WorkerEvent::Progress { progress } => {
                self.progress = to_percent(progress);
                self.status = format!("Loading model: {}%", self.progress);
                vec![ViewUpdate::Progress(self.progress)]
            }
            WorkerEvent::Ready { model_key } => {
                let current = self.selected.as_deref() == Some(model_key.as_str());
                self.loaded_model = Some(model_key);
                if !current {
                    // A superseded load finished; the selected one is still pending
                    return Vec::new();
                }
                self.progress = 100;
                self.status = "Model loaded, ready for inference!".to_string();
                self.can_generate = true;
                vec![
                    ViewUpdate::Progress(100),
                    ViewUpdate::Status(self.status.clone()),
                    ViewUpdate::InputEnabled,
                ]
            }
            WorkerEvent::Chunk { text } => self.show_cumulative(&text).into_iter().collect(),
            WorkerEvent::Done => self.finish("Generation complete".to_string(), None),
            WorkerEvent::Result { result } => {
                let text = format_result(&result);
                let content = self.assistant_content();
                content.clear();
                content.push_str(&text);
                self.finish(
                    "Generation complete".to_string(),
                    Some(ViewUpdate::ReplaceOutput(text)),
                )
            }
            WorkerEvent::Aborted => {
                let update = self.generating.then(|| {
                    self.assistant_content().push_str(CANCELLED_SUFFIX);
                    ViewUpdate::AppendOutput(CANCELLED_SUFFIX.to_string())
                });
                self.finish("Generation aborted".to_string(), update)
            }
            WorkerEvent::Error { message } => {
                if !self.generating {
                    // Not generating, so the failure came from a load
                    self.loaded_model = None;
                    self.can_generate = false;
                }
                self.finish(format!("Error: {message}"), None)
            }
        }
    }

    fn finish(&mut self, status: String, update: Option<ViewUpdate>) -> Vec<ViewUpdate> {
        self.generating = false;
        self.status = status;
        let mut updates: Vec<ViewUpdate> = update.into_iter().collect();
        updates.push(ViewUpdate::Status(self.status.clone()));
        updates.push(ViewUpdate::InputEnabled);
        updates
    }

    /// Chunks carry the whole text so far; only the unseen suffix is appended.
    fn show_cumulative(&mut self, text: &str) -> Option<ViewUpdate> {
        let content = self.assistant_content();
        if let Some(suffix) = text.strip_prefix(content.as_str()) {
            if suffix.is_empty() {
                return None;
            }
            let suffix = suffix.to_string();
            content.push_str(&suffix);
            Some(ViewUpdate::AppendOutput(suffix))
        } else {
            content.clear();
            content.push_str(text);
            Some(ViewUpdate::ReplaceOutput(text.to_string()))
        }
    }

    fn start_assistant_message(&mut self) {
        self.transcript.push(ChatMessage {
            role: Role::Assistant,
            content: String::new(),
        });
        self.assistant = Some(self.transcript.len() - 1);
    }

    fn assistant_content(&mut self) -> &mut String {
        let index = match self.assistant {
            Some(index) if index < self.transcript.len() => index,
            _ => {
                self.start_assistant_message();
                self.transcript.len() - 1
            }
        };
        &mut self.transcript[index].content
    }
}

fn to_percent(progress: f64) -> u8 {
    if !progress.is_finite() {
        return 0;
    }
    (progress.clamp(0.0, 1.0) * 100.0).round() as u8
}

/// Human-readable text for a single-shot result.
pub fn format_result(result: &Value) -> String {
    if let Some(items) = result.as_array() {
        if let Some(first) = items.first() {
            if let (Some(label), Some(score)) = (
                first.get("label").and_then(Value::as_str),
                first.get("score").and_then(Value::as_f64),
            ) {
                return format!("Sentiment: {label} ({:.1}%)", score * 100.0);
            }
            if let Some(row) = first.as_array() {
                return format!("Embedding vector length: {}", row.len());
            }
            if let Some(text) = first.get("generated_text").and_then(Value::as_str) {
                return text.to_string();
            }
        }
    } else if let Some(text) = result.get("generated_text").and_then(Value::as_str) {
        return text.to_string();
    }

    let json = result.to_string();
    json.chars().take(RESULT_PREVIEW_CHARS).collect()
}
