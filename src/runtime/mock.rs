//! Deterministic built-in runtime.
//!
//! Simulates weight download progress, scores sentiment from a small lexicon,
//! hashes text into unit-length embeddings, and streams canned replies word by
//! word. Used by the CLI when no other runtime is wired in, and by the tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::{
    InferenceRuntime, Pipeline, PipelineCall, PipelineOutput, ProgressCallback, RuntimeError,
    RuntimeLoader,
};
use crate::config::RuntimeConfig;
use crate::pipeline::PipelineKind;

const EMBEDDING_DIM: usize = 384;

const POSITIVE_WORDS: &[&str] = &[
    "love", "great", "good", "excellent", "amazing", "happy", "wonderful", "like", "best",
    "fantastic", "nice", "enjoy",
];
const NEGATIVE_WORDS: &[&str] = &[
    "hate", "bad", "terrible", "awful", "worst", "sad", "horrible", "dislike", "poor", "boring",
    "angry", "broken",
];

/// Loader for the built-in runtime. Counts how often it was asked to initialize.
pub struct MockLoader {
    config: RuntimeConfig,
    fail_init: bool,
    failing_models: HashSet<String>,
    init_calls: AtomicUsize,
}

impl MockLoader {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            fail_init: false,
            failing_models: HashSet::new(),
            init_calls: AtomicUsize::new(0),
        }
    }

    /// Make every `init` call fail.
    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// Make loading `model_key` fail.
    pub fn with_failing_model(mut self, model_key: &str) -> Self {
        self.failing_models.insert(model_key.to_string());
        self
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuntimeLoader for MockLoader {
    async fn init(&self) -> Result<Arc<dyn InferenceRuntime>, RuntimeError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_init {
            return Err(RuntimeError::Init("mock runtime unavailable".to_string()));
        }
        Ok(Arc::new(MockRuntime {
            config: self.config.clone(),
            failing_models: self.failing_models.clone(),
        }))
    }
}

/// The initialized built-in runtime.
pub struct MockRuntime {
    config: RuntimeConfig,
    failing_models: HashSet<String>,
}

#[async_trait]
impl InferenceRuntime for MockRuntime {
    async fn load_pipeline(
        &self,
        kind: &PipelineKind,
        model_key: &str,
        progress: ProgressCallback,
    ) -> Result<Arc<dyn Pipeline>, RuntimeError> {
        let steps = self.config.load_steps.max(1);
        for step in 1..=steps {
            tokio::time::sleep(Duration::from_millis(self.config.load_step_ms)).await;
            if step == steps && self.failing_models.contains(model_key) {
                return Err(RuntimeError::Load(format!(
                    "Could not locate file for model {model_key}"
                )));
            }
            progress(f64::from(step) / f64::from(steps));
        }

        Ok(Arc::new(MockPipeline {
            kind: kind.clone(),
            streaming: self.config.streaming,
            token_delay: Duration::from_millis(self.config.token_delay_ms),
        }))
    }
}

/// One loaded mock model.
pub struct MockPipeline {
    kind: PipelineKind,
    streaming: bool,
    token_delay: Duration,
}

#[async_trait]
impl Pipeline for MockPipeline {
    fn supports_streaming(&self) -> bool {
        self.streaming && self.kind.is_streaming()
    }

    async fn run(&self, call: PipelineCall) -> Result<PipelineOutput, RuntimeError> {
        if call.input.trim().is_empty() {
            return Err(RuntimeError::Inference("Input text is empty".to_string()));
        }

        match &self.kind {
            PipelineKind::SentimentAnalysis => Ok(PipelineOutput::Value(classify(&call.input))),
            PipelineKind::FeatureExtraction => Ok(PipelineOutput::Value(json!([embed(&call.input)]))),
            PipelineKind::TextGeneration | PipelineKind::Text2TextGeneration => {
                let limit = call.options.max_new_tokens.unwrap_or(u32::MAX) as usize;
                let words: Vec<String> = canned_reply(&call.input)
                    .split_whitespace()
                    .take(limit)
                    .map(str::to_string)
                    .collect();

                if call.stream && self.supports_streaming() {
                    let cancel = call.cancel.unwrap_or_else(CancellationToken::new);
                    Ok(PipelineOutput::Stream(stream_words(words, self.token_delay, cancel)))
                } else {
                    Ok(PipelineOutput::Value(json!([{ "generated_text": words.join(" ") }])))
                }
            }
            PipelineKind::Other(name) => {
                if call.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                    return Err(RuntimeError::Cancelled);
                }
                Ok(PipelineOutput::Value(json!({ "task": name, "input": call.input })))
            }
        }
    }
}

/// Stream cumulative text one word at a time, checking the token between words.
fn stream_words(
    words: Vec<String>,
    delay: Duration,
    cancel: CancellationToken,
) -> super::UpdateStream {
    stream::unfold(
        (words.into_iter(), String::new(), false),
        move |(mut words, mut text, finished)| {
            let cancel = cancel.clone();
            async move {
                if finished {
                    return None;
                }
                tokio::time::sleep(delay).await;
                if cancel.is_cancelled() {
                    return Some((Err(RuntimeError::Cancelled), (words, text, true)));
                }
                let word = words.next()?;
                if !text.is_empty() {
                    text.push(' ');
                }
                text.push_str(&word);
                let update = json!({ "generated_text": text });
                Some((Ok(update), (words, text, false)))
            }
        },
    )
    .boxed()
}

fn classify(input: &str) -> Value {
    let lower = input.to_lowercase();
    let mut score: i32 = 0;
    for word in lower.split(|c: char| !c.is_alphanumeric()) {
        if POSITIVE_WORDS.contains(&word) {
            score += 1;
        } else if NEGATIVE_WORDS.contains(&word) {
            score -= 1;
        }
    }

    let label = if score >= 0 { "POSITIVE" } else { "NEGATIVE" };
    let confidence = 0.5 + 0.5 * (1.0 - (-f64::from(score.abs()) - 0.1).exp());
    json!([{ "label": label, "score": confidence }])
}

fn embed(input: &str) -> Vec<f64> {
    let mut vector = vec![0.0f64; EMBEDDING_DIM];
    for word in input.to_lowercase().split_whitespace() {
        let hash = word
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3));
        let slot = (hash % EMBEDDING_DIM as u64) as usize;
        let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
        vector[slot] += sign;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

fn canned_reply(input: &str) -> &'static str {
    let lower = input.to_lowercase();
    let has = |word: &str| lower.split(|c: char| !c.is_alphanumeric()).any(|w| w == word);

    if has("hello") || has("hi") {
        "Hello! I'm a small local model. How can I help you today?"
    } else if has("help") {
        "I can continue text, answer short questions, and keep you company while the real weights download."
    } else if has("story") {
        "Once upon a time a tiny model lived inside a worker thread and streamed one word at a time."
    } else {
        "That is an interesting thought. Tell me more about what you have in mind."
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::GenerateOptions;
    use std::sync::Mutex;

    fn fast_config() -> RuntimeConfig {
        RuntimeConfig {
            load_steps: 3,
            load_step_ms: 1,
            token_delay_ms: 1,
            streaming: true,
        }
    }

    fn call(input: &str, stream: bool) -> PipelineCall {
        PipelineCall {
            input: input.to_string(),
            options: GenerateOptions::default(),
            stream,
            cancel: Some(CancellationToken::new()),
        }
    }

    async fn load(kind: PipelineKind) -> Arc<dyn Pipeline> {
        let runtime = MockLoader::new(fast_config()).init().await.unwrap();
        runtime
            .load_pipeline(&kind, "Xenova/test", Arc::new(|_: f64| {}))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_load_reports_progress_steps() {
        let runtime = MockLoader::new(fast_config()).init().await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        runtime
            .load_pipeline(
                &PipelineKind::TextGeneration,
                "Xenova/gpt2",
                Arc::new(move |p: f64| sink.lock().unwrap().push(p)),
            )
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!((seen[2] - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_failing_model() {
        let runtime = MockLoader::new(fast_config())
            .with_failing_model("Xenova/missing")
            .init()
            .await
            .unwrap();
        let err = runtime
            .load_pipeline(&PipelineKind::TextGeneration, "Xenova/missing", Arc::new(|_: f64| {}))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RuntimeError::Load(_)));
    }

    #[tokio::test]
    async fn test_sentiment_labels() {
        let pipeline = load(PipelineKind::SentimentAnalysis).await;
        let PipelineOutput::Value(v) = pipeline.run(call("I love this", false)).await.unwrap()
        else {
            panic!("expected a value");
        };
        assert_eq!(v[0]["label"], "POSITIVE");
        assert!(v[0]["score"].as_f64().unwrap() > 0.5);

        let PipelineOutput::Value(v) = pipeline.run(call("This is awful", false)).await.unwrap()
        else {
            panic!("expected a value");
        };
        assert_eq!(v[0]["label"], "NEGATIVE");
    }

    #[tokio::test]
    async fn test_embedding_is_unit_length() {
        let pipeline = load(PipelineKind::FeatureExtraction).await;
        let PipelineOutput::Value(v) = pipeline.run(call("small sentence", false)).await.unwrap()
        else {
            panic!("expected a value");
        };
        let row = v[0].as_array().unwrap();
        assert_eq!(row.len(), EMBEDDING_DIM);
        let norm: f64 = row.iter().map(|x| x.as_f64().unwrap().powi(2)).sum();
        assert!((norm - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stream_is_cumulative() {
        let pipeline = load(PipelineKind::TextGeneration).await;
        let mut c = call("hello", true);
        c.options.max_new_tokens = Some(3);
        let PipelineOutput::Stream(updates) = pipeline.run(c).await.unwrap() else {
            panic!("expected a stream");
        };
        let texts: Vec<String> = updates
            .map(|u| crate::runtime::generated_text(&u.unwrap()))
            .collect()
            .await;
        assert_eq!(texts, vec!["Hello!", "Hello! I'm", "Hello! I'm a"]);
    }

    #[tokio::test]
    async fn test_stream_stops_on_cancel() {
        let pipeline = load(PipelineKind::TextGeneration).await;
        let c = call("tell me a story", true);
        let token = c.cancel.clone().unwrap();
        let PipelineOutput::Stream(mut updates) = pipeline.run(c).await.unwrap() else {
            panic!("expected a stream");
        };
        assert!(updates.next().await.unwrap().is_ok());
        token.cancel();
        assert_eq!(updates.next().await.unwrap(), Err(RuntimeError::Cancelled));
        assert!(updates.next().await.is_none());
    }

    #[tokio::test]
    async fn test_non_streaming_capability_returns_value() {
        let mut config = fast_config();
        config.streaming = false;
        let runtime = MockLoader::new(config).init().await.unwrap();
        let pipeline = runtime
            .load_pipeline(&PipelineKind::TextGeneration, "Xenova/gpt2", Arc::new(|_: f64| {}))
            .await
            .unwrap();
        assert!(!pipeline.supports_streaming());
        let out = pipeline.run(call("hello", true)).await.unwrap();
        assert!(matches!(out, PipelineOutput::Value(_)));
    }
}
