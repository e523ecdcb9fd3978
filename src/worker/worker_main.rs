//! The inference worker.
//!
//! Owns at most one loaded model and at most one in-flight generation. Runs
//! either as a tokio task inside the front end, or as a child process that
//! reads JSON requests from stdin and writes JSON events to stdout. All log
//! output goes to stderr.
//!
//! Task design:
//! - worker loop: handles requests in order; model loads run inline
//! - generation task (temporary): calls the pipeline and sends chunk events
//! - the worker loop sends the terminal event once the generation task ends,
//!   so the worker is idle again before the controller hears about it

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::ipc_types::{WorkerEvent, WorkerRequest};
use super::progress::ProgressReporter;
use crate::catalog::Catalog;
use crate::pipeline::{Dispatch, GenerateOptions, PipelineKind};
use crate::runtime::{
    generated_text, InferenceRuntime, Pipeline, PipelineCall, PipelineOutput, RuntimeError,
    RuntimeLoader, UpdateStream,
};

pub const NO_MODEL_KEY: &str = "No model key provided to worker.";
pub const NO_MODEL_LOADED: &str = "No model loaded";
pub const GENERATION_BUSY: &str = "Generation already in progress";
pub const LOAD_WHILE_GENERATING: &str = "Cannot load model while generation is in progress";

/// The loaded model.
pub struct ModelSession {
    pub model_key: String,
    pub kind: PipelineKind,
    pub pipeline: Arc<dyn Pipeline>,
}

/// Observable lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Empty,
    Ready,
    Generating,
}

struct ActiveGeneration {
    id: Uuid,
    cancel: CancellationToken,
    handle: JoinHandle<WorkerEvent>,
}

/// Worker-owned state plus the handlers for each request.
pub struct InferenceWorker {
    loader: Arc<dyn RuntimeLoader>,
    runtime: Option<Arc<dyn InferenceRuntime>>,
    catalog: Catalog,
    session: Option<ModelSession>,
    active: Option<ActiveGeneration>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

/// Channels of a worker running as a tokio task.
pub struct WorkerChannels {
    pub requests: mpsc::UnboundedSender<WorkerRequest>,
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
    pub task: JoinHandle<()>,
}

impl InferenceWorker {
    pub fn new(
        loader: Arc<dyn RuntimeLoader>,
        catalog: Catalog,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            loader,
            runtime: None,
            catalog,
            session: None,
            active: None,
            events,
        }
    }

    /// Start a worker on the current tokio runtime.
    pub fn spawn(loader: Arc<dyn RuntimeLoader>, catalog: Catalog) -> WorkerChannels {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let worker = InferenceWorker::new(loader, catalog, event_tx);
        let task = tokio::spawn(worker.run(request_rx));
        WorkerChannels {
            requests: request_tx,
            events: event_rx,
            task,
        }
    }

    /// Snapshot taken between requests; a load runs inside one request.
    pub fn state(&self) -> WorkerState {
        if self.active.is_some() {
            WorkerState::Generating
        } else if self.session.is_some() {
            WorkerState::Ready
        } else {
            WorkerState::Empty
        }
    }

    pub fn loaded_model(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.model_key.as_str())
    }

    /// Process requests until the request channel closes.
    pub async fn run(mut self, mut requests: mpsc::UnboundedReceiver<WorkerRequest>) {
        info!("[WORKER] Ready, waiting for commands...");

        loop {
            let step = tokio::select! {
                biased;
                event = wait_for_generation(&mut self.active) => Step::Finished(event),
                request = requests.recv() => Step::Request(request),
            };

            match step {
                Step::Finished(event) => self.complete_generation(event),
                Step::Request(Some(request)) => self.handle(request).await,
                Step::Request(None) => break,
            }
        }

        info!("[WORKER] Request channel closed, shutting down");
        self.abort();
        self.wait_idle().await;
        info!("[WORKER] Exiting");
    }

    pub async fn handle(&mut self, request: WorkerRequest) {
        match request {
            WorkerRequest::LoadModel {
                model_key,
                pipeline,
            } => self.load(model_key, pipeline).await,
            WorkerRequest::Generate {
                input,
                pipeline_type,
                options,
            } => self.generate(input, pipeline_type, options),
            WorkerRequest::Abort => self.abort(),
            WorkerRequest::Unknown => debug!("[WORKER] Ignoring unknown request type"),
        }
    }

    /// Load `model_key`, or report ready at once if it is already loaded.
    pub async fn load(&mut self, model_key: Option<String>, pipeline: Option<PipelineKind>) {
        let Some(model_key) = model_key.filter(|k| !k.trim().is_empty()) else {
            self.emit(WorkerEvent::error(NO_MODEL_KEY));
            return;
        };

        if self.active.is_some() {
            self.emit(WorkerEvent::error(LOAD_WHILE_GENERATING));
            return;
        }

        if self.loaded_model() == Some(model_key.as_str()) {
            debug!("[WORKER] {model_key} already loaded");
            self.emit(WorkerEvent::Ready { model_key });
            return;
        }

        let Some(kind) = pipeline.or_else(|| self.catalog.pipeline_for(&model_key)) else {
            self.emit(WorkerEvent::error(format!(
                "No pipeline kind provided for model {model_key}"
            )));
            return;
        };

        info!("[WORKER] Loading model: {model_key} ({kind})");
        let result = self.load_pipeline(&model_key, &kind).await;

        match result {
            Ok(pipeline) => {
                info!("[WORKER] Model loaded successfully: {model_key}");
                self.session = Some(ModelSession {
                    model_key: model_key.clone(),
                    kind,
                    pipeline,
                });
                self.emit(WorkerEvent::Ready { model_key });
            }
            Err(e) => {
                warn!("[WORKER] Model load failed: {e}");
                self.session = None;
                self.emit(WorkerEvent::error(e.to_string()));
            }
        }
    }

    async fn load_pipeline(
        &mut self,
        model_key: &str,
        kind: &PipelineKind,
    ) -> Result<Arc<dyn Pipeline>, RuntimeError> {
        let runtime = self.ensure_runtime().await?;
        let reporter = ProgressReporter::new(self.events.clone());
        reporter.report(0.01);
        runtime
            .load_pipeline(kind, model_key, reporter.callback())
            .await
    }

    /// Initialize the runtime on first use; keep it for the worker's lifetime.
    async fn ensure_runtime(&mut self) -> Result<Arc<dyn InferenceRuntime>, RuntimeError> {
        if let Some(runtime) = &self.runtime {
            return Ok(runtime.clone());
        }
        info!("[WORKER] Initializing inference runtime");
        let runtime = self.loader.init().await?;
        self.runtime = Some(runtime.clone());
        Ok(runtime)
    }

    /// Start one generation against the loaded model.
    pub fn generate(
        &mut self,
        input: String,
        pipeline_type: Option<PipelineKind>,
        options: GenerateOptions,
    ) {
        let Some(session) = &self.session else {
            self.emit(WorkerEvent::error(NO_MODEL_LOADED));
            return;
        };

        if self.active.is_some() {
            warn!("[WORKER] Rejecting generate: {GENERATION_BUSY}");
            self.emit(WorkerEvent::error(GENERATION_BUSY));
            return;
        }

        let job = GenerationJob {
            kind: pipeline_type.unwrap_or_else(|| session.kind.clone()),
            pipeline: session.pipeline.clone(),
            input,
            options,
            cancel: CancellationToken::new(),
            events: self.events.clone(),
        };
        let id = Uuid::new_v4();
        info!(
            "[WORKER] Starting generation {id}: model={}, kind={}, input_len={}",
            session.model_key,
            job.kind,
            job.input.len()
        );

        let cancel = job.cancel.clone();
        let handle = tokio::spawn(job.run());
        self.active = Some(ActiveGeneration { id, cancel, handle });
    }

    /// Signal the in-flight generation, if any.
    pub fn abort(&self) {
        match &self.active {
            Some(active) => {
                info!("[WORKER] Cancelling generation {}", active.id);
                active.cancel.cancel();
            }
            None => debug!("[WORKER] Abort with no generation in flight"),
        }
    }

    /// Wait for the in-flight generation (if any) and emit its terminal event.
    pub async fn wait_idle(&mut self) {
        if self.active.is_some() {
            let event = wait_for_generation(&mut self.active).await;
            self.complete_generation(event);
        }
    }

    fn complete_generation(&mut self, event: WorkerEvent) {
        if let Some(active) = self.active.take() {
            match &event {
                WorkerEvent::Error { message } => {
                    warn!("[WORKER] Generation {} failed: {message}", active.id);
                }
                WorkerEvent::Aborted => info!("[WORKER] Generation {} aborted", active.id),
                _ => info!("[WORKER] Generation {} complete", active.id),
            }
        }
        self.emit(event);
    }

    fn emit(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            debug!("[WORKER] Event receiver dropped");
        }
    }
}

enum Step {
    Finished(WorkerEvent),
    Request(Option<WorkerRequest>),
}

/// Resolves when the active generation finishes; never resolves when idle.
async fn wait_for_generation(active: &mut Option<ActiveGeneration>) -> WorkerEvent {
    match active {
        Some(active) => match (&mut active.handle).await {
            Ok(event) => event,
            Err(e) => {
                error!("[WORKER] Generation task failed: {e}");
                WorkerEvent::error(format!("Generation task failed: {e}"))
            }
        },
        None => std::future::pending().await,
    }
}

/// Everything one generation needs, moved onto its own task.
struct GenerationJob {
    kind: PipelineKind,
    pipeline: Arc<dyn Pipeline>,
    input: String,
    options: GenerateOptions,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl GenerationJob {
    /// Runs to completion and returns the terminal event.
    async fn run(self) -> WorkerEvent {
        let outcome = match self.kind.dispatch() {
            Dispatch::SingleShot => self.single_shot(false).await,
            Dispatch::Streaming if self.pipeline.supports_streaming() => self.streaming().await,
            Dispatch::Streaming | Dispatch::Fallback => self.single_shot(true).await,
        };

        match outcome {
            Ok(event) => event,
            Err(RuntimeError::Cancelled) => WorkerEvent::Aborted,
            Err(e) => WorkerEvent::error(e.to_string()),
        }
    }

    async fn single_shot(&self, attach_cancel: bool) -> Result<WorkerEvent, RuntimeError> {
        match self.call(false, attach_cancel).await? {
            PipelineOutput::Value(result) => Ok(WorkerEvent::Result { result }),
            PipelineOutput::Stream(updates) => self.forward_updates(updates).await,
        }
    }

    async fn streaming(&self) -> Result<WorkerEvent, RuntimeError> {
        match self.call(true, true).await? {
            PipelineOutput::Value(result) => Ok(WorkerEvent::Result { result }),
            PipelineOutput::Stream(updates) => self.forward_updates(updates).await,
        }
    }

    async fn call(&self, stream: bool, attach_cancel: bool) -> Result<PipelineOutput, RuntimeError> {
        let call = PipelineCall {
            input: self.input.clone(),
            options: self.options.clone(),
            stream,
            cancel: attach_cancel.then(|| self.cancel.clone()),
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RuntimeError::Cancelled),
            output = self.pipeline.run(call) => output,
        }
    }

    /// Emit one chunk per update; the token is checked before every item.
    async fn forward_updates(&self, mut updates: UpdateStream) -> Result<WorkerEvent, RuntimeError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(RuntimeError::Cancelled),
                next = updates.next() => next,
            };

            match next {
                Some(Ok(update)) => {
                    let text = generated_text(&update);
                    if self.events.send(WorkerEvent::Chunk { text }).is_err() {
                        return Err(RuntimeError::Cancelled);
                    }
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(WorkerEvent::Done),
            }
        }
    }
}

/// Parse one JSON line from the controller.
pub fn parse_request(line: &str) -> Result<WorkerRequest, serde_json::Error> {
    serde_json::from_str(line)
}

/// Run the worker process: JSON Lines on stdin/stdout until stdin closes.
pub fn run_stdio_worker(loader: Arc<dyn RuntimeLoader>, catalog: Catalog) -> io::Result<()> {
    info!("[WORKER] Starting model worker process (pid={})", std::process::id());

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let stdout = io::stdout();
    let mut stdout = stdout.lock();
    rt.block_on(serve_lines(
        loader,
        catalog,
        io::BufReader::new(io::stdin()),
        &mut stdout,
    ));

    Ok(())
}

/// Serve JSON Lines requests from `input`, writing events to `output`.
///
/// Returns once `input` hits EOF and the worker has wound down; a generation
/// still running at that point is cancelled.
pub async fn serve_lines<R, W>(
    loader: Arc<dyn RuntimeLoader>,
    catalog: Catalog,
    input: R,
    output: &mut W,
) where
    R: BufRead + Send + 'static,
    W: Write,
{
    let (request_tx, request_rx) = mpsc::unbounded_channel::<WorkerRequest>();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<WorkerEvent>();

    // Reader thread: blocking reads, parsed requests go to the worker loop
    let parse_errors = event_tx.clone();
    std::thread::spawn(move || {
        for line in input.lines() {
            match line {
                Ok(l) if !l.trim().is_empty() => match parse_request(&l) {
                    Ok(request) => {
                        if request_tx.send(request).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("[WORKER] Failed to parse command: {e}");
                        let _ = parse_errors.send(WorkerEvent::error(format!("Parse error: {e}")));
                    }
                },
                Ok(_) => {}
                Err(_) => break,
            }
        }
        info!("[WORKER] Stdin reader thread exiting");
    });

    let worker = InferenceWorker::new(loader, catalog, event_tx);
    let worker_task = tokio::spawn(worker.run(request_rx));

    while let Some(event) = event_rx.recv().await {
        write_event(output, &event);
    }

    if let Err(e) = worker_task.await {
        error!("[WORKER] Worker task failed: {e}");
    }
}

/// Write a JSON event line, flushing immediately.
pub fn write_event<W: Write>(out: &mut W, event: &WorkerEvent) {
    match serde_json::to_string(event) {
        Ok(json) => {
            let _ = writeln!(out, "{json}");
            let _ = out.flush();
        }
        Err(e) => error!("[WORKER] Failed to serialize event: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::mock::MockLoader;
    use serde_json::json;
    use std::time::Duration;

    fn fast_config() -> RuntimeConfig {
        RuntimeConfig {
            load_steps: 4,
            load_step_ms: 1,
            token_delay_ms: 5,
            streaming: true,
        }
    }

    fn new_worker(loader: MockLoader) -> (InferenceWorker, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (InferenceWorker::new(Arc::new(loader), Catalog::default(), tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> WorkerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn collect_until_terminal(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        loop {
            let event = next_event(rx).await;
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                return events;
            }
        }
    }

    fn load_request(key: &str, kind: PipelineKind) -> WorkerRequest {
        WorkerRequest::load(key, Some(kind))
    }

    #[tokio::test]
    async fn test_load_reports_progress_then_ready() {
        let (mut worker, mut rx) = new_worker(MockLoader::new(fast_config()));
        assert_eq!(worker.state(), WorkerState::Empty);

        worker.handle(load_request("model-A", PipelineKind::TextGeneration)).await;
        let events = drain(&mut rx);

        assert_eq!(events.first(), Some(&WorkerEvent::Progress { progress: 0.01 }));
        assert_eq!(
            events.last(),
            Some(&WorkerEvent::Ready { model_key: "model-A".into() })
        );
        let progress: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Progress { progress } => Some(*progress),
                _ => None,
            })
            .collect();
        assert_eq!(progress.len(), 5);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert!(progress.iter().all(|p| (0.0..=1.0).contains(p)));
        assert_eq!(worker.state(), WorkerState::Ready);
        assert_eq!(worker.loaded_model(), Some("model-A"));
    }

    #[tokio::test]
    async fn test_same_key_is_idempotent() {
        let loader = Arc::new(MockLoader::new(fast_config()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut worker = InferenceWorker::new(loader.clone(), Catalog::default(), tx);

        worker.handle(load_request("model-A", PipelineKind::TextGeneration)).await;
        drain(&mut rx);

        worker.handle(load_request("model-A", PipelineKind::TextGeneration)).await;
        assert_eq!(
            drain(&mut rx),
            vec![WorkerEvent::Ready { model_key: "model-A".into() }]
        );
        assert_eq!(loader.init_calls(), 1);
    }

    #[tokio::test]
    async fn test_runtime_initialized_once_across_models() {
        let loader = Arc::new(MockLoader::new(fast_config()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut worker = InferenceWorker::new(loader.clone(), Catalog::default(), tx);

        worker.handle(load_request("model-A", PipelineKind::TextGeneration)).await;
        worker.handle(load_request("model-B", PipelineKind::SentimentAnalysis)).await;
        let events = drain(&mut rx);

        assert_eq!(loader.init_calls(), 1);
        assert_eq!(worker.loaded_model(), Some("model-B"));
        assert_eq!(
            events.last(),
            Some(&WorkerEvent::Ready { model_key: "model-B".into() })
        );
    }

    #[tokio::test]
    async fn test_missing_model_key() {
        let (mut worker, mut rx) = new_worker(MockLoader::new(fast_config()));
        worker
            .handle(WorkerRequest::LoadModel {
                model_key: None,
                pipeline: None,
            })
            .await;
        worker.handle(WorkerRequest::load("  ", None)).await;
        assert_eq!(
            drain(&mut rx),
            vec![WorkerEvent::error(NO_MODEL_KEY), WorkerEvent::error(NO_MODEL_KEY)]
        );
        assert_eq!(worker.state(), WorkerState::Empty);
    }

    #[tokio::test]
    async fn test_pipeline_resolved_from_catalog() {
        let (mut worker, mut rx) = new_worker(MockLoader::new(fast_config()));
        worker.handle(WorkerRequest::load("Xenova/gpt2", None)).await;
        assert_eq!(
            drain(&mut rx).last(),
            Some(&WorkerEvent::Ready { model_key: "Xenova/gpt2".into() })
        );

        worker.handle(WorkerRequest::load("someone/unknown", None)).await;
        assert_eq!(
            drain(&mut rx),
            vec![WorkerEvent::error("No pipeline kind provided for model someone/unknown")]
        );
        assert_eq!(worker.loaded_model(), Some("Xenova/gpt2"));
    }

    #[tokio::test]
    async fn test_failed_load_clears_session() {
        let loader = MockLoader::new(fast_config()).with_failing_model("model-broken");
        let (mut worker, mut rx) = new_worker(loader);

        worker.handle(load_request("model-A", PipelineKind::TextGeneration)).await;
        drain(&mut rx);
        worker.handle(load_request("model-broken", PipelineKind::TextGeneration)).await;

        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(WorkerEvent::Error { .. })));
        assert_eq!(worker.state(), WorkerState::Empty);
        assert!(worker.loaded_model().is_none());

        // Still usable afterwards
        worker.handle(load_request("model-A", PipelineKind::TextGeneration)).await;
        assert_eq!(worker.state(), WorkerState::Ready);
    }

    #[tokio::test]
    async fn test_init_failure_is_reported_and_retried() {
        let loader = Arc::new(MockLoader::new(fast_config()).failing_init());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut worker = InferenceWorker::new(loader.clone(), Catalog::default(), tx);

        worker.handle(load_request("model-A", PipelineKind::TextGeneration)).await;
        worker.handle(load_request("model-A", PipelineKind::TextGeneration)).await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| matches!(e, WorkerEvent::Error { .. })));
        assert_eq!(loader.init_calls(), 2);
    }

    #[tokio::test]
    async fn test_generate_without_model() {
        let (mut worker, mut rx) = new_worker(MockLoader::new(fast_config()));
        worker
            .handle(WorkerRequest::generate("hello", None, GenerateOptions::default()))
            .await;
        worker.wait_idle().await;
        assert_eq!(drain(&mut rx), vec![WorkerEvent::error(NO_MODEL_LOADED)]);
    }

    #[tokio::test]
    async fn test_streaming_generation_chunks_then_done() {
        let (mut worker, mut rx) = new_worker(MockLoader::new(fast_config()));
        worker.handle(load_request("model-A", PipelineKind::TextGeneration)).await;
        drain(&mut rx);

        let mut options = GenerateOptions::default();
        options.max_new_tokens = Some(3);
        worker.generate("hello".into(), Some(PipelineKind::TextGeneration), options);
        assert_eq!(worker.state(), WorkerState::Generating);
        worker.wait_idle().await;

        assert_eq!(
            drain(&mut rx),
            vec![
                WorkerEvent::Chunk { text: "Hello!".into() },
                WorkerEvent::Chunk { text: "Hello! I'm".into() },
                WorkerEvent::Chunk { text: "Hello! I'm a".into() },
                WorkerEvent::Done,
            ]
        );
        assert_eq!(worker.state(), WorkerState::Ready);
    }

    #[tokio::test]
    async fn test_sentiment_single_result() {
        let (mut worker, mut rx) = new_worker(MockLoader::new(fast_config()));
        worker.handle(load_request("model-B", PipelineKind::SentimentAnalysis)).await;
        drain(&mut rx);

        worker.generate("I love this".into(), None, GenerateOptions::default());
        worker.wait_idle().await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            WorkerEvent::Result { result } => {
                assert_eq!(result[0]["label"], "POSITIVE");
                assert!(result[0]["score"].is_number());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fallback_kind_single_result() {
        let (mut worker, mut rx) = new_worker(MockLoader::new(fast_config()));
        worker.handle(load_request("model-C", PipelineKind::from("translation"))).await;
        drain(&mut rx);

        worker.generate("bonjour".into(), None, GenerateOptions::default());
        worker.wait_idle().await;
        assert_eq!(
            drain(&mut rx),
            vec![WorkerEvent::Result {
                result: json!({"task": "translation", "input": "bonjour"})
            }]
        );
    }

    #[tokio::test]
    async fn test_non_streaming_pipeline_yields_result() {
        let mut config = fast_config();
        config.streaming = false;
        let (mut worker, mut rx) = new_worker(MockLoader::new(config));
        worker.handle(load_request("model-A", PipelineKind::Text2TextGeneration)).await;
        drain(&mut rx);

        worker.generate("hello".into(), None, GenerateOptions::default());
        worker.wait_idle().await;
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], WorkerEvent::Result { result } if result[0]["generated_text"].is_string()));
    }

    #[tokio::test]
    async fn test_generation_error_returns_to_ready() {
        let (mut worker, mut rx) = new_worker(MockLoader::new(fast_config()));
        worker.handle(load_request("model-A", PipelineKind::TextGeneration)).await;
        drain(&mut rx);

        worker.generate("   ".into(), None, GenerateOptions::default());
        worker.wait_idle().await;
        assert_eq!(drain(&mut rx), vec![WorkerEvent::error("Input text is empty")]);
        assert_eq!(worker.state(), WorkerState::Ready);
    }

    #[tokio::test]
    async fn test_abort_without_generation_is_silent() {
        let (mut worker, mut rx) = new_worker(MockLoader::new(fast_config()));
        worker.handle(WorkerRequest::Abort).await;
        worker.handle(load_request("model-A", PipelineKind::TextGeneration)).await;
        drain(&mut rx);
        worker.handle(WorkerRequest::Abort).await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(worker.loaded_model(), Some("model-A"));
    }

    #[tokio::test]
    async fn test_unknown_request_is_ignored() {
        let (mut worker, mut rx) = new_worker(MockLoader::new(fast_config()));
        worker.handle(WorkerRequest::Unknown).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_abort_mid_stream() {
        let mut channels =
            InferenceWorker::spawn(Arc::new(MockLoader::new(fast_config())), Catalog::default());
        channels
            .requests
            .send(load_request("model-A", PipelineKind::TextGeneration))
            .unwrap();
        collect_until_ready(&mut channels.events).await;

        channels
            .requests
            .send(WorkerRequest::generate("tell me a story", None, GenerateOptions::default()))
            .unwrap();
        assert!(matches!(next_event(&mut channels.events).await, WorkerEvent::Chunk { .. }));
        channels.requests.send(WorkerRequest::Abort).unwrap();

        let events = collect_until_terminal(&mut channels.events).await;
        assert_eq!(events.last(), Some(&WorkerEvent::Aborted));
        assert!(events[..events.len() - 1]
            .iter()
            .all(|e| matches!(e, WorkerEvent::Chunk { .. })));

        // The worker is back to Ready and accepts another generation
        channels
            .requests
            .send(WorkerRequest::generate("hi", None, GenerateOptions::default()))
            .unwrap();
        let events = collect_until_terminal(&mut channels.events).await;
        assert_eq!(events.last(), Some(&WorkerEvent::Done));
    }

    #[tokio::test]
    async fn test_overlapping_generate_is_rejected() {
        let mut channels =
            InferenceWorker::spawn(Arc::new(MockLoader::new(fast_config())), Catalog::default());
        channels
            .requests
            .send(load_request("model-A", PipelineKind::TextGeneration))
            .unwrap();
        collect_until_ready(&mut channels.events).await;

        channels
            .requests
            .send(WorkerRequest::generate("tell me a story", None, GenerateOptions::default()))
            .unwrap();
        channels
            .requests
            .send(WorkerRequest::generate("hello", None, GenerateOptions::default()))
            .unwrap();
        channels
            .requests
            .send(load_request("model-B", PipelineKind::SentimentAnalysis))
            .unwrap();

        let mut events = Vec::new();
        loop {
            let event = next_event(&mut channels.events).await;
            let done = event == WorkerEvent::Done;
            events.push(event);
            if done {
                break;
            }
        }

        let errors: Vec<&WorkerEvent> = events
            .iter()
            .filter(|e| matches!(e, WorkerEvent::Error { .. }))
            .collect();
        assert_eq!(
            errors,
            vec![
                &WorkerEvent::error(GENERATION_BUSY),
                &WorkerEvent::error(LOAD_WHILE_GENERATING)
            ]
        );
        assert!(!events.iter().any(|e| matches!(e, WorkerEvent::Aborted)));
    }

    #[tokio::test]
    async fn test_closing_requests_stops_worker() {
        let channels =
            InferenceWorker::spawn(Arc::new(MockLoader::new(fast_config())), Catalog::default());
        let WorkerChannels {
            requests,
            mut events,
            task,
        } = channels;
        requests
            .send(load_request("model-A", PipelineKind::TextGeneration))
            .unwrap();
        requests
            .send(WorkerRequest::generate("tell me a story", None, GenerateOptions::default()))
            .unwrap();
        drop(requests);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        let mut last = None;
        while let Some(event) = events.recv().await {
            last = Some(event);
        }
        assert!(matches!(last, Some(WorkerEvent::Aborted) | Some(WorkerEvent::Done)));
    }

    #[test]
    fn test_write_event_json_line() {
        let mut out = Vec::new();
        write_event(&mut out, &WorkerEvent::Chunk { text: "Hi".into() });
        write_event(&mut out, &WorkerEvent::Done);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "{\"type\":\"chunk\",\"text\":\"Hi\"}\n{\"type\":\"done\"}\n"
        );
    }

    #[test]
    fn test_parse_request_errors() {
        assert!(parse_request("{\"type\":\"abort\"}").is_ok());
        assert!(parse_request("not json").is_err());
        assert!(parse_request("{\"type\":\"generate\"}").is_err());
    }

    async fn serve(input: &'static str) -> Vec<WorkerEvent> {
        let mut out = Vec::new();
        let serving = serve_lines(
            Arc::new(MockLoader::new(fast_config())),
            Catalog::default(),
            std::io::Cursor::new(input),
            &mut out,
        );
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .expect("worker did not stop at end of input");
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_serve_lines_reports_parse_errors_and_keeps_going() {
        let events = serve(concat!(
            "not json\n",
            "\n",
            "{\"type\":\"generate\",\"input\":\"hello\"}\n",
            "{\"type\":\"loadModel\",\"modelKey\":\"Xenova/gpt2\"}\n",
        ))
        .await;

        match &events[0] {
            WorkerEvent::Error { message } => assert!(message.starts_with("Parse error: ")),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(events[1], WorkerEvent::error(NO_MODEL_LOADED));
        assert_eq!(events[2], WorkerEvent::Progress { progress: 0.01 });
        assert_eq!(
            events.last(),
            Some(&WorkerEvent::Ready { model_key: "Xenova/gpt2".into() })
        );
    }

    #[tokio::test]
    async fn test_serve_lines_cancels_generation_at_end_of_input() {
        let events = serve(concat!(
            "{\"type\":\"loadModel\",\"modelKey\":\"Xenova/gpt2\"}\n",
            "{\"type\":\"generate\",\"input\":\"tell me a story\"}\n",
        ))
        .await;

        assert_eq!(events.last(), Some(&WorkerEvent::Aborted));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(!events.contains(&WorkerEvent::Done));
    }

    async fn collect_until_ready(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) {
        loop {
            match next_event(rx).await {
                WorkerEvent::Ready { .. } => return,
                WorkerEvent::Progress { .. } => {}
                other => panic!("unexpected event while loading: {other:?}"),
            }
        }
    }
}
