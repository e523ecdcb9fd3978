//! Front-end side handle for talking to a worker.
//!
//! The worker can live in the same process (a tokio task) or in a child
//! process reached over stdin/stdout pipes. Either way the caller gets a
//! request sender and an ordered event receiver.

use std::io::{BufRead, BufReader, Write};
use std::sync::Arc;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::ipc_types::{WorkerEvent, WorkerRequest};
use super::process_manager::ProcessManager;
use super::worker_main::InferenceWorker;
use crate::catalog::Catalog;
use crate::pipeline::{GenerateOptions, PipelineKind};
use crate::runtime::RuntimeLoader;

/// Sent after the worker's stdout closes.
pub const WORKER_EXITED: &str = "Worker process exited";

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{0}")]
    Spawn(String),
    #[error("Worker is not running")]
    Closed,
    #[error("Worker {0} not available")]
    MissingPipe(&'static str),
}

/// Handle to a running worker.
pub struct WorkerBridge {
    requests: mpsc::UnboundedSender<WorkerRequest>,
    /// Set for out-of-process workers; kills the child on drop.
    process: Option<Arc<ProcessManager>>,
    task: JoinHandle<()>,
}

impl WorkerBridge {
    /// Run the worker as a task on the current tokio runtime.
    pub fn in_process(
        loader: Arc<dyn RuntimeLoader>,
        catalog: Catalog,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let channels = InferenceWorker::spawn(loader, catalog);
        info!("[BRIDGE] In-process worker started");
        (
            Self {
                requests: channels.requests,
                process: None,
                task: channels.task,
            },
            channels.events,
        )
    }

    /// Talk to a worker child process over its pipes.
    pub fn from_process(
        process: Arc<ProcessManager>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WorkerEvent>), BridgeError> {
        let stdin = process.take_stdin().ok_or(BridgeError::MissingPipe("stdin"))?;
        let stdout = process.take_stdout().ok_or(BridgeError::MissingPipe("stdout"))?;

        let (request_tx, request_rx) = mpsc::unbounded_channel::<WorkerRequest>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<WorkerEvent>();

        let task = tokio::spawn(stdin_writer_task(request_rx, stdin));

        // Pipe reads are blocking; keep them off the runtime
        std::thread::spawn(move || {
            read_events(BufReader::new(stdout), &event_tx);
            let _ = event_tx.send(WorkerEvent::error(WORKER_EXITED));
            info!("[BRIDGE] Stdout reader thread exiting");
        });

        Ok((
            Self {
                requests: request_tx,
                process: Some(process),
                task,
            },
            event_rx,
        ))
    }

    pub fn send(&self, request: WorkerRequest) -> Result<(), BridgeError> {
        debug!("[BRIDGE] -> {request:?}");
        self.requests.send(request).map_err(|_| BridgeError::Closed)
    }

    pub fn load_model(
        &self,
        model_key: &str,
        pipeline: Option<PipelineKind>,
    ) -> Result<(), BridgeError> {
        self.send(WorkerRequest::load(model_key, pipeline))
    }

    pub fn generate(
        &self,
        input: &str,
        pipeline_type: Option<PipelineKind>,
        options: GenerateOptions,
    ) -> Result<(), BridgeError> {
        self.send(WorkerRequest::generate(input, pipeline_type, options))
    }

    pub fn abort(&self) -> Result<(), BridgeError> {
        self.send(WorkerRequest::Abort)
    }

    pub fn is_alive(&self) -> bool {
        match &self.process {
            Some(process) => process.is_alive(),
            None => !self.task.is_finished(),
        }
    }

    /// Close the request channel and wait for the worker side to wind down.
    pub async fn shutdown(self) {
        let WorkerBridge {
            requests,
            process,
            task,
        } = self;
        drop(requests);
        if let Err(e) = task.await {
            warn!("[BRIDGE] Worker task ended abnormally: {e}");
        }
        if let Some(process) = process {
            process.kill();
        }
    }
}

/// Task that writes requests to the worker's stdin as JSON lines.
async fn stdin_writer_task<W: Write + Send + 'static>(
    mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
    mut stdin: W,
) {
    while let Some(request) = requests.recv().await {
        if let Err(e) = write_request(&mut stdin, &request) {
            error!("[BRIDGE] Failed to write to worker stdin: {e}");
            break;
        }
    }
    info!("[BRIDGE] Stdin writer task exiting");
}

pub fn write_request<W: Write>(out: &mut W, request: &WorkerRequest) -> std::io::Result<()> {
    let json = serde_json::to_string(request).map_err(std::io::Error::other)?;
    writeln!(out, "{json}")?;
    out.flush()
}

/// Read JSON event lines until EOF, forwarding each parsed event.
pub fn read_events<R: BufRead>(reader: R, events: &mpsc::UnboundedSender<WorkerEvent>) {
    for line in reader.lines() {
        match line {
            Ok(l) if !l.trim().is_empty() => match serde_json::from_str::<WorkerEvent>(&l) {
                Ok(event) => {
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("[BRIDGE] Failed to parse worker event: {e}"),
            },
            Ok(_) => {}
            Err(e) => {
                error!("[BRIDGE] Worker stdout read error: {e}");
                break;
            }
        }
    }
}
