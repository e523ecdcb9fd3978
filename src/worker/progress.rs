//! Load progress forwarding.
//!
//! Runtimes report whatever they like; the controller only ever sees values in
//! [0, 1] that never go backwards within one load.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::ipc_types::WorkerEvent;
use crate::runtime::ProgressCallback;

/// Clamps and orders progress for a single load.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    last: Option<f64>,
}

impl ProgressTracker {
    /// Returns the value to report, or `None` when it must be dropped.
    pub fn accept(&mut self, raw: f64) -> Option<f64> {
        if !raw.is_finite() {
            return None;
        }
        let value = raw.clamp(0.0, 1.0);
        match self.last {
            Some(last) if value < last => None,
            _ => {
                self.last = Some(value);
                Some(value)
            }
        }
    }
}

/// Sends progress events for one load through the worker's event channel.
#[derive(Clone)]
pub struct ProgressReporter {
    tracker: Arc<Mutex<ProgressTracker>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl ProgressReporter {
    pub fn new(events: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self {
            tracker: Arc::new(Mutex::new(ProgressTracker::default())),
            events,
        }
    }

    pub fn report(&self, raw: f64) {
        let accepted = match self.tracker.lock() {
            Ok(mut tracker) => tracker.accept(raw),
            Err(_) => None,
        };
        if let Some(progress) = accepted {
            let _ = self.events.send(WorkerEvent::Progress { progress });
        }
    }

    /// Adapter handed to the runtime.
    pub fn callback(&self) -> ProgressCallback {
        let reporter = self.clone();
        Arc::new(move |raw: f64| reporter.report(raw))
    }
}
