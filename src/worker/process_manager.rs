//! Worker process lifecycle management.
//!
//! Spawns the worker as a child process (same binary with `--worker` flag)
//! and kills it when the front end goes away.

use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;

use log::{info, warn};

use super::worker_bridge::BridgeError;

/// Manages the worker child process.
pub struct ProcessManager {
    child: Mutex<Option<Child>>,
}

impl ProcessManager {
    /// Spawn the current executable as a stdio worker.
    pub fn spawn(config_path: Option<&PathBuf>) -> Result<Self, BridgeError> {
        let exe = std::env::current_exe()
            .map_err(|e| BridgeError::Spawn(format!("Cannot find own executable: {e}")))?;

        let mut command = Command::new(exe);
        command.arg("--worker");
        if let Some(path) = config_path {
            command.arg("--config").arg(path);
        }
        Self::spawn_command(command)
    }

    /// Spawn an arbitrary worker command with piped stdin/stdout.
    pub fn spawn_command(mut command: Command) -> Result<Self, BridgeError> {
        info!("[PROCESS_MGR] Spawning worker: {command:?}");

        let child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Worker logs go to parent's stderr
            .spawn()
            .map_err(|e| BridgeError::Spawn(format!("Failed to spawn worker: {e}")))?;

        info!("[PROCESS_MGR] Worker started (pid={})", child.id());
        Ok(Self {
            child: Mutex::new(Some(child)),
        })
    }

    /// Take the child's stdin handle for writing requests.
    pub fn take_stdin(&self) -> Option<ChildStdin> {
        self.child
            .lock()
            .ok()
            .and_then(|mut guard| guard.as_mut().and_then(|c| c.stdin.take()))
    }

    /// Take the child's stdout handle for reading events.
    pub fn take_stdout(&self) -> Option<ChildStdout> {
        self.child
            .lock()
            .ok()
            .and_then(|mut guard| guard.as_mut().and_then(|c| c.stdout.take()))
    }

    pub fn is_alive(&self) -> bool {
        self.child
            .lock()
            .ok()
            .and_then(|mut guard| guard.as_mut().map(|c| matches!(c.try_wait(), Ok(None))))
            .unwrap_or(false)
    }

    /// Kill the worker process immediately.
    pub fn kill(&self) {
        if let Ok(mut guard) = self.child.lock() {
            if let Some(ref mut child) = *guard {
                info!("[PROCESS_MGR] Killing worker process");
                if let Err(e) = child.kill() {
                    warn!("[PROCESS_MGR] Kill failed: {e}");
                }
                let _ = child.wait(); // Reap
            }
            *guard = None;
        }
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        self.kill();
    }
}
