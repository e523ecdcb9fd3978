//! Model worker.
//!
//! The worker owns the loaded model and runs generations. It can run as a
//! tokio task next to the front end, or as a child process for:
//! - Memory reclaim: kill the process to free everything the runtime holds
//! - Crash isolation: a runtime crash doesn't take the front end down

pub mod ipc_types;
pub mod process_manager;
pub mod progress;
pub mod worker_bridge;
pub mod worker_main;
