//! Local model chat: a front-end controller and an inference worker that talk
//! over a small JSON message protocol.

pub mod catalog;
pub mod config;
pub mod controller;
pub mod logger;
pub mod pipeline;
pub mod runtime;
pub mod worker;
