#![forbid(unsafe_code)]

//! Edit locally, run remotely.
//!
//! The client half watches a local directory and mirrors every change to a
//! remote agent. The agent half applies those changes and keeps each
//! workspace's build, test, init and start commands running.

pub mod agent;
pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod process;
pub mod relay;
pub mod sync;

pub use config::{AgentConfig, ClientConfig};
pub use errors::{AppError, Result};
