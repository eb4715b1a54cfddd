//! Upstage Library - Update attempt orchestration
//!
//! This library provides:
//! - Status and version file access
//! - Tree manifests and verification
//! - Process running and helper-process probing
//! - Privileged service coordination (polkit, signatures, stop barriers)
//! - The update orchestrator and its configuration

pub mod callback;
pub mod config;
pub mod elevation;
pub mod environment;
pub mod error;
pub mod manifest;
pub mod orchestrator;
pub mod paths;
pub mod polkit;
pub mod poll;
pub mod process;
pub mod signing;
pub mod status;
pub mod update_log;
pub mod verify;

pub use error::{Result, UpdateError};
pub use orchestrator::{AttemptOutcome, AttemptPlan, UpdateMode, UpdateOrchestrator};
pub use status::{StatusStore, UpdateStatus};
