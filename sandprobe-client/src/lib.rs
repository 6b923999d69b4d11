//! Sandbox service client for sandprobe
//!
//! This crate defines the remote service surface ([`ControlPlane`] and
//! [`SandboxRuntime`]), the tagged [`ServiceError`] every backend reports,
//! a REST implementation of the control plane and an in-memory
//! [`SimulatedService`] used by tests and local dry runs.

pub mod config;
pub mod errors;
pub mod rest;
pub mod service;
pub mod simulated;
pub mod types;

// Re-export main types for convenience
pub use config::RestConfig;
pub use errors::{ServiceError, ServiceErrorClassifier, ServiceResult};
pub use rest::RestControlPlane;
pub use service::{ControlPlane, SandboxRuntime, SandboxService};
pub use simulated::{default_command_handler, CommandHandler, Operation, SimulatedService, SimulationProfile};
pub use types::{
    CommandOptions, CommandResult, ConnectOutcome, CreateOptions, ProcessInfo, ProcessStream,
    SandboxInfo, SandboxRef, SandboxState,
};
