//! Remote sandbox service surface

use crate::errors::ServiceResult;
use crate::types::{
    CommandOptions, CommandResult, ConnectOutcome, CreateOptions, ProcessInfo, ProcessStream,
    SandboxInfo, SandboxRef,
};
use std::time::Duration;

/// Sandbox lifecycle operations exposed by the service API
#[async_trait::async_trait]
pub trait ControlPlane: Send + Sync {
    async fn create(&self, template: &str, options: &CreateOptions) -> ServiceResult<SandboxRef>;

    /// Connect to a sandbox by id, resuming it if paused
    async fn connect(&self, sandbox_id: &str, timeout: Duration) -> ServiceResult<ConnectOutcome>;

    async fn pause(&self, sandbox_id: &str) -> ServiceResult<()>;

    async fn kill(&self, sandbox_id: &str) -> ServiceResult<()>;

    async fn get_info(&self, sandbox_id: &str) -> ServiceResult<SandboxInfo>;

    /// Re-arm the sandbox lifetime
    async fn set_timeout(&self, sandbox_id: &str, timeout: Duration) -> ServiceResult<()>;

    async fn list(&self) -> ServiceResult<Vec<SandboxInfo>>;
}

/// Operations inside a running sandbox
#[async_trait::async_trait]
pub trait SandboxRuntime: Send + Sync {
    async fn write_file(&self, sandbox_id: &str, path: &str, content: &[u8]) -> ServiceResult<()>;

    async fn read_file(&self, sandbox_id: &str, path: &str) -> ServiceResult<Vec<u8>>;

    /// Run a command to completion
    async fn run_command(
        &self,
        sandbox_id: &str,
        command: &str,
        options: &CommandOptions,
    ) -> ServiceResult<CommandResult>;

    /// Start a background command and attach to its output
    async fn start_process(&self, sandbox_id: &str, command: &str) -> ServiceResult<ProcessStream>;

    async fn list_processes(&self, sandbox_id: &str) -> ServiceResult<Vec<ProcessInfo>>;

    /// Attach to the output of an already running process
    async fn connect_process(
        &self,
        sandbox_id: &str,
        pid: u32,
        timeout: Duration,
    ) -> ServiceResult<ProcessStream>;

    async fn kill_process(&self, sandbox_id: &str, pid: u32) -> ServiceResult<()>;
}

/// Full service surface used by session lifecycles
pub trait SandboxService: ControlPlane + SandboxRuntime {}

impl<T: ControlPlane + SandboxRuntime + ?Sized> SandboxService for T {}
