//! Sandbox service types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;

/// Reference to a remote sandbox as returned by create/connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxRef {
    pub sandbox_id: String,
    pub domain: Option<String>,
    pub template_id: Option<String>,
}

/// Remote-side lifecycle state of a sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Starting,
    Running,
    Paused,
    Failed,
    Unknown,
}

impl SandboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Starting => "starting",
            SandboxState::Running => "running",
            SandboxState::Paused => "paused",
            SandboxState::Failed => "failed",
            SandboxState::Unknown => "unknown",
        }
    }

    /// Whether the sandbox accepts runtime calls
    pub fn is_ready(&self) -> bool {
        matches!(self, SandboxState::Running)
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SandboxState {
    type Err = std::convert::Infallible;

    /// Lenient parse: unrecognised states become `Unknown`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "starting" | "pending" | "creating" => SandboxState::Starting,
            "running" | "ready" => SandboxState::Running,
            "paused" | "pausing" => SandboxState::Paused,
            "failed" | "error" => SandboxState::Failed,
            _ => SandboxState::Unknown,
        })
    }
}

/// Status snapshot of a sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub sandbox_id: String,
    pub template_id: Option<String>,
    pub state: SandboxState,
    pub started_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
}

/// Options for sandbox creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOptions {
    /// Lifetime of the sandbox before the service reaps it
    pub timeout: Duration,
    pub allow_internet_access: bool,
    pub metadata: HashMap<String, String>,
    pub env_vars: HashMap<String, String>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            allow_internet_access: true,
            metadata: HashMap::new(),
            env_vars: HashMap::new(),
        }
    }
}

/// Result of connecting to a sandbox by id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOutcome {
    pub sandbox: SandboxRef,
    /// The sandbox was paused and has been resumed by this connect
    pub resumed: bool,
}

/// Options for a foreground command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOptions {
    pub timeout: Option<Duration>,
}

impl CommandOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Completed foreground command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A process running inside a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub cmd: String,
}

/// Live attachment to the output of a background process
///
/// Dropping the stream detaches from the process without killing it.
#[derive(Debug)]
pub struct ProcessStream {
    pid: u32,
    output: mpsc::UnboundedReceiver<String>,
}

impl ProcessStream {
    /// Create a stream and the sender that feeds it
    pub fn channel(pid: u32) -> (Self, mpsc::UnboundedSender<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { pid, output: rx }, tx)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait for the next output line, `None` once the remote side hangs up
    pub async fn next_line(&mut self) -> Option<String> {
        self.output.recv().await
    }

    /// Next buffered output line without waiting
    pub fn try_next_line(&mut self) -> Option<String> {
        self.output.try_recv().ok()
    }
}
