//! In-memory sandbox service
//!
//! `SimulatedService` implements the whole service surface without a
//! network. It reproduces the eventual-consistency gaps the real service
//! shows (a freshly created sandbox is briefly invisible, pause is refused
//! until the sandbox is pause-capable, a started process takes a moment to
//! show up in the process list) and lets callers script one-shot failures
//! per operation.

use crate::errors::{ServiceError, ServiceResult};
use crate::service::{ControlPlane, SandboxRuntime};
use crate::types::{
    CommandOptions, CommandResult, ConnectOutcome, CreateOptions, ProcessInfo, ProcessStream,
    SandboxInfo, SandboxRef, SandboxState,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Service operation, used to script failures and count calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Connect,
    Pause,
    Kill,
    GetInfo,
    SetTimeout,
    List,
    WriteFile,
    ReadFile,
    RunCommand,
    StartProcess,
    ListProcesses,
    ConnectProcess,
    KillProcess,
}

/// Eventual-consistency behaviour of a simulated sandbox
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulationProfile {
    /// Control-plane lookups answered with not-found after creation
    pub visibility_lag: u32,
    /// Pause calls answered with not-found before the sandbox is pause-capable
    pub pause_lag: u32,
    /// Process-list calls that omit a freshly started process
    pub process_visibility_lag: u32,
    /// Resume attempts rejected with "can't be resumed" after a pause
    pub resume_conflicts: u32,
}

/// Computes the result of a foreground command
pub type CommandHandler = Arc<dyn Fn(&str) -> CommandResult + Send + Sync>;

struct SimProcess {
    cmd: String,
    hidden_for: u32,
    subscribers: Vec<UnboundedSender<String>>,
}

impl SimProcess {
    /// Attach a new stream, dropping senders whose stream is gone
    fn attach(&mut self, pid: u32) -> ProcessStream {
        let (stream, tx) = ProcessStream::channel(pid);
        self.subscribers.retain(|tx| !tx.is_closed());
        self.subscribers.push(tx);
        stream
    }
}

struct SimSandbox {
    template_id: String,
    state: SandboxState,
    lookups_hidden: u32,
    pause_refusals: u32,
    resume_conflicts: u32,
    timeout: Duration,
    started_at: DateTime<Utc>,
    files: HashMap<String, Vec<u8>>,
    processes: BTreeMap<u32, SimProcess>,
}

impl SimSandbox {
    fn info(&self, sandbox_id: &str) -> SandboxInfo {
        let end_at = chrono::Duration::from_std(self.timeout)
            .ok()
            .map(|timeout| self.started_at + timeout);

        SandboxInfo {
            sandbox_id: sandbox_id.to_string(),
            template_id: Some(self.template_id.clone()),
            state: self.state,
            started_at: Some(self.started_at),
            end_at,
        }
    }
}

#[derive(Default)]
struct SimState {
    sandboxes: HashMap<String, SimSandbox>,
    failures: HashMap<Operation, VecDeque<ServiceError>>,
    calls: HashMap<Operation, u32>,
    next_sandbox: u64,
    next_pid: u32,
}

/// In-memory implementation of [`ControlPlane`] and [`SandboxRuntime`]
pub struct SimulatedService {
    profile: SimulationProfile,
    domain: String,
    command_handler: CommandHandler,
    state: Mutex<SimState>,
}

impl Default for SimulatedService {
    fn default() -> Self {
        Self::new(SimulationProfile::default())
    }
}

impl SimulatedService {
    pub fn new(profile: SimulationProfile) -> Self {
        Self {
            profile,
            domain: "sandbox.local".to_string(),
            command_handler: Arc::new(default_command_handler),
            state: Mutex::new(SimState {
                next_pid: 100,
                ..SimState::default()
            }),
        }
    }

    pub fn with_command_handler(
        mut self,
        handler: impl Fn(&str) -> CommandResult + Send + Sync + 'static,
    ) -> Self {
        self.command_handler = Arc::new(handler);
        self
    }

    pub fn profile(&self) -> &SimulationProfile {
        &self.profile
    }

    /// Make the next call to `operation` fail with `error`
    pub fn fail_next(&self, operation: Operation, error: ServiceError) {
        self.state
            .lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Make the next `times` calls to `operation` fail with `error`
    pub fn fail_times(&self, operation: Operation, times: u32, error: ServiceError) {
        for _ in 0..times {
            self.fail_next(operation, error.clone());
        }
    }

    /// Number of calls made to `operation`, including failed ones
    pub fn call_count(&self, operation: Operation) -> u32 {
        self.state.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    pub fn sandbox_state(&self, sandbox_id: &str) -> Option<SandboxState> {
        self.state.lock().sandboxes.get(sandbox_id).map(|s| s.state)
    }

    pub fn sandbox_count(&self) -> usize {
        self.state.lock().sandboxes.len()
    }

    pub fn is_process_running(&self, sandbox_id: &str, pid: u32) -> bool {
        self.state
            .lock()
            .sandboxes
            .get(sandbox_id)
            .is_some_and(|s| s.processes.contains_key(&pid))
    }

    /// Number of live output streams attached to a process
    pub fn attached_streams(&self, sandbox_id: &str, pid: u32) -> usize {
        self.state
            .lock()
            .sandboxes
            .get(sandbox_id)
            .and_then(|s| s.processes.get(&pid))
            .map(|p| p.subscribers.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Emit an output line from a process to every attached stream
    ///
    /// Returns how many streams received the line.
    pub fn emit_output(&self, sandbox_id: &str, pid: u32, line: &str) -> usize {
        let mut state = self.state.lock();
        let Some(process) = state
            .sandboxes
            .get_mut(sandbox_id)
            .and_then(|s| s.processes.get_mut(&pid))
        else {
            return 0;
        };

        process
            .subscribers
            .retain(|tx| tx.send(line.to_string()).is_ok());
        process.subscribers.len()
    }

    /// Record the call and pop a scripted failure, if any
    fn enter(&self, state: &mut SimState, operation: Operation) -> ServiceResult<()> {
        *state.calls.entry(operation).or_default() += 1;

        if let Some(error) = state
            .failures
            .get_mut(&operation)
            .and_then(|queue| queue.pop_front())
        {
            debug!(?operation, "Injecting scripted failure: {}", error);
            return Err(error);
        }
        Ok(())
    }
}

fn sandbox_not_found(sandbox_id: &str) -> ServiceError {
    ServiceError::NotFound(format!("sandbox {} was not found", sandbox_id))
}

/// Control-plane lookup that honours the visibility lag
fn visible_sandbox<'a>(
    state: &'a mut SimState,
    sandbox_id: &str,
) -> ServiceResult<&'a mut SimSandbox> {
    let sandbox = state
        .sandboxes
        .get_mut(sandbox_id)
        .ok_or_else(|| sandbox_not_found(sandbox_id))?;

    if sandbox.lookups_hidden > 0 {
        sandbox.lookups_hidden -= 1;
        return Err(sandbox_not_found(sandbox_id));
    }
    Ok(sandbox)
}

/// Runtime lookup; the sandbox must be running
fn running_sandbox<'a>(
    state: &'a mut SimState,
    sandbox_id: &str,
) -> ServiceResult<&'a mut SimSandbox> {
    let sandbox = state
        .sandboxes
        .get_mut(sandbox_id)
        .ok_or_else(|| sandbox_not_found(sandbox_id))?;

    if sandbox.state != SandboxState::Running {
        return Err(ServiceError::Conflict(format!(
            "sandbox {} is {}",
            sandbox_id, sandbox.state
        )));
    }
    Ok(sandbox)
}

/// Strip a `bash -lc '...'` wrapper
fn unwrap_shell(command: &str) -> &str {
    let trimmed = command.trim();
    trimmed
        .strip_prefix("bash -lc ")
        .or_else(|| trimmed.strip_prefix("bash -c "))
        .map(|inner| inner.trim().trim_matches(|c| c == '\'' || c == '"'))
        .unwrap_or(trimmed)
}

/// Understands `echo`, `true`, `false` and `exit N`; anything else succeeds
/// silently
pub fn default_command_handler(command: &str) -> CommandResult {
    let script = unwrap_shell(command);
    let ok = |stdout: String| CommandResult {
        exit_code: 0,
        stdout,
        stderr: String::new(),
    };

    if let Some(text) = script.strip_prefix("echo ") {
        let text = text.trim().trim_matches(|c| c == '\'' || c == '"');
        return ok(format!("{}\n", text));
    }

    match script {
        "echo" | "true" => ok(String::new()),
        "false" => CommandResult {
            exit_code: 1,
            stdout: String::new(),
            stderr: String::new(),
        },
        other => match other.strip_prefix("exit ").map(|code| code.trim().parse::<i32>()) {
            Some(Ok(code)) => CommandResult {
                exit_code: code,
                stdout: String::new(),
                stderr: String::new(),
            },
            _ => ok(String::new()),
        },
    }
}

#[async_trait::async_trait]
impl ControlPlane for SimulatedService {
    async fn create(&self, template: &str, options: &CreateOptions) -> ServiceResult<SandboxRef> {
        let mut state = self.state.lock();
        self.enter(&mut state, Operation::Create)?;

        if template.trim().is_empty() {
            return Err(ServiceError::InvalidArgument("template must not be empty".to_string()));
        }

        state.next_sandbox += 1;
        let sandbox_id = format!("sbx{:08x}", state.next_sandbox);
        state.sandboxes.insert(
            sandbox_id.clone(),
            SimSandbox {
                template_id: template.to_string(),
                state: SandboxState::Running,
                lookups_hidden: self.profile.visibility_lag,
                pause_refusals: self.profile.pause_lag,
                resume_conflicts: 0,
                timeout: options.timeout,
                started_at: Utc::now(),
                files: HashMap::new(),
                processes: BTreeMap::new(),
            },
        );

        Ok(SandboxRef {
            sandbox_id,
            domain: Some(self.domain.clone()),
            template_id: Some(template.to_string()),
        })
    }

    async fn connect(&self, sandbox_id: &str, timeout: Duration) -> ServiceResult<ConnectOutcome> {
        let mut state = self.state.lock();
        self.enter(&mut state, Operation::Connect)?;
        let domain = self.domain.clone();
        let sandbox = visible_sandbox(&mut state, sandbox_id)?;

        let resumed = match sandbox.state {
            SandboxState::Paused => {
                if sandbox.resume_conflicts > 0 {
                    sandbox.resume_conflicts -= 1;
                    return Err(ServiceError::Conflict(format!(
                        "sandbox {} can't be resumed yet",
                        sandbox_id
                    )));
                }
                sandbox.state = SandboxState::Running;
                true
            }
            SandboxState::Running => false,
            other => {
                return Err(ServiceError::Conflict(format!(
                    "sandbox {} is {} and can't be resumed",
                    sandbox_id, other
                )))
            }
        };
        sandbox.timeout = timeout;

        Ok(ConnectOutcome {
            sandbox: SandboxRef {
                sandbox_id: sandbox_id.to_string(),
                domain: Some(domain),
                template_id: Some(sandbox.template_id.clone()),
            },
            resumed,
        })
    }

    async fn pause(&self, sandbox_id: &str) -> ServiceResult<()> {
        let mut state = self.state.lock();
        self.enter(&mut state, Operation::Pause)?;
        let resume_conflicts = self.profile.resume_conflicts;
        let sandbox = visible_sandbox(&mut state, sandbox_id)?;

        if sandbox.pause_refusals > 0 {
            sandbox.pause_refusals -= 1;
            return Err(sandbox_not_found(sandbox_id));
        }
        if sandbox.state == SandboxState::Paused {
            return Err(ServiceError::Conflict(format!(
                "sandbox {} is already paused",
                sandbox_id
            )));
        }

        sandbox.state = SandboxState::Paused;
        sandbox.resume_conflicts = resume_conflicts;
        // paused processes stop streaming; they survive for reattachment
        for process in sandbox.processes.values_mut() {
            process.subscribers.clear();
        }
        Ok(())
    }

    async fn kill(&self, sandbox_id: &str) -> ServiceResult<()> {
        let mut state = self.state.lock();
        self.enter(&mut state, Operation::Kill)?;

        state
            .sandboxes
            .remove(sandbox_id)
            .map(|_| ())
            .ok_or_else(|| sandbox_not_found(sandbox_id))
    }

    async fn get_info(&self, sandbox_id: &str) -> ServiceResult<SandboxInfo> {
        let mut state = self.state.lock();
        self.enter(&mut state, Operation::GetInfo)?;
        let sandbox = visible_sandbox(&mut state, sandbox_id)?;
        Ok(sandbox.info(sandbox_id))
    }

    async fn set_timeout(&self, sandbox_id: &str, timeout: Duration) -> ServiceResult<()> {
        let mut state = self.state.lock();
        self.enter(&mut state, Operation::SetTimeout)?;
        let sandbox = visible_sandbox(&mut state, sandbox_id)?;
        sandbox.timeout = timeout;
        Ok(())
    }

    async fn list(&self) -> ServiceResult<Vec<SandboxInfo>> {
        let mut state = self.state.lock();
        self.enter(&mut state, Operation::List)?;

        let mut sandboxes: Vec<SandboxInfo> = state
            .sandboxes
            .iter()
            .map(|(id, sandbox)| sandbox.info(id))
            .collect();
        sandboxes.sort_by(|a, b| a.sandbox_id.cmp(&b.sandbox_id));
        Ok(sandboxes)
    }
}

#[async_trait::async_trait]
impl SandboxRuntime for SimulatedService {
    async fn write_file(&self, sandbox_id: &str, path: &str, content: &[u8]) -> ServiceResult<()> {
        let mut state = self.state.lock();
        self.enter(&mut state, Operation::WriteFile)?;
        let sandbox = running_sandbox(&mut state, sandbox_id)?;
        sandbox.files.insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> ServiceResult<Vec<u8>> {
        let mut state = self.state.lock();
        self.enter(&mut state, Operation::ReadFile)?;
        let sandbox = running_sandbox(&mut state, sandbox_id)?;
        sandbox
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("file {} not found", path)))
    }

    async fn run_command(
        &self,
        sandbox_id: &str,
        command: &str,
        _options: &CommandOptions,
    ) -> ServiceResult<CommandResult> {
        {
            let mut state = self.state.lock();
            self.enter(&mut state, Operation::RunCommand)?;
            running_sandbox(&mut state, sandbox_id)?;
        }
        Ok((self.command_handler)(command))
    }

    async fn start_process(&self, sandbox_id: &str, command: &str) -> ServiceResult<ProcessStream> {
        let mut state = self.state.lock();
        self.enter(&mut state, Operation::StartProcess)?;
        running_sandbox(&mut state, sandbox_id)?;

        state.next_pid += 1;
        let pid = state.next_pid;
        let hidden_for = self.profile.process_visibility_lag;

        let sandbox = running_sandbox(&mut state, sandbox_id)?;
        let process = sandbox.processes.entry(pid).or_insert(SimProcess {
            cmd: command.to_string(),
            hidden_for,
            subscribers: Vec::new(),
        });
        Ok(process.attach(pid))
    }

    async fn list_processes(&self, sandbox_id: &str) -> ServiceResult<Vec<ProcessInfo>> {
        let mut state = self.state.lock();
        self.enter(&mut state, Operation::ListProcesses)?;
        let sandbox = running_sandbox(&mut state, sandbox_id)?;

        let mut visible = Vec::new();
        for (pid, process) in sandbox.processes.iter_mut() {
            if process.hidden_for > 0 {
                process.hidden_for -= 1;
                continue;
            }
            visible.push(ProcessInfo {
                pid: *pid,
                cmd: process.cmd.clone(),
            });
        }
        Ok(visible)
    }

    async fn connect_process(
        &self,
        sandbox_id: &str,
        pid: u32,
        _timeout: Duration,
    ) -> ServiceResult<ProcessStream> {
        let mut state = self.state.lock();
        self.enter(&mut state, Operation::ConnectProcess)?;
        let sandbox = running_sandbox(&mut state, sandbox_id)?;

        sandbox
            .processes
            .get_mut(&pid)
            .map(|process| process.attach(pid))
            .ok_or_else(|| ServiceError::NotFound(format!("process {} not found", pid)))
    }

    async fn kill_process(&self, sandbox_id: &str, pid: u32) -> ServiceResult<()> {
        let mut state = self.state.lock();
        self.enter(&mut state, Operation::KillProcess)?;
        let sandbox = running_sandbox(&mut state, sandbox_id)?;

        sandbox
            .processes
            .remove(&pid)
            .map(|_| ())
            .ok_or_else(|| ServiceError::NotFound(format!("process {} not found", pid)))
    }
}
