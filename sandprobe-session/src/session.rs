//! Sandbox session lifecycle
//!
//! A [`SessionLifecycle`] wraps create, connect (with implicit resume), pause
//! and kill of a remote sandbox behind a [`Session`] handle, each retried
//! under its own [`RetryPolicy`]. The lifecycle receives its configuration
//! explicitly; nothing is read from the environment here.
//!
//! State machine:
//!
//! ```text
//! Created --pause--> Paused --connect--> Resumed
//! {Created, Running, Paused, Resumed} --kill--> Killed
//! ```
//!
//! `Killed` is terminal and killing twice is a no-op.

use crate::error::{SessionError, SessionErrorClassifier, SessionResult};
use crate::probe::ProbeResult;
use futures::future::BoxFuture;
use sandprobe_client::{
    CommandOptions, CommandResult, CreateOptions, SandboxInfo, SandboxRef, SandboxService,
    ServiceErrorClassifier,
};
use sandprobe_config::{RetryConfig, SandboxDefaults, SandprobeConfig};
use sandprobe_resilience::{ErrorClassifier, ErrorKind, Retried, RetryExecutor, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Local view of a sandbox's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Freshly created by this process
    Created,
    /// Connected to a sandbox that was already running
    Running,
    Paused,
    /// Connected to a sandbox that was paused and got resumed
    Resumed,
    Killed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Running => "running",
            SessionState::Paused => "paused",
            SessionState::Resumed => "resumed",
            SessionState::Killed => "killed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Killed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether dropping the session should clean up the remote sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Created by this process; killed on drop if still alive
    Owned,
    /// Attached to by id; left running on drop
    Borrowed,
}

/// Handle to a remote sandbox
///
/// The sandbox id is the only stable reference across processes; a
/// different run can reattach with [`SessionLifecycle::connect`].
pub struct Session {
    sandbox: SandboxRef,
    state: SessionState,
    ownership: Ownership,
    service: Arc<dyn SandboxService>,
    kill_policy: RetryPolicy,
    classifier: ServiceErrorClassifier,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("sandbox", &self.sandbox)
            .field("state", &self.state)
            .field("ownership", &self.ownership)
            .finish()
    }
}

impl Session {
    fn new(
        sandbox: SandboxRef,
        state: SessionState,
        ownership: Ownership,
        service: Arc<dyn SandboxService>,
        kill_policy: RetryPolicy,
    ) -> Self {
        Self {
            sandbox,
            state,
            ownership,
            service,
            kill_policy,
            classifier: ServiceErrorClassifier::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.sandbox.sandbox_id
    }

    pub fn domain(&self) -> Option<&str> {
        self.sandbox.domain.as_deref()
    }

    pub fn sandbox(&self) -> &SandboxRef {
        &self.sandbox
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn is_killed(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn service(&self) -> &Arc<dyn SandboxService> {
        &self.service
    }

    /// Stop owning the sandbox; dropping the session then leaves it running
    pub fn release(&mut self) {
        if self.ownership == Ownership::Owned {
            info!(sandbox_id = %self.id(), "Releasing sandbox, it stays running");
            self.ownership = Ownership::Borrowed;
        }
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        debug!(sandbox_id = %self.id(), from = %self.state, to = %state, "Session state change");
        self.state = state;
    }

    pub(crate) fn ensure_alive(&self, operation: &'static str) -> SessionResult<()> {
        if self.state.is_terminal() {
            return Err(SessionError::InvalidState {
                sandbox_id: self.id().to_string(),
                state: self.state,
                operation,
            });
        }
        Ok(())
    }

    /// Fetch the remote status
    pub async fn info(&self) -> SessionResult<SandboxInfo> {
        self.ensure_alive("inspect")?;
        Ok(self.service.get_info(self.id()).await?)
    }

    /// Re-arm the remote lifetime
    pub async fn set_timeout(&self, timeout: Duration) -> SessionResult<()> {
        self.ensure_alive("set timeout on")?;
        Ok(self.service.set_timeout(self.id(), timeout).await?)
    }

    pub async fn write_file(&self, path: &str, content: impl AsRef<[u8]>) -> SessionResult<()> {
        self.ensure_alive("write to")?;
        Ok(self
            .service
            .write_file(self.id(), path, content.as_ref())
            .await?)
    }

    pub async fn read_file(&self, path: &str) -> SessionResult<Vec<u8>> {
        self.ensure_alive("read from")?;
        Ok(self.service.read_file(self.id(), path).await?)
    }

    /// Read a file as UTF-8 text, lossily
    pub async fn read_text(&self, path: &str) -> SessionResult<String> {
        let bytes = self.read_file(path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read a file, retrying while the sandbox settles after a resume
    pub async fn read_file_retrying(
        &self,
        path: &str,
        policy: &RetryPolicy,
    ) -> SessionResult<Vec<u8>> {
        Ok(self.read_file_retried(path, policy).await?.into_inner())
    }

    /// Like [`Session::read_file_retrying`], also reporting attempts and
    /// elapsed time
    pub async fn read_file_retried(
        &self,
        path: &str,
        policy: &RetryPolicy,
    ) -> SessionResult<Retried<Vec<u8>>> {
        self.ensure_alive("read from")?;
        let executor = RetryExecutor::new(policy.clone());

        let retried = executor
            .execute(&self.classifier, || self.service.read_file(self.id(), path))
            .await
            .map_err(|e| SessionError::retry("read file", e))?;

        if retried.attempts > 1 {
            info!(
                sandbox_id = %self.id(),
                path,
                attempts = retried.attempts,
                "File readable after {:.2?}",
                retried.elapsed
            );
        }
        Ok(retried)
    }

    pub async fn run_command(&self, command: &str) -> SessionResult<CommandResult> {
        self.run_command_with(command, &CommandOptions::default())
            .await
    }

    pub async fn run_command_with(
        &self,
        command: &str,
        options: &CommandOptions,
    ) -> SessionResult<CommandResult> {
        self.ensure_alive("run a command in")?;
        debug!(sandbox_id = %self.id(), command, "Running command");
        Ok(self
            .service
            .run_command(self.id(), command, options)
            .await?)
    }

    /// Kill the remote sandbox
    ///
    /// A sandbox the service no longer knows about counts as killed, and
    /// killing an already killed session does nothing.
    pub async fn kill(&mut self) -> SessionResult<()> {
        if self.state.is_terminal() {
            debug!(sandbox_id = %self.id(), "Session already killed");
            return Ok(());
        }

        let executor = RetryExecutor::new(self.kill_policy.clone());
        let service = &self.service;
        let sandbox_id = self.sandbox.sandbox_id.as_str();
        let classifier = self.classifier;

        executor
            .execute(&self.classifier, move || async move {
                match service.kill(sandbox_id).await {
                    Err(e) if classifier.classify(&e) == ErrorKind::NotFound => {
                        debug!(sandbox_id, "Sandbox already gone: {}", e);
                        Ok(())
                    }
                    other => other,
                }
            })
            .await
            .map_err(|e| SessionError::retry("kill", e))?;

        info!(sandbox_id = %self.id(), "Sandbox killed");
        self.set_state(SessionState::Killed);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.ownership != Ownership::Owned || self.state.is_terminal() {
            return;
        }

        let sandbox_id = self.sandbox.sandbox_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(sandbox_id = %sandbox_id, "Session dropped without kill, killing in background");
                let service = Arc::clone(&self.service);
                let classifier = self.classifier;
                handle.spawn(async move {
                    match service.kill(&sandbox_id).await {
                        Ok(()) => debug!(sandbox_id = %sandbox_id, "Background kill finished"),
                        Err(e) if classifier.classify(&e) == ErrorKind::NotFound => {}
                        Err(e) => warn!(sandbox_id = %sandbox_id, "Background kill failed: {}", e),
                    }
                });
            }
            Err(_) => {
                warn!(sandbox_id = %sandbox_id, "Session dropped without kill outside a runtime, sandbox leaked");
            }
        }
    }
}

/// Creates, connects, pauses and kills sessions under configured retry
/// policies
#[derive(Clone)]
pub struct SessionLifecycle {
    service: Arc<dyn SandboxService>,
    defaults: SandboxDefaults,
    retry: RetryConfig,
    classifier: ServiceErrorClassifier,
}

impl SessionLifecycle {
    pub fn new(service: Arc<dyn SandboxService>, config: &SandprobeConfig) -> Self {
        Self::with_settings(service, config.sandbox.clone(), config.retry.clone())
    }

    pub fn with_settings(
        service: Arc<dyn SandboxService>,
        defaults: SandboxDefaults,
        retry: RetryConfig,
    ) -> Self {
        Self {
            service,
            defaults,
            retry,
            classifier: ServiceErrorClassifier::new(),
        }
    }

    pub fn service(&self) -> &Arc<dyn SandboxService> {
        &self.service
    }

    pub fn defaults(&self) -> &SandboxDefaults {
        &self.defaults
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Creation options derived from the sandbox defaults
    pub fn create_options(&self) -> CreateOptions {
        CreateOptions {
            timeout: self.defaults.timeout,
            allow_internet_access: self.defaults.allow_internet_access,
            ..CreateOptions::default()
        }
    }

    /// Create a sandbox from the default template
    pub async fn create_default(&self) -> SessionResult<Session> {
        let template = self.defaults.template.clone();
        self.create(&template, &self.create_options()).await
    }

    /// Create a sandbox
    ///
    /// Runs under the `create` policy, a single attempt by default. The
    /// returned session is owned: the caller must kill it, and dropping it
    /// alive triggers a background kill.
    pub async fn create(&self, template: &str, options: &CreateOptions) -> SessionResult<Session> {
        let executor = RetryExecutor::new(self.retry.create.clone());
        let service = &self.service;

        let retried = executor
            .execute(&self.classifier, || service.create(template, options))
            .await
            .map_err(|e| SessionError::retry("create", e))?;

        info!(
            sandbox_id = %retried.value.sandbox_id,
            template,
            "Sandbox created in {:.2?}",
            retried.elapsed
        );

        Ok(Session::new(
            retried.into_inner(),
            SessionState::Created,
            Ownership::Owned,
            Arc::clone(&self.service),
            self.retry.kill.clone(),
        ))
    }

    /// Connect to a sandbox by id with the default lifetime
    pub async fn connect(&self, sandbox_id: &str) -> SessionResult<Session> {
        self.connect_with_timeout(sandbox_id, self.defaults.connect_timeout)
            .await
    }

    /// Connect to a sandbox by id, resuming it if paused
    ///
    /// Not-found, conflict and transient failures are retried under the
    /// `connect` policy, which covers the window where a fresh sandbox is not
    /// yet visible and the one where a paused sandbox cannot be resumed yet.
    /// The returned session is borrowed and never killed on drop.
    pub async fn connect_with_timeout(
        &self,
        sandbox_id: &str,
        timeout: Duration,
    ) -> SessionResult<Session> {
        let executor = RetryExecutor::new(self.retry.connect.clone());
        let service = &self.service;

        let retried = executor
            .execute(&self.classifier, || service.connect(sandbox_id, timeout))
            .await
            .map_err(|e| SessionError::retry("connect", e))?;

        let attempts = retried.attempts;
        let outcome = retried.into_inner();
        let state = if outcome.resumed {
            SessionState::Resumed
        } else {
            SessionState::Running
        };
        info!(sandbox_id, %state, attempts, "Connected to sandbox");

        // connect only resumes; the lifetime is re-armed explicitly
        if let Err(e) = self.service.set_timeout(sandbox_id, timeout).await {
            warn!(sandbox_id, "Failed to re-arm sandbox timeout: {}", e);
        }

        Ok(Session::new(
            outcome.sandbox,
            state,
            Ownership::Borrowed,
            Arc::clone(&self.service),
            self.retry.kill.clone(),
        ))
    }

    /// Pause a session
    ///
    /// A fresh sandbox answers not-found until it becomes pausable; that is
    /// retried under the `pause` policy and only surfaces once the budget is
    /// spent. Pausing a paused session does nothing.
    pub async fn pause(&self, session: &mut Session) -> SessionResult<()> {
        session.ensure_alive("pause")?;
        if session.state() == SessionState::Paused {
            debug!(sandbox_id = %session.id(), "Session already paused");
            return Ok(());
        }

        let executor = RetryExecutor::new(self.retry.pause.clone());
        let service = &self.service;
        let sandbox_id = session.id();

        let retried = executor
            .execute(&self.classifier, || service.pause(sandbox_id))
            .await
            .map_err(|e| SessionError::retry("pause", e))?;

        info!(
            sandbox_id = %session.id(),
            attempts = retried.attempts,
            "Sandbox paused after {:.2?}",
            retried.elapsed
        );
        session.set_state(SessionState::Paused);
        Ok(())
    }

    /// Kill a session; see [`Session::kill`]
    pub async fn kill(&self, session: &mut Session) -> SessionResult<()> {
        session.kill().await
    }

    /// Run `operation` under the time-bounded `probe` policy
    ///
    /// Never fails: the outcome, attempt count and time to first success
    /// are reported in the [`ProbeResult`].
    pub async fn readiness_probe<T, F, Fut>(&self, name: &str, operation: F) -> ProbeResult
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SessionResult<T>>,
    {
        self.probe_with_policy(name, &self.retry.probe, operation)
            .await
    }

    /// Run `operation` as a probe under an explicit policy
    pub async fn probe_with_policy<T, F, Fut>(
        &self,
        name: &str,
        policy: &RetryPolicy,
        operation: F,
    ) -> ProbeResult
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SessionResult<T>>,
    {
        let executor = RetryExecutor::new(policy.clone());
        let result = match executor
            .execute(&SessionErrorClassifier::default(), operation)
            .await
        {
            Ok(retried) => ProbeResult::passed(name, retried.attempts, retried.elapsed),
            Err(e) => ProbeResult::failed(name, e.attempts(), e.last_error().to_string()),
        };

        info!(probe = name, ok = result.ok, attempts = result.attempts, "{}", result);
        result
    }

    /// Create a session, run `f` on it and always kill it afterwards
    ///
    /// The error from `f` takes precedence over a failed kill.
    pub async fn scoped<T, F>(&self, template: &str, f: F) -> SessionResult<T>
    where
        F: for<'a> FnOnce(&'a mut Session) -> BoxFuture<'a, SessionResult<T>>,
    {
        let mut session = self.create(template, &self.create_options()).await?;
        let outcome = f(&mut session).await;
        let killed = session.kill().await;

        let value = outcome?;
        killed?;
        Ok(value)
    }
}
