//! Background process streams that survive disconnects
//!
//! A [`StreamHandle`] is a weak reference to a process inside a sandbox.
//! Detaching drops the local output stream but leaves the process running,
//! and [`StreamReconnect::reattach`] finds it again by pid, possibly from a
//! different [`Session`] connected to the same sandbox.

use crate::error::{SessionError, SessionResult};
use crate::session::{Session, SessionLifecycle};
use sandprobe_client::{ProcessStream, ServiceError, ServiceErrorClassifier};
use sandprobe_config::{RetryConfig, SandboxDefaults};
use sandprobe_resilience::{ErrorClassifier, ErrorKind, RetryExecutor, RetryPolicy};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    Attached,
    Detached,
}

/// Handle to a background process inside a sandbox
#[derive(Debug)]
pub struct StreamHandle {
    pid: u32,
    stream: Option<ProcessStream>,
}

impl StreamHandle {
    fn attached(stream: ProcessStream) -> Self {
        Self {
            pid: stream.pid(),
            stream: Some(stream),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn attach_state(&self) -> AttachState {
        if self.stream.is_some() {
            AttachState::Attached
        } else {
            AttachState::Detached
        }
    }

    pub fn is_attached(&self) -> bool {
        self.stream.is_some()
    }

    /// Wait for the next output line
    ///
    /// Returns `None` when detached or once the process output ends.
    pub async fn next_line(&mut self) -> Option<String> {
        match self.stream.as_mut() {
            Some(stream) => stream.next_line().await,
            None => None,
        }
    }

    /// Drain output that has already arrived
    pub fn drain_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(stream) = self.stream.as_mut() {
            while let Some(line) = stream.try_next_line() {
                lines.push(line);
            }
        }
        lines
    }
}

/// Starts, lists, detaches and reattaches background processes
#[derive(Debug, Clone)]
pub struct StreamReconnect {
    visibility: RetryPolicy,
    reattach: RetryPolicy,
    connect_timeout: Duration,
    classifier: ServiceErrorClassifier,
}

impl StreamReconnect {
    pub fn new(retry: &RetryConfig, defaults: &SandboxDefaults) -> Self {
        Self {
            visibility: retry.visibility.clone(),
            reattach: retry.reattach.clone(),
            connect_timeout: defaults.process_connect_timeout,
            classifier: ServiceErrorClassifier::new(),
        }
    }

    pub fn from_lifecycle(lifecycle: &SessionLifecycle) -> Self {
        Self::new(lifecycle.retry_config(), lifecycle.defaults())
    }

    /// Default timeout for attaching to a running process
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Launch a background command and attach to its output
    pub async fn start(&self, session: &Session, command: &str) -> SessionResult<StreamHandle> {
        session.ensure_alive("start a process in")?;
        let stream = session
            .service()
            .start_process(session.id(), command)
            .await?;

        info!(sandbox_id = %session.id(), pid = stream.pid(), command, "Started background process");
        Ok(StreamHandle::attached(stream))
    }

    /// Pids of the processes currently visible in the sandbox
    ///
    /// Transient failures are retried under the visibility policy.
    pub async fn list_running(&self, session: &Session) -> SessionResult<BTreeSet<u32>> {
        session.ensure_alive("list processes in")?;
        let executor = RetryExecutor::new(self.visibility.clone());
        let service = session.service();
        let sandbox_id = session.id();

        let retried = executor
            .execute(&self.classifier, || service.list_processes(sandbox_id))
            .await
            .map_err(|e| SessionError::retry("list processes", e))?;

        Ok(retried.into_inner().into_iter().map(|p| p.pid).collect())
    }

    /// Poll the process list until `pid` shows up
    ///
    /// A freshly started process may be missing from the list for a while;
    /// absence is reported as not-found and retried under the visibility
    /// policy.
    pub async fn wait_until_visible(&self, session: &Session, pid: u32) -> SessionResult<()> {
        session.ensure_alive("list processes in")?;
        let executor = RetryExecutor::new(self.visibility.clone());
        let service = session.service();
        let sandbox_id = session.id();

        let retried = executor
            .execute(&self.classifier, move || async move {
                let processes = service.list_processes(sandbox_id).await?;
                if processes.iter().any(|p| p.pid == pid) {
                    Ok(())
                } else {
                    Err(ServiceError::NotFound(format!(
                        "process {} not yet listed",
                        pid
                    )))
                }
            })
            .await
            .map_err(|e| SessionError::retry("wait for process", e))?;

        debug!(
            sandbox_id,
            pid,
            attempts = retried.attempts,
            "Process visible after {:.2?}",
            retried.elapsed
        );
        Ok(())
    }

    /// Detach the local stream; the remote process keeps running
    pub fn disconnect(&self, handle: &mut StreamHandle) {
        if handle.stream.take().is_some() {
            info!(pid = handle.pid, "Detached from process stream");
        }
    }

    /// Re-establish a live stream to a still running process
    ///
    /// Retried under the reattach policy.
    pub async fn reattach(
        &self,
        session: &Session,
        pid: u32,
        timeout: Duration,
    ) -> SessionResult<StreamHandle> {
        session.ensure_alive("reattach to a process in")?;
        let executor = RetryExecutor::new(self.reattach.clone());
        let service = session.service();
        let sandbox_id = session.id();

        let retried = executor
            .execute(&self.classifier, || {
                service.connect_process(sandbox_id, pid, timeout)
            })
            .await
            .map_err(|e| SessionError::retry("reattach", e))?;

        info!(
            sandbox_id,
            pid,
            attempts = retried.attempts,
            "Reattached to process stream"
        );
        Ok(StreamHandle::attached(retried.into_inner()))
    }

    /// Terminate a process, whether or not a stream is attached
    ///
    /// A process that is already gone counts as killed.
    pub async fn kill(&self, session: &Session, pid: u32) -> SessionResult<()> {
        session.ensure_alive("kill a process in")?;
        match session.service().kill_process(session.id(), pid).await {
            Ok(()) => {
                info!(sandbox_id = %session.id(), pid, "Killed process");
                Ok(())
            }
            Err(e) if self.classifier.classify(&e) == ErrorKind::NotFound => {
                debug!(sandbox_id = %session.id(), pid, "Process already gone: {}", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandprobe_client::{Operation, SimulatedService, SimulationProfile};
    use sandprobe_config::SandprobeConfig;
    use std::sync::Arc;

    const HEARTBEAT: &str = "bash -lc 'while true; do echo tail-heartbeat; sleep 1; done'";

    fn setup(profile: SimulationProfile) -> (Arc<SimulatedService>, SessionLifecycle, StreamReconnect) {
        let service = Arc::new(SimulatedService::new(profile));
        let lifecycle = SessionLifecycle::new(service.clone(), &SandprobeConfig::default());
        let streams = StreamReconnect::from_lifecycle(&lifecycle);
        (service, lifecycle, streams)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_wait_and_list() {
        let (service, lifecycle, streams) = setup(SimulationProfile {
            process_visibility_lag: 2,
            ..Default::default()
        });
        let mut session = lifecycle.create_default().await.unwrap();

        let handle = streams.start(&session, HEARTBEAT).await.unwrap();
        assert!(handle.is_attached());

        streams.wait_until_visible(&session, handle.pid()).await.unwrap();
        assert_eq!(service.call_count(Operation::ListProcesses), 3);

        let running = streams.list_running(&session).await.unwrap();
        assert!(running.contains(&handle.pid()));
        session.kill().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_visible_gives_up() {
        let (_service, lifecycle, streams) = setup(SimulationProfile::default());
        let mut session = lifecycle.create_default().await.unwrap();

        let err = streams.wait_until_visible(&session, 4242).await.unwrap_err();
        assert_eq!(err.attempts(), 6);
        assert!(err.to_string().contains("not yet listed"));
        session.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_keeps_process_running() {
        let (service, lifecycle, streams) = setup(SimulationProfile::default());
        let mut session = lifecycle.create_default().await.unwrap();

        let mut handle = streams.start(&session, HEARTBEAT).await.unwrap();
        service.emit_output(session.id(), handle.pid(), "tail-heartbeat");
        assert_eq!(handle.drain_lines(), vec!["tail-heartbeat".to_string()]);

        streams.disconnect(&mut handle);
        assert_eq!(handle.attach_state(), AttachState::Detached);
        assert!(handle.next_line().await.is_none());
        assert!(service.is_process_running(session.id(), handle.pid()));
        assert_eq!(service.attached_streams(session.id(), handle.pid()), 0);

        // disconnecting twice is harmless
        streams.disconnect(&mut handle);
        session.kill().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reattach_from_another_session() {
        let (service, lifecycle, streams) = setup(SimulationProfile::default());
        let mut owner = lifecycle.create_default().await.unwrap();

        let mut handle = streams.start(&owner, HEARTBEAT).await.unwrap();
        let pid = handle.pid();
        streams.disconnect(&mut handle);

        let other = lifecycle.connect(owner.id()).await.unwrap();
        service.fail_next(
            Operation::ConnectProcess,
            ServiceError::Timeout("stream handshake timed out".into()),
        );
        let mut again = streams
            .reattach(&other, pid, streams.connect_timeout())
            .await
            .unwrap();
        assert_eq!(again.pid(), pid);
        assert_eq!(again.attach_state(), AttachState::Attached);
        assert_eq!(service.call_count(Operation::ConnectProcess), 2);

        service.emit_output(owner.id(), pid, "after-reattach");
        assert_eq!(again.next_line().await.as_deref(), Some("after-reattach"));

        streams.kill(&other, pid).await.unwrap();
        assert!(!service.is_process_running(owner.id(), pid));
        assert!(again.next_line().await.is_none());

        // killing a gone process is not an error
        streams.kill(&other, pid).await.unwrap();
        owner.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_accepts_untagged_not_found() {
        let (service, lifecycle, streams) = setup(SimulationProfile::default());
        let mut session = lifecycle.create_default().await.unwrap();
        let handle = streams.start(&session, HEARTBEAT).await.unwrap();

        service.fail_next(
            Operation::KillProcess,
            ServiceError::untagged("NotFoundException", "Process was not found"),
        );
        streams.kill(&session, handle.pid()).await.unwrap();
        assert_eq!(service.call_count(Operation::KillProcess), 1);
        session.kill().await.unwrap();
    }
}
