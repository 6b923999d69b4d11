//! Readiness probes
//!
//! A probe exercises one capability of a sandbox (status fetch, command,
//! file I/O, pause, reconnect) under the time-bounded probe policy and
//! reports how long the capability took to first succeed.

use crate::error::{SessionError, SessionResult};
use crate::session::{Session, SessionLifecycle, SessionState};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::warn;

pub const READY_COMMAND: &str = "bash -lc 'echo ready'";
const PROBE_FILE: &str = "/tmp/sandprobe-probe.txt";
const PROBE_CONTENT: &str = "ok";

/// Outcome of one probe invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub name: String,
    pub ok: bool,
    /// Time from the first attempt to the first success
    pub first_success_elapsed: Option<Duration>,
    /// Attempts made, always at least 1
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl ProbeResult {
    pub fn passed(name: impl Into<String>, attempts: u32, elapsed: Duration) -> Self {
        Self {
            name: name.into(),
            ok: true,
            first_success_elapsed: Some(elapsed),
            attempts: attempts.max(1),
            last_error: None,
        }
    }

    pub fn failed(name: impl Into<String>, attempts: u32, last_error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: false,
            first_success_elapsed: None,
            attempts: attempts.max(1),
            last_error: Some(last_error.into()),
        }
    }
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ok {
            let elapsed = self.first_success_elapsed.unwrap_or_default();
            write!(
                f,
                "[PASS] {} first_ok={:.2}s attempts={}",
                self.name,
                elapsed.as_secs_f64(),
                self.attempts
            )
        } else {
            write!(
                f,
                "[FAIL] {} attempts={} last_error={}",
                self.name,
                self.attempts,
                self.last_error.as_deref().unwrap_or("unknown")
            )
        }
    }
}

/// Probe that fetches the sandbox status
pub async fn probe_info(lifecycle: &SessionLifecycle, session: &Session) -> ProbeResult {
    lifecycle
        .readiness_probe("info", move || session.info())
        .await
}

/// Probe that runs `echo ready` and checks its output
pub async fn probe_command(lifecycle: &SessionLifecycle, session: &Session) -> ProbeResult {
    lifecycle
        .readiness_probe("command", move || async move {
            let result = session.run_command(READY_COMMAND).await?;
            if !result.is_success() || !result.stdout.contains("ready") {
                return Err(SessionError::Unready(format!(
                    "exit_code={} stdout={:?}",
                    result.exit_code, result.stdout
                )));
            }
            Ok(())
        })
        .await
}

/// Probe that writes a file and reads it back
pub async fn probe_file_round_trip(lifecycle: &SessionLifecycle, session: &Session) -> ProbeResult {
    lifecycle
        .readiness_probe("file_round_trip", move || async move {
            session.write_file(PROBE_FILE, PROBE_CONTENT).await?;
            let content = session.read_text(PROBE_FILE).await?;
            if content != PROBE_CONTENT {
                return Err(SessionError::Unready(format!(
                    "read back {:?} instead of {:?}",
                    content, PROBE_CONTENT
                )));
            }
            Ok(())
        })
        .await
}

/// Probe that pauses the sandbox
pub async fn probe_pause(lifecycle: &SessionLifecycle, session: &mut Session) -> ProbeResult {
    let result = {
        let target: &Session = session;
        lifecycle
            .readiness_probe("pause", move || pause_once(target))
            .await
    };

    if result.ok {
        session.set_state(SessionState::Paused);
    }
    result
}

/// Probe that pauses the sandbox, then reconnects to it by id
///
/// The pause runs under the regular pause policy; only the reconnect is
/// timed.
pub async fn probe_connect_after_pause(
    lifecycle: &SessionLifecycle,
    session: &mut Session,
) -> ProbeResult {
    const NAME: &str = "connect_after_pause";

    if let Err(e) = lifecycle.pause(session).await {
        return ProbeResult::failed(NAME, e.attempts(), e.to_string());
    }

    let sandbox_id = session.id().to_string();
    let sandbox_id = sandbox_id.as_str();
    let timeout = lifecycle.defaults().connect_timeout;
    let service = lifecycle.service();
    let result = lifecycle
        .readiness_probe(NAME, move || async move {
            Ok::<_, SessionError>(service.connect(sandbox_id, timeout).await?)
        })
        .await;

    if result.ok {
        session.set_state(SessionState::Resumed);
    }
    result
}

async fn pause_once(session: &Session) -> SessionResult<()> {
    session.ensure_alive("pause")?;
    Ok(session.service().pause(session.id()).await?)
}

/// Built-in readiness checks, each run against a fresh sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessCase {
    Info,
    Command,
    FileRoundTrip,
    Pause,
    ConnectAfterPause,
}

impl ReadinessCase {
    pub const ALL: [ReadinessCase; 5] = [
        ReadinessCase::Info,
        ReadinessCase::Command,
        ReadinessCase::FileRoundTrip,
        ReadinessCase::Pause,
        ReadinessCase::ConnectAfterPause,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ReadinessCase::Info => "info",
            ReadinessCase::Command => "command",
            ReadinessCase::FileRoundTrip => "file_round_trip",
            ReadinessCase::Pause => "pause",
            ReadinessCase::ConnectAfterPause => "connect_after_pause",
        }
    }

    async fn run(self, lifecycle: &SessionLifecycle, session: &mut Session) -> ProbeResult {
        match self {
            ReadinessCase::Info => probe_info(lifecycle, session).await,
            ReadinessCase::Command => probe_command(lifecycle, session).await,
            ReadinessCase::FileRoundTrip => probe_file_round_trip(lifecycle, session).await,
            ReadinessCase::Pause => probe_pause(lifecycle, session).await,
            ReadinessCase::ConnectAfterPause => probe_connect_after_pause(lifecycle, session).await,
        }
    }
}

/// Run every readiness case on its own fresh sandbox
///
/// Each sandbox is killed whatever the probe outcome. A sandbox that cannot
/// be created yields a failed result for that case.
pub async fn readiness_suite(lifecycle: &SessionLifecycle, template: &str) -> Vec<ProbeResult> {
    let mut results = Vec::with_capacity(ReadinessCase::ALL.len());
    let options = lifecycle.create_options();

    for case in ReadinessCase::ALL {
        let mut session = match lifecycle.create(template, &options).await {
            Ok(session) => session,
            Err(e) => {
                results.push(ProbeResult::failed(
                    case.name(),
                    e.attempts(),
                    format!("create failed: {}", e),
                ));
                continue;
            }
        };

        let result = case.run(lifecycle, &mut session).await;
        if let Err(e) = session.kill().await {
            warn!(sandbox_id = %session.id(), probe = case.name(), "Cleanup kill failed: {}", e);
        }
        results.push(result);
    }

    results
}
