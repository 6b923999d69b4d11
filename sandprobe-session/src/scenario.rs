//! End-to-end checks built from the lifecycle and stream primitives

use crate::error::{SessionError, SessionResult};
use crate::session::{Session, SessionLifecycle, SessionState};
use crate::stream::StreamReconnect;
use chrono::Utc;
use sandprobe_client::{CommandOptions, CommandResult};
use serde::Serialize;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub const RESUME_CHECK_PATH: &str = "/tmp/resume-check.txt";
pub const HEARTBEAT_COMMAND: &str =
    "bash -lc 'while true; do echo tail-heartbeat; sleep 1; done'";
pub const RECONNECT_PROBE_COMMAND: &str = "bash -lc 'echo reconnect-ok'";
pub const INSPECT_COMMAND: &str = "ls -l /home/user";

pub const SOAK_LOG_PATH: &str = "/tmp/test.log";
pub const SOAK_TAIL_COMMAND: &str = "bash -lc 'tail -f /tmp/test.log'";
pub const SOAK_WRITER_COMMAND: &str =
    "bash -lc 'while true; do echo \"$(date) - log line\" >> /tmp/test.log; sleep 0.5; done'";
/// Ordinary commands run in turn while the tail is attached
pub const SOAK_COMMANDS: [&str; 4] = [
    "ls -l /tmp",
    "ps aux | grep tail",
    "cat /proc/meminfo | head -5",
    "df -h",
];
pub const SOAK_COMMANDS_PER_ROUND: usize = 10;
pub const LIVENESS_COMMAND: &str = "echo 'shell is alive'";

const SOAK_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);
const SAMPLE_TIMEOUT: Duration = Duration::from_secs(5);
const SOAK_COMMAND_INTERVAL: Duration = Duration::from_secs(1);
/// How long the tail stays detached before reconnecting
const SOAK_DETACH_PAUSE: Duration = Duration::from_secs(5);

/// Outcome of [`resume_round_trip`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumeReport {
    pub sandbox_id: String,
    /// Connect found the sandbox paused and resumed it
    pub resumed: bool,
    pub payload: String,
    /// Attempts the read-back took
    pub read_attempts: u32,
}

/// Outcome of [`tail_reconnect`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TailReport {
    pub sandbox_id: String,
    pub pid: u32,
    pub reconnect_stdout: String,
    /// Heartbeat lines received before the first disconnect
    pub lines_before_disconnect: Vec<String>,
    /// Heartbeat lines received on the reattached stream
    pub lines_after_reattach: Vec<String>,
}

/// Outcome of [`create_and_inspect`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InspectReport {
    pub sandbox_id: String,
    pub listing: CommandResult,
    /// The sandbox was left running
    pub kept: bool,
}

/// Resource counts inside a sandbox; `None` where a count could not be read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceSample {
    /// Commands completed in the round when the sample was taken
    pub after_command: usize,
    pub open_fds: Option<u32>,
    pub processes: Option<u32>,
    pub sockets: Option<u32>,
}

/// One round of [`tail_soak`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SoakRound {
    pub round: usize,
    pub sandbox_id: String,
    pub tail_pid: u32,
    pub writer_pid: u32,
    pub commands_run: usize,
    pub samples: Vec<ResourceSample>,
    pub liveness_stdout: String,
}

/// Outcome of [`tail_soak`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SoakReport {
    pub rounds: Vec<SoakRound>,
}

/// Reconnect to an existing sandbox and verify its filesystem works
///
/// Optionally pauses it first. Connecting resumes a paused sandbox; a
/// timestamped payload is then written and read back under the `read`
/// policy. The sandbox is left running for later runs to reuse.
pub async fn resume_round_trip(
    lifecycle: &SessionLifecycle,
    sandbox_id: &str,
    pause_first: bool,
) -> SessionResult<ResumeReport> {
    if pause_first {
        let mut session = lifecycle.connect(sandbox_id).await?;
        lifecycle.pause(&mut session).await?;
    }

    let session = lifecycle.connect(sandbox_id).await?;
    let resumed = session.state() == SessionState::Resumed;

    let payload = format!("hello-resume-{}", Utc::now().timestamp());
    session.write_file(RESUME_CHECK_PATH, &payload).await?;

    let read_policy = &lifecycle.retry_config().read;
    let read = session
        .read_file_retried(RESUME_CHECK_PATH, read_policy)
        .await?;
    let read_attempts = read.attempts;
    let actual = String::from_utf8_lossy(&read.value).into_owned();
    if actual != payload {
        return Err(SessionError::Mismatch {
            path: RESUME_CHECK_PATH.to_string(),
            expected: payload,
            actual,
        });
    }

    info!(sandbox_id, resumed, "Resume round trip verified");
    Ok(ResumeReport {
        sandbox_id: sandbox_id.to_string(),
        resumed,
        payload,
        read_attempts,
    })
}

/// Detach from and reattach to a long running process across a reconnect
///
/// Creates a sandbox, starts a heartbeat loop, waits until it is listed,
/// disconnects, reconnects to the sandbox by id, checks a command still
/// runs, reattaches to the heartbeat, then kills the process. The sandbox
/// is killed on every path.
pub async fn tail_reconnect(lifecycle: &SessionLifecycle, template: &str) -> SessionResult<TailReport> {
    let streams = StreamReconnect::from_lifecycle(lifecycle);
    let mut session = lifecycle
        .create(template, &lifecycle.create_options())
        .await?;

    let outcome = tail_reconnect_steps(lifecycle, &streams, &session).await;
    let killed = session.kill().await;
    if let Err(ref e) = killed {
        warn!(sandbox_id = %session.id(), "Failed to kill sandbox after tail check: {}", e);
    }

    let report = outcome?;
    killed?;
    Ok(report)
}

async fn tail_reconnect_steps(
    lifecycle: &SessionLifecycle,
    streams: &StreamReconnect,
    session: &Session,
) -> SessionResult<TailReport> {
    let mut handle = streams.start(session, HEARTBEAT_COMMAND).await?;
    let pid = handle.pid();
    streams.wait_until_visible(session, pid).await?;

    let lines_before_disconnect = handle.drain_lines();
    streams.disconnect(&mut handle);

    let reconnected = lifecycle.connect(session.id()).await?;
    let probe = reconnected.run_command(RECONNECT_PROBE_COMMAND).await?;
    if !probe.is_success() || !probe.stdout.contains("reconnect-ok") {
        return Err(SessionError::Unready(format!(
            "reconnect probe exit_code={} stdout={:?}",
            probe.exit_code, probe.stdout
        )));
    }

    let mut reattached = streams
        .reattach(&reconnected, pid, streams.connect_timeout())
        .await?;
    let lines_after_reattach = reattached.drain_lines();
    streams.disconnect(&mut reattached);
    streams.kill(&reconnected, pid).await?;

    info!(sandbox_id = %session.id(), pid, "Tail reconnect verified");
    Ok(TailReport {
        sandbox_id: session.id().to_string(),
        pid,
        reconnect_stdout: probe.stdout,
        lines_before_disconnect,
        lines_after_reattach,
    })
}

/// Create a sandbox and list the user's home directory
///
/// With `keep` the sandbox is left running so a later
/// [`resume_round_trip`] can reconnect to it by id; otherwise it is killed.
/// A failed listing kills the sandbox either way.
pub async fn create_and_inspect(
    lifecycle: &SessionLifecycle,
    template: &str,
    keep: bool,
) -> SessionResult<InspectReport> {
    let mut session = lifecycle
        .create(template, &lifecycle.create_options())
        .await?;

    let listing = match session.run_command(INSPECT_COMMAND).await {
        Ok(listing) => listing,
        Err(e) => {
            if let Err(kill_error) = session.kill().await {
                warn!(
                    sandbox_id = %session.id(),
                    "Failed to kill sandbox after listing failed: {}", kill_error
                );
            }
            return Err(e);
        }
    };

    if keep {
        session.release();
        info!(sandbox_id = %session.id(), template, "Created sandbox kept for later runs");
    } else {
        session.kill().await?;
    }
    Ok(InspectReport {
        sandbox_id: session.id().to_string(),
        listing,
        kept: keep,
    })
}

/// Repeatedly stress a tailed log across disconnects
///
/// Each round creates a sandbox, tails a log file while a second process
/// appends to it, runs a series of ordinary commands with periodic resource
/// samples, then detaches the tail, waits, reconnects and checks the shell
/// still answers before killing both processes. Each round's sandbox is
/// killed whatever happens, and the first failed round ends the soak.
pub async fn tail_soak(
    lifecycle: &SessionLifecycle,
    template: &str,
    rounds: usize,
) -> SessionResult<SoakReport> {
    let streams = StreamReconnect::from_lifecycle(lifecycle);
    let mut report = SoakReport::default();

    for round in 1..=rounds {
        info!(round, rounds, template, "Starting soak round");
        let mut session = lifecycle
            .create(template, &lifecycle.create_options())
            .await?;

        let outcome = soak_round(lifecycle, &streams, &session, round).await;
        let killed = session.kill().await;
        if let Err(ref e) = killed {
            warn!(
                sandbox_id = %session.id(),
                round,
                "Failed to kill sandbox after soak round: {}", e
            );
        }

        let finished = outcome?;
        killed?;
        report.rounds.push(finished);
    }

    info!(rounds = report.rounds.len(), "Soak finished without a stuck shell");
    Ok(report)
}

async fn soak_round(
    lifecycle: &SessionLifecycle,
    streams: &StreamReconnect,
    session: &Session,
    round: usize,
) -> SessionResult<SoakRound> {
    let prepare = format!("touch {log} && chmod 777 {log}", log = SOAK_LOG_PATH);
    expect_success(session, &prepare, SOAK_COMMAND_TIMEOUT, "prepare log file").await?;

    let mut tail = streams.start(session, SOAK_TAIL_COMMAND).await?;
    let writer = streams.start(session, SOAK_WRITER_COMMAND).await?;
    let (tail_pid, writer_pid) = (tail.pid(), writer.pid());
    streams.wait_until_visible(session, tail_pid).await?;
    debug!(sandbox_id = %session.id(), tail_pid, writer_pid, "Tail and writer running");

    let mut samples = Vec::new();
    for i in 0..SOAK_COMMANDS_PER_ROUND {
        let command = SOAK_COMMANDS[i % SOAK_COMMANDS.len()];
        let step = format!("command {} ({})", i + 1, command);
        expect_success(session, command, SOAK_COMMAND_TIMEOUT, &step).await?;

        if i % 2 == 0 {
            samples.push(sample_resources(session, i + 1).await);
        }
        sleep(SOAK_COMMAND_INTERVAL).await;
    }

    streams.disconnect(&mut tail);
    sleep(SOAK_DETACH_PAUSE).await;

    let reconnected = lifecycle.connect(session.id()).await?;
    let alive =
        expect_success(&reconnected, LIVENESS_COMMAND, SAMPLE_TIMEOUT, "liveness check").await?;
    if !alive.stdout.contains("shell is alive") {
        return Err(SessionError::Unready(format!(
            "shell unresponsive after reconnect, stdout={:?}",
            alive.stdout
        )));
    }

    streams.kill(&reconnected, tail_pid).await?;
    streams.kill(&reconnected, writer_pid).await?;

    info!(sandbox_id = %session.id(), round, samples = samples.len(), "Soak round passed");
    Ok(SoakRound {
        round,
        sandbox_id: session.id().to_string(),
        tail_pid,
        writer_pid,
        commands_run: SOAK_COMMANDS_PER_ROUND,
        samples,
        liveness_stdout: alive.stdout,
    })
}

/// Run a command that must exit 0; any failure means the shell is stuck
async fn expect_success(
    session: &Session,
    command: &str,
    timeout: Duration,
    step: &str,
) -> SessionResult<CommandResult> {
    let result = session
        .run_command_with(command, &CommandOptions::with_timeout(timeout))
        .await
        .map_err(|e| SessionError::Unready(format!("shell stuck at {}: {}", step, e)))?;

    if !result.is_success() {
        return Err(SessionError::Unready(format!(
            "shell stuck at {}: exit_code={} stderr={:?}",
            step, result.exit_code, result.stderr
        )));
    }
    Ok(result)
}

/// Count open descriptors, processes and sockets; failures are logged only
async fn sample_resources(session: &Session, after_command: usize) -> ResourceSample {
    let sample = ResourceSample {
        after_command,
        open_fds: count_lines(session, "ls /proc/self/fd | wc -l").await,
        processes: count_lines(session, "ps aux | wc -l").await,
        sockets: count_lines(session, "ss -tuln | wc -l").await,
    };
    debug!(
        sandbox_id = %session.id(),
        open_fds = ?sample.open_fds,
        processes = ?sample.processes,
        sockets = ?sample.sockets,
        "Resource sample"
    );
    sample
}

async fn count_lines(session: &Session, command: &str) -> Option<u32> {
    match session
        .run_command_with(command, &CommandOptions::with_timeout(SAMPLE_TIMEOUT))
        .await
    {
        Ok(result) if result.is_success() => result.stdout.trim().parse().ok(),
        Ok(result) => {
            warn!(command, exit_code = result.exit_code, "Resource sample failed");
            None
        }
        Err(e) => {
            warn!(command, "Resource sample failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandprobe_client::{
        ControlPlane, Operation, SandboxState, ServiceError, SimulatedService, SimulationProfile,
    };
    use sandprobe_config::SandprobeConfig;
    use std::sync::Arc;

    fn setup(profile: SimulationProfile) -> (Arc<SimulatedService>, SessionLifecycle) {
        let service = Arc::new(SimulatedService::new(profile));
        let lifecycle = SessionLifecycle::new(service.clone(), &SandprobeConfig::default());
        (service, lifecycle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_round_trip_with_pause() {
        let (service, lifecycle) = setup(SimulationProfile {
            pause_lag: 2,
            resume_conflicts: 1,
            ..Default::default()
        });
        let mut owner = lifecycle.create_default().await.unwrap();
        let id = owner.id().to_string();

        service.fail_next(
            Operation::ReadFile,
            ServiceError::untagged("ReadTimeout", "Read timed out"),
        );
        let report = resume_round_trip(&lifecycle, &id, true).await.unwrap();

        assert!(report.resumed);
        assert!(report.payload.starts_with("hello-resume-"));
        assert_eq!(report.read_attempts, 2);
        assert_eq!(service.sandbox_state(&id), Some(SandboxState::Running));
        owner.kill().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_round_trip_without_pause() {
        let (service, lifecycle) = setup(SimulationProfile::default());
        let mut owner = lifecycle.create_default().await.unwrap();

        let report = resume_round_trip(&lifecycle, owner.id(), false).await.unwrap();
        assert!(!report.resumed);
        assert_eq!(report.read_attempts, 1);
        assert_eq!(service.call_count(Operation::Pause), 0);
        owner.kill().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_round_trip_surfaces_write_failure() {
        let (service, lifecycle) = setup(SimulationProfile::default());
        let mut owner = lifecycle.create_default().await.unwrap();
        service.fail_next(Operation::WriteFile, ServiceError::Timeout("write".into()));

        let err = resume_round_trip(&lifecycle, owner.id(), false).await.unwrap_err();
        assert!(matches!(err, SessionError::Service(ServiceError::Timeout(_))));
        owner.kill().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tail_reconnect_kills_everything() {
        let (service, lifecycle) = setup(SimulationProfile {
            visibility_lag: 1,
            process_visibility_lag: 2,
            ..Default::default()
        });

        let report = tail_reconnect(&lifecycle, "base").await.unwrap();
        assert_eq!(report.reconnect_stdout, "reconnect-ok\n");
        assert_eq!(service.call_count(Operation::ConnectProcess), 1);
        assert_eq!(service.call_count(Operation::KillProcess), 1);
        assert_eq!(service.sandbox_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tail_reconnect_kills_sandbox_on_failure() {
        let (service, lifecycle) = setup(SimulationProfile::default());
        service.fail_next(
            Operation::StartProcess,
            ServiceError::InvalidArgument("command rejected".into()),
        );

        let err = tail_reconnect(&lifecycle, "base").await.unwrap_err();
        assert!(matches!(err, SessionError::Service(ServiceError::InvalidArgument(_))));
        assert_eq!(service.call_count(Operation::Kill), 1);
        assert_eq!(service.sandbox_count(), 0);
    }

    fn inspecting_service() -> Arc<SimulatedService> {
        let service = SimulatedService::default().with_command_handler(|cmd| CommandResult {
            exit_code: 0,
            stdout: format!("total 0\n# {}\n", cmd),
            stderr: String::new(),
        });
        Arc::new(service)
    }

    #[tokio::test]
    async fn test_create_and_inspect() {
        let service = inspecting_service();
        let lifecycle = SessionLifecycle::new(service.clone(), &SandprobeConfig::default());

        let report = create_and_inspect(&lifecycle, "base", false).await.unwrap();
        assert!(report.listing.stdout.contains("# ls -l /home/user"));
        assert!(!report.kept);
        assert_eq!(service.sandbox_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_and_inspect_keeps_sandbox_for_resume() {
        let service = inspecting_service();
        let lifecycle = SessionLifecycle::new(service.clone(), &SandprobeConfig::default());

        let report = create_and_inspect(&lifecycle, "base", true).await.unwrap();
        assert!(report.kept);
        tokio::task::yield_now().await;
        assert_eq!(service.sandbox_state(&report.sandbox_id), Some(SandboxState::Running));
        assert_eq!(service.call_count(Operation::Kill), 0);

        let resumed = resume_round_trip(&lifecycle, &report.sandbox_id, true).await.unwrap();
        assert!(resumed.resumed);
        service.kill(&report.sandbox_id).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tail_soak_rounds() {
        let (service, lifecycle) = setup(SimulationProfile {
            process_visibility_lag: 1,
            ..Default::default()
        });

        let report = tail_soak(&lifecycle, "base", 2).await.unwrap();
        assert_eq!(report.rounds.len(), 2);
        for round in &report.rounds {
            assert_eq!(round.commands_run, SOAK_COMMANDS_PER_ROUND);
            assert_eq!(round.samples.len(), SOAK_COMMANDS_PER_ROUND / 2);
            assert_ne!(round.tail_pid, round.writer_pid);
            assert_eq!(round.liveness_stdout, "shell is alive\n");
        }
        assert_ne!(report.rounds[0].sandbox_id, report.rounds[1].sandbox_id);
        assert_eq!(service.call_count(Operation::KillProcess), 4);
        assert_eq!(service.sandbox_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tail_soak_stops_on_stuck_shell() {
        let service = Arc::new(SimulatedService::default().with_command_handler(|cmd| {
            let exit_code = if cmd == "df -h" { 124 } else { 0 };
            CommandResult {
                exit_code,
                stdout: String::new(),
                stderr: String::new(),
            }
        }));
        let lifecycle = SessionLifecycle::new(service.clone(), &SandprobeConfig::default());

        let err = tail_soak(&lifecycle, "base", 3).await.unwrap_err();
        assert!(matches!(err, SessionError::Unready(ref m) if m.contains("command 4 (df -h)")));
        assert_eq!(service.call_count(Operation::Create), 1);
        assert_eq!(service.sandbox_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resource_samples_parse_counts() {
        let service = Arc::new(SimulatedService::default().with_command_handler(|cmd| {
            let stdout = match cmd {
                "ls /proc/self/fd | wc -l" => "12\n",
                "ps aux | wc -l" => "  7\n",
                _ => "n/a\n",
            };
            CommandResult {
                exit_code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            }
        }));
        let lifecycle = SessionLifecycle::new(service.clone(), &SandprobeConfig::default());
        let mut session = lifecycle.create_default().await.unwrap();

        let sample = sample_resources(&session, 3).await;
        assert_eq!(
            sample,
            ResourceSample {
                after_command: 3,
                open_fds: Some(12),
                processes: Some(7),
                sockets: None,
            }
        );
        session.kill().await.unwrap();
    }
}
