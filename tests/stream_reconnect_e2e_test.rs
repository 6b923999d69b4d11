//! Background process detach/reattach across sandbox reconnects

use anyhow::Result;
use sandprobe_client::{
    ControlPlane, Operation, ServiceError, SimulatedService, SimulationProfile,
};
use sandprobe_config::SandprobeConfig;
use sandprobe_session::{
    create_and_inspect, resume_round_trip, tail_reconnect, tail_soak, AttachState, SessionError,
    SessionLifecycle, StreamReconnect,
};
use std::sync::Arc;

const HEARTBEAT: &str = "bash -lc 'while true; do echo tail-heartbeat; sleep 1; done'";

fn setup(profile: SimulationProfile) -> (Arc<SimulatedService>, SessionLifecycle) {
    let _ = sandprobe_logging::init_simple_tracing("warn");
    let service = Arc::new(SimulatedService::new(profile));
    let lifecycle = SessionLifecycle::new(service.clone(), &SandprobeConfig::default());
    (service, lifecycle)
}

#[tokio::test(start_paused = true)]
async fn test_tail_reconnect_scenario() -> Result<()> {
    let (service, lifecycle) = setup(SimulationProfile {
        visibility_lag: 2,
        process_visibility_lag: 3,
        ..Default::default()
    });

    let report = tail_reconnect(&lifecycle, "base").await?;
    assert_eq!(report.reconnect_stdout, "reconnect-ok\n");
    assert!(report.pid > 0);
    assert_eq!(service.call_count(Operation::ListProcesses), 4);
    assert_eq!(service.sandbox_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_output_flows_only_while_attached() -> Result<()> {
    let (service, lifecycle) = setup(SimulationProfile::default());
    let streams = StreamReconnect::from_lifecycle(&lifecycle);
    let mut session = lifecycle.create_default().await?;

    let mut handle = streams.start(&session, HEARTBEAT).await?;
    let pid = handle.pid();
    streams.wait_until_visible(&session, pid).await?;

    assert_eq!(service.emit_output(session.id(), pid, "beat-1"), 1);
    assert_eq!(handle.next_line().await.as_deref(), Some("beat-1"));

    streams.disconnect(&mut handle);
    assert_eq!(handle.attach_state(), AttachState::Detached);
    assert_eq!(service.emit_output(session.id(), pid, "beat-lost"), 0);

    // a foreground command still works while the heartbeat runs detached
    let echo = session.run_command("bash -lc 'echo x'").await?;
    assert!(echo.is_success());
    assert_eq!(echo.stdout, "x\n");

    let other = lifecycle.connect(session.id()).await?;
    let mut reattached = streams
        .reattach(&other, pid, streams.connect_timeout())
        .await?;
    service.emit_output(session.id(), pid, "beat-2");
    assert_eq!(reattached.drain_lines(), vec!["beat-2".to_string()]);

    let running = streams.list_running(&other).await?;
    assert!(running.contains(&pid));

    streams.kill(&other, pid).await?;
    assert!(!service.is_process_running(session.id(), pid));
    assert!(streams.list_running(&other).await?.is_empty());

    session.kill().await?;
    Ok(())
}

#[tokio::test]
async fn test_create_and_inspect_cleans_up() -> Result<()> {
    let (service, lifecycle) = setup(SimulationProfile::default());

    let report = create_and_inspect(&lifecycle, "base", false).await?;
    assert!(report.listing.is_success());
    assert!(report.sandbox_id.starts_with("sbx"));
    assert_eq!(service.sandbox_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_kept_sandbox_is_resumed_by_a_later_run() -> Result<()> {
    let (service, lifecycle) = setup(SimulationProfile {
        resume_conflicts: 1,
        ..Default::default()
    });

    let created = create_and_inspect(&lifecycle, "base", true).await?;
    assert!(created.kept);
    assert_eq!(service.sandbox_count(), 1);

    let report = resume_round_trip(&lifecycle, &created.sandbox_id, true).await?;
    assert!(report.resumed);

    service.kill(&created.sandbox_id).await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_tail_soak_survives_repeated_reconnects() -> Result<()> {
    let (service, lifecycle) = setup(SimulationProfile {
        visibility_lag: 1,
        process_visibility_lag: 2,
        ..Default::default()
    });

    let report = tail_soak(&lifecycle, "base", 3).await?;
    assert_eq!(report.rounds.len(), 3);
    for (i, round) in report.rounds.iter().enumerate() {
        assert_eq!(round.round, i + 1);
        assert_eq!(round.samples.len(), 5);
        assert_eq!(round.samples[0].after_command, 1);
        assert!(round.liveness_stdout.contains("shell is alive"));
    }
    assert_eq!(service.call_count(Operation::Create), 3);
    assert_eq!(service.call_count(Operation::KillProcess), 6);
    assert_eq!(service.sandbox_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_tail_soak_kills_sandbox_when_reconnect_fails() -> Result<()> {
    let (service, lifecycle) = setup(SimulationProfile::default());
    service.fail_next(Operation::Connect, ServiceError::Unauthorized("key revoked".into()));

    let err = tail_soak(&lifecycle, "base", 2).await.unwrap_err();
    assert!(matches!(err, SessionError::Retry { operation: "connect", .. }));
    assert_eq!(service.call_count(Operation::Create), 1);
    assert_eq!(service.sandbox_count(), 0);
    Ok(())
}
