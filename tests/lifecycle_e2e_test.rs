//! End-to-end session lifecycle tests against the in-memory service
//!
//! These drive the public lifecycle surface the way a probe run does:
//! create, pause, reconnect, file I/O and teardown.

use anyhow::Result;
use sandprobe_client::{Operation, SandboxState, ServiceError, SimulatedService, SimulationProfile};
use sandprobe_config::{ConfigLoader, SandprobeConfig};
use sandprobe_resilience::{ErrorClassifier, ErrorKind};
use sandprobe_session::{
    readiness_suite, resume_round_trip, Ownership, SessionError, SessionErrorClassifier,
    SessionLifecycle, SessionState,
};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn lifecycle_with(profile: SimulationProfile) -> (Arc<SimulatedService>, SessionLifecycle) {
    let service = Arc::new(SimulatedService::new(profile));
    let lifecycle = SessionLifecycle::new(service.clone(), &SandprobeConfig::default());
    (service, lifecycle)
}

/// A realistic service: slow to list new sandboxes, refuses early pauses and
/// rejects the first resumes
fn flaky_profile() -> SimulationProfile {
    SimulationProfile {
        visibility_lag: 1,
        pause_lag: 2,
        resume_conflicts: 2,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_create_pause_connect_preserves_files() -> Result<()> {
    let (service, lifecycle) = lifecycle_with(flaky_profile());

    let mut owner = lifecycle.create_default().await?;
    assert_eq!(owner.ownership(), Ownership::Owned);
    assert_eq!(owner.state(), SessionState::Created);

    let payload: Vec<u8> = vec![0, 159, 146, 150, b'\n', 255];
    owner.write_file("/tmp/payload.bin", &payload).await?;

    lifecycle.pause(&mut owner).await?;
    assert_eq!(owner.state(), SessionState::Paused);
    assert_eq!(service.sandbox_state(owner.id()), Some(SandboxState::Paused));
    assert_eq!(service.call_count(Operation::Pause), 4);

    // data plane calls are refused while paused
    let err = owner.read_file("/tmp/payload.bin").await.unwrap_err();
    assert!(matches!(err, SessionError::Service(ServiceError::Conflict(_))));

    let resumed = lifecycle.connect(owner.id()).await?;
    assert_eq!(resumed.state(), SessionState::Resumed);
    assert_eq!(resumed.ownership(), Ownership::Borrowed);
    assert_eq!(service.sandbox_state(owner.id()), Some(SandboxState::Running));

    let read_back = resumed.read_file("/tmp/payload.bin").await?;
    assert_eq!(read_back, payload);

    drop(resumed);
    assert_eq!(service.sandbox_count(), 1, "borrowed session must not kill");

    owner.kill().await?;
    assert_eq!(service.sandbox_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_kill_twice_is_idempotent() -> Result<()> {
    let (service, lifecycle) = lifecycle_with(SimulationProfile::default());

    let mut owner = lifecycle.create_default().await?;
    let mut other = lifecycle.connect(owner.id()).await?;

    owner.kill().await?;
    owner.kill().await?;
    assert!(owner.is_killed());
    assert_eq!(service.call_count(Operation::Kill), 1);

    // the service already forgot the sandbox; the other handle still succeeds
    lifecycle.kill(&mut other).await?;
    assert!(other.is_killed());
    assert_eq!(service.call_count(Operation::Kill), 2);

    let err = owner.run_command("true").await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidState { .. }));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_resume_round_trip_through_flaky_service() -> Result<()> {
    let (service, lifecycle) = lifecycle_with(flaky_profile());
    let mut owner = lifecycle.create_default().await?;
    let id = owner.id().to_string();

    let report = resume_round_trip(&lifecycle, &id, true).await?;
    assert!(report.resumed);
    assert_eq!(report.read_attempts, 1);
    assert_eq!(service.sandbox_state(&id), Some(SandboxState::Running));

    // second run finds it running and does not resume
    let report = resume_round_trip(&lifecycle, &id, false).await?;
    assert!(!report.resumed);

    owner.kill().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_readiness_suite_end_to_end() {
    let (service, lifecycle) = lifecycle_with(flaky_profile());

    let results = readiness_suite(&lifecycle, "base").await;
    assert_eq!(results.len(), 5);
    for result in &results {
        assert!(result.ok, "{}", result);
        assert!(result.to_string().starts_with("[PASS]"));
    }
    assert_eq!(service.sandbox_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_config_file_drives_lifecycle_policies() -> Result<()> {
    let yaml = r#"
sandbox:
  template: python
retry:
  pause:
    max_attempts: 2
    base_delay: 1s
    max_delay: 1s
"#;
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(yaml.as_bytes())?;
    let config = ConfigLoader::new().from_file(file.path())?;

    let service = Arc::new(SimulatedService::new(SimulationProfile {
        pause_lag: 5,
        ..Default::default()
    }));
    let lifecycle = SessionLifecycle::new(service.clone(), &config);

    let mut session = lifecycle.create_default().await?;
    let info = session.info().await?;
    assert_eq!(info.template_id.as_deref(), Some("python"));

    let started = Instant::now();
    let err = lifecycle.pause(&mut session).await.unwrap_err();
    assert_eq!(err.attempts(), 2);
    assert_eq!(started.elapsed(), Duration::from_secs(1));
    assert_eq!(SessionErrorClassifier::default().classify(&err), ErrorKind::NotFound);
    assert_eq!(session.state(), SessionState::Created);

    session.kill().await?;
    Ok(())
}
