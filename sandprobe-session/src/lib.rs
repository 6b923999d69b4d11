//! Sandbox sessions for sandprobe
//!
//! A [`Session`] is a local handle to one remote sandbox. The
//! [`SessionLifecycle`] creates, connects, pauses and kills sessions under
//! the configured retry policies, and the probe, stream, scenario and fleet
//! modules build readiness checks and load runs on top of it.

pub mod error;
pub mod fleet;
pub mod probe;
pub mod scenario;
pub mod session;
pub mod stream;

// Re-export main types for convenience
pub use error::{SessionError, SessionErrorClassifier, SessionResult};
pub use fleet::{
    concurrent_create, kill_all, DurationStats, KillReport, LoadPlan, LoadReport, SandboxRecord,
    TemplateStats, DEFAULT_MAX_WAIT, READY_POLL_INTERVAL,
};
pub use probe::{
    probe_command, probe_connect_after_pause, probe_file_round_trip, probe_info, probe_pause,
    readiness_suite, ProbeResult, ReadinessCase, READY_COMMAND,
};
pub use scenario::{
    create_and_inspect, resume_round_trip, tail_reconnect, tail_soak, InspectReport,
    ResourceSample, ResumeReport, SoakReport, SoakRound, TailReport,
};
pub use session::{Ownership, Session, SessionLifecycle, SessionState};
pub use stream::{AttachState, StreamHandle, StreamReconnect};
