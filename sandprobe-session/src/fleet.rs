//! Fleet load checks
//!
//! Creates many sandboxes concurrently, spread across one or more templates,
//! and measures how long each takes to be created and to report ready. Also
//! tears down every sandbox the API key can see.

use futures::stream::{self, StreamExt};
use sandprobe_client::{
    ControlPlane, CreateOptions, SandboxState, ServiceError, ServiceErrorClassifier,
};
use sandprobe_config::SandprobeConfig;
use sandprobe_resilience::{DescribeError, ErrorClassifier, ErrorKind, RetryExecutor, RetryPolicy};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Interval between readiness polls
pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default time a sandbox gets to report ready
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(180);

/// What to create in a load run
#[derive(Debug, Clone, PartialEq)]
pub struct LoadPlan {
    /// Templates to spread the sandboxes across
    pub templates: Vec<String>,
    /// Total number of sandboxes
    pub count: usize,
    /// Consecutive sandboxes assigned to one template before moving to the
    /// next; `None` spreads them evenly
    pub per_template: Option<usize>,
    /// Policy for each create call
    pub create_policy: RetryPolicy,
    /// Readiness deadline, measured from the first create call
    pub max_wait: Duration,
    pub options: CreateOptions,
}

impl LoadPlan {
    /// Plan with a single create attempt per sandbox
    pub fn new<I, S>(templates: I, count: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            templates: templates.into_iter().map(Into::into).collect(),
            count,
            per_template: None,
            create_policy: RetryPolicy::single_attempt(),
            max_wait: DEFAULT_MAX_WAIT,
            options: CreateOptions::default(),
        }
    }

    /// Plan for the configured template, retrying creates under the
    /// configured create policy
    pub fn from_config(config: &SandprobeConfig, count: usize) -> Self {
        Self::new([config.sandbox.template.clone()], count)
            .with_create_policy(config.retry.create.clone())
    }

    pub fn with_per_template(mut self, per_template: usize) -> Self {
        self.per_template = Some(per_template.max(1));
        self
    }

    pub fn with_create_policy(mut self, policy: RetryPolicy) -> Self {
        self.create_policy = policy;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_options(mut self, options: CreateOptions) -> Self {
        self.options = options;
        self
    }

    /// Template for each sandbox, in index order
    ///
    /// Sandboxes are assigned in blocks of `per_template`, cycling through
    /// the templates when there are more blocks than templates. An empty
    /// template list yields no assignments.
    pub fn assignment(&self) -> Vec<&str> {
        if self.templates.is_empty() {
            return Vec::new();
        }
        let block = self
            .per_template
            .unwrap_or_else(|| self.count.div_ceil(self.templates.len()))
            .max(1);

        (0..self.count)
            .map(|index| self.templates[(index / block) % self.templates.len()].as_str())
            .collect()
    }
}

/// Per-sandbox outcome of a load run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxRecord {
    pub index: usize,
    pub template: String,
    pub sandbox_id: Option<String>,
    /// Create calls beyond the first
    pub retry_count: u32,
    /// Time spent creating, retries included
    pub create_duration: Option<Duration>,
    /// Time from create returning to the sandbox reporting ready
    pub ready_duration: Option<Duration>,
    pub total_duration: Duration,
    pub ready: bool,
    pub error: Option<String>,
}

impl SandboxRecord {
    pub fn created(&self) -> bool {
        self.sandbox_id.is_some()
    }
}

/// Summary statistics over a set of durations
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DurationStats {
    pub count: usize,
    pub avg: Duration,
    pub min: Duration,
    pub max: Duration,
    pub p50: Duration,
    pub p90: Duration,
    pub p99: Duration,
}

impl DurationStats {
    /// Nearest-rank percentiles; all zero for an empty sample
    pub fn from_samples(samples: &[Duration]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let count = sorted.len();
        let total: Duration = sorted.iter().sum();

        let percentile = |p: f64| {
            let rank = ((p * count as f64).ceil() as usize).clamp(1, count);
            sorted[rank - 1]
        };

        Self {
            count,
            avg: total / count as u32,
            min: sorted[0],
            max: sorted[count - 1],
            p50: percentile(0.50),
            p90: percentile(0.90),
            p99: percentile(0.99),
        }
    }
}

impl fmt::Display for DurationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "n={} avg={:.2?} min={:.2?} p50={:.2?} p90={:.2?} p99={:.2?} max={:.2?}",
            self.count, self.avg, self.min, self.p50, self.p90, self.p99, self.max
        )
    }
}

/// Outcome of a load run for one template
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TemplateStats {
    pub requested: usize,
    pub created: usize,
    pub ready: usize,
    pub retries: u32,
    pub ready_times: DurationStats,
}

impl TemplateStats {
    pub fn ready_success_rate(&self) -> f64 {
        ratio(self.ready, self.requested)
    }
}

/// Result of [`concurrent_create`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadReport {
    pub requested: usize,
    pub created: usize,
    pub ready: usize,
    /// Create retries summed over all sandboxes
    pub retries: u32,
    pub create_times: DurationStats,
    pub ready_times: DurationStats,
    pub total_times: DurationStats,
    pub per_template: BTreeMap<String, TemplateStats>,
    pub records: Vec<SandboxRecord>,
}

impl LoadReport {
    fn from_records(records: Vec<SandboxRecord>) -> Self {
        let create: Vec<_> = records.iter().filter_map(|r| r.create_duration).collect();
        let ready: Vec<_> = records
            .iter()
            .filter(|r| r.ready)
            .filter_map(|r| r.ready_duration)
            .collect();
        let total: Vec<_> = records
            .iter()
            .filter(|r| r.ready)
            .map(|r| r.total_duration)
            .collect();

        let mut per_template: BTreeMap<String, TemplateStats> = BTreeMap::new();
        let mut template_ready: BTreeMap<&str, Vec<Duration>> = BTreeMap::new();
        for record in &records {
            let stats = per_template.entry(record.template.clone()).or_default();
            stats.requested += 1;
            stats.retries += record.retry_count;
            if record.created() {
                stats.created += 1;
            }
            if record.ready {
                stats.ready += 1;
                if let Some(ready_duration) = record.ready_duration {
                    template_ready
                        .entry(record.template.as_str())
                        .or_default()
                        .push(ready_duration);
                }
            }
        }
        for (template, samples) in template_ready {
            if let Some(stats) = per_template.get_mut(template) {
                stats.ready_times = DurationStats::from_samples(&samples);
            }
        }

        Self {
            requested: records.len(),
            created: records.iter().filter(|r| r.created()).count(),
            ready: records.iter().filter(|r| r.ready).count(),
            retries: records.iter().map(|r| r.retry_count).sum(),
            create_times: DurationStats::from_samples(&create),
            ready_times: DurationStats::from_samples(&ready),
            total_times: DurationStats::from_samples(&total),
            per_template,
            records,
        }
    }

    pub fn create_success_rate(&self) -> f64 {
        ratio(self.created, self.requested)
    }

    pub fn ready_success_rate(&self) -> f64 {
        ratio(self.ready, self.requested)
    }

    /// Ids of every sandbox that was created, ready or not
    pub fn sandbox_ids(&self) -> Vec<&str> {
        self.records
            .iter()
            .filter_map(|r| r.sandbox_id.as_deref())
            .collect()
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "created {}/{} ({:.1}%), ready {}/{} ({:.1}%), {} create retries",
            self.created,
            self.requested,
            self.create_success_rate() * 100.0,
            self.ready,
            self.requested,
            self.ready_success_rate() * 100.0,
            self.retries
        )?;
        writeln!(f, "create: {}", self.create_times)?;
        writeln!(f, "ready:  {}", self.ready_times)?;
        write!(f, "total:  {}", self.total_times)?;
        if self.per_template.len() > 1 {
            for (template, stats) in &self.per_template {
                write!(
                    f,
                    "\n  {}: created {}/{}, ready {}/{}, retries {}, ready p50={:.2?}",
                    template,
                    stats.created,
                    stats.requested,
                    stats.ready,
                    stats.requested,
                    stats.retries,
                    stats.ready_times.p50
                )?;
            }
        }
        Ok(())
    }
}

/// Classifies create failures
///
/// Any 5xx answer is worth another attempt, as is a scheduler reporting no
/// free nodes. Everything else is classified as usual.
#[derive(Debug, Clone, Copy, Default)]
struct CreateErrorClassifier {
    service: ServiceErrorClassifier,
}

impl ErrorClassifier<ServiceError> for CreateErrorClassifier {
    fn classify(&self, error: &ServiceError) -> ErrorKind {
        match error {
            ServiceError::Api { status, .. } if *status >= 500 => ErrorKind::Transient,
            _ if is_capacity_error(error) => ErrorKind::Transient,
            _ => self.service.classify(error),
        }
    }
}

/// Scheduler has no node to place the sandbox on
fn is_capacity_error(error: &ServiceError) -> bool {
    let message = error.message().to_lowercase();
    message.contains("no nodes available") || message.contains("no node available")
}

/// Create sandboxes at once, per `plan`, and wait for each to report ready
///
/// Each create runs under the plan's create policy. A create that fails for
/// lack of capacity waits one extra backoff delay before its next attempt.
/// Each created sandbox is polled every [`READY_POLL_INTERVAL`] until it is
/// running, reports failed or not-found, or `max_wait` (measured from the
/// first create call) runs out. Sandboxes are left running; see
/// [`kill_all`].
pub async fn concurrent_create(control_plane: &dyn ControlPlane, plan: &LoadPlan) -> LoadReport {
    let assignment = plan.assignment();
    if assignment.len() < plan.count {
        warn!(count = plan.count, "Load plan names no templates, nothing to create");
    }
    info!(
        count = assignment.len(),
        templates = plan.templates.len(),
        "Starting load run"
    );

    let runs = assignment
        .into_iter()
        .enumerate()
        .map(|(index, template)| create_one(control_plane, index, template, plan));
    let records = futures::future::join_all(runs).await;

    let report = LoadReport::from_records(records);
    info!(
        requested = report.requested,
        created = report.created,
        ready = report.ready,
        retries = report.retries,
        "Load run finished"
    );
    report
}

async fn create_one(
    control_plane: &dyn ControlPlane,
    index: usize,
    template: &str,
    plan: &LoadPlan,
) -> SandboxRecord {
    let started = Instant::now();
    let mut record = SandboxRecord {
        index,
        template: template.to_string(),
        sandbox_id: None,
        retry_count: 0,
        create_duration: None,
        ready_duration: None,
        total_duration: Duration::ZERO,
        ready: false,
        error: None,
    };

    let executor = RetryExecutor::new(plan.create_policy.clone());
    let policy = &plan.create_policy;
    let options = &plan.options;
    let created = executor
        .execute_with_context(&CreateErrorClassifier::default(), move |attempt| async move {
            let result = control_plane.create(template, options).await;
            if let Err(e) = &result {
                let last = policy.max_attempts.is_some_and(|max| attempt >= max);
                if !last && is_capacity_error(e) {
                    let hold = policy.delay_for_attempt(attempt - 1);
                    debug!(index, template, ?hold, "No nodes available, backing off longer");
                    sleep(hold).await;
                }
            }
            result
        })
        .await;

    let sandbox = match created {
        Ok(retried) => {
            record.retry_count = retried.attempts - 1;
            retried.into_inner()
        }
        Err(e) => {
            warn!(index, template, "Create failed: {}", e);
            record.retry_count = e.attempts().saturating_sub(1);
            record.error = Some(e.last_error().to_string());
            record.total_duration = started.elapsed();
            return record;
        }
    };
    let created_at = Instant::now();
    record.create_duration = Some(created_at - started);
    let sandbox_id = sandbox.sandbox_id;
    record.sandbox_id = Some(sandbox_id.clone());

    let classifier = ServiceErrorClassifier::new();
    let deadline = started + plan.max_wait;
    loop {
        match control_plane.get_info(&sandbox_id).await {
            Ok(info) if info.state.is_ready() => {
                record.ready = true;
                record.ready_duration = Some(created_at.elapsed());
                break;
            }
            Ok(info) if info.state == SandboxState::Failed => {
                record.error = Some(format!("sandbox {} failed", sandbox_id));
                break;
            }
            Ok(info) => debug!(sandbox_id = %sandbox_id, state = %info.state, "Not ready yet"),
            Err(e) if classifier.classify(&e) == ErrorKind::NotFound => {
                record.error = Some(e.to_string());
                break;
            }
            Err(e) => {
                debug!(sandbox_id = %sandbox_id, "Status poll failed: {}", e);
                record.error = Some(e.to_string());
            }
        }

        if Instant::now() + READY_POLL_INTERVAL > deadline {
            let waited = started.elapsed();
            record.error = Some(match record.error.take() {
                Some(last) => format!("not ready after {:.2?}, last error: {}", waited, last),
                None => format!("not ready after {:.2?}", waited),
            });
            break;
        }
        sleep(READY_POLL_INTERVAL).await;
    }

    if record.ready {
        record.error = None;
    }
    record.total_duration = started.elapsed();
    record
}

/// Result of [`kill_all`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KillReport {
    pub listed: usize,
    pub deleted: usize,
    /// Sandbox id and error for each failed delete
    pub failed: Vec<(String, String)>,
}

/// Delete every listed sandbox, `concurrency` at a time
///
/// A sandbox that is already gone counts as deleted.
pub async fn kill_all(
    control_plane: &dyn ControlPlane,
    concurrency: usize,
) -> sandprobe_client::ServiceResult<KillReport> {
    let sandboxes = control_plane.list().await?;
    let mut report = KillReport {
        listed: sandboxes.len(),
        ..KillReport::default()
    };
    info!(count = report.listed, "Deleting sandboxes");
    let classifier = ServiceErrorClassifier::new();

    let mut results = stream::iter(sandboxes)
        .map(|info| async move {
            let outcome = control_plane.kill(&info.sandbox_id).await;
            (info.sandbox_id, outcome)
        })
        .buffer_unordered(concurrency.max(1));

    while let Some((sandbox_id, outcome)) = results.next().await {
        match outcome {
            Ok(()) => report.deleted += 1,
            Err(e) if classifier.classify(&e) == ErrorKind::NotFound => {
                debug!(sandbox_id = %sandbox_id, "Sandbox already gone: {}", e);
                report.deleted += 1;
            }
            Err(e) => {
                warn!(sandbox_id = %sandbox_id, "Delete failed: {}", e);
                report.failed.push((sandbox_id, e.to_string()));
            }
        }
    }

    Ok(report)
}
