//! Schedule execution engine.
//!
//! This module ties provisioning and test execution together: a schedule is
//! split into barrier groups, every group is admitted (all of its guests
//! acquired, or none), run, and torn down, and the entry results are
//! collected into a [`ScheduleReport`].
//!
//! # Architecture
//!
//! ```text
//!  TestSchedule
//!       │
//!       │ partition()
//!       ▼
//!  Vec<BarrierGroup> ──── one task per group, concurrently ────┐
//!                                                              │
//!        ┌─────────────────────────────────────────────────────┘
//!        ▼
//!   Scheduler::admit ──► Provisioner::acquire (per entry) ──► ProvisioningClient
//!        │                     ▲
//!        │                     └── shared acquisition semaphore
//!        │
//!        ├─ Aborted ──► guests already released, runner skipped
//!        │
//!        ▼ Running
//!   GroupRunner::run ──► GuestSession (per entry) ──► LogSink
//!        │
//!        ▼
//!   teardown: delete snapshots, release guests (newest first)
//!        │
//!        ▼
//!   Reporter::on_group_complete
//! ```
//!
//! # Key Components
//!
//! - [`Orchestrator`]: runs a whole schedule
//! - [`RunContext`]: everything a run needs, passed explicitly
//! - [`Scheduler`]: partitioning and all-or-nothing admission
//! - [`GroupRunner`]: step execution, rendezvous, cancellation, teardown
//! - [`ScheduleReport`]: aggregated results
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use guestfarm::config::load_config;
//! use guestfarm::orchestrator::{Orchestrator, RunContext};
//! use guestfarm::provider;
//! use guestfarm::report::ConsoleReporter;
//! use guestfarm::schedule::load_schedule;
//! use guestfarm::session::log_channel;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("guestfarm.toml"))?;
//!     let schedule = load_schedule(std::path::Path::new("schedule.toml"))?;
//!
//!     let client = provider::connect(&config.provider).await?;
//!     let (logs, _stream) = log_channel();
//!     let ctx = RunContext::from_config(&config, client, logs)?;
//!
//!     let orchestrator = Orchestrator::new(ctx, ConsoleReporter::new(false));
//!     let report = orchestrator.run(&schedule).await?;
//!
//!     std::process::exit(report.exit_code());
//! }
//! ```

pub mod pool;
pub mod runner;
pub mod scheduler;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::environment::ProvisionOptions;
use crate::lifecycle::{Provisioner, ProvisionerSettings};
use crate::provider::ProvisioningClient;
use crate::report::{Reporter, schedule_table};
use crate::schedule::{EntryResult, EntryState, TestSchedule};
use crate::session::ssh::SshConnector;
use crate::session::{Connector, LogSink};

pub use pool::GuestPool;
pub use runner::{GroupRunner, Rendezvous};
pub use scheduler::{BarrierGroup, EntryRun, GroupState, Scheduler, partition};

/// Aggregated results of a schedule run.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every entry completed and passed |
/// | 1 | At least one entry failed or was aborted |
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleReport {
    /// Number of schedule entries.
    pub total: usize,

    /// Entries that ran all of their steps.
    pub complete: usize,

    /// Completed entries whose test content passed.
    pub passed: usize,

    /// Entries that neither passed nor were aborted.
    pub failed: usize,

    /// Entries of aborted groups, or interrupted by cancellation.
    pub aborted: usize,

    /// Wall-clock duration of the run.
    #[serde(with = "crate::schedule::duration_secs")]
    pub duration: Duration,

    /// Per-entry results, in schedule order.
    pub results: Vec<EntryResult>,
}

impl ScheduleReport {
    pub fn new(results: Vec<EntryResult>, duration: Duration) -> Self {
        let count = |state: EntryState| results.iter().filter(|r| r.state == state).count();
        let complete = count(EntryState::Complete);
        let aborted = count(EntryState::Aborted);
        let passed = results.iter().filter(|r| r.passed()).count();

        Self {
            total: results.len(),
            complete,
            passed,
            failed: results.len() - passed - aborted,
            aborted,
            duration,
            results,
        }
    }

    /// Returns `true` if every entry passed.
    ///
    /// # Example
    ///
    /// ```
    /// use guestfarm::orchestrator::ScheduleReport;
    /// use std::time::Duration;
    ///
    /// let report = ScheduleReport::new(vec![], Duration::from_secs(1));
    /// assert!(report.success());
    /// assert_eq!(report.exit_code(), 0);
    /// ```
    pub fn success(&self) -> bool {
        self.passed == self.total
    }

    /// Returns an appropriate process exit code for this report.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }

    /// Result of the entry `id`.
    pub fn entry(&self, id: &str) -> Option<&EntryResult> {
        self.results.iter().find(|r| r.entry_id == id)
    }
}

/// Concurrency caps and time limits of a run.
#[derive(Debug, Clone)]
pub struct RunLimits {
    pub max_concurrent_acquisitions: usize,
    /// 0 means no limit.
    pub max_parallel_groups: usize,
    pub step_timeout: Duration,
    pub group_deadline: Option<Duration>,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_concurrent_acquisitions: 8,
            max_parallel_groups: 0,
            step_timeout: Duration::from_secs(3600),
            group_deadline: None,
        }
    }
}

impl RunLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_acquisitions: config.farm.max_concurrent_acquisitions.max(1),
            max_parallel_groups: config.farm.max_parallel_groups,
            step_timeout: Duration::from_secs(config.runner.step_timeout_secs),
            group_deadline: config.runner.group_deadline_secs.map(Duration::from_secs),
        }
    }
}

/// Everything a run needs.
pub struct RunContext {
    pub provisioner: Arc<Provisioner>,
    pub connector: Arc<dyn Connector>,
    /// Options every guest request starts from.
    pub options: ProvisionOptions,
    pub limits: RunLimits,
    /// Cancels the whole run; every acquired guest is still released.
    pub cancel: CancellationToken,
    pub logs: LogSink,
}

impl RunContext {
    pub fn new(provisioner: Arc<Provisioner>, connector: Arc<dyn Connector>, logs: LogSink) -> Self {
        Self {
            provisioner,
            connector,
            options: ProvisionOptions::default(),
            limits: RunLimits::default(),
            cancel: CancellationToken::new(),
            logs,
        }
    }

    /// Builds a context for `client` from the configuration, reaching guests
    /// over SSH.
    pub fn from_config(
        config: &Config,
        client: Arc<dyn ProvisioningClient>,
        logs: LogSink,
    ) -> anyhow::Result<Self> {
        let settings = ProvisionerSettings::from_config(config)?;
        let connector: Arc<dyn Connector> = Arc::new(SshConnector::new(&config.runner.ssh));
        let provisioner =
            Arc::new(Provisioner::new(client, settings).with_connector(Arc::clone(&connector)));

        Ok(Self::new(provisioner, connector, logs)
            .with_options(config.provider.provision_options())
            .with_limits(RunLimits::from_config(config)))
    }

    pub fn with_options(mut self, options: ProvisionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_limits(mut self, limits: RunLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Runs schedules: admission, execution, and teardown of every group.
pub struct Orchestrator<R> {
    ctx: RunContext,
    reporter: R,
}

impl<R: Reporter> Orchestrator<R> {
    pub fn new(ctx: RunContext, reporter: R) -> Self {
        Self { ctx, reporter }
    }

    /// Runs `schedule` and returns the aggregated results.
    ///
    /// Groups are admitted in schedule order and run concurrently. A failing
    /// group never affects its siblings.
    ///
    /// # Errors
    ///
    /// Returns an error if the schedule is invalid. Entry failures are
    /// reported in the [`ScheduleReport`], not as errors.
    pub async fn run(&self, schedule: &TestSchedule) -> anyhow::Result<ScheduleReport> {
        schedule.validate()?;
        let start = Instant::now();

        let mut groups = partition(schedule, &self.ctx.provisioner);
        info!(
            "Scheduled {} entries into {} barrier groups",
            schedule.len(),
            groups.len()
        );
        let pending: Vec<EntryResult> = groups.iter().flat_map(BarrierGroup::results).collect();
        info!("Schedule:\n{}", schedule_table(&pending));
        self.reporter.on_schedule_start(schedule).await;

        let limits = &self.ctx.limits;
        let scheduler = Scheduler::with_limit(
            Arc::clone(&self.ctx.provisioner),
            self.ctx.options.clone(),
            limits.max_concurrent_acquisitions,
        );
        let runner = GroupRunner::new(
            Arc::clone(&self.ctx.provisioner),
            Arc::clone(&self.ctx.connector),
            self.ctx.logs.clone(),
        )
        .with_step_timeout(limits.step_timeout)
        .with_deadline(limits.group_deadline);
        let slots = (limits.max_parallel_groups > 0)
            .then(|| Semaphore::new(limits.max_parallel_groups));

        {
            let mut running: FuturesUnordered<_> = groups
                .iter_mut()
                .map(|group| self.drive(group, &scheduler, &runner, slots.as_ref()))
                .collect();
            while running.next().await.is_some() {}
        }

        let order: HashMap<&str, usize> = schedule
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.as_str(), i))
            .collect();
        let mut results: Vec<EntryResult> = groups.iter().flat_map(BarrierGroup::results).collect();
        results.sort_by_key(|r| order.get(r.entry_id.as_str()).copied().unwrap_or(usize::MAX));

        info!("Results:\n{}", schedule_table(&results));
        let report = ScheduleReport::new(results, start.elapsed());
        self.reporter.on_run_complete(&report).await;

        Ok(report)
    }

    async fn drive(
        &self,
        group: &mut BarrierGroup,
        scheduler: &Scheduler,
        runner: &GroupRunner,
        slots: Option<&Semaphore>,
    ) {
        let _slot = match slots {
            Some(slots) => tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => None,
                slot = slots.acquire() => slot.ok(),
            },
            None => None,
        };

        if scheduler.admit(group, &self.ctx.cancel).await.is_ok() {
            runner.run(group, &self.ctx.cancel).await;
        }

        self.reporter.on_group_complete(&group.results()).await;
    }
}
