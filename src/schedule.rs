//! Test schedules.
//!
//! A [`TestSchedule`] is an ordered list of [`ScheduleEntry`]s, each needing
//! one guest of a given environment and carrying the [`Step`]s to run on it.
//! Entries that share a multi-host plan (or name the same `group`) are
//! provisioned and run together as one barrier group.
//!
//! # Schedule File
//!
//! ```toml
//! [[entries]]
//! id = "server"
//! arch = "x86_64"
//! compose = "RHEL-9.4"
//! plan = "/plans/client-server"
//! multihost = true
//! role = "primary"
//!
//! [[entries.steps]]
//! type = "run"
//! command = "systemctl start httpd"
//!
//! [[entries.steps]]
//! type = "sync"
//! point = "server-up"
//!
//! [[entries]]
//! id = "client"
//! arch = "x86_64"
//! compose = "RHEL-9.4"
//! plan = "/plans/client-server"
//! multihost = true
//!
//! [[entries.steps]]
//! type = "sync"
//! point = "server-up"
//!
//! [[entries.steps]]
//! type = "run"
//! command = "curl -f http://server/"
//! ```

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::environment::TestingEnvironment;
use crate::error::ErrorKind;
use crate::lifecycle::GuestSummary;

/// Role of an entry within its barrier group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Coordinator: leaves a sync point only after every secondary arrived.
    Primary,
    Secondary,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => f.write_str("primary"),
            Role::Secondary => f.write_str("secondary"),
        }
    }
}

/// Execution state of a schedule entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Pending,
    Provisioning,
    Running,
    Complete,
    Failed,
    Aborted,
}

impl EntryState {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            EntryState::Complete | EntryState::Failed | EntryState::Aborted
        )
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryState::Pending => "pending",
            EntryState::Provisioning => "provisioning",
            EntryState::Running => "running",
            EntryState::Complete => "complete",
            EntryState::Failed => "failed",
            EntryState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Result of the test content of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    /// Nothing conclusive ran.
    Undefined,
    Passed,
    Failed,
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestOutcome::Undefined => f.write_str("undefined"),
            TestOutcome::Passed => f.write_str("passed"),
            TestOutcome::Failed => f.write_str("failed"),
        }
    }
}

/// One step of test content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Step {
    /// Runs a shell command on the entry's guest.
    Run {
        command: String,
        /// Overrides `runner.step_timeout_secs`.
        #[serde(default)]
        timeout_secs: Option<u64>,
    },

    /// Waits at a named synchronization point of the barrier group.
    Sync { point: String },

    /// Takes a snapshot of the guest.
    Checkpoint,

    /// Restores the guest from the latest snapshot.
    Rollback,
}

impl Step {
    /// Timeout of a `run` step, falling back to `default`.
    pub fn timeout(&self, default: Duration) -> Duration {
        match self {
            Step::Run {
                timeout_secs: Some(secs),
                ..
            } => Duration::from_secs(*secs),
            _ => default,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Run { command, .. } => write!(f, "run `{}`", command),
            Step::Sync { point } => write!(f, "sync {}", point),
            Step::Checkpoint => f.write_str("checkpoint"),
            Step::Rollback => f.write_str("rollback"),
        }
    }
}

/// One unit of test execution, bound to exactly one guest once acquired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,

    #[serde(flatten)]
    pub environment: TestingEnvironment,

    /// Declared role. Unset entries are secondaries, except the first entry
    /// of a group without a declared primary.
    #[serde(default)]
    pub role: Option<Role>,

    /// Test plan the entry comes from.
    #[serde(default)]
    pub plan: Option<String>,

    /// Entries sharing a multi-host plan form one barrier group.
    #[serde(default)]
    pub multihost: bool,

    /// Explicit barrier group, overriding plan-based grouping.
    #[serde(default)]
    pub group: Option<String>,

    #[serde(default)]
    pub steps: Vec<Step>,
}

impl ScheduleEntry {
    pub fn new(id: impl Into<String>, environment: TestingEnvironment) -> Self {
        Self {
            id: id.into(),
            environment,
            role: None,
            plan: None,
            multihost: false,
            group: None,
            steps: Vec::new(),
        }
    }

    /// Key of the barrier group this entry belongs to.
    pub fn group_key(&self) -> GroupKey {
        if let Some(group) = &self.group {
            return GroupKey::Group(group.clone());
        }
        match (&self.plan, self.multihost) {
            (Some(plan), true) => GroupKey::Plan(plan.clone()),
            _ => GroupKey::Entry(self.id.clone()),
        }
    }
}

/// Identity of a barrier group.
///
/// Explicit group names, multi-host plans and standalone entries live in
/// separate namespaces: an entry named `pair` never joins group `pair`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    /// Explicit `group` name.
    Group(String),
    /// Shared multi-host plan.
    Plan(String),
    /// Standalone entry, always a group of one.
    Entry(String),
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Group(name) | GroupKey::Plan(name) | GroupKey::Entry(name) => {
                f.write_str(name)
            }
        }
    }
}

/// Ordered list of schedule entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestSchedule {
    #[serde(default)]
    pub entries: Vec<ScheduleEntry>,
}

impl TestSchedule {
    pub fn new(entries: Vec<ScheduleEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks that entry ids are unique, every group has at most one primary,
    /// and no entry waits at the same sync point twice.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for entry in &self.entries {
            if entry.id.trim().is_empty() {
                anyhow::bail!("schedule entry with empty id");
            }
            if !ids.insert(entry.id.as_str()) {
                anyhow::bail!("duplicate schedule entry id: {}", entry.id);
            }

            let mut points = HashSet::new();
            for step in &entry.steps {
                if let Step::Sync { point } = step
                    && !points.insert(point.as_str())
                {
                    anyhow::bail!(
                        "entry {} syncs at point {} more than once",
                        entry.id,
                        point
                    );
                }
            }
        }

        let mut primaries = HashSet::new();
        for entry in &self.entries {
            if entry.role == Some(Role::Primary) && !primaries.insert(entry.group_key()) {
                anyhow::bail!(
                    "group {} declares more than one primary entry",
                    entry.group_key()
                );
            }
        }

        Ok(())
    }
}

/// Loads a schedule from a TOML file.
pub fn load_schedule(path: &Path) -> Result<TestSchedule> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read schedule file: {}", path.display()))?;

    load_schedule_str(&content)
        .with_context(|| format!("Invalid schedule file: {}", path.display()))
}

/// Loads a schedule from a TOML string.
pub fn load_schedule_str(content: &str) -> Result<TestSchedule> {
    let schedule: TestSchedule = toml::from_str(content).context("Failed to parse schedule")?;
    schedule.validate()?;
    Ok(schedule)
}

/// Final record of one schedule entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntryResult {
    pub entry_id: String,
    pub group_id: String,
    pub role: Role,
    pub environment: String,
    pub state: EntryState,
    pub outcome: TestOutcome,
    /// Set for `failed` and `aborted` entries.
    pub error_kind: Option<ErrorKind>,
    /// Error reason, or the first failing step of a completed entry.
    pub reason: Option<String>,
    pub guest: Option<GuestSummary>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

impl EntryResult {
    /// Entry completed and its test content passed.
    pub fn passed(&self) -> bool {
        self.state == EntryState::Complete && self.outcome == TestOutcome::Passed
    }
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }
}
