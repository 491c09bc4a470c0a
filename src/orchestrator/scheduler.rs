//! Barrier groups and all-or-nothing admission.
//!
//! [`partition`] splits a [`TestSchedule`] into [`BarrierGroup`]s: entries
//! sharing a multi-host plan (or an explicit `group`) form one group, every
//! other entry is a group of its own. The [`Scheduler`] then admits a group
//! in two phases:
//!
//! ```text
//!   acquire phase                          commit phase
//!   ─────────────                          ────────────
//!   entry 1 ──acquire──► Ready ─┐
//!   entry 2 ──acquire──► Ready ─┼─ all ready ──► GroupState::Running
//!   entry 3 ──acquire──► Ready ─┘
//!
//!   entry k ──acquire──► Fatal ──► cancel in-flight acquisitions
//!                                  release ready guests (newest first)
//!                                  GroupState::Aborted, every entry Aborted
//! ```
//!
//! Acquisitions of all groups share one semaphore, which caps how many
//! guests are being provisioned at any time. Waiters are served in the order
//! they queued, so entries are admitted in schedule order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pool::GuestPool;
use crate::environment::ProvisionOptions;
use crate::error::{ProvisionError, ProvisionResult};
use crate::lifecycle::{GuestRequest, Provisioner, SnapshotManager};
use crate::schedule::{
    EntryResult, EntryState, GroupKey, Role, ScheduleEntry, TestOutcome, TestSchedule,
};

/// Lifecycle of a barrier group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Pending,
    Acquiring,
    Running,
    Complete,
    Aborted,
}

/// Runtime state of one schedule entry.
pub struct EntryRun {
    pub entry: ScheduleEntry,
    pub role: Role,
    pub group_id: String,
    pub state: EntryState,
    /// The entry's guest; never shared with another entry.
    pub guest: GuestRequest,
    pub snapshots: SnapshotManager,
    pub outcome: TestOutcome,
    error: Option<ProvisionError>,
    failure: Option<String>,
    started: Option<Instant>,
    finished: Option<Instant>,
}

impl EntryRun {
    pub fn new(
        entry: ScheduleEntry,
        role: Role,
        group_id: impl Into<String>,
        provisioner: &Arc<Provisioner>,
    ) -> Self {
        let guest = GuestRequest::new(entry.id.clone(), entry.environment.clone());
        Self {
            entry,
            role,
            group_id: group_id.into(),
            state: EntryState::Pending,
            guest,
            snapshots: SnapshotManager::new(Arc::clone(provisioner)),
            outcome: TestOutcome::Undefined,
            error: None,
            failure: None,
            started: None,
            finished: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.entry.id
    }

    /// Error that ended the entry, if any.
    pub fn error(&self) -> Option<&ProvisionError> {
        self.error.as_ref()
    }

    pub(crate) fn start(&mut self, state: EntryState) {
        self.started.get_or_insert_with(Instant::now);
        self.state = state;
    }

    /// Records a failing test result without ending the entry.
    pub(crate) fn fail_test(&mut self, reason: String) {
        self.outcome = TestOutcome::Failed;
        self.failure.get_or_insert(reason);
    }

    /// Moves the entry to its final state. Later calls are ignored.
    pub(crate) fn finish(&mut self, state: EntryState, error: Option<ProvisionError>) {
        if self.state.is_final() {
            return;
        }
        self.state = state;
        self.error = error;
        if state == EntryState::Complete && self.outcome == TestOutcome::Undefined {
            self.outcome = TestOutcome::Passed;
        }
        self.finished = Some(Instant::now());
    }

    pub fn duration(&self) -> Duration {
        match (self.started, self.finished) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Final record of this entry.
    pub fn result(&self) -> EntryResult {
        EntryResult {
            entry_id: self.entry.id.clone(),
            group_id: self.group_id.clone(),
            role: self.role,
            environment: self.entry.environment.to_string(),
            state: self.state,
            outcome: self.outcome,
            error_kind: self.error.as_ref().map(ProvisionError::kind),
            reason: self
                .error
                .as_ref()
                .map(|e| e.reason().to_string())
                .or_else(|| self.failure.clone()),
            guest: self.guest.summary(),
            duration: self.duration(),
        }
    }
}

/// Entries that are provisioned and run as one unit.
pub struct BarrierGroup {
    pub(crate) id: String,
    pub(crate) state: GroupState,
    pub(crate) entries: Vec<EntryRun>,
    /// Entries whose guest is ready, in acquisition order.
    pub(crate) pool: GuestPool,
    pub(crate) abort_reason: Option<String>,
}

impl BarrierGroup {
    pub fn new(id: impl Into<String>, entries: Vec<EntryRun>) -> Self {
        let pool = GuestPool::with_capacity(entries.len());
        Self {
            id: id.into(),
            state: GroupState::Pending,
            entries,
            pool,
            abort_reason: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn entries(&self) -> &[EntryRun] {
        &self.entries
    }

    pub fn primary(&self) -> Option<&EntryRun> {
        self.entries.iter().find(|e| e.role == Role::Primary)
    }

    /// Why the group was aborted.
    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    /// Entry results, in group order.
    pub fn results(&self) -> Vec<EntryResult> {
        self.entries.iter().map(EntryRun::result).collect()
    }
}

/// Splits `schedule` into barrier groups, in order of first appearance.
///
/// The declared primary of a group keeps its role; without one, the first
/// entry of the group is the primary. Every other entry is a secondary.
pub fn partition(schedule: &TestSchedule, provisioner: &Arc<Provisioner>) -> Vec<BarrierGroup> {
    let mut members: Vec<(GroupKey, Vec<&ScheduleEntry>)> = Vec::new();
    for entry in &schedule.entries {
        let key = entry.group_key();
        match members.iter_mut().find(|(k, _)| *k == key) {
            Some((_, group)) => group.push(entry),
            None => members.push((key, vec![entry])),
        }
    }

    members
        .into_iter()
        .map(|(key, group)| {
            let id = key.to_string();
            let primary = group
                .iter()
                .position(|e| e.role == Some(Role::Primary))
                .unwrap_or(0);
            let entries = group
                .into_iter()
                .enumerate()
                .map(|(i, entry)| {
                    let role = if i == primary {
                        Role::Primary
                    } else {
                        Role::Secondary
                    };
                    EntryRun::new(entry.clone(), role, id.clone(), provisioner)
                })
                .collect();
            BarrierGroup::new(id, entries)
        })
        .collect()
}

/// Drives the acquire and commit phases of barrier groups.
pub struct Scheduler {
    provisioner: Arc<Provisioner>,
    options: ProvisionOptions,
    acquisitions: Arc<Semaphore>,
}

impl Scheduler {
    /// Creates a scheduler sharing the `acquisitions` limiter.
    pub fn new(
        provisioner: Arc<Provisioner>,
        options: ProvisionOptions,
        acquisitions: Arc<Semaphore>,
    ) -> Self {
        Self {
            provisioner,
            options,
            acquisitions,
        }
    }

    /// Creates a scheduler with its own limiter of `max_concurrent` permits.
    pub fn with_limit(
        provisioner: Arc<Provisioner>,
        options: ProvisionOptions,
        max_concurrent: usize,
    ) -> Self {
        Self::new(
            provisioner,
            options,
            Arc::new(Semaphore::new(max_concurrent.max(1))),
        )
    }

    /// Acquires a guest for every entry of `group`.
    ///
    /// On success the group is `Running` and every entry's guest is ready.
    /// Otherwise the group is `Aborted`, every entry is `Aborted`, and no
    /// guest of the group is left allocated.
    ///
    /// # Errors
    ///
    /// The error of the first entry that failed terminally.
    pub async fn admit(
        &self,
        group: &mut BarrierGroup,
        cancel: &CancellationToken,
    ) -> ProvisionResult<()> {
        group.state = GroupState::Acquiring;
        info!(
            "Group {}: acquiring {} guest(s)",
            group.id,
            group.entries.len()
        );

        let token = cancel.child_token();
        let mut errors: Vec<Option<ProvisionError>> = vec![None; group.entries.len()];
        let mut trigger: Option<(usize, ProvisionError)> = None;

        {
            let group_id = group.id.as_str();
            let mut acquisitions: FuturesUnordered<_> = group
                .entries
                .iter_mut()
                .enumerate()
                .map(|(index, run)| self.acquire_entry(index, run, group_id, &token))
                .collect();

            while let Some((index, result)) = acquisitions.next().await {
                match result {
                    Ok(()) => group.pool.add(index),
                    Err(err) => {
                        if trigger.is_none() {
                            warn!("Group {}: acquisition failed: {}", group_id, err);
                            token.cancel();
                            trigger = Some((index, err.clone()));
                        }
                        errors[index] = Some(err);
                    }
                }
            }
        }

        let Some((failed, err)) = trigger else {
            group.state = GroupState::Running;
            info!("Group {}: all guests ready", group.id);
            return Ok(());
        };

        for index in group.pool.take_release_order() {
            self.provisioner
                .release_quietly(&mut group.entries[index].guest)
                .await;
        }

        let reason = format!(
            "group {} aborted: entry {} failed: {}",
            group.id, group.entries[failed].entry.id, err
        );
        for (index, run) in group.entries.iter_mut().enumerate() {
            // No-op for released guests; marks never-created ones released.
            self.provisioner.release_quietly(&mut run.guest).await;

            let error = match errors[index].take() {
                Some(e) if index == failed || !matches!(e, ProvisionError::Cancelled(_)) => e,
                _ => ProvisionError::Cancelled(reason.clone()),
            };
            run.finish(EntryState::Aborted, Some(error));
        }

        warn!("{}", reason);
        group.state = GroupState::Aborted;
        group.abort_reason = Some(reason);
        Err(err)
    }

    async fn acquire_entry(
        &self,
        index: usize,
        run: &mut EntryRun,
        group_id: &str,
        token: &CancellationToken,
    ) -> (usize, ProvisionResult<()>) {
        run.start(EntryState::Provisioning);

        let _permit = tokio::select! {
            biased;
            _ = token.cancelled() => {
                let err = ProvisionError::Cancelled(format!(
                    "entry {} cancelled before provisioning",
                    run.entry.id
                ));
                return (index, Err(err));
            }
            permit = self.acquisitions.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    let err = ProvisionError::Cancelled("acquisition limiter closed".to_string());
                    return (index, Err(err));
                }
            },
        };

        let options = self
            .options
            .clone()
            .tag("entry-id", &run.entry.id)
            .tag("group-id", group_id);
        debug!(
            "Entry {}: requesting {}",
            run.entry.id, run.entry.environment
        );

        let result = self.provisioner.acquire(&mut run.guest, &options, token).await;
        (index, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::TestingEnvironment;
    use crate::error::ErrorKind;
    use crate::lifecycle::GuestState;
    use crate::lifecycle::tests::provisioner;
    use crate::provider::mock::{GuestScript, MockFailure, MockProvisioningClient};
    use crate::provider::RemoteState;

    fn entry(id: &str) -> ScheduleEntry {
        ScheduleEntry::new(id, TestingEnvironment::new("x86_64", "RHEL"))
    }

    fn multihost(id: &str, plan: &str) -> ScheduleEntry {
        let mut entry = entry(id);
        entry.plan = Some(plan.to_string());
        entry.multihost = true;
        entry
    }

    fn single_group(
        client: &MockProvisioningClient,
        entries: Vec<ScheduleEntry>,
    ) -> (Arc<Provisioner>, BarrierGroup) {
        let provisioner = Arc::new(provisioner(client));
        let mut groups = partition(&TestSchedule::new(entries), &provisioner);
        assert_eq!(groups.len(), 1);
        (provisioner, groups.remove(0))
    }

    #[test]
    fn test_partition_groups_and_roles() {
        let client = MockProvisioningClient::new();
        let provisioner = Arc::new(provisioner(&client));
        let mut client_entry = multihost("client", "/plans/cs");
        client_entry.role = Some(Role::Secondary);
        let mut server = multihost("server", "/plans/cs");
        server.role = Some(Role::Primary);
        let schedule = TestSchedule::new(vec![
            entry("lonely"),
            client_entry,
            server,
            multihost("other", "/plans/other"),
        ]);

        let groups = partition(&schedule, &provisioner);

        let ids: Vec<&str> = groups.iter().map(|g| g.id()).collect();
        assert_eq!(ids, vec!["lonely", "/plans/cs", "/plans/other"]);
        assert_eq!(groups[0].primary().unwrap().id(), "lonely");
        assert_eq!(groups[1].primary().unwrap().id(), "server");
        assert_eq!(groups[1].entries()[0].role, Role::Secondary);
        assert_eq!(groups[1].entries()[0].group_id, "/plans/cs");
    }

    #[test]
    fn test_standalone_entry_stays_out_of_same_named_group() {
        let client = MockProvisioningClient::new();
        let provisioner = Arc::new(provisioner(&client));
        let mut a = entry("a");
        a.group = Some("pair".to_string());
        let mut b = entry("b");
        b.group = Some("pair".to_string());
        let schedule = TestSchedule::new(vec![entry("pair"), a, b]);
        schedule.validate().unwrap();

        let groups = partition(&schedule, &provisioner);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].entries().len(), 1);
        assert_eq!(groups[0].primary().unwrap().id(), "pair");
        let members: Vec<&str> = groups[1].entries().iter().map(|e| e.id()).collect();
        assert_eq!(members, vec!["a", "b"]);
    }

    #[test]
    fn test_first_entry_is_default_primary() {
        let client = MockProvisioningClient::new();
        let (_, group) = single_group(&client, vec![multihost("a", "/p"), multihost("b", "/p")]);

        assert_eq!(group.entries()[0].role, Role::Primary);
        assert_eq!(group.entries()[1].role, Role::Secondary);
    }

    #[tokio::test]
    async fn test_single_entry_group_reaches_running() {
        let client = MockProvisioningClient::new();
        client.set_default_script(GuestScript::new(&[RemoteState::Promised, RemoteState::Ready]));
        let (provisioner, mut group) = single_group(&client, vec![entry("e1")]);
        let scheduler = Scheduler::with_limit(provisioner, ProvisionOptions::default(), 4);

        scheduler
            .admit(&mut group, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(group.state(), GroupState::Running);
        let run = &group.entries()[0];
        assert_eq!(run.state, EntryState::Provisioning);
        assert_eq!(run.guest.state(), GuestState::Ready);
        assert_eq!(run.guest.address(), Some("1.1.1.1"));
        assert_eq!(run.guest.ssh().unwrap().port, 22);
    }

    #[tokio::test]
    async fn test_requests_are_tagged_with_entry_and_group() {
        let client = MockProvisioningClient::new();
        let (provisioner, mut group) =
            single_group(&client, vec![multihost("a", "/p"), multihost("b", "/p")]);
        let scheduler = Scheduler::with_limit(provisioner, ProvisionOptions::default(), 4);

        scheduler
            .admit(&mut group, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(client.creates_for("a"), 1);
        assert_eq!(client.creates_for("b"), 1);
    }

    #[tokio::test]
    async fn test_fatal_secondary_aborts_group() {
        let client = MockProvisioningClient::new();
        client.fail_next_create("client", MockFailure::Rejected("unknown compose".into()));
        let (provisioner, mut group) = single_group(
            &client,
            vec![multihost("server", "/p"), multihost("client", "/p")],
        );
        let scheduler = Scheduler::with_limit(provisioner, ProvisionOptions::default(), 1);

        let err = scheduler
            .admit(&mut group, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::FatalEnvironment);
        assert_eq!(group.state(), GroupState::Aborted);
        assert_eq!(client.creates_for("client"), 1);

        let primary_guests = client.guests_of("server");
        assert_eq!(primary_guests.len(), 1);
        assert_eq!(client.cancels_of(&primary_guests[0]), 1);
        assert!(client.leaked().is_empty());

        let results = group.results();
        assert!(results.iter().all(|r| r.state == EntryState::Aborted));
        assert_eq!(results[0].error_kind, Some(ErrorKind::Cancelled));
        assert!(results[0].reason.as_deref().unwrap().contains("entry client failed"));
        assert_eq!(results[1].error_kind, Some(ErrorKind::FatalEnvironment));
    }

    #[tokio::test]
    async fn test_fatal_sibling_cancels_guest_still_polling() {
        let client = MockProvisioningClient::new();
        client.queue_script("slow", GuestScript::stuck());
        client.queue_script("bad", GuestScript::failing("Quota exceeded"));
        let (provisioner, mut group) =
            single_group(&client, vec![multihost("slow", "/p"), multihost("bad", "/p")]);
        let scheduler = Scheduler::with_limit(provisioner, ProvisionOptions::default(), 2);

        let err = scheduler
            .admit(&mut group, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::FatalEnvironment);
        assert_eq!(group.state(), GroupState::Aborted);

        let slow = client.guests_of("slow");
        assert_eq!(slow.len(), 1);
        assert_eq!(client.cancels_of(&slow[0]), 1);
        assert!(client.leaked().is_empty());

        let results = group.results();
        assert_eq!(results[0].state, EntryState::Aborted);
        assert_eq!(results[0].error_kind, Some(ErrorKind::Cancelled));
        assert_eq!(results[1].error_kind, Some(ErrorKind::FatalEnvironment));
    }

    #[tokio::test]
    async fn test_kth_failure_releases_earlier_guests_newest_first() {
        let client = MockProvisioningClient::new();
        client.queue_script("e3", GuestScript::failing("quota exceeded"));
        let entries: Vec<ScheduleEntry> = ["e1", "e2", "e3", "e4"]
            .iter()
            .map(|id| multihost(id, "/p"))
            .collect();
        let (provisioner, mut group) = single_group(&client, entries);
        let scheduler = Scheduler::with_limit(provisioner, ProvisionOptions::default(), 1);

        scheduler
            .admit(&mut group, &CancellationToken::new())
            .await
            .unwrap_err();

        let e1 = client.guests_of("e1");
        let e2 = client.guests_of("e2");
        let e3 = client.guests_of("e3");
        assert_eq!(client.creates_for("e4"), 0);
        assert_eq!(
            client.cancelled(),
            vec![e3[0].clone(), e2[0].clone(), e1[0].clone()]
        );
        assert!(client.leaked().is_empty());

        for run in group.entries() {
            assert_eq!(run.guest.state(), GuestState::Released);
            assert_eq!(run.state, EntryState::Aborted);
        }
        assert_eq!(
            group.entries()[2].error().map(ProvisionError::kind),
            Some(ErrorKind::FatalEnvironment)
        );
    }

    #[tokio::test]
    async fn test_cancelled_run_never_creates() {
        let client = MockProvisioningClient::new();
        let (provisioner, mut group) = single_group(&client, vec![entry("e1")]);
        let scheduler = Scheduler::with_limit(provisioner, ProvisionOptions::default(), 1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = scheduler.admit(&mut group, &cancel).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(client.creates_for("e1"), 0);
        assert_eq!(group.entries()[0].state, EntryState::Aborted);
        assert_eq!(group.entries()[0].guest.state(), GuestState::Released);
    }

    #[test]
    fn test_finish_is_final() {
        let client = MockProvisioningClient::new();
        let (_, mut group) = single_group(&client, vec![entry("e1")]);
        let run = &mut group.entries[0];

        run.start(EntryState::Running);
        run.finish(EntryState::Complete, None);
        run.finish(
            EntryState::Aborted,
            Some(ProvisionError::Cancelled("late".into())),
        );

        let result = run.result();
        assert!(result.passed());
        assert_eq!(result.error_kind, None);
    }

    #[test]
    fn test_failed_test_keeps_first_reason() {
        let client = MockProvisioningClient::new();
        let (_, mut group) = single_group(&client, vec![entry("e1")]);
        let run = &mut group.entries[0];

        run.fail_test("first".into());
        run.fail_test("second".into());
        run.finish(EntryState::Complete, None);

        let result = run.result();
        assert_eq!(result.outcome, TestOutcome::Failed);
        assert_eq!(result.reason.as_deref(), Some("first"));
        assert!(!result.passed());
    }
}
