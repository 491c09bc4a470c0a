//! Execution of a fully provisioned barrier group.
//!
//! The [`GroupRunner`] runs the steps of every entry of a group
//! concurrently, one task per guest:
//!
//! | Step | Effect |
//! |------|--------|
//! | `run` | Shell command over the guest's management channel |
//! | `sync` | Waits at a named point of the group's [`Rendezvous`] |
//! | `checkpoint` | Takes a snapshot of the guest |
//! | `rollback` | Restores the latest snapshot |
//!
//! # Failure Handling
//!
//! - A command exiting non-zero fails the entry's test outcome; the entry
//!   keeps running its remaining steps.
//! - A command that cannot run or exceeds its timeout fails the entry and
//!   cancels the whole group.
//! - A snapshot failure fails only the entry that requested it.
//! - The group deadline, an external cancel, or a failing sibling interrupts
//!   every running entry; interrupted entries end `Aborted` with the reason
//!   that triggered the cancellation.
//!
//! Whatever happens, teardown deletes every snapshot and releases every
//! guest, newest acquisition first, before the group's results are
//! published.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::scheduler::{BarrierGroup, EntryRun, GroupState};
use crate::error::ProvisionError;
use crate::lifecycle::Provisioner;
use crate::schedule::{EntryState, Role, Step};
use crate::session::{Command, Connector, LogSink, SessionError, run_command};

#[derive(Debug, Default)]
struct RendezvousState {
    primary: Option<String>,
    secondaries: HashSet<String>,
    arrived: HashMap<String, HashSet<String>>,
    released: HashSet<String>,
}

/// Synchronization points shared by the entries of one group.
///
/// The primary passes a point only once every live secondary has arrived
/// there; secondaries wait at the point until the primary passes it.
/// Entries that finish [`depart`](Self::depart), so nobody waits for them.
/// Point names are single-use within a group.
#[derive(Debug, Default)]
pub struct Rendezvous {
    state: Mutex<RendezvousState>,
    notify: Notify,
}

impl Rendezvous {
    pub fn new<'a>(members: impl IntoIterator<Item = (&'a str, Role)>) -> Self {
        let mut state = RendezvousState::default();
        for (member, role) in members {
            match role {
                Role::Primary => state.primary = Some(member.to_string()),
                Role::Secondary => {
                    state.secondaries.insert(member.to_string());
                }
            }
        }
        Self {
            state: Mutex::new(state),
            notify: Notify::new(),
        }
    }

    /// Waits at `point` until the group may pass it.
    ///
    /// Returns `false` if `cancel` fired first.
    pub async fn arrive(
        &self,
        point: &str,
        member: &str,
        role: Role,
        cancel: &CancellationToken,
    ) -> bool {
        debug!("{} arrived at {}", member, point);

        match role {
            Role::Primary => {
                let passed = self
                    .wait_until(cancel, |state| {
                        let arrived = state.arrived.get(point);
                        let all = state
                            .secondaries
                            .iter()
                            .all(|s| arrived.is_some_and(|a| a.contains(s)));
                        if all {
                            state.released.insert(point.to_string());
                        }
                        all
                    })
                    .await;
                if passed {
                    self.notify.notify_waiters();
                }
                passed
            }
            Role::Secondary => {
                self.lock()
                    .arrived
                    .entry(point.to_string())
                    .or_default()
                    .insert(member.to_string());
                self.notify.notify_waiters();

                self.wait_until(cancel, |state| {
                    state.released.contains(point) || state.primary.is_none()
                })
                .await
            }
        }
    }

    /// Removes `member` from the group.
    pub fn depart(&self, member: &str) {
        {
            let mut state = self.lock();
            if state.primary.as_deref() == Some(member) {
                state.primary = None;
            } else {
                state.secondaries.remove(member);
            }
        }
        self.notify.notify_waiters();
    }

    async fn wait_until(
        &self,
        cancel: &CancellationToken,
        mut ready: impl FnMut(&mut RendezvousState) -> bool,
    ) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let done = {
                let mut state = self.lock();
                ready(&mut state)
            };
            if done {
                return true;
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = &mut notified => {}
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, RendezvousState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Group-wide cancellation, remembering what triggered it.
struct GroupAbort {
    token: CancellationToken,
    reason: OnceLock<String>,
}

impl GroupAbort {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            reason: OnceLock::new(),
        }
    }

    fn trigger(&self, reason: String) {
        if self.reason.set(reason).is_ok() {
            warn!("{}", self.reason());
        }
        self.token.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn reason(&self) -> String {
        self.reason
            .get()
            .cloned()
            .unwrap_or_else(|| "run cancelled".to_string())
    }

    fn interrupted(&self) -> (EntryState, Option<ProvisionError>) {
        (
            EntryState::Aborted,
            Some(ProvisionError::Cancelled(self.reason())),
        )
    }
}

/// Runs the entries of a barrier group and tears it down.
pub struct GroupRunner {
    provisioner: Arc<Provisioner>,
    connector: Arc<dyn Connector>,
    logs: LogSink,
    step_timeout: Duration,
    deadline: Option<Duration>,
}

impl GroupRunner {
    pub fn new(provisioner: Arc<Provisioner>, connector: Arc<dyn Connector>, logs: LogSink) -> Self {
        Self {
            provisioner,
            connector,
            logs,
            step_timeout: Duration::from_secs(3600),
            deadline: None,
        }
    }

    /// Timeout of `run` steps that do not set their own.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Wall-clock limit for running a group.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Runs `group` to completion, then releases all of its guests.
    ///
    /// Groups that were not admitted are left untouched.
    pub async fn run(&self, group: &mut BarrierGroup, cancel: &CancellationToken) {
        if group.state != GroupState::Running {
            debug!("Group {} is {:?}, not running it", group.id, group.state);
            return;
        }

        info!("Group {}: running {} entries", group.id, group.entries.len());
        let abort = GroupAbort::new(cancel.child_token());
        let rendezvous = Rendezvous::new(group.entries.iter().map(|e| (e.id(), e.role)));

        {
            let work = join_all(
                group
                    .entries
                    .iter_mut()
                    .map(|run| self.run_entry(run, &rendezvous, &abort)),
            );
            tokio::pin!(work);

            let deadline = async {
                match self.deadline {
                    Some(limit) => {
                        tokio::time::sleep(limit).await;
                        limit
                    }
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = &mut work => {}
                limit = deadline => {
                    abort.trigger(format!(
                        "group {} exceeded its deadline of {:?}",
                        group.id, limit
                    ));
                    work.await;
                }
            }
        }

        self.teardown(group).await;

        if abort.is_cancelled() {
            group.state = GroupState::Aborted;
            group.abort_reason = Some(abort.reason());
        } else {
            group.state = GroupState::Complete;
        }
        info!("Group {}: {:?}", group.id, group.state);
    }

    async fn run_entry(&self, run: &mut EntryRun, rendezvous: &Rendezvous, abort: &GroupAbort) {
        run.start(EntryState::Running);
        let (state, error) = self.run_steps(run, rendezvous, abort).await;
        rendezvous.depart(run.id());
        run.finish(state, error);
    }

    async fn run_steps(
        &self,
        run: &mut EntryRun,
        rendezvous: &Rendezvous,
        abort: &GroupAbort,
    ) -> (EntryState, Option<ProvisionError>) {
        let id = run.id().to_string();

        let session = match self.connector.connect(&run.guest) {
            Ok(session) => session,
            Err(e) => return infra_failure(&id, abort, format!("cannot reach guest: {}", e)),
        };

        let steps = run.entry.steps.clone();
        for (n, step) in steps.iter().enumerate() {
            if abort.is_cancelled() {
                return abort.interrupted();
            }
            debug!("Entry {}: step {} {}", id, n + 1, step);

            match step {
                Step::Run { command, .. } => {
                    let cmd = Command::shell(command.clone());
                    let timeout = step.timeout(self.step_timeout);
                    let result =
                        run_command(session.as_ref(), &cmd, &id, &self.logs, timeout, &abort.token)
                            .await;

                    match result {
                        Ok(result) if result.success() => {}
                        Ok(result) => {
                            let reason =
                                format!("step {} ({}) exited with {}", n + 1, step, result.exit_code);
                            info!("Entry {}: {}", id, reason);
                            run.fail_test(reason);
                        }
                        Err(SessionError::Cancelled) => return abort.interrupted(),
                        Err(e) => {
                            let reason = format!("step {} ({}) failed: {}", n + 1, step, e);
                            return infra_failure(&id, abort, reason);
                        }
                    }
                }
                Step::Sync { point } => {
                    if !rendezvous.arrive(point, &id, run.role, &abort.token).await {
                        return abort.interrupted();
                    }
                }
                Step::Checkpoint => {
                    let result = run.snapshots.create(&mut run.guest, &abort.token).await;
                    if let Err(e) = result {
                        return snapshot_failure(&id, abort, e);
                    }
                }
                Step::Rollback => {
                    let result = match run.snapshots.latest_ready().map(str::to_string) {
                        Some(snapshot) => {
                            run.snapshots
                                .restore(&mut run.guest, &snapshot, &abort.token)
                                .await
                        }
                        None => Err(ProvisionError::Snapshot(
                            "no snapshot to roll back to".to_string(),
                        )),
                    };
                    if let Err(e) = result {
                        return snapshot_failure(&id, abort, e);
                    }
                }
            }
        }

        (EntryState::Complete, None)
    }

    async fn teardown(&self, group: &mut BarrierGroup) {
        let mut order = group.pool.take_release_order();
        for index in 0..group.entries.len() {
            if !order.contains(&index) {
                order.push(index);
            }
        }

        for index in order {
            let run = &mut group.entries[index];
            if let Err(e) = run.snapshots.delete_all().await {
                warn!("Entry {}: {}", run.entry.id, e);
            }
            self.provisioner.release_quietly(&mut run.guest).await;
        }
    }
}

fn infra_failure(
    id: &str,
    abort: &GroupAbort,
    reason: String,
) -> (EntryState, Option<ProvisionError>) {
    abort.trigger(format!("entry {} failed: {}", id, reason));
    (
        EntryState::Failed,
        Some(ProvisionError::FatalEnvironment(reason)),
    )
}

fn snapshot_failure(
    id: &str,
    abort: &GroupAbort,
    error: ProvisionError,
) -> (EntryState, Option<ProvisionError>) {
    if matches!(error, ProvisionError::Cancelled(_)) {
        return abort.interrupted();
    }
    warn!("Entry {}: {}", id, error);
    (EntryState::Failed, Some(error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{ProvisionOptions, TestingEnvironment};
    use crate::error::ErrorKind;
    use crate::lifecycle::GuestState;
    use crate::lifecycle::tests::provisioner;
    use crate::orchestrator::scheduler::{Scheduler, partition};
    use crate::provider::mock::{Call, MockProvisioningClient};
    use crate::schedule::{ScheduleEntry, TestOutcome, TestSchedule};
    use crate::session::log_channel;
    use crate::session::tests::{Scripted, ScriptedConnector};

    fn run_step(command: &str) -> Step {
        Step::Run {
            command: command.to_string(),
            timeout_secs: None,
        }
    }

    fn sync(point: &str) -> Step {
        Step::Sync {
            point: point.to_string(),
        }
    }

    fn entry(id: &str, steps: Vec<Step>) -> ScheduleEntry {
        let mut entry = ScheduleEntry::new(id, TestingEnvironment::new("x86_64", "RHEL"));
        entry.group = Some("g".to_string());
        entry.steps = steps;
        entry
    }

    fn snapshot_entry(id: &str, steps: Vec<Step>) -> ScheduleEntry {
        let mut entry = entry(id, steps);
        entry.environment.snapshots = true;
        entry
    }

    async fn admitted(
        client: &MockProvisioningClient,
        entries: Vec<ScheduleEntry>,
    ) -> (Arc<Provisioner>, BarrierGroup) {
        let provisioner = Arc::new(provisioner(client));
        let mut groups = partition(&TestSchedule::new(entries), &provisioner);
        let mut group = groups.remove(0);
        Scheduler::with_limit(Arc::clone(&provisioner), ProvisionOptions::default(), 4)
            .admit(&mut group, &CancellationToken::new())
            .await
            .unwrap();
        (provisioner, group)
    }

    async fn run_group(
        client: &MockProvisioningClient,
        connector: Arc<ScriptedConnector>,
        entries: Vec<ScheduleEntry>,
        deadline: Option<Duration>,
    ) -> BarrierGroup {
        let (provisioner, mut group) = admitted(client, entries).await;
        let (logs, _stream) = log_channel();
        GroupRunner::new(provisioner, connector, logs)
            .with_deadline(deadline)
            .run(&mut group, &CancellationToken::new())
            .await;
        group
    }

    fn assert_released_once(client: &MockProvisioningClient, group: &BarrierGroup) {
        assert!(client.leaked().is_empty());
        for run in group.entries() {
            assert_eq!(run.guest.state(), GuestState::Released);
            let guestname = run.guest.id().unwrap();
            assert_eq!(client.cancels_of(guestname), 1);
        }
    }

    #[tokio::test]
    async fn test_completed_group_releases_guests() {
        let client = MockProvisioningClient::new();
        let connector = Arc::new(ScriptedConnector::default());

        let group = run_group(
            &client,
            Arc::clone(&connector),
            vec![entry("e1", vec![run_step("true")])],
            None,
        )
        .await;

        assert_eq!(group.state(), GroupState::Complete);
        let result = &group.results()[0];
        assert!(result.passed());
        assert_eq!(connector.executed(), vec!["true"]);
        assert_released_once(&client, &group);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_outcome_only() {
        let client = MockProvisioningClient::new();
        let connector = Arc::new(ScriptedConnector::default().with("false", Scripted::Exit(1)));

        let group = run_group(
            &client,
            Arc::clone(&connector),
            vec![entry("e1", vec![run_step("false"), run_step("true")])],
            None,
        )
        .await;

        let result = &group.results()[0];
        assert_eq!(result.state, EntryState::Complete);
        assert_eq!(result.outcome, TestOutcome::Failed);
        assert_eq!(result.error_kind, None);
        assert!(result.reason.as_deref().unwrap().contains("exited with 1"));
        assert_eq!(connector.executed(), vec!["false", "true"]);
    }

    #[tokio::test]
    async fn test_lost_connection_is_an_infrastructure_failure() {
        let client = MockProvisioningClient::new();
        let connector =
            Arc::new(ScriptedConnector::default().with("make check", Scripted::Exit(255)));

        let group = run_group(
            &client,
            Arc::clone(&connector),
            vec![entry("e1", vec![run_step("make check"), run_step("true")])],
            None,
        )
        .await;

        assert_eq!(group.state(), GroupState::Aborted);
        let result = &group.results()[0];
        assert_eq!(result.state, EntryState::Failed);
        assert_eq!(result.error_kind, Some(ErrorKind::FatalEnvironment));
        assert!(result.reason.as_deref().unwrap().contains("exited with 255"));
        assert_eq!(connector.executed(), vec!["make check"]);
        assert_released_once(&client, &group);
    }

    #[tokio::test]
    async fn test_execution_failure_cancels_group() {
        let client = MockProvisioningClient::new();
        let connector = Arc::new(
            ScriptedConnector::default()
                .with("serve", Scripted::Hang)
                .with("boom", Scripted::Unreachable),
        );

        let group = run_group(
            &client,
            connector,
            vec![
                entry("a", vec![run_step("serve")]),
                entry("b", vec![run_step("boom")]),
            ],
            None,
        )
        .await;

        assert_eq!(group.state(), GroupState::Aborted);
        let results = group.results();
        assert_eq!(results[0].state, EntryState::Aborted);
        assert_eq!(results[0].error_kind, Some(ErrorKind::Cancelled));
        assert!(results[0].reason.as_deref().unwrap().contains("entry b failed"));
        assert_eq!(results[1].state, EntryState::Failed);
        assert_eq!(results[1].error_kind, Some(ErrorKind::FatalEnvironment));
        assert_released_once(&client, &group);
    }

    #[tokio::test]
    async fn test_primary_waits_for_secondaries() {
        let client = MockProvisioningClient::new();
        let connector = Arc::new(ScriptedConnector::default());
        let mut server = entry("server", vec![run_step("start-server"), sync("up")]);
        server.role = Some(Role::Primary);

        let group = run_group(
            &client,
            Arc::clone(&connector),
            vec![entry("client", vec![sync("up"), run_step("curl")]), server],
            None,
        )
        .await;

        assert_eq!(connector.executed(), vec!["start-server", "curl"]);
        assert!(group.results().iter().all(|r| r.passed()));
    }

    #[tokio::test]
    async fn test_deadline_interrupts_entries() {
        let client = MockProvisioningClient::new();
        let connector = Arc::new(ScriptedConnector::default().with("sleep", Scripted::Hang));

        let group = run_group(
            &client,
            connector,
            vec![entry("e1", vec![run_step("sleep")])],
            Some(Duration::from_millis(20)),
        )
        .await;

        assert_eq!(group.state(), GroupState::Aborted);
        let result = &group.results()[0];
        assert_eq!(result.state, EntryState::Aborted);
        assert!(result.reason.as_deref().unwrap().contains("deadline"));
        assert_released_once(&client, &group);
    }

    #[tokio::test]
    async fn test_snapshot_failure_is_scoped_to_entry() {
        let client = MockProvisioningClient::new();
        client.fail_next_snapshot("storage full");
        let connector = Arc::new(ScriptedConnector::default());

        let group = run_group(
            &client,
            connector,
            vec![
                snapshot_entry("a", vec![Step::Checkpoint]),
                snapshot_entry("b", vec![run_step("true")]),
            ],
            None,
        )
        .await;

        assert_eq!(group.state(), GroupState::Complete);
        let results = group.results();
        assert_eq!(results[0].state, EntryState::Failed);
        assert_eq!(results[0].error_kind, Some(ErrorKind::Snapshot));
        assert!(results[1].passed());
        assert_released_once(&client, &group);
    }

    #[tokio::test]
    async fn test_checkpoint_and_rollback() {
        let client = MockProvisioningClient::new();
        let connector = Arc::new(ScriptedConnector::default());

        let group = run_group(
            &client,
            Arc::clone(&connector),
            vec![snapshot_entry(
                "e1",
                vec![
                    Step::Checkpoint,
                    run_step("break-things"),
                    Step::Rollback,
                    run_step("verify"),
                ],
            )],
            None,
        )
        .await;

        assert!(group.results()[0].passed());
        assert_eq!(client.restores(), 1);
        assert_eq!(connector.executed(), vec!["break-things", "verify"]);
        assert!(
            client
                .calls()
                .iter()
                .any(|c| matches!(c, Call::CancelSnapshot { .. }))
        );
        assert_released_once(&client, &group);
    }

    #[tokio::test]
    async fn test_rollback_without_snapshot() {
        let client = MockProvisioningClient::new();
        let connector = Arc::new(ScriptedConnector::default());

        let group = run_group(
            &client,
            connector,
            vec![snapshot_entry("e1", vec![Step::Rollback])],
            None,
        )
        .await;

        assert_eq!(group.results()[0].error_kind, Some(ErrorKind::Snapshot));
        assert_eq!(client.restores(), 0);
    }

    #[tokio::test]
    async fn test_group_not_admitted_is_not_run() {
        let client = MockProvisioningClient::new();
        let provisioner = Arc::new(provisioner(&client));
        let mut group = partition(
            &TestSchedule::new(vec![entry("e1", vec![run_step("true")])]),
            &provisioner,
        )
        .remove(0);
        let connector = Arc::new(ScriptedConnector::default());
        let (logs, _stream) = log_channel();

        GroupRunner::new(provisioner, connector.clone(), logs)
            .run(&mut group, &CancellationToken::new())
            .await;

        assert!(connector.executed().is_empty());
        assert_eq!(group.state(), GroupState::Pending);
    }

    #[tokio::test]
    async fn test_departed_secondary_releases_primary() {
        let rendezvous = Rendezvous::new([("p", Role::Primary), ("s", Role::Secondary)]);
        rendezvous.depart("s");

        assert!(
            rendezvous
                .arrive("x", "p", Role::Primary, &CancellationToken::new())
                .await
        );
    }

    #[tokio::test]
    async fn test_departed_primary_releases_secondary() {
        let rendezvous = Rendezvous::new([("p", Role::Primary), ("s", Role::Secondary)]);
        rendezvous.depart("p");

        assert!(
            rendezvous
                .arrive("x", "s", Role::Secondary, &CancellationToken::new())
                .await
        );
    }

    #[tokio::test]
    async fn test_cancelled_wait() {
        let rendezvous = Rendezvous::new([("p", Role::Primary), ("s", Role::Secondary)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(!rendezvous.arrive("x", "p", Role::Primary, &cancel).await);
    }
}
