//! Scripted in-memory provisioning client for tests.
//!
//! Every created guest replays a [`GuestScript`]: the create response carries
//! the first state, and each inspect call advances one step until the last
//! state, which then repeats. Scripts are queued per schedule entry (keyed by
//! the `entry-id` user data tag) so concurrent acquisitions stay
//! deterministic. All calls are recorded for verification.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    GuestEvent, GuestInfo, ProviderError, ProviderResult, ProvisioningClient, RemoteState,
    SnapshotInfo, SshInfo,
};
use crate::environment::{ProvisionOptions, TestingEnvironment};

/// States replayed by one mock guest.
#[derive(Debug, Clone)]
pub struct GuestScript {
    pub states: Vec<RemoteState>,
    pub address: String,
    pub port: u16,
    pub username: String,
    /// Message of the `error` event reported once the guest is in `error`.
    pub error_event: Option<String>,
}

impl GuestScript {
    /// A guest that goes through `states` and ends up at `1.1.1.1:22`.
    pub fn new(states: &[RemoteState]) -> Self {
        Self {
            states: states.to_vec(),
            address: "1.1.1.1".to_string(),
            port: 22,
            username: "root".to_string(),
            error_event: None,
        }
    }

    /// `promised`, then `ready`.
    pub fn ready() -> Self {
        Self::new(&[RemoteState::Promised, RemoteState::Ready])
    }

    /// `promised`, then `error` with the given error event.
    pub fn failing(message: &str) -> Self {
        Self::new(&[RemoteState::Promised, RemoteState::Error]).with_error_event(message)
    }

    /// A guest that never leaves `promised`.
    pub fn stuck() -> Self {
        Self::new(&[RemoteState::Promised])
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.address = address.to_string();
        self
    }

    pub fn with_error_event(mut self, message: &str) -> Self {
        self.error_event = Some(message.to_string());
        self
    }
}

/// Failure injected into a create call.
#[derive(Debug, Clone)]
pub enum MockFailure {
    /// HTTP 400.
    Rejected(String),
    /// Connection-level failure.
    Connection(String),
}

impl From<MockFailure> for ProviderError {
    fn from(failure: MockFailure) -> Self {
        match failure {
            MockFailure::Rejected(msg) => ProviderError::Rejected(msg),
            MockFailure::Connection(msg) => ProviderError::Connection(msg),
        }
    }
}

/// One recorded client call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create { entry: Option<String> },
    Inspect { guest: String },
    Cancel { guest: String },
    CreateSnapshot { guest: String },
    InspectSnapshot { guest: String, snapshot: String },
    Restore { guest: String, snapshot: String },
    CancelSnapshot { guest: String, snapshot: String },
    Events { guest: String },
}

#[derive(Debug)]
struct MockGuest {
    entry: Option<String>,
    script: GuestScript,
    step: usize,
}

impl MockGuest {
    fn current(&self) -> RemoteState {
        let last = self.script.states.len().saturating_sub(1);
        self.script
            .states
            .get(self.step.min(last))
            .copied()
            .unwrap_or(RemoteState::Promised)
    }

    fn advance(&mut self) -> RemoteState {
        if self.step + 1 < self.script.states.len() {
            self.step += 1;
        }
        self.current()
    }

    /// Replays `promised, ready` after a restart.
    fn restart(&mut self) {
        self.script.states = vec![RemoteState::Promised, RemoteState::Ready];
        self.step = 0;
    }

    fn info(&self, guestname: &str) -> GuestInfo {
        let state = self.current();
        GuestInfo {
            guestname: guestname.to_string(),
            address: (state == RemoteState::Ready).then(|| self.script.address.clone()),
            state,
            ssh: Some(SshInfo {
                keyname: Some("mock".to_string()),
                username: self.script.username.clone(),
                port: self.script.port,
            }),
            environment: None,
        }
    }
}

#[derive(Debug)]
struct MockSnapshot {
    guest: String,
    states: Vec<RemoteState>,
    step: usize,
}

impl MockSnapshot {
    fn current(&self) -> RemoteState {
        let last = self.states.len().saturating_sub(1);
        self.states
            .get(self.step.min(last))
            .copied()
            .unwrap_or(RemoteState::Promised)
    }

    fn advance(&mut self) -> RemoteState {
        if self.step + 1 < self.states.len() {
            self.step += 1;
        }
        self.current()
    }
}

#[derive(Debug, Default)]
struct MockInner {
    scripts: HashMap<String, VecDeque<GuestScript>>,
    create_failures: HashMap<String, VecDeque<MockFailure>>,
    default_script: Option<GuestScript>,
    snapshot_states: Option<Vec<RemoteState>>,
    guests: HashMap<String, MockGuest>,
    snapshots: HashMap<String, MockSnapshot>,
    calls: Vec<Call>,
    next_id: usize,
    fail_next_cancel: Option<String>,
    fail_next_snapshot: Option<String>,
}

/// Scripted provisioning client.
///
/// Clones share state, so a test can keep a handle while the provisioner
/// owns another.
#[derive(Debug, Default, Clone)]
pub struct MockProvisioningClient {
    inner: Arc<Mutex<MockInner>>,
}

impl MockProvisioningClient {
    /// Create a client whose guests become ready after one `promised` poll.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Script used when no per-entry script is queued.
    pub fn set_default_script(&self, script: GuestScript) {
        let mut inner = self.lock();
        inner.default_script = Some(script);
    }

    /// Queue a script for the next guest created for `entry`.
    pub fn queue_script(&self, entry: &str, script: GuestScript) {
        let mut inner = self.lock();
        inner
            .scripts
            .entry(entry.to_string())
            .or_default()
            .push_back(script);
    }

    /// Cause the next create call for `entry` to fail.
    pub fn fail_next_create(&self, entry: &str, failure: MockFailure) {
        let mut inner = self.lock();
        inner
            .create_failures
            .entry(entry.to_string())
            .or_default()
            .push_back(failure);
    }

    /// Cause the next guest delete call to fail.
    pub fn fail_next_cancel(&self, error: &str) {
        let mut inner = self.lock();
        inner.fail_next_cancel = Some(error.to_string());
    }

    /// Cause the next snapshot create or restore call to fail.
    pub fn fail_next_snapshot(&self, error: &str) {
        let mut inner = self.lock();
        inner.fail_next_snapshot = Some(error.to_string());
    }

    /// States replayed by snapshots after create and after each restore.
    pub fn set_snapshot_states(&self, states: &[RemoteState]) {
        let mut inner = self.lock();
        inner.snapshot_states = Some(states.to_vec());
    }

    /// All calls, in order.
    pub fn calls(&self) -> Vec<Call> {
        let inner = self.lock();
        inner.calls.clone()
    }

    /// Number of create calls issued for `entry`.
    pub fn creates_for(&self, entry: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Create { entry: Some(e) } if e == entry))
            .count()
    }

    /// Guests created for `entry`, in creation order.
    pub fn guests_of(&self, entry: &str) -> Vec<String> {
        let inner = self.lock();
        let mut guests: Vec<&String> = inner
            .guests
            .iter()
            .filter(|(_, g)| g.entry.as_deref() == Some(entry))
            .map(|(name, _)| name)
            .collect();
        guests.sort_by_key(|name| guest_number(name));
        guests.into_iter().cloned().collect()
    }

    /// Number of delete calls issued for `guest`.
    pub fn cancels_of(&self, guest: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Cancel { guest: g } if g == guest))
            .count()
    }

    /// Guests deleted, in call order.
    pub fn cancelled(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Cancel { guest } => Some(guest),
                _ => None,
            })
            .collect()
    }

    /// Every created guest that never received a delete call.
    pub fn leaked(&self) -> Vec<String> {
        let cancelled = self.cancelled();
        let inner = self.lock();
        inner
            .guests
            .keys()
            .filter(|g| !cancelled.contains(g))
            .cloned()
            .collect()
    }

    /// Number of restore calls issued.
    pub fn restores(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Restore { .. }))
            .count()
    }

    fn record(&self, call: Call) {
        let mut inner = self.lock();
        inner.calls.push(call);
    }
}

fn guest_number(name: &str) -> usize {
    name.trim_start_matches("guest-").parse().unwrap_or(0)
}

#[async_trait]
impl ProvisioningClient for MockProvisioningClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_guest(
        &self,
        _environment: &TestingEnvironment,
        options: &ProvisionOptions,
    ) -> ProviderResult<GuestInfo> {
        let entry = options.user_data.get("entry-id").cloned();
        let mut inner = self.lock();
        inner.calls.push(Call::Create {
            entry: entry.clone(),
        });

        let key = entry.clone().unwrap_or_default();
        if let Some(failure) = inner
            .create_failures
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return Err(failure.into());
        }

        let script = inner
            .scripts
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .or_else(|| inner.default_script.clone())
            .unwrap_or_else(GuestScript::ready);

        inner.next_id += 1;
        let guestname = format!("guest-{}", inner.next_id);
        let guest = MockGuest {
            entry,
            script,
            step: 0,
        };
        let info = guest.info(&guestname);
        inner.guests.insert(guestname, guest);
        Ok(info)
    }

    async fn inspect_guest(&self, guestname: &str) -> ProviderResult<GuestInfo> {
        self.record(Call::Inspect {
            guest: guestname.to_string(),
        });
        let mut inner = self.lock();
        let guest = inner
            .guests
            .get_mut(guestname)
            .ok_or_else(|| ProviderError::NotFound(guestname.to_string()))?;
        guest.advance();
        Ok(guest.info(guestname))
    }

    async fn cancel_guest(&self, guestname: &str) -> ProviderResult<()> {
        self.record(Call::Cancel {
            guest: guestname.to_string(),
        });
        let mut inner = self.lock();
        if let Some(error) = inner.fail_next_cancel.take() {
            return Err(ProviderError::Api {
                status: 500,
                message: error,
            });
        }
        Ok(())
    }

    async fn create_snapshot(
        &self,
        guestname: &str,
        start_again: bool,
    ) -> ProviderResult<SnapshotInfo> {
        self.record(Call::CreateSnapshot {
            guest: guestname.to_string(),
        });
        let mut inner = self.lock();
        if let Some(error) = inner.fail_next_snapshot.take() {
            return Err(ProviderError::Api {
                status: 500,
                message: error,
            });
        }

        let states = inner
            .snapshot_states
            .clone()
            .unwrap_or_else(|| vec![RemoteState::Promised, RemoteState::Ready]);
        let guest = inner
            .guests
            .get_mut(guestname)
            .ok_or_else(|| ProviderError::NotFound(guestname.to_string()))?;
        if start_again {
            guest.restart();
        }

        inner.next_id += 1;
        let snapshotname = format!("snapshot-{}", inner.next_id);
        let snapshot = MockSnapshot {
            guest: guestname.to_string(),
            states,
            step: 0,
        };
        let state = snapshot.current();
        inner.snapshots.insert(snapshotname.clone(), snapshot);
        Ok(SnapshotInfo {
            snapshotname,
            state,
        })
    }

    async fn inspect_snapshot(
        &self,
        guestname: &str,
        snapshotname: &str,
    ) -> ProviderResult<SnapshotInfo> {
        self.record(Call::InspectSnapshot {
            guest: guestname.to_string(),
            snapshot: snapshotname.to_string(),
        });
        let mut inner = self.lock();
        let snapshot = inner
            .snapshots
            .get_mut(snapshotname)
            .filter(|s| s.guest == guestname)
            .ok_or_else(|| ProviderError::NotFound(snapshotname.to_string()))?;
        let state = snapshot.advance();
        Ok(SnapshotInfo {
            snapshotname: snapshotname.to_string(),
            state,
        })
    }

    async fn restore_snapshot(
        &self,
        guestname: &str,
        snapshotname: &str,
    ) -> ProviderResult<SnapshotInfo> {
        self.record(Call::Restore {
            guest: guestname.to_string(),
            snapshot: snapshotname.to_string(),
        });
        let mut inner = self.lock();
        if let Some(error) = inner.fail_next_snapshot.take() {
            return Err(ProviderError::Api {
                status: 500,
                message: error,
            });
        }

        let states = inner
            .snapshot_states
            .clone()
            .unwrap_or_else(|| vec![RemoteState::Promised, RemoteState::Ready]);
        let snapshot = inner
            .snapshots
            .get_mut(snapshotname)
            .filter(|s| s.guest == guestname)
            .ok_or_else(|| ProviderError::NotFound(snapshotname.to_string()))?;
        snapshot.states = states;
        snapshot.step = 0;
        let state = snapshot.current();

        if let Some(guest) = inner.guests.get_mut(guestname) {
            guest.restart();
        }
        Ok(SnapshotInfo {
            snapshotname: snapshotname.to_string(),
            state,
        })
    }

    async fn cancel_snapshot(&self, guestname: &str, snapshotname: &str) -> ProviderResult<()> {
        self.record(Call::CancelSnapshot {
            guest: guestname.to_string(),
            snapshot: snapshotname.to_string(),
        });
        Ok(())
    }

    async fn guest_events(&self, guestname: &str) -> ProviderResult<Vec<GuestEvent>> {
        self.record(Call::Events {
            guest: guestname.to_string(),
        });
        let inner = self.lock();
        let Some(guest) = inner.guests.get(guestname) else {
            return Ok(Vec::new());
        };
        Ok(guest
            .script
            .error_event
            .iter()
            .map(|message| GuestEvent {
                eventname: "error".to_string(),
                details: serde_json::json!({ "error": message }),
                updated: Some("2024-01-01 00:00:00".to_string()),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(entry: &str) -> ProvisionOptions {
        ProvisionOptions::default().tag("entry-id", entry)
    }

    #[tokio::test]
    async fn mock_replays_script_per_entry() {
        let client = MockProvisioningClient::new();
        client.queue_script("e1", GuestScript::stuck());
        let env = TestingEnvironment::new("x86_64", "RHEL");

        let stuck = client.create_guest(&env, &options("e1")).await.unwrap();
        let ready = client.create_guest(&env, &options("e2")).await.unwrap();

        for _ in 0..3 {
            let info = client.inspect_guest(&stuck.guestname).await.unwrap();
            assert_eq!(info.state, RemoteState::Promised);
        }
        let info = client.inspect_guest(&ready.guestname).await.unwrap();
        assert_eq!(info.state, RemoteState::Ready);
        assert_eq!(info.address.as_deref(), Some("1.1.1.1"));
    }

    #[tokio::test]
    async fn mock_injects_create_failure_once() {
        let client = MockProvisioningClient::new();
        client.fail_next_create("e1", MockFailure::Rejected("bad compose".into()));
        let env = TestingEnvironment::new("x86_64", "RHEL");

        let err = client.create_guest(&env, &options("e1")).await.unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(_)));
        assert!(client.create_guest(&env, &options("e1")).await.is_ok());
        assert_eq!(client.creates_for("e1"), 2);
    }

    #[tokio::test]
    async fn mock_tracks_leaks() {
        let client = MockProvisioningClient::new();
        let env = TestingEnvironment::new("x86_64", "RHEL");
        let a = client.create_guest(&env, &options("e1")).await.unwrap();
        let b = client.create_guest(&env, &options("e2")).await.unwrap();

        client.cancel_guest(&a.guestname).await.unwrap();

        assert_eq!(client.leaked(), vec![b.guestname]);
        assert_eq!(client.guests_of("e1"), vec![a.guestname]);
    }
}
