//! Guest request state machine.
//!
//! ```text
//!   Requesting ──► Promised ──► Ready
//!        ▲            │           │ (snapshot restore / restart)
//!        │            ▼           ▼
//!        └──────── Error      Promised
//!
//!   any state ──► Releasing ──► Released (terminal)
//! ```
//!
//! A [`GuestRequest`] is owned by exactly one schedule entry and mutated
//! only by the task driving that entry. Observations of the remote state are
//! applied through [`GuestRequest::observe`], which ignores repeated states
//! and transitions the machine does not allow.

use serde::Serialize;
use tracing::debug;

use crate::environment::TestingEnvironment;
use crate::error::ErrorKind;
use crate::provider::{GuestInfo, RemoteState, SshInfo};

/// Lifecycle state of a guest request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestState {
    Requesting,
    Promised,
    Ready,
    Error,
    Releasing,
    Released,
}

impl GuestState {
    /// Maps a service-reported state onto the local machine.
    ///
    /// A guest reported `ready` without an address is still in flight.
    pub fn from_remote(state: RemoteState, has_address: bool) -> GuestState {
        match state {
            RemoteState::Ready if has_address => GuestState::Ready,
            RemoteState::Error => GuestState::Error,
            _ => GuestState::Promised,
        }
    }

    /// Returns `true` if the machine allows moving from `self` to `to`.
    pub fn can_transition(self, to: GuestState) -> bool {
        use GuestState::*;

        match (self, to) {
            (Released, _) => false,
            (Releasing, Released) => true,
            (Releasing, _) => false,
            (_, Releasing) => true,
            (Requesting, Promised | Ready | Error) => true,
            (Promised, Ready | Error) => true,
            (Error, Requesting) => true,
            (Ready, Promised) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for GuestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GuestState::Requesting => "requesting",
            GuestState::Promised => "promised",
            GuestState::Ready => "ready",
            GuestState::Error => "error",
            GuestState::Releasing => "releasing",
            GuestState::Released => "released",
        };
        f.write_str(name)
    }
}

/// Connection summary of a guest, as published in results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuestSummary {
    pub guestname: String,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
}

impl GuestSummary {
    /// Command line to log into the guest, when enough is known.
    pub fn ssh_hint(&self) -> Option<String> {
        let address = self.address.as_deref()?;
        Some(format!(
            "ssh -l {} -p {} {}",
            self.username.as_deref().unwrap_or("root"),
            self.port.unwrap_or(22),
            address
        ))
    }
}

/// One entry's guest, from the first request to the final release.
#[derive(Debug, Clone)]
pub struct GuestRequest {
    owner: String,
    environment: TestingEnvironment,
    id: Option<String>,
    state: GuestState,
    address: Option<String>,
    ssh: Option<SshInfo>,
    attempts: u32,
    last_error: Option<ErrorKind>,
    history: Vec<GuestState>,
}

impl GuestRequest {
    /// Creates a request owned by the schedule entry `owner`.
    pub fn new(owner: impl Into<String>, environment: TestingEnvironment) -> Self {
        Self {
            owner: owner.into(),
            environment,
            id: None,
            state: GuestState::Requesting,
            address: None,
            ssh: None,
            attempts: 0,
            last_error: None,
            history: vec![GuestState::Requesting],
        }
    }

    /// Id of the owning schedule entry.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn environment(&self) -> &TestingEnvironment {
        &self.environment
    }

    /// Service-assigned guest id of the current attempt.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn state(&self) -> GuestState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == GuestState::Ready
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn ssh(&self) -> Option<&SshInfo> {
        self.ssh.as_ref()
    }

    pub fn supports_snapshots(&self) -> bool {
        self.environment.snapshots
    }

    /// Number of acquisition attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    /// Every state the machine has entered, in order.
    pub fn history(&self) -> &[GuestState] {
        &self.history
    }

    /// Connection summary, once a guest id is known.
    pub fn summary(&self) -> Option<GuestSummary> {
        Some(GuestSummary {
            guestname: self.id.clone()?,
            address: self.address.clone(),
            port: self.ssh.as_ref().map(|s| s.port),
            username: self.ssh.as_ref().map(|s| s.username.clone()),
        })
    }

    pub(crate) fn start_attempt(&mut self) {
        self.attempts += 1;
    }

    pub(crate) fn record_error(&mut self, kind: ErrorKind) {
        self.last_error = Some(kind);
    }

    /// Binds the guest returned by a successful create call.
    pub(crate) fn bind(&mut self, info: &GuestInfo) {
        self.id = Some(info.guestname.clone());
        self.observe(info);
    }

    /// Applies one observation of the remote guest.
    ///
    /// Returns `true` if the observation moved the machine to a new state.
    /// Repeated observations of the current state are no-ops.
    pub fn observe(&mut self, info: &GuestInfo) -> bool {
        self.update_connection(info);

        let next = GuestState::from_remote(info.state, self.address.is_some());
        if next == self.state {
            return false;
        }
        if !self.transition(next) {
            debug!(
                "Ignoring {} -> {} for guest {}",
                self.state, next, info.guestname
            );
            return false;
        }
        true
    }

    /// Takes the address and SSH details of `info` without changing state.
    pub(crate) fn update_connection(&mut self, info: &GuestInfo) {
        if info.address.is_some() {
            self.address = info.address.clone();
        }
        if info.ssh.is_some() {
            self.ssh = info.ssh.clone();
        }
    }

    /// Marks the current attempt as failed.
    pub(crate) fn fail(&mut self) {
        if self.state != GuestState::Error {
            self.transition(GuestState::Error);
        }
    }

    /// Puts a ready guest back to promised while it is being rebuilt.
    pub(crate) fn suspend(&mut self) -> bool {
        self.state == GuestState::Ready && self.transition(GuestState::Promised)
    }

    /// Prepares for another attempt, returning the id of the abandoned guest.
    ///
    /// The caller owns releasing the returned guest.
    pub(crate) fn begin_retry(&mut self) -> Option<String> {
        if self.state == GuestState::Error {
            self.transition(GuestState::Requesting);
        }
        self.address = None;
        self.ssh = None;
        self.id.take()
    }

    /// Enters `Releasing`, returning the guest to delete.
    ///
    /// Returns `None` if the request was already released, or if no guest was
    /// ever created (the request is then released right away).
    pub(crate) fn begin_release(&mut self) -> Option<String> {
        if matches!(self.state, GuestState::Releasing | GuestState::Released) {
            return None;
        }
        self.transition(GuestState::Releasing);
        match &self.id {
            Some(id) => Some(id.clone()),
            None => {
                self.transition(GuestState::Released);
                None
            }
        }
    }

    pub(crate) fn finish_release(&mut self) {
        self.transition(GuestState::Released);
    }

    fn transition(&mut self, to: GuestState) -> bool {
        if !self.state.can_transition(to) {
            return false;
        }
        self.state = to;
        self.history.push(to);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(state: RemoteState, address: Option<&str>) -> GuestInfo {
        GuestInfo {
            guestname: "g1".to_string(),
            address: address.map(String::from),
            state,
            ssh: Some(SshInfo {
                keyname: Some("ci".to_string()),
                username: "root".to_string(),
                port: 22,
            }),
            environment: None,
        }
    }

    fn request() -> GuestRequest {
        GuestRequest::new("e1", TestingEnvironment::new("x86_64", "RHEL"))
    }

    #[test]
    fn test_repeated_observations_enter_ready_once() {
        let mut guest = request();
        guest.bind(&info(RemoteState::Promised, None));

        let moved: Vec<bool> = [
            info(RemoteState::Promised, None),
            info(RemoteState::Ready, Some("1.1.1.1")),
            info(RemoteState::Ready, Some("1.1.1.1")),
        ]
        .iter()
        .map(|i| guest.observe(i))
        .collect();

        assert_eq!(moved, vec![false, true, false]);
        let readies = guest
            .history()
            .iter()
            .filter(|s| **s == GuestState::Ready)
            .count();
        assert_eq!(readies, 1);
    }

    #[test]
    fn test_ready_without_address_keeps_waiting() {
        let mut guest = request();
        guest.bind(&info(RemoteState::Ready, None));
        assert_eq!(guest.state(), GuestState::Promised);
    }

    #[test]
    fn test_released_is_terminal() {
        let mut guest = request();
        guest.bind(&info(RemoteState::Promised, None));

        assert_eq!(guest.begin_release().as_deref(), Some("g1"));
        guest.finish_release();
        assert_eq!(guest.begin_release(), None);
        assert!(!guest.observe(&info(RemoteState::Ready, Some("1.1.1.1"))));
        assert_eq!(guest.state(), GuestState::Released);
    }

    #[test]
    fn test_release_without_guest_needs_no_call() {
        let mut guest = request();
        assert_eq!(guest.begin_release(), None);
        assert_eq!(guest.state(), GuestState::Released);
    }

    #[test]
    fn test_retry_hands_back_abandoned_guest() {
        let mut guest = request();
        guest.bind(&info(RemoteState::Error, None));
        assert_eq!(guest.state(), GuestState::Error);

        assert_eq!(guest.begin_retry().as_deref(), Some("g1"));
        assert_eq!(guest.state(), GuestState::Requesting);
        assert_eq!(guest.id(), None);
    }

    #[test]
    fn test_ready_guest_never_jumps_to_error() {
        assert!(!GuestState::Ready.can_transition(GuestState::Error));
        assert!(GuestState::Ready.can_transition(GuestState::Promised));
        assert!(GuestState::Error.can_transition(GuestState::Releasing));
    }

    #[test]
    fn test_summary_hint() {
        let mut guest = request();
        guest.bind(&info(RemoteState::Ready, Some("1.1.1.1")));

        let summary = guest.summary().unwrap();
        assert_eq!(summary.ssh_hint().unwrap(), "ssh -l root -p 22 1.1.1.1");
    }
}
