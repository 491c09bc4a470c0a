//! Snapshots of a single guest.
//!
//! A [`SnapshotManager`] belongs to one schedule entry and tracks the
//! snapshots taken of that entry's guest. Create and restore are only valid
//! while the guest is ready; both cycle the snapshot through
//! `Promised -> Ready` and then wait for the guest, which the service
//! restarts, to be ready again. Snapshot failures are scoped to the entry
//! and never touch the guest's own lifecycle beyond that wait.

use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::sleep_or_cancel;
use super::{GuestRequest, GuestState, Provisioner};
use crate::error::{ProvisionError, ProvisionResult};
use crate::provider::RemoteState;

/// State of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotState {
    Promised,
    Ready,
    Error,
}

impl From<RemoteState> for SnapshotState {
    fn from(state: RemoteState) -> Self {
        match state {
            RemoteState::Ready => SnapshotState::Ready,
            RemoteState::Error => SnapshotState::Error,
            _ => SnapshotState::Promised,
        }
    }
}

/// A snapshot of one guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,
    pub guest_id: String,
    pub state: SnapshotState,
    /// Completed `Promised -> Ready` cycles: one for the create, one per restore.
    pub ready_cycles: u32,
}

/// Snapshot create / restore / delete for the guest of one entry.
pub struct SnapshotManager {
    provisioner: Arc<Provisioner>,
    snapshots: Vec<Snapshot>,
}

impl SnapshotManager {
    pub fn new(provisioner: Arc<Provisioner>) -> Self {
        Self {
            provisioner,
            snapshots: Vec::new(),
        }
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn get(&self, id: &str) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.id == id)
    }

    /// Id of the most recent ready snapshot.
    pub fn latest_ready(&self) -> Option<&str> {
        self.snapshots
            .iter()
            .rev()
            .find(|s| s.state == SnapshotState::Ready)
            .map(|s| s.id.as_str())
    }

    /// Takes a snapshot of a ready guest and waits for it to be usable.
    ///
    /// # Errors
    ///
    /// `Snapshot` if the guest is not ready, does not support snapshots, or
    /// the snapshot or the restarted guest never becomes ready. The guest is
    /// not contacted when it is not ready.
    pub async fn create(
        &mut self,
        guest: &mut GuestRequest,
        cancel: &CancellationToken,
    ) -> ProvisionResult<String> {
        let guestname = usable_guest(guest)?;

        let info = self
            .provisioner
            .client()
            .create_snapshot(&guestname, true)
            .await
            .map_err(|e| {
                ProvisionError::Snapshot(format!(
                    "failed to create snapshot of guest {}: {}",
                    guestname, e
                ))
            })?;

        info!(
            "Snapshot {} of guest {} requested",
            info.snapshotname, guestname
        );
        self.snapshots.push(Snapshot {
            id: info.snapshotname.clone(),
            guest_id: guestname.clone(),
            state: SnapshotState::from(info.state),
            ready_cycles: 0,
        });
        let index = self.snapshots.len() - 1;

        self.wait_snapshot(index, cancel).await?;
        guest.suspend();
        self.wait_guest(guest, cancel).await?;

        Ok(info.snapshotname)
    }

    /// Rebuilds the guest from a ready snapshot.
    ///
    /// The guest goes back to `Promised` and must not be used until this
    /// returns.
    ///
    /// # Errors
    ///
    /// `Snapshot` if the guest or the snapshot is not ready (without
    /// contacting the service), or if the restore does not complete.
    pub async fn restore(
        &mut self,
        guest: &mut GuestRequest,
        snapshot_id: &str,
        cancel: &CancellationToken,
    ) -> ProvisionResult<()> {
        let guestname = usable_guest(guest)?;

        let Some(index) = self.snapshots.iter().position(|s| s.id == snapshot_id) else {
            return Err(ProvisionError::Snapshot(format!(
                "unknown snapshot {}",
                snapshot_id
            )));
        };
        if self.snapshots[index].state != SnapshotState::Ready {
            return Err(ProvisionError::Snapshot(format!(
                "snapshot {} is not ready",
                snapshot_id
            )));
        }

        let info = self
            .provisioner
            .client()
            .restore_snapshot(&guestname, snapshot_id)
            .await
            .map_err(|e| {
                ProvisionError::Snapshot(format!(
                    "failed to restore guest {} from snapshot {}: {}",
                    guestname, snapshot_id, e
                ))
            })?;

        info!("Restoring guest {} from snapshot {}", guestname, snapshot_id);
        guest.suspend();
        self.snapshots[index].state = match SnapshotState::from(info.state) {
            SnapshotState::Ready => SnapshotState::Promised,
            other => other,
        };

        self.wait_snapshot(index, cancel).await?;
        self.wait_guest(guest, cancel).await
    }

    /// Deletes every snapshot, attempting all of them even if some fail.
    ///
    /// # Errors
    ///
    /// `Snapshot` naming the snapshots whose delete call failed.
    pub async fn delete_all(&mut self) -> ProvisionResult<()> {
        let mut failed = Vec::new();

        for snapshot in self.snapshots.drain(..).rev() {
            match self
                .provisioner
                .client()
                .cancel_snapshot(&snapshot.guest_id, &snapshot.id)
                .await
            {
                Ok(()) => debug!("Deleted snapshot {}", snapshot.id),
                Err(e) => {
                    warn!("Failed to delete snapshot {}: {}", snapshot.id, e);
                    failed.push(snapshot.id);
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(ProvisionError::Snapshot(format!(
                "failed to delete snapshots: {}",
                failed.join(", ")
            )))
        }
    }

    /// Polls snapshot `index` until it is ready.
    async fn wait_snapshot(
        &mut self,
        index: usize,
        cancel: &CancellationToken,
    ) -> ProvisionResult<()> {
        let schedule = self.provisioner.settings().snapshot_poll;
        let deadline = Instant::now() + schedule.timeout;
        let client = Arc::clone(self.provisioner.client());
        let snapshot = &mut self.snapshots[index];

        loop {
            match snapshot.state {
                SnapshotState::Ready => {
                    snapshot.ready_cycles += 1;
                    info!("Snapshot {} is ready", snapshot.id);
                    return Ok(());
                }
                SnapshotState::Error => {
                    return Err(ProvisionError::Snapshot(format!(
                        "snapshot {} ended in error state",
                        snapshot.id
                    )));
                }
                SnapshotState::Promised => {}
            }

            if Instant::now() >= deadline {
                return Err(ProvisionError::Snapshot(format!(
                    "snapshot {} not ready after {:?}",
                    snapshot.id, schedule.timeout
                )));
            }

            if !sleep_or_cancel(schedule.next_delay(), cancel).await {
                return Err(ProvisionError::Cancelled(format!(
                    "waiting for snapshot {} cancelled",
                    snapshot.id
                )));
            }

            match client
                .inspect_snapshot(&snapshot.guest_id, &snapshot.id)
                .await
            {
                Ok(info) => snapshot.state = SnapshotState::from(info.state),
                Err(e) if e.is_transient() => {
                    debug!("Failed to inspect snapshot {}, retrying: {}", snapshot.id, e);
                }
                Err(e) => {
                    return Err(ProvisionError::Snapshot(format!(
                        "failed to inspect snapshot {}: {}",
                        snapshot.id, e
                    )));
                }
            }
        }
    }

    /// Waits for the restarted guest to be ready again.
    async fn wait_guest(
        &self,
        guest: &mut GuestRequest,
        cancel: &CancellationToken,
    ) -> ProvisionResult<()> {
        match self.provisioner.poll(guest, cancel).await {
            Ok(GuestState::Ready) => Ok(()),
            Ok(state) => Err(ProvisionError::Snapshot(format!(
                "guest {} is {} after snapshot operation",
                guest.id().unwrap_or_default(),
                state
            ))),
            Err(ProvisionError::Cancelled(reason)) => Err(ProvisionError::Cancelled(reason)),
            Err(e) => Err(ProvisionError::Snapshot(e.reason().to_string())),
        }
    }
}

/// Checks that snapshot operations are allowed on `guest`.
fn usable_guest(guest: &GuestRequest) -> ProvisionResult<String> {
    if !guest.is_ready() {
        return Err(ProvisionError::Snapshot(format!(
            "guest of entry {} is {}, snapshots need a ready guest",
            guest.owner(),
            guest.state()
        )));
    }
    if !guest.supports_snapshots() {
        return Err(ProvisionError::Snapshot(format!(
            "environment of entry {} does not support snapshots",
            guest.owner()
        )));
    }
    guest
        .id()
        .map(str::to_string)
        .ok_or_else(|| ProvisionError::Snapshot("guest has no id".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{ProvisionOptions, TestingEnvironment};
    use crate::error::ErrorKind;
    use crate::lifecycle::tests::provisioner;
    use crate::provider::mock::{Call, GuestScript, MockProvisioningClient};

    async fn ready_guest(
        client: &MockProvisioningClient,
        provisioner: &Provisioner,
    ) -> GuestRequest {
        let mut guest = GuestRequest::new(
            "e1",
            TestingEnvironment::new("x86_64", "RHEL").with_snapshots(true),
        );
        provisioner
            .acquire(
                &mut guest,
                &ProvisionOptions::default().tag("entry-id", "e1"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        guest
    }

    #[tokio::test]
    async fn test_create_then_restore_cycles_twice() {
        let client = MockProvisioningClient::new();
        let provisioner = Arc::new(provisioner(&client));
        let mut guest = ready_guest(&client, &provisioner).await;
        let mut snapshots = SnapshotManager::new(Arc::clone(&provisioner));
        let cancel = CancellationToken::new();

        let id = snapshots.create(&mut guest, &cancel).await.unwrap();
        assert!(guest.is_ready());
        snapshots.restore(&mut guest, &id, &cancel).await.unwrap();
        assert!(guest.is_ready());

        let snapshot = snapshots.get(&id).unwrap();
        assert_eq!(snapshots.snapshots().len(), 1);
        assert_eq!(snapshot.id, id);
        assert_eq!(snapshot.ready_cycles, 2);
        assert_eq!(snapshots.latest_ready(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn test_restore_on_errored_guest_skips_backend() {
        let client = MockProvisioningClient::new();
        client.queue_script("e1", GuestScript::failing("boom"));
        let provisioner = Arc::new(provisioner(&client));
        let mut guest = GuestRequest::new(
            "e1",
            TestingEnvironment::new("x86_64", "RHEL").with_snapshots(true),
        );
        provisioner
            .create(
                &mut guest,
                &ProvisionOptions::default().tag("entry-id", "e1"),
            )
            .await
            .unwrap();
        provisioner
            .poll(&mut guest, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(guest.state(), GuestState::Error);

        let mut snapshots = SnapshotManager::new(Arc::clone(&provisioner));
        let err = snapshots
            .restore(&mut guest, "snapshot-1", &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Snapshot);
        assert_eq!(client.restores(), 0);
    }

    #[tokio::test]
    async fn test_create_requires_snapshot_support() {
        let client = MockProvisioningClient::new();
        let provisioner = Arc::new(provisioner(&client));
        let mut guest = GuestRequest::new("e1", TestingEnvironment::new("x86_64", "RHEL"));
        provisioner
            .acquire(
                &mut guest,
                &ProvisionOptions::default().tag("entry-id", "e1"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut snapshots = SnapshotManager::new(provisioner);
        let err = snapshots
            .create(&mut guest, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Snapshot);
        assert!(
            !client
                .calls()
                .iter()
                .any(|c| matches!(c, Call::CreateSnapshot { .. }))
        );
    }

    #[tokio::test]
    async fn test_failed_snapshot_leaves_guest_ready() {
        let client = MockProvisioningClient::new();
        let provisioner = Arc::new(provisioner(&client));
        let mut guest = ready_guest(&client, &provisioner).await;
        let mut snapshots = SnapshotManager::new(Arc::clone(&provisioner));

        client.fail_next_snapshot("disk full");
        let err = snapshots
            .create(&mut guest, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Snapshot);
        assert!(guest.is_ready());
    }

    #[tokio::test]
    async fn test_snapshot_error_state() {
        let client = MockProvisioningClient::new();
        client.set_snapshot_states(&[RemoteState::Promised, RemoteState::Error]);
        let provisioner = Arc::new(provisioner(&client));
        let mut guest = ready_guest(&client, &provisioner).await;
        let mut snapshots = SnapshotManager::new(Arc::clone(&provisioner));

        let err = snapshots
            .create(&mut guest, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Snapshot);
        assert_eq!(snapshots.latest_ready(), None);
    }

    #[tokio::test]
    async fn test_delete_all_is_unconditional() {
        let client = MockProvisioningClient::new();
        let provisioner = Arc::new(provisioner(&client));
        let mut guest = ready_guest(&client, &provisioner).await;
        let mut snapshots = SnapshotManager::new(Arc::clone(&provisioner));
        let cancel = CancellationToken::new();

        snapshots.create(&mut guest, &cancel).await.unwrap();
        snapshots.create(&mut guest, &cancel).await.unwrap();
        snapshots.delete_all().await.unwrap();

        let deletes = client
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::CancelSnapshot { .. }))
            .count();
        assert_eq!(deletes, 2);
        assert!(snapshots.snapshots().is_empty());
    }
}
