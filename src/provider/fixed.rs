//! Static pool of pre-existing machines.
//!
//! This client hands out machines listed in the configuration instead of
//! provisioning new ones. A machine is "created" by marking it in use and
//! "deleted" by returning it to the pool. Machines are always ready.
//!
//! # When to Use
//!
//! - **Lab hardware**: machines that cannot be provisioned on demand
//! - **Debugging**: re-running a schedule against known hosts
//!
//! # Limitations
//!
//! - Snapshots are not supported; requesting them is rejected
//! - Machines are matched on exact `arch` and `compose`
//!
//! # Example Configuration
//!
//! ```toml
//! [provider]
//! type = "static"
//!
//! [[provider.guests]]
//! hostname = "lab-01.example.com"
//! arch = "x86_64"
//! compose = "RHEL-9.4"
//! ```

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    GuestInfo, ProviderError, ProviderResult, ProvisioningClient, RemoteState, SnapshotInfo,
    SshInfo,
};
use crate::config::{StaticGuestConfig, StaticProviderConfig};
use crate::environment::{ProvisionOptions, TestingEnvironment};

/// Client handing out pre-existing machines.
pub struct StaticClient {
    guests: Vec<StaticGuestConfig>,
    in_use: Mutex<Vec<bool>>,
}

impl StaticClient {
    pub fn new(config: &StaticProviderConfig) -> Self {
        Self {
            guests: config.guests.clone(),
            in_use: Mutex::new(vec![false; config.guests.len()]),
        }
    }

    fn guestname(index: usize, guest: &StaticGuestConfig) -> String {
        format!("static-{}-{}", index, guest.hostname)
    }

    fn index_of(&self, guestname: &str) -> Option<usize> {
        self.guests
            .iter()
            .enumerate()
            .find(|(i, g)| Self::guestname(*i, g) == guestname)
            .map(|(i, _)| i)
    }

    fn info(index: usize, guest: &StaticGuestConfig) -> GuestInfo {
        GuestInfo {
            guestname: Self::guestname(index, guest),
            address: Some(guest.hostname.clone()),
            state: RemoteState::Ready,
            ssh: Some(SshInfo {
                keyname: None,
                username: guest.username.clone(),
                port: guest.port,
            }),
            environment: None,
        }
    }
}

fn unsupported() -> ProviderError {
    ProviderError::Rejected("static guests do not support snapshots".to_string())
}

#[async_trait]
impl ProvisioningClient for StaticClient {
    fn name(&self) -> &str {
        "static"
    }

    async fn create_guest(
        &self,
        environment: &TestingEnvironment,
        _options: &ProvisionOptions,
    ) -> ProviderResult<GuestInfo> {
        if environment.snapshots {
            return Err(unsupported());
        }

        let matching: Vec<usize> = self
            .guests
            .iter()
            .enumerate()
            .filter(|(_, g)| g.arch == environment.arch && g.compose == environment.compose)
            .map(|(i, _)| i)
            .collect();

        if matching.is_empty() {
            return Err(ProviderError::Rejected(format!(
                "no static guest provides {}",
                environment
            )));
        }

        let mut in_use = self.in_use.lock().await;
        let Some(index) = matching.into_iter().find(|i| !in_use[*i]) else {
            return Err(ProviderError::Api {
                status: 503,
                message: format!("all static guests providing {} are in use", environment),
            });
        };
        in_use[index] = true;

        let guest = &self.guests[index];
        debug!("Handing out static guest {}", guest.hostname);
        Ok(Self::info(index, guest))
    }

    async fn inspect_guest(&self, guestname: &str) -> ProviderResult<GuestInfo> {
        let index = self
            .index_of(guestname)
            .ok_or_else(|| ProviderError::NotFound(guestname.to_string()))?;
        if !self.in_use.lock().await[index] {
            return Err(ProviderError::NotFound(guestname.to_string()));
        }
        Ok(Self::info(index, &self.guests[index]))
    }

    async fn cancel_guest(&self, guestname: &str) -> ProviderResult<()> {
        if let Some(index) = self.index_of(guestname) {
            self.in_use.lock().await[index] = false;
        }
        Ok(())
    }

    async fn create_snapshot(
        &self,
        _guestname: &str,
        _start_again: bool,
    ) -> ProviderResult<SnapshotInfo> {
        Err(unsupported())
    }

    async fn inspect_snapshot(
        &self,
        _guestname: &str,
        snapshotname: &str,
    ) -> ProviderResult<SnapshotInfo> {
        Err(ProviderError::NotFound(snapshotname.to_string()))
    }

    async fn restore_snapshot(
        &self,
        _guestname: &str,
        _snapshotname: &str,
    ) -> ProviderResult<SnapshotInfo> {
        Err(unsupported())
    }

    async fn cancel_snapshot(&self, _guestname: &str, _snapshotname: &str) -> ProviderResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> StaticClient {
        StaticClient::new(&StaticProviderConfig {
            guests: vec![StaticGuestConfig {
                hostname: "10.0.0.5".to_string(),
                port: 2222,
                username: "cloud-user".to_string(),
                arch: "x86_64".to_string(),
                compose: "RHEL".to_string(),
            }],
        })
    }

    #[tokio::test]
    async fn test_hands_out_ready_machine() {
        let client = client();
        let env = TestingEnvironment::new("x86_64", "RHEL");

        let info = client
            .create_guest(&env, &ProvisionOptions::default())
            .await
            .unwrap();

        assert_eq!(info.state, RemoteState::Ready);
        assert_eq!(info.address.as_deref(), Some("10.0.0.5"));
        assert_eq!(info.ssh.unwrap().port, 2222);
    }

    #[tokio::test]
    async fn test_busy_pool_is_transient() {
        let client = client();
        let env = TestingEnvironment::new("x86_64", "RHEL");
        let first = client
            .create_guest(&env, &ProvisionOptions::default())
            .await
            .unwrap();

        let err = client
            .create_guest(&env, &ProvisionOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_transient());

        client.cancel_guest(&first.guestname).await.unwrap();
        assert!(
            client
                .create_guest(&env, &ProvisionOptions::default())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_unknown_environment_is_rejected() {
        let client = client();
        let env = TestingEnvironment::new("aarch64", "RHEL");
        let err = client
            .create_guest(&env, &ProvisionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_snapshots_rejected() {
        let client = client();
        let env = TestingEnvironment::new("x86_64", "RHEL").with_snapshots(true);
        let err = client
            .create_guest(&env, &ProvisionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(_)));
    }
}
