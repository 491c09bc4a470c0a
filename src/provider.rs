//! Provisioning service client abstraction.
//!
//! This module defines the contract between guestfarm and the remote
//! service that hands out ephemeral guests. The client is a thin transport:
//! it issues single create / inspect / delete calls and reports what the
//! service said. Polling, retries, and state tracking live in
//! [`lifecycle`](crate::lifecycle).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ProvisioningClient                        │
//! │                                                              │
//! │  create_guest(env, options) ────────► GuestInfo             │
//! │  inspect_guest(guestname)   ────────► GuestInfo             │
//! │  cancel_guest(guestname)                                    │
//! │                                                              │
//! │  create_snapshot / inspect_snapshot / restore_snapshot      │
//! │  cancel_snapshot            ────────► SnapshotInfo          │
//! │                                                              │
//! │  guest_events / console_log (diagnostic, read-only)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Clients
//!
//! | Client | Module | Description |
//! |--------|--------|-------------|
//! | HTTP | [`http`] | REST provisioning service (`/guests` API) |
//! | Fixed | [`fixed`] | Static pool of pre-existing machines |
//! | Mock | [`mock`] | Scripted in-memory client for tests |
//!
//! # Error Handling
//!
//! All client operations return [`ProviderResult<T>`]. Errors are
//! categorized so the lifecycle layer can decide between retrying
//! ([`ProviderError::is_transient`]) and failing fast.

pub mod fixed;
pub mod http;
pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;
use crate::environment::{ProvisionOptions, TestingEnvironment};

/// Result type for provisioning client operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors reported by a provisioning client.
///
/// - **Transient**: `Connection`, `Timeout`, `Api` with a 5xx status
/// - **Fatal**: `Rejected`, `QuotaDenied`, `NotFound`, `Decode`, `Other`
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The service refused the request as invalid (HTTP 400).
    ///
    /// Common causes: unknown compose, unsupported architecture, malformed
    /// hardware constraints.
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The service refused the request because a quota is exhausted.
    #[error("Quota denied: {0}")]
    QuotaDenied(String),

    /// The service answered with an unexpected status.
    #[error("API error, HTTP {status}: {message}")]
    Api { status: u16, message: String },

    /// The guest or snapshot does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Failed to reach the service.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The call did not finish in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The response body could not be decoded.
    #[error("Invalid response: {0}")]
    Decode(String),

    /// Client-specific error not covered by other variants.
    #[error("Provider-specific error: {0}")]
    Other(#[from] anyhow::Error),
}

impl ProviderError {
    /// Returns `true` if repeating the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Connection(_) | ProviderError::Timeout(_) => true,
            ProviderError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Guest or snapshot state as reported by the provisioning service.
///
/// The service knows more intermediate states than guestfarm cares about;
/// everything that is neither `ready` nor `error` means "still in flight".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteState {
    Pending,
    Routing,
    Provisioning,
    Promised,
    Preparing,
    Ready,
    Error,
    Condemned,
    Shelved,
    #[serde(other)]
    Unknown,
}

impl RemoteState {
    /// Returns `true` for states that end a poll loop.
    pub fn is_terminal(self) -> bool {
        matches!(self, RemoteState::Ready | RemoteState::Error)
    }
}

/// SSH connection details of a guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshInfo {
    /// Name of the key the service installed on the guest.
    #[serde(default)]
    pub keyname: Option<String>,

    /// Login user.
    pub username: String,

    /// SSH port.
    pub port: u16,
}

/// Guest description returned by create and inspect calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestInfo {
    /// Service-assigned guest identifier.
    pub guestname: String,

    /// Hostname or IP address, known once the guest is ready.
    #[serde(default)]
    pub address: Option<String>,

    /// Current guest state.
    pub state: RemoteState,

    /// SSH details; inspect calls may omit them.
    #[serde(default)]
    pub ssh: Option<SshInfo>,

    /// Environment as understood by the service.
    #[serde(default)]
    pub environment: Option<serde_json::Value>,
}

/// Snapshot description returned by snapshot calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Service-assigned snapshot identifier.
    pub snapshotname: String,

    /// Current snapshot state.
    pub state: RemoteState,
}

/// One entry of a guest's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestEvent {
    /// Event name, e.g. `created`, `state-changed`, `error`.
    pub eventname: String,

    /// Event payload.
    #[serde(default)]
    pub details: serde_json::Value,

    /// Timestamp of the event, as reported by the service.
    #[serde(default)]
    pub updated: Option<String>,
}

impl GuestEvent {
    /// Returns the error message carried by an `error` event.
    pub fn error_message(&self) -> Option<&str> {
        if self.eventname != "error" {
            return None;
        }
        self.details.get("error").and_then(|e| e.as_str())
    }
}

/// Picks the message of the newest `error` event, if any.
pub fn newest_error(events: &[GuestEvent]) -> Option<&str> {
    events
        .iter()
        .filter(|e| e.error_message().is_some())
        .max_by(|a, b| a.updated.cmp(&b.updated))
        .and_then(GuestEvent::error_message)
}

/// Client for a provisioning service.
///
/// Every method issues at most one logical call against the service.
/// Implementations must be safe to use concurrently for distinct guests;
/// the caller never issues concurrent calls for the same guest.
///
/// Delete calls (`cancel_guest`, `cancel_snapshot`) must be idempotent:
/// deleting something that is already gone succeeds.
#[async_trait]
pub trait ProvisioningClient: Send + Sync {
    /// Short name of the client, for logging.
    fn name(&self) -> &str;

    /// Submits a guest request.
    ///
    /// # Errors
    ///
    /// - `ProviderError::Rejected` - the environment is invalid
    /// - `ProviderError::QuotaDenied` - the request exceeds a quota
    /// - `ProviderError::Connection` - the service is unreachable
    async fn create_guest(
        &self,
        environment: &TestingEnvironment,
        options: &ProvisionOptions,
    ) -> ProviderResult<GuestInfo>;

    /// Fetches the current state of a guest.
    async fn inspect_guest(&self, guestname: &str) -> ProviderResult<GuestInfo>;

    /// Deletes a guest, or cancels its request if it is not ready yet.
    async fn cancel_guest(&self, guestname: &str) -> ProviderResult<()>;

    /// Starts a snapshot of a guest.
    ///
    /// With `start_again`, the guest is booted again once the snapshot is taken.
    async fn create_snapshot(
        &self,
        guestname: &str,
        start_again: bool,
    ) -> ProviderResult<SnapshotInfo>;

    /// Fetches the current state of a snapshot.
    async fn inspect_snapshot(
        &self,
        guestname: &str,
        snapshotname: &str,
    ) -> ProviderResult<SnapshotInfo>;

    /// Rebuilds a guest from a snapshot.
    async fn restore_snapshot(
        &self,
        guestname: &str,
        snapshotname: &str,
    ) -> ProviderResult<SnapshotInfo>;

    /// Deletes a snapshot.
    async fn cancel_snapshot(&self, guestname: &str, snapshotname: &str) -> ProviderResult<()>;

    /// Returns the guest's event log.
    ///
    /// # Default Implementation
    ///
    /// Returns an empty list. Clients backed by a service with an event log
    /// should override this method.
    async fn guest_events(&self, _guestname: &str) -> ProviderResult<Vec<GuestEvent>> {
        Ok(Vec::new())
    }

    /// Returns the latest console log of the guest, if one is available.
    async fn console_log(&self, _guestname: &str) -> ProviderResult<Option<String>> {
        Ok(None)
    }
}

/// Builds the client selected by the `[provider]` section.
///
/// The REST client checks that its URL points to the provisioning service
/// before it is handed out.
pub async fn connect(config: &ProviderConfig) -> ProviderResult<Arc<dyn ProvisioningClient>> {
    match config {
        ProviderConfig::Artemis(config) => {
            let client = http::ArtemisClient::new(config)?;
            client.verify().await?;
            Ok(Arc::new(client))
        }
        ProviderConfig::Static(config) => Ok(Arc::new(fixed::StaticClient::new(config))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_remote_state_deserializes() {
        let info: GuestInfo = serde_json::from_str(
            r#"{"guestname": "g1", "address": null, "state": "something-new"}"#,
        )
        .unwrap();
        assert_eq!(info.state, RemoteState::Unknown);
        assert!(!info.state.is_terminal());
    }

    #[test]
    fn test_create_response_with_ssh() {
        let info: GuestInfo = serde_json::from_str(
            r#"{
                "guestname": "g1",
                "address": "10.0.0.5",
                "state": "promised",
                "ssh": {"keyname": "ci", "username": "root", "port": 22},
                "environment": {"hw": {"arch": "x86_64"}}
            }"#,
        )
        .unwrap();
        assert_eq!(info.state, RemoteState::Promised);
        assert_eq!(info.ssh.unwrap().port, 22);
    }

    #[test]
    fn test_server_errors_are_transient() {
        assert!(
            ProviderError::Api {
                status: 503,
                message: "unavailable".into()
            }
            .is_transient()
        );
        assert!(
            !ProviderError::Api {
                status: 409,
                message: "conflict".into()
            }
            .is_transient()
        );
        assert!(!ProviderError::Rejected("bad".into()).is_transient());
    }

    #[test]
    fn test_newest_error_event_wins() {
        let events: Vec<GuestEvent> = serde_json::from_str(
            r#"[
                {"eventname": "error", "details": {"error": "old"}, "updated": "2024-01-01 10:00:00"},
                {"eventname": "state-changed", "details": {}, "updated": "2024-01-01 11:00:00"},
                {"eventname": "error", "details": {"error": "new"}, "updated": "2024-01-01 12:00:00"}
            ]"#,
        )
        .unwrap();
        assert_eq!(newest_error(&events), Some("new"));
        assert_eq!(newest_error(&events[1..2]), None);
    }
}
