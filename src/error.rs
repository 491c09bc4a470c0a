//! Error taxonomy for guest provisioning and schedule execution.
//!
//! Transport-level failures are reported by providers as
//! [`ProviderError`](crate::provider::ProviderError). The lifecycle layer
//! turns those into a [`ProvisionError`], which is what the scheduler and
//! runner act on:
//!
//! | Variant | Handling |
//! |---------|----------|
//! | `TransientProvision` | Retried with bounded backoff |
//! | `FatalEnvironment` | Aborts the entry (and its barrier group during admission), never retried |
//! | `PollTimeout` | Retried; fatal once the retry budget is spent |
//! | `GuestRelease` | Logged as a warning, never fails the schedule |
//! | `Snapshot` | Fails the snapshot-dependent action of one entry only |
//! | `Cancelled` | Cooperative cancellation; guests are still released |

use serde::Serialize;

use crate::provider::ProviderError;

/// Result type for lifecycle operations.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Errors produced while acquiring, using, and releasing guests.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProvisionError {
    /// Backend-reported transient fault (resource exhaustion, flaky API).
    #[error("Transient provisioning error: {0}")]
    TransientProvision(String),

    /// Invalid or unsatisfiable environment request.
    ///
    /// Also used for any unclassified failure.
    #[error("Fatal environment error: {0}")]
    FatalEnvironment(String),

    /// The guest did not become ready before the acquisition deadline.
    #[error("Poll timeout: {0}")]
    PollTimeout(String),

    /// A teardown call failed.
    #[error("Guest release failed: {0}")]
    GuestRelease(String),

    /// Snapshot create, restore, or delete failed.
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// The operation was cancelled before it finished.
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl ProvisionError {
    /// Returns the serializable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientProvision(_) => ErrorKind::TransientProvision,
            Self::FatalEnvironment(_) => ErrorKind::FatalEnvironment,
            Self::PollTimeout(_) => ErrorKind::PollTimeout,
            Self::GuestRelease(_) => ErrorKind::GuestRelease,
            Self::Snapshot(_) => ErrorKind::Snapshot,
            Self::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// Returns the human-readable reason without the kind prefix.
    pub fn reason(&self) -> &str {
        match self {
            Self::TransientProvision(s)
            | Self::FatalEnvironment(s)
            | Self::PollTimeout(s)
            | Self::GuestRelease(s)
            | Self::Snapshot(s)
            | Self::Cancelled(s) => s,
        }
    }

    /// Returns `true` if another acquisition attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientProvision(_) | Self::PollTimeout(_))
    }
}

impl From<ProviderError> for ProvisionError {
    fn from(err: ProviderError) -> Self {
        if err.is_transient() {
            ProvisionError::TransientProvision(err.to_string())
        } else {
            ProvisionError::FatalEnvironment(err.to_string())
        }
    }
}

/// Error kinds as they appear in schedule results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    TransientProvision,
    FatalEnvironment,
    PollTimeout,
    GuestRelease,
    Snapshot,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::TransientProvision => "TransientProvisionError",
            ErrorKind::FatalEnvironment => "FatalEnvironmentError",
            ErrorKind::PollTimeout => "PollTimeoutError",
            ErrorKind::GuestRelease => "GuestReleaseError",
            ErrorKind::Snapshot => "SnapshotError",
            ErrorKind::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}
