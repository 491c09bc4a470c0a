//! Testing environments and per-request provisioning options.
//!
//! A [`TestingEnvironment`] describes *what* kind of guest a schedule entry
//! needs: architecture, compose (OS image), and optional hardware and
//! kickstart constraints. [`ProvisionOptions`] carries the request-level knobs
//! that are not part of the environment itself (SSH key name, priority
//! group, user data tags, watchdog tuning).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Description of the environment a guest must provide.
///
/// # Example
///
/// ```
/// use guestfarm::environment::TestingEnvironment;
///
/// let env = TestingEnvironment::new("x86_64", "RHEL-9.4").with_snapshots(true);
/// assert_eq!(env.to_string(), "x86_64 RHEL-9.4 S+");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestingEnvironment {
    /// Guest architecture, e.g. `x86_64` or `aarch64`.
    pub arch: String,

    /// Compose or image name the guest is installed from.
    pub compose: String,

    /// Provisioning pool to allocate from, if the caller insists on one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,

    /// Whether the guest must support snapshots.
    #[serde(default)]
    pub snapshots: bool,

    /// Hardware constraints, passed through to the provisioning service verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<serde_json::Value>,

    /// Kickstart payload for installer-driven provisioning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kickstart: Option<BTreeMap<String, String>>,
}

impl TestingEnvironment {
    /// Creates an environment with the given architecture and compose.
    pub fn new(arch: impl Into<String>, compose: impl Into<String>) -> Self {
        Self {
            arch: arch.into(),
            compose: compose.into(),
            pool: None,
            snapshots: false,
            hardware: None,
            kickstart: None,
        }
    }

    /// Requires snapshot support from the guest.
    pub fn with_snapshots(mut self, snapshots: bool) -> Self {
        self.snapshots = snapshots;
        self
    }

    /// Pins the environment to a provisioning pool.
    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    /// Attaches hardware constraints.
    pub fn with_hardware(mut self, hardware: serde_json::Value) -> Self {
        self.hardware = Some(hardware);
        self
    }
}

impl fmt::Display for TestingEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.arch,
            self.compose,
            if self.snapshots { "S+" } else { "S-" }
        )
    }
}

/// Request-level options sent along with a guest creation call.
///
/// Defaults come from the provider configuration; the scheduler adds
/// `entry-id` and `group-id` tags to [`user_data`](Self::user_data) so that
/// guests can be traced back to the schedule entry that owns them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProvisionOptions {
    /// Name of the SSH key registered with the provisioning service.
    pub keyname: Option<String>,

    /// Priority group of the request.
    pub priority_group: Option<String>,

    /// Pool override; takes precedence over the environment's pool.
    pub pool: Option<String>,

    /// Script run on the guest right after installation.
    pub post_install_script: Option<String>,

    /// Free-form tags attached to the guest request.
    pub user_data: BTreeMap<String, String>,

    /// Seconds before the guest liveness watchdog is dispatched.
    pub watchdog_dispatch_delay: Option<u64>,

    /// Seconds between guest liveness checks.
    pub watchdog_period_delay: Option<u64>,

    /// Ask the service to skip its own SSH verification in the prepare stage.
    pub skip_prepare_verify_ssh: bool,
}

impl ProvisionOptions {
    /// Adds a user data tag.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_data.insert(key.into(), value.into());
        self
    }
}
