//! Configuration schema definitions for guestfarm.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. The provider section is a tagged enum selecting
//! the provisioning backend.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── FarmConfig             - Concurrency caps
//! ├── ProviderConfig         - Tagged enum selecting the provisioning backend
//! │   ├── Artemis            - REST provisioning service
//! │   └── Static             - Fixed pool of pre-existing machines
//! ├── PollingConfig          - Readiness poll cadence and deadlines
//! ├── RetryConfig            - Acquisition retry policy and error classification
//! ├── RunnerConfig           - Step execution and SSH settings
//! └── ReportConfig           - Result output settings
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::environment::ProvisionOptions;
use crate::lifecycle::backoff::{PollSchedule, RetryPolicy};

/// Root configuration structure for guestfarm.
///
/// Only the `[provider]` section is required; every other section has
/// defaults.
///
/// # Example
///
/// ```
/// use guestfarm::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [farm]
///     max_concurrent_acquisitions = 4
///
///     [provider]
///     type = "artemis"
///     api_url = "http://artemis.example.com/v0.0.56"
///     keyname = "ci"
/// "#).unwrap();
///
/// assert_eq!(config.farm.max_concurrent_acquisitions, 4);
/// assert_eq!(config.polling.ready_timeout_secs, 300);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Concurrency caps.
    #[serde(default)]
    pub farm: FarmConfig,

    /// Provisioning backend.
    pub provider: ProviderConfig,

    /// Readiness polling.
    #[serde(default)]
    pub polling: PollingConfig,

    /// Acquisition retries.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Test step execution.
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Result output.
    #[serde(default)]
    pub report: ReportConfig,
}

/// Concurrency caps protecting the provisioning backend.
///
/// | Field | Default |
/// |-------|---------|
/// | `max_concurrent_acquisitions` | 8 |
/// | `max_parallel_groups` | 0 (unlimited) |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FarmConfig {
    /// Maximum number of guest acquisitions in flight across the whole run.
    ///
    /// Values below 1 are treated as 1.
    #[serde(default = "default_max_concurrent_acquisitions")]
    pub max_concurrent_acquisitions: usize,

    /// Maximum number of barrier groups admitted at once. 0 means no limit.
    #[serde(default)]
    pub max_parallel_groups: usize,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            max_concurrent_acquisitions: default_max_concurrent_acquisitions(),
            max_parallel_groups: 0,
        }
    }
}

fn default_max_concurrent_acquisitions() -> usize {
    8
}

/// Provisioning backend selection.
///
/// # Example
///
/// ```toml
/// # REST provisioning service
/// [provider]
/// type = "artemis"
/// api_url = "http://artemis.example.com/v0.0.56"
/// keyname = "ci"
///
/// # Pre-existing machines
/// [provider]
/// type = "static"
///
/// [[provider.guests]]
/// hostname = "10.0.0.5"
/// arch = "x86_64"
/// compose = "RHEL-9.4"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// Guests are requested from a REST provisioning service.
    Artemis(ArtemisProviderConfig),

    /// Guests are taken from a fixed list of machines.
    Static(StaticProviderConfig),
}

impl ProviderConfig {
    /// Request options every guest request starts from.
    pub fn provision_options(&self) -> ProvisionOptions {
        match self {
            ProviderConfig::Artemis(config) => config.provision_options(),
            ProviderConfig::Static(_) => ProvisionOptions::default(),
        }
    }
}

/// Settings of the REST provisioning service client.
///
/// | Field | Default |
/// |-------|---------|
/// | `priority_group` | `default-priority` |
/// | `api_call_timeout_secs` | 60 |
/// | `api_call_tick_secs` | 1 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArtemisProviderConfig {
    /// Base URL of the API, including the version segment.
    pub api_url: String,

    /// SSH key name registered with the service.
    pub keyname: String,

    /// Pool to allocate from. The service picks one when unset.
    pub pool: Option<String>,

    #[serde(default = "default_priority_group")]
    pub priority_group: String,

    /// Script run on each guest right after installation.
    pub post_install_script: Option<String>,

    /// Tags attached to every guest request.
    #[serde(default)]
    pub user_data: BTreeMap<String, String>,

    #[serde(default)]
    pub skip_prepare_verify_ssh: bool,

    pub watchdog_dispatch_delay: Option<u64>,

    pub watchdog_period_delay: Option<u64>,

    /// How long a single API call is retried on connection failures.
    #[serde(default = "default_api_call_timeout")]
    pub api_call_timeout_secs: u64,

    /// Delay between connection retries of a single API call.
    #[serde(default = "default_api_call_tick")]
    pub api_call_tick_secs: u64,
}

impl ArtemisProviderConfig {
    fn provision_options(&self) -> ProvisionOptions {
        ProvisionOptions {
            keyname: Some(self.keyname.clone()),
            priority_group: Some(self.priority_group.clone()),
            pool: self.pool.clone(),
            post_install_script: self.post_install_script.clone(),
            user_data: self.user_data.clone(),
            watchdog_dispatch_delay: self.watchdog_dispatch_delay,
            watchdog_period_delay: self.watchdog_period_delay,
            skip_prepare_verify_ssh: self.skip_prepare_verify_ssh,
        }
    }
}

fn default_priority_group() -> String {
    "default-priority".to_string()
}

fn default_api_call_timeout() -> u64 {
    60
}

fn default_api_call_tick() -> u64 {
    1
}

/// A fixed list of machines handed out as guests.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StaticProviderConfig {
    #[serde(default)]
    pub guests: Vec<StaticGuestConfig>,
}

/// One pre-existing machine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StaticGuestConfig {
    pub hostname: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default = "default_ssh_username")]
    pub username: String,

    pub arch: String,

    pub compose: String,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_username() -> String {
    "root".to_string()
}

/// Readiness poll cadence for guests and snapshots.
///
/// | Field | Default |
/// |-------|---------|
/// | `ready_timeout_secs` | 300 |
/// | `ready_tick_secs` | 3 |
/// | `jitter_ms` | 500 |
/// | `snapshot_ready_timeout_secs` | 600 |
/// | `snapshot_ready_tick_secs` | 10 |
/// | `alive_timeout_secs` | 300 |
/// | `alive_tick_secs` | 5 |
///
/// The alive check runs `echo alive` over SSH once the service reports a
/// guest ready; the guest only counts as acquired after it answers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollingConfig {
    /// Deadline for one guest to become ready.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    #[serde(default = "default_ready_tick")]
    pub ready_tick_secs: u64,

    /// Upper bound of the random delay added to every poll interval.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    #[serde(default = "default_snapshot_ready_timeout")]
    pub snapshot_ready_timeout_secs: u64,

    #[serde(default = "default_snapshot_ready_tick")]
    pub snapshot_ready_tick_secs: u64,

    /// Deadline for a ready guest to answer over SSH.
    #[serde(default = "default_alive_timeout")]
    pub alive_timeout_secs: u64,

    #[serde(default = "default_alive_tick")]
    pub alive_tick_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            ready_timeout_secs: default_ready_timeout(),
            ready_tick_secs: default_ready_tick(),
            jitter_ms: default_jitter_ms(),
            snapshot_ready_timeout_secs: default_snapshot_ready_timeout(),
            snapshot_ready_tick_secs: default_snapshot_ready_tick(),
            alive_timeout_secs: default_alive_timeout(),
            alive_tick_secs: default_alive_tick(),
        }
    }
}

impl PollingConfig {
    /// Poll schedule for guests.
    pub fn guest_schedule(&self) -> PollSchedule {
        PollSchedule {
            interval: Duration::from_secs(self.ready_tick_secs),
            jitter: Duration::from_millis(self.jitter_ms),
            timeout: Duration::from_secs(self.ready_timeout_secs),
        }
    }

    /// Poll schedule for snapshots.
    pub fn snapshot_schedule(&self) -> PollSchedule {
        PollSchedule {
            interval: Duration::from_secs(self.snapshot_ready_tick_secs),
            jitter: Duration::from_millis(self.jitter_ms),
            timeout: Duration::from_secs(self.snapshot_ready_timeout_secs),
        }
    }

    /// Schedule of the SSH alive check.
    pub fn alive_schedule(&self) -> PollSchedule {
        PollSchedule {
            interval: Duration::from_secs(self.alive_tick_secs),
            jitter: Duration::from_millis(self.jitter_ms),
            timeout: Duration::from_secs(self.alive_timeout_secs),
        }
    }
}

fn default_ready_timeout() -> u64 {
    300
}

fn default_ready_tick() -> u64 {
    3
}

fn default_jitter_ms() -> u64 {
    500
}

fn default_snapshot_ready_timeout() -> u64 {
    600
}

fn default_snapshot_ready_tick() -> u64 {
    10
}

fn default_alive_timeout() -> u64 {
    300
}

fn default_alive_tick() -> u64 {
    5
}

/// Acquisition retry policy.
///
/// A guest that ends up in `error` is classified by matching the newest
/// error event against `fatal_patterns`: a match is fatal, anything else is
/// retried with exponential backoff until `max_attempts` is spent.
///
/// | Field | Default |
/// |-------|---------|
/// | `max_attempts` | 3 |
/// | `initial_backoff_secs` | 5 |
/// | `max_backoff_secs` | 60 |
/// | `multiplier` | 2.0 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Total acquisition attempts per entry, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Regular expressions marking a guest error as fatal.
    #[serde(default = "default_fatal_patterns")]
    pub fatal_patterns: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_secs: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            multiplier: default_multiplier(),
            fatal_patterns: default_fatal_patterns(),
        }
    }
}

impl RetryConfig {
    /// Backoff policy between acquisition attempts.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_secs(self.initial_backoff_secs),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
            multiplier: self.multiplier,
        }
    }

    /// Compiles `fatal_patterns`.
    pub fn compile_patterns(&self) -> Result<Vec<regex::Regex>, regex::Error> {
        self.fatal_patterns
            .iter()
            .map(|p| regex::Regex::new(p))
            .collect()
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    5
}

fn default_max_backoff() -> u64 {
    60
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_fatal_patterns() -> Vec<String> {
    vec![
        "(?i)quota".to_string(),
        "(?i)(invalid|unsupported|unknown) (environment|compose|arch|architecture|image)"
            .to_string(),
        "(?i)no suitable pool".to_string(),
    ]
}

/// Test step execution settings.
///
/// # Example
///
/// ```toml
/// [runner]
/// group_deadline_secs = 7200
/// step_timeout_secs = 1800
/// stream_output = true
///
/// [runner.ssh]
/// key_path = "~/.ssh/ci_key"
/// connect_timeout_secs = 20
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Deadline for a whole barrier group, acquisition included.
    pub group_deadline_secs: Option<u64>,

    /// Timeout of a single `run` step.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,

    /// Print guest output as it arrives.
    #[serde(default)]
    pub stream_output: bool,

    #[serde(default)]
    pub ssh: SshConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            group_deadline_secs: None,
            step_timeout_secs: default_step_timeout(),
            stream_output: false,
            ssh: SshConfig::default(),
        }
    }
}

fn default_step_timeout() -> u64 {
    3600
}

/// How guests are reached over SSH.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SshConfig {
    /// Private key matching the provider's `keyname`. Supports `~`.
    pub key_path: Option<PathBuf>,

    /// Extra `-o` options.
    #[serde(default = "default_ssh_options")]
    pub options: Vec<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            key_path: None,
            options: default_ssh_options(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_ssh_options() -> Vec<String> {
    vec![
        "UserKnownHostsFile=/dev/null".to_string(),
        "StrictHostKeyChecking=no".to_string(),
    ]
}

fn default_connect_timeout() -> u64 {
    10
}

/// Result output settings.
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `results` |
/// | `results_file` | `results.json` |
/// | `dump_guest_events` | true |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Name of the JSON result file inside `output_dir`.
    #[serde(default = "default_results_file")]
    pub results_file: String,

    /// Write each guest's event log to `output_dir` when it is released.
    #[serde(default = "default_true")]
    pub dump_guest_events: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            results_file: default_results_file(),
            dump_guest_events: true,
        }
    }
}

impl ReportConfig {
    /// Full path of the JSON result file.
    pub fn results_path(&self) -> PathBuf {
        self.output_dir.join(&self.results_file)
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_results_file() -> String {
    "results.json".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_provider_defaults() {
        let config: Config = toml::from_str(
            r#"
            [provider]
            type = "static"

            [[provider.guests]]
            hostname = "10.0.0.5"
            arch = "x86_64"
            compose = "RHEL-9.4"
        "#,
        )
        .unwrap();

        let ProviderConfig::Static(provider) = &config.provider else {
            panic!("expected static provider");
        };
        assert_eq!(provider.guests[0].port, 22);
        assert_eq!(provider.guests[0].username, "root");
        assert_eq!(config.farm.max_parallel_groups, 0);
        assert!(config.report.dump_guest_events);
    }

    #[test]
    fn test_artemis_options_carry_request_knobs() {
        let config: Config = toml::from_str(
            r#"
            [provider]
            type = "artemis"
            api_url = "http://localhost:8001/v0.0.56"
            keyname = "ci"
            pool = "aws"
            watchdog_dispatch_delay = 600

            [provider.user_data]
            owner = "qe"
        "#,
        )
        .unwrap();

        let options = config.provider.provision_options();
        assert_eq!(options.keyname.as_deref(), Some("ci"));
        assert_eq!(options.priority_group.as_deref(), Some("default-priority"));
        assert_eq!(options.pool.as_deref(), Some("aws"));
        assert_eq!(options.watchdog_dispatch_delay, Some(600));
        assert_eq!(options.user_data["owner"], "qe");
    }

    #[test]
    fn test_alive_check_schedule() {
        let config: Config = toml::from_str(
            r#"
            [provider]
            type = "static"

            [polling]
            alive_timeout_secs = 60
            jitter_ms = 0
        "#,
        )
        .unwrap();

        let schedule = config.polling.alive_schedule();
        assert_eq!(schedule.timeout, Duration::from_secs(60));
        assert_eq!(schedule.interval, Duration::from_secs(5));
        assert_eq!(schedule.jitter, Duration::ZERO);
    }

    #[test]
    fn test_retry_policy_clamps_attempts() {
        let retry = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert_eq!(retry.policy().max_attempts, 1);
    }

    #[test]
    fn test_default_fatal_patterns_compile() {
        let patterns = RetryConfig::default().compile_patterns().unwrap();
        assert!(patterns.iter().any(|p| p.is_match("Quota exceeded for pool")));
        assert!(
            patterns
                .iter()
                .any(|p| p.is_match("unsupported architecture s390x"))
        );
        assert!(!patterns.iter().any(|p| p.is_match("failed to boot")));
    }

    #[test]
    fn test_unknown_provider_type_is_rejected() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            [provider]
            type = "beaker"
        "#,
        );
        assert!(result.is_err());
    }
}
