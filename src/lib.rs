//! guestfarm: Provision ephemeral guests and run multi-host test schedules.
//!
//! This crate acquires remote machines ("guests") from a provisioning
//! service, groups test entries that must run together into barrier groups,
//! and runs each group only once every guest it needs is ready.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Provider**: Talks to the provisioning service (REST or a static pool)
//! - **Lifecycle**: Guest state machine, retries, snapshots, release
//! - **Orchestrator**: Barrier-group admission, execution, and teardown
//! - **Session**: Command execution on guests with streamed output
//! - **Report**: Console progress and JSON results
//!
//! # Example
//!
//! ```no_run
//! use guestfarm::config::load_config;
//! use guestfarm::orchestrator::{Orchestrator, RunContext};
//! use guestfarm::report::NullReporter;
//! use guestfarm::schedule::load_schedule;
//! use guestfarm::session::log_channel;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("guestfarm.toml"))?;
//!     let schedule = load_schedule(std::path::Path::new("schedule.toml"))?;
//!     let client = guestfarm::provider::connect(&config.provider).await?;
//!     let (logs, _stream) = log_channel();
//!
//!     let ctx = RunContext::from_config(&config, client, logs)?;
//!     let report = Orchestrator::new(ctx, NullReporter).run(&schedule).await?;
//!     println!("{} of {} entries passed", report.passed, report.total);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod environment;
pub mod error;
pub mod lifecycle;
pub mod orchestrator;
pub mod provider;
pub mod report;
pub mod schedule;
pub mod session;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use environment::{ProvisionOptions, TestingEnvironment};
pub use error::{ErrorKind, ProvisionError, ProvisionResult};
pub use lifecycle::{GuestRequest, GuestState, Provisioner, SnapshotManager};
pub use orchestrator::{Orchestrator, RunContext, ScheduleReport};
pub use provider::{ProviderError, ProvisioningClient};
pub use report::Reporter;
pub use schedule::{EntryResult, EntryState, Role, ScheduleEntry, Step, TestOutcome, TestSchedule};
