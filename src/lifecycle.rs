//! Guest acquisition and release.
//!
//! The [`Provisioner`] drives [`GuestRequest`]s through their lifecycle:
//!
//! 1. **create** submits the request to the provisioning service
//! 2. **poll** waits, with jitter, until the guest is ready or failed; with
//!    a [`Connector`] set, a guest the service reports ready must also
//!    answer over SSH before it counts as ready
//! 3. on `error`, the newest error event is **classified** as fatal or
//!    retryable; retryable failures abandon the guest and start over after
//!    an exponential backoff
//! 4. **release** deletes the guest exactly once, whatever happened before
//!
//! Each acquisition runs its own poll loop; loops for different guests
//! never wait on each other. Cancellation is cooperative: a cancelled
//! acquisition still releases its guest before returning.

pub mod backoff;
pub mod guest;
pub mod snapshot;

pub use guest::{GuestRequest, GuestState, GuestSummary};
pub use snapshot::{Snapshot, SnapshotManager, SnapshotState};

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use regex::Regex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::environment::ProvisionOptions;
use crate::error::{ProvisionError, ProvisionResult};
use crate::provider::{ProvisioningClient, RemoteState, newest_error};
use crate::session::{Connector, is_alive};
use backoff::{PollSchedule, RetryPolicy, sleep_or_cancel};

/// Poll, retry, and diagnostics settings of a [`Provisioner`].
#[derive(Debug, Clone)]
pub struct ProvisionerSettings {
    pub guest_poll: PollSchedule,
    pub snapshot_poll: PollSchedule,
    /// Cadence and deadline of the SSH alive check.
    pub alive_poll: PollSchedule,
    pub retry: RetryPolicy,
    /// Error event messages matching one of these are fatal.
    pub fatal_patterns: Vec<Regex>,
    /// Directory receiving `<guestname>-guest-events.json` on release.
    pub events_dir: Option<PathBuf>,
}

impl ProvisionerSettings {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            guest_poll: config.polling.guest_schedule(),
            snapshot_poll: config.polling.snapshot_schedule(),
            alive_poll: config.polling.alive_schedule(),
            retry: config.retry.policy(),
            fatal_patterns: config
                .retry
                .compile_patterns()
                .context("Invalid retry.fatal_patterns")?,
            events_dir: config
                .report
                .dump_guest_events
                .then(|| config.report.output_dir.clone()),
        })
    }
}

/// Owner of guest create / poll / retry / release.
///
/// Shared by all acquisition tasks of a run; it holds no per-guest state.
pub struct Provisioner {
    client: Arc<dyn ProvisioningClient>,
    settings: ProvisionerSettings,
    connector: Option<Arc<dyn Connector>>,
}

impl Provisioner {
    pub fn new(client: Arc<dyn ProvisioningClient>, settings: ProvisionerSettings) -> Self {
        Self {
            client,
            settings,
            connector: None,
        }
    }

    /// Requires guests to answer over `connector` before they count as ready.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn client(&self) -> &Arc<dyn ProvisioningClient> {
        &self.client
    }

    pub fn settings(&self) -> &ProvisionerSettings {
        &self.settings
    }

    /// Acquires a ready guest for `request`, retrying retryable failures.
    ///
    /// On any error the request is released before returning, so the caller
    /// only has to release requests that were acquired successfully.
    ///
    /// # Errors
    ///
    /// - `FatalEnvironment` - rejected request or fatal guest error
    /// - `TransientProvision` / `PollTimeout` - retry budget exhausted
    /// - `Cancelled` - `cancel` fired
    pub async fn acquire(
        &self,
        request: &mut GuestRequest,
        options: &ProvisionOptions,
        cancel: &CancellationToken,
    ) -> ProvisionResult<()> {
        loop {
            let err = match self.attempt(request, options, cancel).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            request.record_error(err.kind());
            let attempt = request.attempts();

            if err.is_retryable() && self.settings.retry.should_retry(attempt) {
                let delay = self.settings.retry.backoff(attempt);
                warn!(
                    "Entry {}: attempt {}/{} failed ({}), retrying in {:?}",
                    request.owner(),
                    attempt,
                    self.settings.retry.max_attempts,
                    err,
                    delay
                );
                self.discard(request).await;

                if sleep_or_cancel(delay, cancel).await {
                    continue;
                }
                let cancelled = ProvisionError::Cancelled(format!(
                    "entry {} cancelled while waiting to retry",
                    request.owner()
                ));
                request.record_error(cancelled.kind());
                self.release_quietly(request).await;
                return Err(cancelled);
            }

            self.release_quietly(request).await;
            return Err(err);
        }
    }

    /// One create-and-poll attempt.
    async fn attempt(
        &self,
        request: &mut GuestRequest,
        options: &ProvisionOptions,
        cancel: &CancellationToken,
    ) -> ProvisionResult<()> {
        request.start_attempt();

        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled(format!(
                "entry {} cancelled before request",
                request.owner()
            )));
        }

        self.create(request, options).await?;

        match self.poll(request, cancel).await? {
            GuestState::Ready => {
                info!(
                    "Guest {} is ready for entry {} at {}",
                    request.id().unwrap_or_default(),
                    request.owner(),
                    request.address().unwrap_or_default()
                );
                Ok(())
            }
            _ => Err(self.classify_error(request).await),
        }
    }

    /// Submits the guest request.
    ///
    /// A rejected request fails with `FatalEnvironment` and is never retried.
    pub async fn create(
        &self,
        request: &mut GuestRequest,
        options: &ProvisionOptions,
    ) -> ProvisionResult<()> {
        debug!(
            "Requesting guest for entry {} ({})",
            request.owner(),
            request.environment()
        );

        let mut info = self
            .client
            .create_guest(request.environment(), options)
            .await?;
        if self.connector.is_some() && info.state == RemoteState::Ready {
            // Ready only once polling has seen it answer.
            info.state = RemoteState::Promised;
        }
        request.bind(&info);

        info!(
            "Guest {} requested for entry {} ({})",
            info.guestname,
            request.owner(),
            request.environment()
        );
        Ok(())
    }

    /// Polls the guest until it is `Ready` or `Error`.
    ///
    /// Transport failures are tolerated until the deadline. Any other
    /// state keeps the loop going.
    ///
    /// # Errors
    ///
    /// - `PollTimeout` - the deadline passed first, or a ready guest never
    ///   answered the alive check; the request is marked `Error`
    /// - `Cancelled` - `cancel` fired
    /// - `FatalEnvironment` - the service returned a non-transient error
    pub async fn poll(
        &self,
        request: &mut GuestRequest,
        cancel: &CancellationToken,
    ) -> ProvisionResult<GuestState> {
        let Some(guestname) = request.id().map(str::to_string) else {
            return Err(ProvisionError::FatalEnvironment(format!(
                "entry {} has no guest to poll",
                request.owner()
            )));
        };

        let schedule = self.settings.guest_poll;
        let deadline = Instant::now() + schedule.timeout;

        loop {
            if matches!(request.state(), GuestState::Ready | GuestState::Error) {
                return Ok(request.state());
            }

            if Instant::now() >= deadline {
                request.fail();
                return Err(ProvisionError::PollTimeout(format!(
                    "guest {} not ready after {:?}",
                    guestname, schedule.timeout
                )));
            }

            if !sleep_or_cancel(schedule.next_delay(), cancel).await {
                return Err(ProvisionError::Cancelled(format!(
                    "polling of guest {} cancelled",
                    guestname
                )));
            }

            match self.client.inspect_guest(&guestname).await {
                Ok(info) => {
                    if let Some(connector) = &self.connector
                        && request.state() != GuestState::Ready
                        && info.state == RemoteState::Ready
                        && (info.address.is_some() || request.address().is_some())
                    {
                        request.update_connection(&info);
                        if let Err(e) = self.wait_alive(connector.as_ref(), request, cancel).await {
                            if e.is_retryable() {
                                request.fail();
                            }
                            return Err(e);
                        }
                    }
                    if request.observe(&info) {
                        debug!("Guest {} is {}", guestname, request.state());
                    }
                }
                Err(e) if e.is_transient() => {
                    debug!("Failed to inspect guest {}, retrying: {}", guestname, e);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Runs the alive check on a guest the service reports ready.
    ///
    /// Retries every `alive_poll` tick until the guest answers or the
    /// deadline passes.
    async fn wait_alive(
        &self,
        connector: &dyn Connector,
        request: &GuestRequest,
        cancel: &CancellationToken,
    ) -> ProvisionResult<()> {
        let guestname = request.id().unwrap_or_default();
        let schedule = self.settings.alive_poll;
        let session = connector.connect(request).map_err(|e| {
            ProvisionError::TransientProvision(format!(
                "cannot connect to guest {}: {}",
                guestname, e
            ))
        })?;
        let deadline = Instant::now() + schedule.timeout;

        debug!("Waiting for guest {} to answer at {}", guestname, session.target());
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProvisionError::PollTimeout(format!(
                    "guest {} not reachable after {:?}",
                    guestname, schedule.timeout
                )));
            }

            let alive = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                alive = is_alive(session.as_ref(), remaining) => alive,
            };
            if alive {
                debug!("Guest {} is alive", guestname);
                return Ok(());
            }

            if !sleep_or_cancel(schedule.next_delay(), cancel).await {
                return Err(ProvisionError::Cancelled(format!(
                    "alive check of guest {} cancelled",
                    guestname
                )));
            }
        }
    }

    /// Classifies a guest that ended in `error`.
    ///
    /// The newest `error` event decides: a message matching a fatal pattern
    /// is fatal, anything else is transient.
    pub async fn classify_error(&self, request: &GuestRequest) -> ProvisionError {
        let guestname = request.id().unwrap_or_default();

        let message = match self.client.guest_events(guestname).await {
            Ok(events) => newest_error(&events).map(str::to_string),
            Err(e) => {
                debug!("Failed to fetch events of guest {}: {}", guestname, e);
                None
            }
        };

        match message {
            Some(message) if self.settings.fatal_patterns.iter().any(|p| p.is_match(&message)) => {
                ProvisionError::FatalEnvironment(format!(
                    "guest {} failed: {}",
                    guestname, message
                ))
            }
            Some(message) => ProvisionError::TransientProvision(format!(
                "guest {} failed: {}",
                guestname, message
            )),
            None => ProvisionError::TransientProvision(format!(
                "guest {} ended in error state",
                guestname
            )),
        }
    }

    /// Releases the guest of `request`.
    ///
    /// Safe to call more than once: only the first call reaches the service.
    /// A failed delete still leaves the request `Released`.
    ///
    /// # Errors
    ///
    /// `GuestRelease` if the delete call failed.
    pub async fn release(&self, request: &mut GuestRequest) -> ProvisionResult<()> {
        let Some(guestname) = request.begin_release() else {
            return Ok(());
        };

        self.dump_diagnostics(&guestname).await;

        let result = self.client.cancel_guest(&guestname).await;
        request.finish_release();

        match result {
            Ok(()) => {
                info!("Released guest {} of entry {}", guestname, request.owner());
                Ok(())
            }
            Err(e) => Err(ProvisionError::GuestRelease(format!(
                "failed to release guest {}: {}",
                guestname, e
            ))),
        }
    }

    /// Releases and logs a failure instead of returning it.
    pub async fn release_quietly(&self, request: &mut GuestRequest) {
        if let Err(e) = self.release(request).await {
            warn!("{}", e);
        }
    }

    /// Deletes the guest of a failed attempt and resets the request.
    async fn discard(&self, request: &mut GuestRequest) {
        request.fail();
        let Some(guestname) = request.begin_retry() else {
            return;
        };

        self.dump_diagnostics(&guestname).await;

        match self.client.cancel_guest(&guestname).await {
            Ok(()) => debug!("Discarded guest {} of entry {}", guestname, request.owner()),
            Err(e) => warn!("Failed to release guest {}: {}", guestname, e),
        }
    }

    /// Writes the guest's event log (and console log, if any) to `events_dir`.
    async fn dump_diagnostics(&self, guestname: &str) {
        let Some(dir) = &self.settings.events_dir else {
            return;
        };

        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            debug!("Cannot create {}: {}", dir.display(), e);
            return;
        }

        match self.client.guest_events(guestname).await {
            Ok(events) => {
                let path = dir.join(format!("{}-guest-events.json", guestname));
                match serde_json::to_vec_pretty(&events) {
                    Ok(bytes) => {
                        if let Err(e) = tokio::fs::write(&path, bytes).await {
                            debug!("Cannot write {}: {}", path.display(), e);
                        }
                    }
                    Err(e) => debug!("Cannot encode events of guest {}: {}", guestname, e),
                }
            }
            Err(e) => debug!("Failed to fetch events of guest {}: {}", guestname, e),
        }

        if let Ok(Some(log)) = self.client.console_log(guestname).await {
            let path = dir.join(format!("{}-console.log", guestname));
            if let Err(e) = tokio::fs::write(&path, log).await {
                debug!("Cannot write {}: {}", path.display(), e);
            }
        }
    }
}
