//! Auto-stop watcher: waits, drains client connections, stops the server,
//! and removes the data directory.
//!
//! ```text
//! Waiting ──force──────────────┐
//!    │                         ▼
//!    └──► Draining ──► Stopping ──► Done
//!             │            │
//!             └──► Failed ◄┘
//! ```

use std::time::Duration;

use camino::Utf8Path;
use color_eyre::eyre::eyre;
use tracing::{debug, info, warn};

use crate::cleanup::remove_root_with_retry;
use crate::error::{LifecycleError, LifecycleErrorKind, LifecycleResult};
use crate::layout::DataDirLayout;
use crate::observability::LOG_TARGET;
use crate::toolchain::{Invocation, Tool, Toolchain};


/// Sampled connection count at or above which the server is still busy.
///
/// The monitoring session itself is one of the counted rows.
pub(crate) const BUSY_THRESHOLD: u64 = 2;
/// First delay between samples once a busy sample has been seen.
pub(crate) const DRAIN_RETRY_START: Duration = Duration::from_millis(250);

const MONITOR_DATABASE: &str = "postgres";
const ACTIVE_CONNECTIONS_QUERY: &str = "SELECT count(*) FROM pg_stat_activity \
     WHERE datname IS NOT NULL AND state IS NOT NULL";

/// Position of a watcher in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchState {
    /// Sleeping through the initial delay.
    Waiting,
    /// Polling the server until clients disconnect.
    Draining,
    /// Asking the server to shut down.
    Stopping,
    /// Finished; the data directory has been removed unless kept.
    Done,
    /// An external command failed; nothing further is attempted.
    Failed,
}

/// Timing and teardown choices for one watcher run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchPlan {
    /// Sleep before the first drain sample.
    pub initial_delay: Duration,
    /// Upper bound on the pause between drain samples.
    pub drain_interval: Duration,
    /// Skip draining and stop straight after the initial delay.
    pub force: bool,
    /// Leave the data directory on disk after stopping.
    pub keep: bool,
}

/// Operations the watcher needs from a running server.
pub(crate) trait ServerControl {
    /// Samples the number of client sessions, the sampling session included.
    async fn active_connections(&self) -> LifecycleResult<u64>;

    /// Stops the server and waits for it to exit.
    async fn stop_server(&self) -> LifecycleResult<()>;
}

/// Delay schedule between drain samples.
///
/// The first sample waits the full interval; later samples start at
/// [`DRAIN_RETRY_START`] and double until they reach the interval.
#[derive(Debug)]
pub(crate) struct DrainBackoff {
    interval: Duration,
    next: Option<Duration>,
}

impl DrainBackoff {
    pub(crate) const fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: None,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.next.unwrap_or(self.interval);
        let following = match self.next {
            None => DRAIN_RETRY_START,
            Some(current) => current.saturating_mul(2),
        };
        self.next = Some(following.min(self.interval));
        delay
    }
}

/// Drives one server from `Waiting` to `Done` or `Failed`.
#[derive(Debug)]
pub(crate) struct ShutdownWatcher<'a, C> {
    control: &'a C,
    root: &'a Utf8Path,
    plan: WatchPlan,
    state: WatchState,
}

impl<'a, C: ServerControl> ShutdownWatcher<'a, C> {
    pub(crate) const fn new(control: &'a C, root: &'a Utf8Path, plan: WatchPlan) -> Self {
        Self {
            control,
            root,
            plan,
            state: WatchState::Waiting,
        }
    }

    pub(crate) const fn state(&self) -> WatchState {
        self.state
    }

    /// Runs every state to completion. Any failure leaves the watcher in
    /// [`WatchState::Failed`] and is returned unchanged.
    pub(crate) async fn run(&mut self) -> LifecycleResult<()> {
        while self.state != WatchState::Done {
            match self.step().await {
                Ok(next) => {
                    debug!(target: LOG_TARGET, from = ?self.state(), to = ?next, "watcher transition");
                    self.state = next;
                }
                Err(err) => {
                    warn!(target: LOG_TARGET, state = ?self.state, error = %err, "watcher failed");
                    self.state = WatchState::Failed;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn step(&self) -> LifecycleResult<WatchState> {
        match self.state {
            WatchState::Waiting => {
                tokio::time::sleep(self.plan.initial_delay).await;
                Ok(if self.plan.force {
                    WatchState::Stopping
                } else {
                    WatchState::Draining
                })
            }
            WatchState::Draining => {
                self.drain().await?;
                Ok(WatchState::Stopping)
            }
            WatchState::Stopping => {
                self.control.stop_server().await?;
                info!(target: LOG_TARGET, root = %self.root, "server stopped");
                self.finish().await?;
                Ok(WatchState::Done)
            }
            WatchState::Done => Ok(WatchState::Done),
            WatchState::Failed => Err(eyre!("watcher already failed").into()),
        }
    }

    async fn drain(&self) -> LifecycleResult<()> {
        let mut backoff = DrainBackoff::new(self.plan.drain_interval);
        loop {
            tokio::time::sleep(backoff.next_delay()).await;
            let sampled = self.control.active_connections().await?;
            debug!(target: LOG_TARGET, connections = sampled, "drain sample");
            if sampled < BUSY_THRESHOLD {
                return Ok(());
            }
        }
    }

    async fn finish(&self) -> LifecycleResult<()> {
        if self.plan.keep {
            info!(target: LOG_TARGET, root = %self.root, "keeping data directory");
            return Ok(());
        }
        remove_root_with_retry(self.root.as_std_path())
            .await
            .map_err(|err| eyre!("remove {}: {err}", self.root))?;
        Ok(())
    }
}

/// Fails with [`LifecycleErrorKind::InvalidDataDirectory`] unless the layout's
/// versioned sub-path is an existing directory.
pub(crate) async fn validate_data_dir(layout: &DataDirLayout) -> LifecycleResult<()> {
    let valid = tokio::fs::metadata(layout.versioned())
        .await
        .is_ok_and(|metadata| metadata.is_dir());
    if valid {
        return Ok(());
    }
    Err(LifecycleError::new(
        LifecycleErrorKind::InvalidDataDirectory,
        eyre!(
            "{} is not an initialised data directory (missing {})",
            layout.root(),
            layout.versioned()
        ),
    ))
}

/// [`ServerControl`] backed by `psql` and `pg_ctl`.
#[derive(Debug)]
pub(crate) struct PgServerControl<'a> {
    pub(crate) toolchain: &'a Toolchain,
    pub(crate) layout: &'a DataDirLayout,
    pub(crate) host: Option<&'a str>,
    pub(crate) port: Option<u16>,
}

impl PgServerControl<'_> {
    fn host(&self) -> &str {
        self.host.unwrap_or_else(|| self.layout.versioned().as_str())
    }
}

impl ServerControl for PgServerControl<'_> {
    async fn active_connections(&self) -> LifecycleResult<u64> {
        let mut invocation = Invocation::new(Tool::Psql)
            .arg("-At")
            .arg("-h")
            .arg(self.host());
        if let Some(port) = self.port {
            invocation = invocation.arg("-p").arg(port.to_string());
        }
        invocation = invocation
            .arg("-d")
            .arg(MONITOR_DATABASE)
            .arg("-c")
            .arg(ACTIVE_CONNECTIONS_QUERY)
            .context(format!("sampling connections in {}", self.layout.versioned()));

        let output = self.toolchain.run(invocation).await?;
        parse_count(&String::from_utf8_lossy(&output.stdout))
    }

    async fn stop_server(&self) -> LifecycleResult<()> {
        let mut invocation = Invocation::new(Tool::PgCtl)
            .arg("stop")
            .arg("-D")
            .arg(self.layout.versioned())
            .arg("-w")
            .env("PGHOST", self.host());
        if let Some(port) = self.port {
            invocation = invocation.env("PGPORT", port.to_string());
        }
        invocation = invocation.context(format!("stopping server in {}", self.layout.versioned()));
        self.toolchain.run(invocation).await?;
        Ok(())
    }
}

pub(crate) fn parse_count(stdout: &str) -> LifecycleResult<u64> {
    let trimmed = stdout.trim();
    trimmed.parse().map_err(|err| {
        LifecycleError::new(
            LifecycleErrorKind::ToolInvocation,
            eyre!("unexpected `psql` output {trimmed:?}: {err}"),
        )
    })
}
