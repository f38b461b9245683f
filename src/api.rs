//! Public entry points: initialise, start, and stop disposable servers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::eyre;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::background::{PrewarmLauncher, resolve_usable_helper, spawn_auto_stop};
use crate::cleanup::remove_root_with_retry;
use crate::config::{DEFAULT_DRAIN_INTERVAL, PgTmpSettings};
use crate::error::{LifecycleResult, PgTmpError};
use crate::initdb::{InitRequest, initialize};
use crate::launch::{Dsn, LaunchRequest, NetworkListen, launch};
use crate::layout::DataDirLayout;
use crate::observability::LOG_TARGET;
use crate::pool::{AcquireSource, DirectoryPool};
use crate::runtime::build_runtime;
use crate::shutdown::{
    PgServerControl, ServerControl, ShutdownWatcher, WatchPlan, validate_data_dir,
};
use crate::toolchain::{OutputMode, PgVersion, Toolchain};

/// Options accepted by [`PgTmp::start`].
///
/// # Examples
/// ```
/// use std::time::Duration;
/// use pg_tmp::{NetworkListen, StartOptions};
///
/// let options = StartOptions {
///     listen: Some(NetworkListen::default()),
///     timeout: Some(Duration::ZERO),
///     ..StartOptions::default()
/// };
/// assert!(options.data_dir.is_none());
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Root directory to use instead of the pool.
    pub data_dir: Option<Utf8PathBuf>,
    /// Listen on TCP instead of a Unix socket only.
    pub listen: Option<NetworkListen>,
    /// Auto-stop delay; zero disables the watcher. Defaults to the settings.
    pub timeout: Option<Duration>,
    /// Pause between drain samples for the watcher. Defaults to the settings.
    pub drain_interval: Option<Duration>,
    /// Keep the data directory after the watcher stops the server.
    pub keep: bool,
    /// Extra options passed verbatim to the server.
    pub postgres_options: Option<String>,
    /// Helper binary overriding discovery.
    pub helper: Option<Utf8PathBuf>,
}

/// Options accepted by [`PgTmp::stop`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StopOptions {
    /// Leave the data directory on disk.
    pub keep: bool,
    /// Pause between drain samples.
    pub timeout: Duration,
    /// Delay before the first drain sample.
    pub initial_timeout: Duration,
    /// Stop without waiting for clients to disconnect.
    pub force: bool,
    /// Host used to reach the server; the socket directory when absent.
    pub host: Option<String>,
    /// Port used to reach the server.
    pub port: Option<u16>,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            keep: false,
            timeout: DEFAULT_DRAIN_INTERVAL,
            initial_timeout: Duration::ZERO,
            force: false,
            host: None,
            port: None,
        }
    }
}

/// Handle to the resolved toolchain and settings.
///
/// # Examples
/// ```no_run
/// use pg_tmp::{PgTmp, StartOptions};
///
/// # async fn demo() -> pg_tmp::Result<()> {
/// let pg_tmp = PgTmp::discover().await?;
/// let instance = pg_tmp.start(StartOptions::default()).await?;
/// println!("{}", instance.dsn());
/// instance.stop().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PgTmp {
    settings: PgTmpSettings,
    toolchain: Toolchain,
    version: PgVersion,
}

impl PgTmp {
    /// Loads settings from the environment and resolves the toolchain version.
    ///
    /// # Errors
    /// Returns an error when the environment is invalid or `pg_ctl` cannot
    /// report its version.
    pub async fn discover() -> crate::error::Result<Self> {
        let settings = PgTmpSettings::from_env()?;
        Ok(Self::with_settings(settings).await?)
    }

    /// Resolves the toolchain version for explicit settings.
    ///
    /// # Errors
    /// Returns an error when `pg_ctl` cannot report its version.
    pub async fn with_settings(settings: PgTmpSettings) -> LifecycleResult<Self> {
        let toolchain = Toolchain::new(settings.bin_dir.clone());
        let version = toolchain.resolve_version().await?;
        Ok(Self {
            settings,
            toolchain,
            version,
        })
    }

    /// Builds a handle for a version resolved elsewhere.
    #[must_use]
    pub fn new(settings: PgTmpSettings, version: PgVersion) -> Self {
        let toolchain = Toolchain::new(settings.bin_dir.clone());
        Self {
            settings,
            toolchain,
            version,
        }
    }

    /// Returns the settings in use.
    #[must_use]
    pub const fn settings(&self) -> &PgTmpSettings {
        &self.settings
    }

    /// Returns the resolved toolchain version.
    #[must_use]
    pub const fn version(&self) -> &PgVersion {
        &self.version
    }

    /// Returns the layout `root` has under this handle's version.
    #[must_use]
    pub fn layout(&self, root: &Utf8Path) -> DataDirLayout {
        DataDirLayout::new(root, &self.version)
    }

    /// Initialises an idle data directory and returns its root.
    ///
    /// Without `dir` a uniquely named directory is created under the pool
    /// root. The idle marker is left in place so a later start can claim it.
    ///
    /// # Errors
    /// Returns an error when `initdb` fails, including when the versioned
    /// sub-path already holds a cluster.
    pub async fn init(&self, dir: Option<&Utf8Path>, forward_io: bool) -> LifecycleResult<Utf8PathBuf> {
        let layout = initialize(InitRequest {
            toolchain: &self.toolchain,
            version: &self.version,
            pool_root: &self.settings.root,
            dir,
            output: if forward_io {
                OutputMode::Forward
            } else {
                OutputMode::Capture
            },
        })
        .await?;
        Ok(layout.root().to_path_buf())
    }

    /// Acquires a data directory, starts a server, and arms the auto-stop
    /// watcher unless the timeout is zero.
    ///
    /// # Errors
    /// Returns an error when no helper binary is available for a non-zero
    /// timeout, or when acquisition, launch, or the watcher spawn fails. A
    /// failure after acquisition first stops any server it started and
    /// removes the directory unless it came from `data_dir`.
    pub async fn start(&self, options: StartOptions) -> LifecycleResult<RunningInstance> {
        let timeout = options.timeout.unwrap_or(self.settings.default_timeout);
        let drain_interval = options
            .drain_interval
            .unwrap_or(self.settings.drain_interval);
        ensure_positive_interval(drain_interval)?;

        let span = info_span!(
            target: LOG_TARGET,
            "start",
            timeout_secs = timeout.as_secs(),
            tcp = options.listen.is_some()
        );
        self.start_inner(options, timeout, drain_interval)
            .instrument(span)
            .await
    }

    async fn start_inner(
        &self,
        options: StartOptions,
        timeout: Duration,
        drain_interval: Duration,
    ) -> LifecycleResult<RunningInstance> {
        let helper = self.start_helper(&options, timeout).await?;

        let prewarm = PrewarmLauncher::new(helper.clone(), &self.settings);
        let pool = DirectoryPool {
            toolchain: &self.toolchain,
            version: &self.version,
            root: &self.settings.root,
            prewarm: &prewarm,
        };
        let acquisition = pool.acquire(options.data_dir.as_deref()).await?;
        if acquisition.source == AcquireSource::ExplicitAdopted {
            debug!(target: LOG_TARGET, "explicit directory adopted; marker untouched");
        }
        let layout = acquisition.layout;

        let plan = WatchPlan {
            initial_delay: timeout,
            drain_interval,
            force: false,
            keep: options.keep,
        };
        let watcher = helper.as_deref().filter(|_| !timeout.is_zero());
        let (dsn, auto_stop) = match self.launch_and_watch(&options, &layout, watcher, plan).await {
            Ok(launched) => launched,
            Err(err) => {
                self.abandon(&layout, options.data_dir.is_some()).await;
                return Err(err);
            }
        };

        info!(target: LOG_TARGET, dsn = %dsn, auto_stop, "instance started");
        Ok(RunningInstance {
            dsn,
            layout,
            keep: options.keep,
            drain_interval,
            auto_stop,
            handle: self.clone(),
        })
    }

    /// Resolves the helper for this start. A missing helper only matters
    /// when the auto-stop watcher is needed; otherwise pre-warm is skipped.
    async fn start_helper(
        &self,
        options: &StartOptions,
        timeout: Duration,
    ) -> LifecycleResult<Option<PathBuf>> {
        match resolve_usable_helper(options.helper.as_deref(), self.settings.helper.as_deref()).await {
            Ok(path) => Ok(Some(path)),
            Err(err) if timeout.is_zero() => {
                debug!(target: LOG_TARGET, error = %err, "no helper; pre-warm disabled");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn launch_and_watch(
        &self,
        options: &StartOptions,
        layout: &DataDirLayout,
        watcher: Option<&Path>,
        plan: WatchPlan,
    ) -> LifecycleResult<(Dsn, bool)> {
        let dsn = launch(LaunchRequest {
            toolchain: &self.toolchain,
            layout,
            listen: options.listen.as_ref(),
            postgres_options: options.postgres_options.as_deref(),
        })
        .await?;

        let Some(helper) = watcher else {
            return Ok((dsn, false));
        };
        spawn_auto_stop(helper, &self.settings, layout, &dsn, plan)?;
        Ok((dsn, true))
    }

    /// Undoes a start that failed after acquisition: stops whatever server
    /// may be running and removes the directory unless the caller supplied it.
    async fn abandon(&self, layout: &DataDirLayout, explicit: bool) {
        let control = PgServerControl {
            toolchain: &self.toolchain,
            layout,
            host: None,
            port: None,
        };
        if let Err(err) = control.stop_server().await {
            debug!(
                target: LOG_TARGET,
                root = %layout.root(),
                error = %err,
                "no server to stop after failed start"
            );
        }
        if explicit {
            return;
        }
        match remove_root_with_retry(layout.root().as_std_path()).await {
            Ok(_) => info!(target: LOG_TARGET, root = %layout.root(), "discarded data directory after failed start"),
            Err(err) => warn!(
                target: LOG_TARGET,
                root = %layout.root(),
                error = %err,
                "could not remove data directory after failed start"
            ),
        }
    }

    /// Drains, stops, and (unless kept) removes the server rooted at `root`.
    ///
    /// # Errors
    /// Returns [`crate::LifecycleErrorKind::InvalidDataDirectory`] before any
    /// side effect when `root` lacks this version's sub-path, otherwise the
    /// first failing `psql`, `pg_ctl`, or removal error.
    pub async fn stop(&self, root: &Utf8Path, options: &StopOptions) -> LifecycleResult<()> {
        ensure_positive_interval(options.timeout)?;
        let layout = self.layout(root);
        validate_data_dir(&layout).await?;

        let control = PgServerControl {
            toolchain: &self.toolchain,
            layout: &layout,
            host: options.host.as_deref(),
            port: options.port,
        };
        let plan = WatchPlan {
            initial_delay: options.initial_timeout,
            drain_interval: options.timeout,
            force: options.force,
            keep: options.keep,
        };
        let span = info_span!(target: LOG_TARGET, "stop", root = %root, force = options.force);
        let mut watcher = ShutdownWatcher::new(&control, root, plan);
        watcher.run().instrument(span).await
    }

    /// Blocking form of [`PgTmp::discover`]. Must not run inside an async runtime.
    ///
    /// # Errors
    /// See [`PgTmp::discover`].
    pub fn discover_blocking() -> crate::error::Result<Self> {
        let runtime = build_runtime().map_err(PgTmpError::from)?;
        runtime.block_on(Self::discover())
    }

    /// Blocking form of [`PgTmp::init`].
    ///
    /// # Errors
    /// See [`PgTmp::init`].
    pub fn init_blocking(&self, dir: Option<&Utf8Path>, forward_io: bool) -> LifecycleResult<Utf8PathBuf> {
        build_runtime()?.block_on(self.init(dir, forward_io))
    }

    /// Blocking form of [`PgTmp::start`].
    ///
    /// # Errors
    /// See [`PgTmp::start`].
    pub fn start_blocking(&self, options: StartOptions) -> LifecycleResult<RunningInstance> {
        build_runtime()?.block_on(self.start(options))
    }

    /// Blocking form of [`PgTmp::stop`].
    ///
    /// # Errors
    /// See [`PgTmp::stop`].
    pub fn stop_blocking(&self, root: &Utf8Path, options: &StopOptions) -> LifecycleResult<()> {
        build_runtime()?.block_on(self.stop(root, options))
    }
}

fn ensure_positive_interval(interval: Duration) -> LifecycleResult<()> {
    if interval.is_zero() {
        return Err(eyre!("drain interval must be greater than zero").into());
    }
    Ok(())
}

/// A started server.
#[derive(Clone, Debug)]
pub struct RunningInstance {
    dsn: Dsn,
    layout: DataDirLayout,
    keep: bool,
    drain_interval: Duration,
    auto_stop: bool,
    handle: PgTmp,
}

impl RunningInstance {
    /// Returns the connection target.
    #[must_use]
    pub const fn dsn(&self) -> &Dsn {
        &self.dsn
    }

    /// Returns the root data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Utf8Path {
        self.layout.root()
    }

    /// Returns the full directory layout.
    #[must_use]
    pub const fn layout(&self) -> &DataDirLayout {
        &self.layout
    }

    /// Whether a detached watcher will stop this server on its own.
    #[must_use]
    pub const fn auto_stop_armed(&self) -> bool {
        self.auto_stop
    }

    /// Stop options matching how this instance was started.
    #[must_use]
    pub fn stop_options(&self) -> StopOptions {
        let (host, port) = match self.dsn {
            Dsn::Socket { .. } => (None, None),
            Dsn::Tcp { ref host, port } => (Some(host.clone()), Some(port)),
        };
        StopOptions {
            keep: self.keep,
            timeout: self.drain_interval,
            host,
            port,
            ..StopOptions::default()
        }
    }

    /// Drains and stops the server with [`RunningInstance::stop_options`].
    ///
    /// # Errors
    /// See [`PgTmp::stop`].
    pub async fn stop(&self) -> LifecycleResult<()> {
        self.stop_with(&self.stop_options()).await
    }

    /// Stops the server with caller-provided options.
    ///
    /// # Errors
    /// See [`PgTmp::stop`].
    pub async fn stop_with(&self, options: &StopOptions) -> LifecycleResult<()> {
        self.handle.stop(self.layout.root(), options).await
    }

    /// Blocking form of [`RunningInstance::stop`].
    ///
    /// # Errors
    /// See [`PgTmp::stop`].
    pub fn stop_blocking(&self) -> LifecycleResult<()> {
        build_runtime()?.block_on(self.stop())
    }

    /// Blocking form of [`RunningInstance::stop_with`].
    ///
    /// # Errors
    /// See [`PgTmp::stop`].
    pub fn stop_blocking_with(&self, options: &StopOptions) -> LifecycleResult<()> {
        build_runtime()?.block_on(self.stop_with(options))
    }
}
