//! Detached helper processes for pre-warming and auto-stop.
//!
//! Both helpers are the `pg_tmp` binary started in its own process group so
//! they outlive the caller. Nothing is awaited: a reaper thread collects the
//! exit status when the parent happens to live long enough, otherwise the
//! child is re-parented by the OS.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use camino::Utf8Path;
use color_eyre::eyre::eyre;
use tracing::{debug, info, warn};

use crate::config::PgTmpSettings;
use crate::error::{LifecycleError, LifecycleErrorKind, LifecycleResult};
use crate::fs::open_append_log;
use crate::launch::Dsn;
use crate::layout::DataDirLayout;
use crate::observability::LOG_TARGET;
use crate::pool::Prewarm;
use crate::shutdown::WatchPlan;

/// File stem of the helper binary.
pub(crate) const HELPER_BINARY: &str = "pg_tmp";

/// Finds the helper executable.
///
/// Lookup order: `explicit`, then `configured` (`PG_TMP_HELPER`), then the
/// running executable when it is itself `pg_tmp`, then `PATH`.
pub(crate) fn resolve_helper(
    explicit: Option<&Utf8Path>,
    configured: Option<&Utf8Path>,
) -> LifecycleResult<PathBuf> {
    if let Some(path) = explicit.or(configured) {
        return Ok(path.as_std_path().to_path_buf());
    }
    if let Some(exe) = current_exe_if_helper() {
        return Ok(exe);
    }
    which::which(HELPER_BINARY).map_err(|err| {
        LifecycleError::new(
            LifecycleErrorKind::HelperMissing,
            eyre!(
                "could not find the `{HELPER_BINARY}` helper ({err}); set {}",
                crate::config::HELPER_ENV
            ),
        )
    })
}

/// Resolves the helper and checks that it names an existing file, so a start
/// fails before anything is acquired rather than after the server is up.
pub(crate) async fn resolve_usable_helper(
    explicit: Option<&Utf8Path>,
    configured: Option<&Utf8Path>,
) -> LifecycleResult<PathBuf> {
    let helper = resolve_helper(explicit, configured)?;
    let is_file = tokio::fs::metadata(&helper)
        .await
        .is_ok_and(|metadata| metadata.is_file());
    if is_file {
        return Ok(helper);
    }
    Err(LifecycleError::new(
        LifecycleErrorKind::HelperMissing,
        eyre!(
            "helper {} is not an existing file; set {}",
            helper.display(),
            crate::config::HELPER_ENV
        ),
    ))
}

fn current_exe_if_helper() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let is_helper = exe
        .file_stem()
        .is_some_and(|stem| stem == HELPER_BINARY);
    is_helper.then_some(exe)
}

/// A helper invocation ready to be detached.
#[derive(Debug)]
pub(crate) struct HelperCommand<'a> {
    program: &'a Path,
    args: Vec<OsString>,
    env: Vec<(String, Option<String>)>,
    log: Option<&'a Utf8Path>,
}

impl<'a> HelperCommand<'a> {
    pub(crate) fn new(program: &'a Path, settings: &PgTmpSettings) -> Self {
        Self {
            program,
            args: Vec::new(),
            env: settings.to_env(),
            log: None,
        }
    }

    fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sends stdout and stderr to `log` instead of discarding them.
    const fn log_to(mut self, log: &'a Utf8Path) -> Self {
        self.log = Some(log);
        self
    }

    pub(crate) fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Spawns the helper detached and returns its process ID.
    pub(crate) fn spawn_detached(self) -> LifecycleResult<u32> {
        let mut command = Command::new(self.program);
        command.args(&self.args).stdin(Stdio::null());
        for (key, value) in &self.env {
            match value {
                Some(set) => command.env(key, set),
                None => command.env_remove(key),
            };
        }
        match self.log {
            Some(log) => {
                let stdout = open_append_log(log)?;
                let stderr = stdout
                    .try_clone()
                    .map_err(|err| eyre!("duplicate handle for {log}: {err}"))?;
                command.stdout(stdout).stderr(stderr);
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        detach(&mut command);

        debug!(
            target: LOG_TARGET,
            program = %self.program.display(),
            args = ?self.args(),
            "spawning detached helper"
        );
        let mut child = command.spawn().map_err(|err| {
            LifecycleError::new(
                LifecycleErrorKind::HelperMissing,
                eyre!("failed to spawn helper {}: {err}", self.program.display()),
            )
        })?;
        let pid = child.id();
        std::thread::spawn(move || {
            if let Err(err) = child.wait() {
                debug!(target: LOG_TARGET, pid, error = %err, "helper reap failed");
            }
        });
        Ok(pid)
    }
}

#[cfg(unix)]
fn detach(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn detach(_command: &mut Command) {}

/// Fires `pg_tmp prewarm` when a helper is available.
#[derive(Debug)]
pub(crate) struct PrewarmLauncher<'a> {
    helper: Option<PathBuf>,
    settings: &'a PgTmpSettings,
}

impl<'a> PrewarmLauncher<'a> {
    pub(crate) const fn new(helper: Option<PathBuf>, settings: &'a PgTmpSettings) -> Self {
        Self { helper, settings }
    }
}

impl Prewarm for PrewarmLauncher<'_> {
    fn fire(&self) {
        let Some(ref helper) = self.helper else {
            warn!(target: LOG_TARGET, "no helper binary; skipping pre-warm");
            return;
        };
        match HelperCommand::new(helper, self.settings)
            .arg("prewarm")
            .spawn_detached()
        {
            Ok(pid) => debug!(target: LOG_TARGET, pid, "pre-warm helper started"),
            Err(err) => warn!(target: LOG_TARGET, error = %err, "pre-warm helper failed to start"),
        }
    }
}

/// Builds the `pg_tmp stop` invocation used as the auto-stop watcher.
pub(crate) fn auto_stop_command<'a>(
    helper: &'a Path,
    settings: &PgTmpSettings,
    layout: &DataDirLayout,
    dsn: &Dsn,
    plan: WatchPlan,
) -> HelperCommand<'a> {
    let mut command = HelperCommand::new(helper, settings)
        .arg("stop")
        .arg(layout.root().as_str())
        .arg("--initial-timeout")
        .arg(whole_seconds(plan.initial_delay).to_string())
        .arg("--timeout")
        .arg(whole_seconds(plan.drain_interval).to_string())
        .arg("--verbose");
    if let Dsn::Tcp { host, port } = dsn {
        command = command
            .arg("--host")
            .arg(host.as_str())
            .arg("--port")
            .arg(port.to_string());
    }
    if plan.force {
        command = command.arg("--force");
    }
    if plan.keep {
        command = command.arg("--keep");
    }
    command
}

/// Starts the detached auto-stop watcher for a launched server.
pub(crate) fn spawn_auto_stop(
    helper: &Path,
    settings: &PgTmpSettings,
    layout: &DataDirLayout,
    dsn: &Dsn,
    plan: WatchPlan,
) -> LifecycleResult<u32> {
    let log = layout.stop_helper_log();
    let pid = auto_stop_command(helper, settings, layout, dsn, plan)
        .log_to(&log)
        .spawn_detached()?;
    info!(
        target: LOG_TARGET,
        pid,
        root = %layout.root(),
        initial_delay_secs = plan.initial_delay.as_secs(),
        "auto-stop watcher started"
    );
    Ok(pid)
}

/// Rounds up to whole seconds so sub-second requests never collapse to zero.
pub(crate) const fn whole_seconds(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}
