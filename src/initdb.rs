//! Creates pooled data directories with clusters tuned for disposable use.
//!
//! The idle marker is written only after `initdb` and the configuration patch
//! both succeed, so a marker always certifies a finished, never-used cluster.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::Context;
use tracing::{Instrument, info, info_span, warn};

use crate::cleanup::remove_root_with_retry;
use crate::error::LifecycleResult;
use crate::fs::{append_to_file, ensure_dir_exists, write_empty_file};
use crate::layout::{DIR_PREFIX, DataDirLayout};
use crate::observability::LOG_TARGET;
use crate::toolchain::{Invocation, OutputMode, PgVersion, Tool, Toolchain};

/// Settings appended to `postgresql.conf` after `initdb`.
///
/// Durability is switched off because the data is thrown away, TCP listening
/// is off unless a launch asks for it, and every connection and statement is
/// logged to `postgres.log`.
pub(crate) const TUNED_SETTINGS: &[(&str, &str)] = &[
    ("fsync", "off"),
    ("synchronous_commit", "off"),
    ("full_page_writes", "off"),
    ("listen_addresses", "''"),
    ("shared_buffers", "12MB"),
    ("log_connections", "on"),
    ("log_disconnections", "on"),
    ("log_statement", "'all'"),
];

/// Inputs for a single cluster initialisation.
#[derive(Debug)]
pub(crate) struct InitRequest<'a> {
    pub(crate) toolchain: &'a Toolchain,
    pub(crate) version: &'a PgVersion,
    /// Temp root used when no explicit directory is given.
    pub(crate) pool_root: &'a Utf8Path,
    /// Explicit root directory to initialise in place.
    pub(crate) dir: Option<&'a Utf8Path>,
    pub(crate) output: OutputMode,
}

/// Creates a data directory, runs `initdb`, patches the configuration, and
/// writes the idle marker.
///
/// # Errors
/// Returns an error when the directory cannot be created, when `initdb`
/// fails (for example because the versioned sub-path already holds files), or
/// when the configuration or marker cannot be written.
pub(crate) async fn initialize(request: InitRequest<'_>) -> LifecycleResult<DataDirLayout> {
    let root = match request.dir {
        Some(dir) => {
            ensure_dir_exists(dir)?;
            dir.to_path_buf()
        }
        None => create_unique_root(request.pool_root)?,
    };
    let layout = DataDirLayout::new(&root, request.version);
    let span = info_span!(target: LOG_TARGET, "initialize", root = %layout.root());
    if let Err(err) = populate(request.toolchain, &layout, request.output)
        .instrument(span)
        .await
    {
        // A root without a marker can never be claimed; explicit roots belong
        // to the caller and stay put.
        if request.dir.is_none() {
            discard_unique_root(layout.root()).await;
        }
        return Err(err);
    }
    Ok(layout)
}

async fn discard_unique_root(root: &Utf8Path) {
    if let Err(err) = remove_root_with_retry(root.as_std_path()).await {
        warn!(
            target: LOG_TARGET,
            root = %root,
            error = %err,
            "could not remove data directory after failed initialisation"
        );
    }
}

async fn populate(
    toolchain: &Toolchain,
    layout: &DataDirLayout,
    output: OutputMode,
) -> LifecycleResult<()> {
    ensure_dir_exists(layout.versioned())?;
    run_initdb(toolchain, layout, output).await?;
    append_tuned_settings(&layout.conf_file())?;
    write_empty_file(&layout.idle_marker())?;
    info!(
        target: LOG_TARGET,
        versioned = %layout.versioned(),
        "initialised idle data directory"
    );
    Ok(())
}

fn create_unique_root(pool_root: &Utf8Path) -> LifecycleResult<Utf8PathBuf> {
    ensure_dir_exists(pool_root)?;
    let dir = tempfile::Builder::new()
        .prefix(DIR_PREFIX)
        .tempdir_in(pool_root)
        .with_context(|| format!("create data directory under {pool_root}"))?
        .keep();
    let root = Utf8PathBuf::from_path_buf(dir)
        .map_err(|path| color_eyre::eyre::eyre!("non UTF-8 data directory {}", path.display()))?;
    Ok(root)
}

async fn run_initdb(
    toolchain: &Toolchain,
    layout: &DataDirLayout,
    output: OutputMode,
) -> LifecycleResult<()> {
    let invocation = Invocation::new(Tool::Initdb)
        .arg("-D")
        .arg(layout.versioned())
        .arg("--auth=trust")
        .arg("--encoding=UTF8")
        .output(output)
        .context(format!("initialising {}", layout.versioned()));
    toolchain.run(invocation).await?;
    Ok(())
}

/// Appends the tuned block to an existing `postgresql.conf`.
pub(crate) fn append_tuned_settings(conf: &Utf8Path) -> LifecycleResult<()> {
    append_to_file(conf, &tuned_settings())?;
    Ok(())
}

pub(crate) fn tuned_settings() -> String {
    let mut block = String::from("\n# pg_tmp: disposable test cluster\n");
    for (key, value) in TUNED_SETTINGS {
        block.push_str(key);
        block.push_str(" = ");
        block.push_str(value);
        block.push('\n');
    }
    block
}
