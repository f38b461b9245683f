//! Locates and invokes the installed `PostgreSQL` tools.
//!
//! Every external program is treated as an opaque subprocess. Failures bubble
//! up as [`LifecycleErrorKind::ToolInvocation`] errors carrying the tool's
//! truncated stdout and stderr so callers see exactly what the tool reported.

mod output;

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::PathBuf;
use std::process::{Output, Stdio};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::eyre;
use tokio::process::Command;
use tracing::debug;

use self::output::render_failure;
use crate::error::{LifecycleError, LifecycleErrorKind, LifecycleResult};
use crate::observability::LOG_TARGET;

/// External `PostgreSQL` programs driven by the lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Tool {
    Initdb,
    PgCtl,
    Psql,
    Createdb,
}

impl Tool {
    pub(crate) const fn binary_name(self) -> &'static str {
        match self {
            Self::Initdb => "initdb",
            Self::PgCtl => "pg_ctl",
            Self::Psql => "psql",
            Self::Createdb => "createdb",
        }
    }
}

/// Whether a tool's output is captured for diagnostics or forwarded to the
/// parent's own streams.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum OutputMode {
    #[default]
    Capture,
    Forward,
}

/// A single external command ready to run through a [`Toolchain`].
#[derive(Debug)]
pub(crate) struct Invocation {
    tool: Tool,
    args: Vec<OsString>,
    env: Vec<(String, String)>,
    mode: OutputMode,
    context: Option<String>,
}

impl Invocation {
    pub(crate) const fn new(tool: Tool) -> Self {
        Self {
            tool,
            args: Vec::new(),
            env: Vec::new(),
            mode: OutputMode::Capture,
            context: None,
        }
    }

    /// Names what the tool was operating on in failure messages.
    pub(crate) fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub(crate) fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub(crate) fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.push((key.to_owned(), value.into()));
        self
    }

    pub(crate) const fn output(mut self, mode: OutputMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Major/minor version string reported by the installed server tools.
///
/// The value names the versioned sub-path inside every data directory, so
/// pool entries only match clusters created by the same toolchain.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PgVersion(String);

impl PgVersion {
    /// Parses the output of `pg_ctl --version`.
    ///
    /// # Errors
    /// Returns an error when the output does not carry a `(PostgreSQL)`
    /// marker followed by a version token.
    ///
    /// # Examples
    /// ```
    /// use pg_tmp::PgVersion;
    ///
    /// let version = PgVersion::parse("pg_ctl (PostgreSQL) 16.2 (Ubuntu 16.2-1)")?;
    /// assert_eq!(version.as_str(), "16.2");
    /// # Ok::<(), pg_tmp::LifecycleError>(())
    /// ```
    pub fn parse(raw: &str) -> LifecycleResult<Self> {
        let token = raw
            .split_once("(PostgreSQL)")
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .ok_or_else(|| eyre!("unrecognised pg_ctl version output: {:?}", raw.trim()))?;

        let well_formed = token.starts_with(|ch: char| ch.is_ascii_digit())
            && token.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '.');
        if !well_formed {
            return Err(LifecycleError::from(eyre!(
                "unparseable PostgreSQL version {token:?} in {:?}",
                raw.trim()
            )));
        }
        Ok(Self(token.to_owned()))
    }

    /// Returns the version as used in directory names.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PgVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves tool paths from an optional binary directory or `PATH`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Toolchain {
    bin_dir: Option<Utf8PathBuf>,
}

impl Toolchain {
    /// Creates a toolchain that prefers `bin_dir` when provided.
    #[must_use]
    pub const fn new(bin_dir: Option<Utf8PathBuf>) -> Self {
        Self { bin_dir }
    }

    /// Returns the configured binary directory, if any.
    #[must_use]
    pub fn bin_dir(&self) -> Option<&Utf8Path> {
        self.bin_dir.as_deref()
    }

    /// Queries `pg_ctl --version` and returns the reported version.
    ///
    /// # Errors
    /// Returns an error when `pg_ctl` cannot be found or run, or when its
    /// output cannot be parsed.
    pub async fn resolve_version(&self) -> LifecycleResult<PgVersion> {
        let output = self
            .run(Invocation::new(Tool::PgCtl).arg("--version"))
            .await?;
        let version = PgVersion::parse(&String::from_utf8_lossy(&output.stdout))?;
        debug!(target: LOG_TARGET, version = %version, "resolved postgres version");
        Ok(version)
    }

    pub(crate) fn program(&self, tool: Tool) -> LifecycleResult<PathBuf> {
        let name = tool.binary_name();
        if let Some(ref dir) = self.bin_dir {
            return Ok(dir.join(name).into_std_path_buf());
        }
        which::which(name).map_err(|err| {
            LifecycleError::new(
                LifecycleErrorKind::ToolInvocation,
                eyre!("could not find `{name}` on PATH ({err}); set PG_TMP_BIN_DIR"),
            )
        })
    }

    /// Runs `invocation` to completion, failing on a non-zero exit status.
    pub(crate) async fn run(&self, invocation: Invocation) -> LifecycleResult<Output> {
        let name = invocation.tool.binary_name();
        let program = self.program(invocation.tool)?;
        let mut command = Command::new(&program);
        command.args(&invocation.args);
        command.envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        command.stdin(Stdio::null());
        match invocation.mode {
            OutputMode::Capture => {
                command.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            OutputMode::Forward => {
                command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
        }

        debug!(
            target: LOG_TARGET,
            tool = name,
            program = %program.display(),
            args = ?invocation.args,
            "running postgres tool"
        );
        let output = command.output().await.map_err(|err| {
            LifecycleError::new(
                LifecycleErrorKind::ToolInvocation,
                eyre!("failed to spawn `{name}` ({}): {err}", program.display()),
            )
        })?;

        if output.status.success() {
            return Ok(output);
        }
        let summary = match invocation.context {
            Some(ref context) => format!("`{name}` exited with {} ({context})", output.status),
            None => format!("`{name}` exited with {}", output.status),
        };
        Err(render_failure(&summary, &output))
    }
}
