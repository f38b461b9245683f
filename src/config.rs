//! Environment-driven settings shared by the library, the CLI, and the
//! background helpers.
//!
//! Values are read through [`OrthoConfig`] using the `PG_TMP` prefix and then
//! resolved into [`PgTmpSettings`], the typed form every entry point consumes.
//! Helper processes receive the resolved values back as environment variables
//! so they scan the same pool and run the same toolchain as their parent.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use color_eyre::eyre::eyre;
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Default auto-stop timeout applied by `start` when none is supplied.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(60);
/// Default pause between connection-count samples while draining.
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_secs(5);

const ROOT_ENV: &str = "PG_TMP_ROOT";
const BIN_DIR_ENV: &str = "PG_TMP_BIN_DIR";
pub(crate) const HELPER_ENV: &str = "PG_TMP_HELPER";
const TIMEOUT_ENV: &str = "PG_TMP_TIMEOUT_SECS";
const DRAIN_INTERVAL_ENV: &str = "PG_TMP_DRAIN_INTERVAL_SECS";

/// Captures lifecycle settings supplied via environment variables.
///
/// # Examples
/// ```
/// use pg_tmp::PgTmpEnvCfg;
///
/// let cfg = PgTmpEnvCfg::default();
/// assert!(cfg.root.is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, OrthoConfig, Default)]
#[ortho_config(prefix = "PG_TMP")]
pub struct PgTmpEnvCfg {
    /// Directory scanned for reusable data directories.
    pub root: Option<Utf8PathBuf>,
    /// Directory containing `initdb`, `pg_ctl`, `psql`, and `createdb`.
    pub bin_dir: Option<Utf8PathBuf>,
    /// Helper binary used to host detached background tasks.
    pub helper: Option<Utf8PathBuf>,
    /// Auto-stop timeout in seconds; zero disables the watcher.
    pub timeout_secs: Option<u64>,
    /// Seconds between connection-count samples while draining.
    pub drain_interval_secs: Option<u64>,
}

impl PgTmpEnvCfg {
    /// Loads configuration from environment variables without parsing CLI arguments.
    ///
    /// # Errors
    /// Returns an error when a variable is present but cannot be parsed.
    pub fn load() -> ConfigResult<Self> {
        let args = [OsString::from("pg-tmp")];
        Self::load_from_iter(args).map_err(|err| ConfigError::from(eyre!(err)))
    }

    /// Resolves the raw configuration into typed settings.
    ///
    /// # Errors
    /// Returns an error when no root is configured and the system temporary
    /// directory is not valid UTF-8, or when the drain interval is zero.
    pub fn to_settings(&self) -> ConfigResult<PgTmpSettings> {
        let root = match self.root {
            Some(ref root) => root.clone(),
            None => default_root()?,
        };
        let drain_interval = match self.drain_interval_secs {
            Some(0) => {
                return Err(ConfigError::from(eyre!(
                    "{DRAIN_INTERVAL_ENV} must be at least 1 second (received 0)"
                )));
            }
            Some(secs) => Duration::from_secs(secs),
            None => DEFAULT_DRAIN_INTERVAL,
        };

        Ok(PgTmpSettings {
            root,
            bin_dir: self.bin_dir.clone(),
            helper: self.helper.clone(),
            default_timeout: self
                .timeout_secs
                .map_or(DEFAULT_START_TIMEOUT, Duration::from_secs),
            drain_interval,
        })
    }
}

fn default_root() -> ConfigResult<Utf8PathBuf> {
    Utf8PathBuf::from_path_buf(std::env::temp_dir()).map_err(|path| {
        ConfigError::from(eyre!(
            "system temporary directory is not valid UTF-8: {}; set {ROOT_ENV}",
            path.display()
        ))
    })
}

/// Typed settings consumed by every lifecycle entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgTmpSettings {
    /// Directory scanned for, and used to create, pooled data directories.
    pub root: Utf8PathBuf,
    /// Optional directory holding the `PostgreSQL` client and server tools.
    pub bin_dir: Option<Utf8PathBuf>,
    /// Optional explicit helper binary for background tasks.
    pub helper: Option<Utf8PathBuf>,
    /// Auto-stop timeout applied when a start request does not carry one.
    pub default_timeout: Duration,
    /// Drain interval applied when a start request does not carry one.
    pub drain_interval: Duration,
}

impl PgTmpSettings {
    /// Loads and resolves settings from the environment.
    ///
    /// # Errors
    /// Returns an error when the environment cannot be parsed.
    pub fn from_env() -> ConfigResult<Self> {
        PgTmpEnvCfg::load()?.to_settings()
    }

    /// Builds settings rooted at `root` with every other value defaulted.
    #[must_use]
    pub const fn with_root(root: Utf8PathBuf) -> Self {
        Self {
            root,
            bin_dir: None,
            helper: None,
            default_timeout: DEFAULT_START_TIMEOUT,
            drain_interval: DEFAULT_DRAIN_INTERVAL,
        }
    }

    /// Returns the variables a helper process needs to reproduce these settings.
    ///
    /// # Examples
    /// ```
    /// use camino::Utf8PathBuf;
    /// use pg_tmp::PgTmpSettings;
    ///
    /// let settings = PgTmpSettings::with_root(Utf8PathBuf::from("/tmp/pool"));
    /// let env = settings.to_env();
    /// assert!(env.contains(&("PG_TMP_ROOT".into(), Some("/tmp/pool".into()))));
    /// ```
    #[must_use]
    pub fn to_env(&self) -> Vec<(String, Option<String>)> {
        vec![
            (ROOT_ENV.into(), Some(self.root.as_str().into())),
            (
                BIN_DIR_ENV.into(),
                self.bin_dir.as_ref().map(|dir| dir.as_str().into()),
            ),
            (
                HELPER_ENV.into(),
                self.helper.as_ref().map(|path| path.as_str().into()),
            ),
            (
                TIMEOUT_ENV.into(),
                Some(self.default_timeout.as_secs().to_string()),
            ),
            (
                DRAIN_INTERVAL_ENV.into(),
                Some(self.drain_interval.as_secs().to_string()),
            ),
        ]
    }
}
