//! On-disk layout of a pooled data directory.
//!
//! ```text
//! <root>/NEW                          idle marker, zero bytes
//! <root>/<version>/                   the cluster created by initdb
//! <root>/<version>/postgresql.conf    patched with tuned settings
//! <root>/<version>/postgres.log       server log
//! ```

use camino::{Utf8Path, Utf8PathBuf};

use crate::toolchain::PgVersion;

/// Prefix shared by every pooled directory under the temp root.
pub const DIR_PREFIX: &str = "pg-tmp-";
/// Zero-byte file present only while a directory has never been adopted.
pub const IDLE_MARKER: &str = "NEW";
pub(crate) const CONF_FILE: &str = "postgresql.conf";
pub(crate) const SERVER_LOG: &str = "postgres.log";
pub(crate) const STOP_HELPER_LOG: &str = "pg_tmp_stop.log";

/// Paths derived from a root data directory and the resolved toolchain version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataDirLayout {
    root: Utf8PathBuf,
    versioned: Utf8PathBuf,
}

impl DataDirLayout {
    /// Builds the layout for `root` under `version`.
    ///
    /// # Examples
    /// ```
    /// use camino::Utf8Path;
    /// use pg_tmp::{DataDirLayout, PgVersion};
    ///
    /// let version = PgVersion::parse("pg_ctl (PostgreSQL) 16.2")?;
    /// let layout = DataDirLayout::new(Utf8Path::new("/tmp/pg-tmp-abc"), &version);
    /// assert_eq!(layout.versioned().as_str(), "/tmp/pg-tmp-abc/16.2");
    /// assert_eq!(layout.idle_marker().as_str(), "/tmp/pg-tmp-abc/NEW");
    /// # Ok::<(), pg_tmp::LifecycleError>(())
    /// ```
    #[must_use]
    pub fn new(root: &Utf8Path, version: &PgVersion) -> Self {
        Self {
            root: root.to_path_buf(),
            versioned: root.join(version.as_str()),
        }
    }

    /// Returns the root (non-versioned) directory.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Returns the versioned sub-path holding the cluster.
    #[must_use]
    pub fn versioned(&self) -> &Utf8Path {
        &self.versioned
    }

    /// Returns the idle-marker path.
    #[must_use]
    pub fn idle_marker(&self) -> Utf8PathBuf {
        self.root.join(IDLE_MARKER)
    }

    pub(crate) fn conf_file(&self) -> Utf8PathBuf {
        self.versioned.join(CONF_FILE)
    }

    pub(crate) fn server_log(&self) -> Utf8PathBuf {
        self.versioned.join(SERVER_LOG)
    }

    pub(crate) fn stop_helper_log(&self) -> Utf8PathBuf {
        self.versioned.join(STOP_HELPER_LOG)
    }
}
