//! Isolated pool roots for tests that drive the real PostgreSQL toolchain.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use nix::unistd::{User, geteuid};
use pg_tmp::{DIR_PREFIX, Dsn, IDLE_MARKER, PgTmp, PgTmpSettings};
use postgres::{Client, NoTls};
use tempfile::TempDir;

use super::skip::{SKIP_PREFIX, report_skip, skip_message};

/// Which helper binary background tasks should run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Helper {
    /// The `pg_tmp` binary built for this test run.
    Binary,
    /// A path that does not exist, so pre-warming is skipped quietly.
    Unavailable,
}

/// A temp directory used as the pool root plus a handle bound to it.
pub(crate) struct PoolSandbox {
    root: Utf8PathBuf,
    pg_tmp: PgTmp,
    _temp: TempDir,
}

impl PoolSandbox {
    /// Builds a sandbox, or reports a skip and returns `None` when this host
    /// cannot run PostgreSQL.
    pub(crate) fn new(helper: Helper) -> Option<Self> {
        if geteuid().is_root() {
            report_skip(&format!("{SKIP_PREFIX}: initdb refuses to run as root"));
            return None;
        }

        let temp = tempfile::tempdir().expect("sandbox tempdir");
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf8 sandbox");
        let mut settings = PgTmpSettings::with_root(root.clone());
        settings.bin_dir = bin_dir();
        settings.helper = Some(match helper {
            Helper::Binary => Utf8PathBuf::from(env!("CARGO_BIN_EXE_pg_tmp")),
            Helper::Unavailable => root.join("no-helper"),
        });

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("discovery runtime");
        match runtime.block_on(PgTmp::with_settings(settings)) {
            Ok(pg_tmp) => Some(Self {
                root,
                pg_tmp,
                _temp: temp,
            }),
            Err(err) => {
                let message = err.to_string();
                let reason = skip_message(&message)
                    .unwrap_or_else(|| panic!("toolchain discovery failed: {message}"));
                report_skip(&reason);
                None
            }
        }
    }

    pub(crate) fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub(crate) const fn pg_tmp(&self) -> &PgTmp {
        &self.pg_tmp
    }

    /// Pool entries that still carry an idle marker.
    pub(crate) fn idle_directories(&self) -> Vec<Utf8PathBuf> {
        self.pool_entries()
            .into_iter()
            .filter(|dir| dir.join(IDLE_MARKER).exists())
            .collect()
    }

    /// Waits for an idle directory other than those in `known` to appear.
    pub(crate) fn wait_for_new_idle_directory(
        &self,
        known: &[Utf8PathBuf],
        timeout: Duration,
    ) -> Option<Utf8PathBuf> {
        let deadline = Instant::now() + timeout;
        loop {
            let fresh = self
                .idle_directories()
                .into_iter()
                .find(|dir| !known.contains(dir));
            if fresh.is_some() || Instant::now() >= deadline {
                return fresh;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    fn pool_entries(&self) -> Vec<Utf8PathBuf> {
        let Ok(entries) = self.root.read_dir_utf8() else {
            return Vec::new();
        };
        entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().starts_with(DIR_PREFIX))
            .map(|entry| entry.path().to_path_buf())
            .collect()
    }
}

impl Drop for PoolSandbox {
    fn drop(&mut self) {
        // Stop anything a failed test left running so no server outlives the sandbox.
        for dir in self.pool_entries() {
            let versioned = self.pg_tmp.layout(&dir).versioned().to_path_buf();
            if versioned.join("postmaster.pid").exists() {
                let status = Command::new(tool("pg_ctl"))
                    .args(["stop", "-m", "immediate", "-D", versioned.as_str()])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status();
                drop(status);
            }
        }
    }
}

/// `PG_TMP_BIN_DIR` when set, otherwise whatever `pg_config --bindir` reports.
pub(crate) fn bin_dir() -> Option<Utf8PathBuf> {
    if let Ok(dir) = std::env::var("PG_TMP_BIN_DIR") {
        return Some(Utf8PathBuf::from(dir));
    }
    let output = Command::new("pg_config").arg("--bindir").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let dir = String::from_utf8(output.stdout).ok()?;
    let trimmed = dir.trim();
    (!trimmed.is_empty()).then(|| Utf8PathBuf::from(trimmed))
}

/// Path of a PostgreSQL tool, resolved like the library does.
pub(crate) fn tool(name: &str) -> PathBuf {
    bin_dir().map_or_else(|| PathBuf::from(name), |dir| dir.join(name).into())
}

/// Polls `condition` every 100 ms until it holds or `timeout` elapses.
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    condition()
}

/// Opens a client against a TCP instance as the current OS user.
pub(crate) fn connect(dsn: &Dsn) -> Client {
    let Dsn::Tcp { host, port } = dsn else {
        panic!("tests connect over TCP, got {dsn:?}");
    };
    let user = User::from_uid(geteuid())
        .ok()
        .flatten()
        .map(|user| user.name)
        .expect("current user name");
    Client::connect(
        &format!("host={host} port={port} dbname=test user={user}"),
        NoTls,
    )
    .expect("connect to test database")
}
