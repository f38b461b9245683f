//! Disposable `PostgreSQL` servers for tests, backed by a pool of
//! pre-initialised data directories.
//!
//! Running `initdb` is the slow part of standing up a throwaway server, so
//! `pg_tmp` keeps idle clusters under the system temp directory and hands one
//! out per start. A directory is idle while its `NEW` marker exists; deleting
//! the marker claims it. After each acquisition a detached helper initialises
//! a replacement, and unless disabled a second helper waits for clients to
//! disconnect, stops the server, and removes the directory.
//!
//! ```no_run
//! use std::time::Duration;
//! use pg_tmp::{PgTmp, StartOptions};
//!
//! # fn main() -> pg_tmp::Result<()> {
//! let pg_tmp = PgTmp::discover_blocking()?;
//! let instance = pg_tmp.start_blocking(StartOptions {
//!     timeout: Some(Duration::from_secs(30)),
//!     ..StartOptions::default()
//! })?;
//! let uri = instance.dsn().render();
//! # drop(uri);
//! # Ok(())
//! # }
//! ```

mod api;
mod background;
mod cleanup;
mod config;
mod error;
mod fs;
mod initdb;
mod launch;
mod layout;
mod observability;
mod ownership;
mod pool;
mod port;
mod runtime;
mod shutdown;
mod toolchain;

pub use api::{PgTmp, RunningInstance, StartOptions, StopOptions};
pub use config::{DEFAULT_DRAIN_INTERVAL, DEFAULT_START_TIMEOUT, PgTmpEnvCfg, PgTmpSettings};
pub use error::{
    ConfigError, ConfigResult, LifecycleError, LifecycleErrorKind, LifecycleResult, PgTmpError,
    Result,
};
pub use launch::{DEFAULT_LISTEN_HOST, Dsn, NetworkListen, TEST_DATABASE};
pub use layout::{DIR_PREFIX, DataDirLayout, IDLE_MARKER};
pub use port::allocate_port;
pub use toolchain::{PgVersion, Toolchain};
