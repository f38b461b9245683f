//! Starts a server against a claimed data directory and provisions the
//! `test` database.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tracing::{Instrument, debug, info, info_span};

use crate::error::{LifecycleError, LifecycleResult};
use crate::layout::DataDirLayout;
use crate::observability::LOG_TARGET;
use crate::port::allocate_port;
use crate::toolchain::{Invocation, Tool, Toolchain};

/// Host used when TCP listening is requested without naming one.
pub const DEFAULT_LISTEN_HOST: &str = "127.0.0.1";
/// Database created on every launch and named by every DSN.
pub const TEST_DATABASE: &str = "test";

const CREATEDB_ATTEMPTS: u32 = 5;
const CREATEDB_BACKOFF: Duration = Duration::from_millis(100);

/// Characters escaped in the socket-directory query value. Everything outside
/// `A-Z a-z 0-9 - _ . ! ~ * ' ( )` is encoded, including `/`.
const SOCKET_HOST_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// TCP listening requested for a launch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkListen {
    /// Address passed to `listen_addresses`.
    pub host: String,
    /// Port to bind; allocated from the OS when absent.
    pub port: Option<u16>,
}

impl Default for NetworkListen {
    fn default() -> Self {
        Self {
            host: DEFAULT_LISTEN_HOST.to_owned(),
            port: None,
        }
    }
}

/// Connection target of a launched server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dsn {
    /// Unix-domain socket inside the versioned directory.
    Socket {
        /// Directory holding the `.s.PGSQL.*` socket.
        dir: Utf8PathBuf,
    },
    /// TCP listener.
    Tcp {
        /// Listen address.
        host: String,
        /// Listen port.
        port: u16,
    },
}

impl Dsn {
    /// Renders the libpq connection URI for the `test` database.
    ///
    /// # Examples
    /// ```
    /// use pg_tmp::Dsn;
    ///
    /// let tcp = Dsn::Tcp { host: "127.0.0.1".into(), port: 5433 };
    /// assert_eq!(tcp.render(), "postgresql://127.0.0.1:5433/test");
    ///
    /// let socket = Dsn::Socket { dir: "/tmp/pg-tmp-x/16.2".into() };
    /// assert_eq!(
    ///     socket.render(),
    ///     "postgresql:///test?host=%2Ftmp%2Fpg-tmp-x%2F16.2"
    /// );
    /// ```
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Socket { dir } => format!(
                "postgresql:///{TEST_DATABASE}?host={}",
                utf8_percent_encode(dir.as_str(), SOCKET_HOST_ENCODE_SET)
            ),
            Self::Tcp { host, port } => format!("postgresql://{host}:{port}/{TEST_DATABASE}"),
        }
    }

    /// Value for `-h`/`PGHOST`: the socket directory or the TCP host.
    pub(crate) fn pg_host(&self) -> &str {
        match self {
            Self::Socket { dir } => dir.as_str(),
            Self::Tcp { host, .. } => host,
        }
    }

    pub(crate) const fn port(&self) -> Option<u16> {
        match self {
            Self::Socket { .. } => None,
            Self::Tcp { port, .. } => Some(*port),
        }
    }
}

impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

#[derive(Debug)]
pub(crate) struct LaunchRequest<'a> {
    pub(crate) toolchain: &'a Toolchain,
    pub(crate) layout: &'a DataDirLayout,
    pub(crate) listen: Option<&'a NetworkListen>,
    pub(crate) postgres_options: Option<&'a str>,
}

/// Starts the server and makes sure the `test` database exists.
pub(crate) async fn launch(request: LaunchRequest<'_>) -> LifecycleResult<Dsn> {
    let dsn = resolve_dsn(request.layout, request.listen)?;
    let span = info_span!(target: LOG_TARGET, "launch", versioned = %request.layout.versioned());
    async {
        start_server(request.toolchain, request.layout, &dsn, request.postgres_options).await?;
        ensure_test_database(request.toolchain, &dsn).await?;
        info!(target: LOG_TARGET, dsn = %dsn, "server ready");
        Ok::<_, LifecycleError>(())
    }
    .instrument(span)
    .await?;
    Ok(dsn)
}

fn resolve_dsn(layout: &DataDirLayout, listen: Option<&NetworkListen>) -> LifecycleResult<Dsn> {
    let Some(listen) = listen else {
        return Ok(Dsn::Socket {
            dir: layout.versioned().to_path_buf(),
        });
    };
    let port = match listen.port {
        Some(port) => port,
        None => allocate_port()?,
    };
    Ok(Dsn::Tcp {
        host: listen.host.clone(),
        port,
    })
}

/// Builds the `-o` string handed to `pg_ctl`, which passes it through a shell.
pub(crate) fn server_options(versioned: &Utf8Path, dsn: &Dsn, extra: Option<&str>) -> String {
    let mut options = Vec::new();
    if let Some(user) = extra.map(str::trim).filter(|user| !user.is_empty()) {
        options.push(user.to_owned());
    }
    options.push(format!("-k {}", shell_quote(versioned.as_str())));
    if let Dsn::Tcp { host, port } = dsn {
        options.push(format!("-c listen_addresses={}", shell_quote(host)));
        options.push(format!("-p {port}"));
    }
    options.join(" ")
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

async fn start_server(
    toolchain: &Toolchain,
    layout: &DataDirLayout,
    dsn: &Dsn,
    extra: Option<&str>,
) -> LifecycleResult<()> {
    let options = server_options(layout.versioned(), dsn, extra);
    let invocation = Invocation::new(Tool::PgCtl)
        .arg("start")
        .arg("-D")
        .arg(layout.versioned())
        .arg("-W")
        .arg("-s")
        .arg("-l")
        .arg(layout.server_log())
        .arg("-o")
        .arg(&options)
        .context(format!("starting server in {}", layout.versioned()));
    toolchain.run(invocation).await?;
    debug!(target: LOG_TARGET, options = %options, "pg_ctl start issued");
    Ok(())
}

/// Creates the `test` database, retrying while the server comes up.
pub(crate) async fn ensure_test_database(toolchain: &Toolchain, dsn: &Dsn) -> LifecycleResult<()> {
    retry_create(CREATEDB_ATTEMPTS, CREATEDB_BACKOFF, || {
        let mut invocation = Invocation::new(Tool::Createdb)
            .arg("-h")
            .arg(dsn.pg_host())
            .arg("-E")
            .arg("UTF8");
        if let Some(port) = dsn.port() {
            invocation = invocation.arg("-p").arg(port.to_string());
        }
        invocation = invocation
            .arg(TEST_DATABASE)
            .context(format!("creating database {TEST_DATABASE}"));
        async move { toolchain.run(invocation).await.map(drop) }
    })
    .await
}

/// Runs `create` until it succeeds, reports an existing database, or the
/// attempts run out. The last error is returned in the latter case.
pub(crate) async fn retry_create<F, Fut>(
    attempts: u32,
    backoff: Duration,
    mut create: F,
) -> LifecycleResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LifecycleResult<()>>,
{
    let mut attempt = 1;
    loop {
        match create().await {
            Ok(()) => return Ok(()),
            Err(err) if already_exists(&err) => {
                debug!(target: LOG_TARGET, "test database already exists");
                return Ok(());
            }
            Err(err) if attempt >= attempts => return Err(err),
            Err(err) => {
                debug!(target: LOG_TARGET, attempt, error = %err, "createdb failed; retrying");
                attempt += 1;
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

fn already_exists(err: &LifecycleError) -> bool {
    err.to_string().contains("already exists")
}
