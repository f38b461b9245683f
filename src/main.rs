//! `pg_tmp`: start a throwaway `PostgreSQL` server and print its DSN.
//!
//! The same binary hosts the detached helpers: `pg_tmp prewarm` refills the
//! pool of idle data directories and `pg_tmp stop` doubles as the auto-stop
//! watcher. Settings come from `PG_TMP_*` environment variables.

use std::io::Write as _;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Context, Result};
use pg_tmp::{DEFAULT_LISTEN_HOST, NetworkListen, PgTmp, StartOptions, StopOptions};
use tracing::{Level, debug};

#[derive(Debug, Parser)]
#[command(name = "pg_tmp", version, about = "Disposable PostgreSQL servers for tests")]
struct Cli {
    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Initialise an idle data directory and print its path.
    Init(InitArgs),
    /// Start a server and print its connection URI.
    Start(StartArgs),
    /// Drain, stop, and remove a server's data directory.
    Stop(StopArgs),
    /// Initialise one spare idle directory at low priority.
    #[command(hide = true)]
    Prewarm,
}

#[derive(Debug, Args)]
struct InitArgs {
    /// Directory to initialise instead of a fresh one under the pool root.
    dir: Option<Utf8PathBuf>,
    /// Forward `initdb` output instead of capturing it.
    #[arg(long)]
    forward_io: bool,
}

#[derive(Debug, Args)]
struct StartArgs {
    /// Use this root directory instead of the pool.
    #[arg(short = 'd', long)]
    data_dir: Option<Utf8PathBuf>,
    /// Listen on TCP; without a value listens on 127.0.0.1.
    #[arg(
        short = 't',
        long,
        num_args = 0..=1,
        default_missing_value = DEFAULT_LISTEN_HOST,
    )]
    host: Option<String>,
    /// TCP port; implies listening on the default host when `--host` is absent.
    #[arg(short, long)]
    port: Option<u16>,
    /// Seconds before the auto-stop watcher starts draining; 0 disables it.
    #[arg(short = 'w', long)]
    timeout: Option<u64>,
    /// Seconds between connection samples while draining.
    #[arg(long)]
    drain_interval: Option<u64>,
    /// Keep the data directory after the watcher stops the server.
    #[arg(short, long)]
    keep: bool,
    /// Extra options for the server, e.g. `-c work_mem=8MB`.
    #[arg(short, long, allow_hyphen_values = true)]
    options: Option<String>,
}

#[derive(Debug, Args)]
struct StopArgs {
    /// Root data directory of the server.
    dir: Utf8PathBuf,
    /// Keep the data directory.
    #[arg(short, long)]
    keep: bool,
    /// Seconds between connection samples while draining.
    #[arg(long, default_value_t = 5)]
    timeout: u64,
    /// Seconds to wait before the first sample.
    #[arg(long, default_value_t = 0)]
    initial_timeout: u64,
    /// Stop without draining.
    #[arg(short, long)]
    force: bool,
    /// Host the server listens on; the socket directory when absent.
    #[arg(long)]
    host: Option<String>,
    /// Port the server listens on.
    #[arg(short, long)]
    port: Option<u16>,
}

impl StartArgs {
    fn into_options(self) -> StartOptions {
        let listen = match (self.host, self.port) {
            (None, None) => None,
            (host, port) => Some(NetworkListen {
                host: host.unwrap_or_else(|| DEFAULT_LISTEN_HOST.to_owned()),
                port,
            }),
        };
        StartOptions {
            data_dir: self.data_dir,
            listen,
            timeout: self.timeout.map(Duration::from_secs),
            drain_interval: self.drain_interval.map(Duration::from_secs),
            keep: self.keep,
            postgres_options: self.options,
            helper: None,
        }
    }
}

impl StopArgs {
    fn options(&self) -> StopOptions {
        StopOptions {
            keep: self.keep,
            timeout: Duration::from_secs(self.timeout),
            initial_timeout: Duration::from_secs(self.initial_timeout),
            force: self.force,
            host: self.host.clone(),
            port: self.port,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if let Err(err) = color_eyre::install() {
        debug!(error = %err, "color-eyre already installed");
    }
    run(cli.command).await
}

fn init_tracing(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::WARN };
    let installed = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init();
    if installed.is_err() {
        debug!("tracing subscriber already installed");
    }
}

async fn run(command: Command) -> Result<()> {
    if matches!(command, Command::Prewarm) {
        lower_priority();
    }
    let pg_tmp = PgTmp::discover().await?;
    match command {
        Command::Init(args) => {
            let root = pg_tmp.init(args.dir.as_deref(), args.forward_io).await?;
            emit(root.as_str())
        }
        Command::Start(args) => {
            let instance = pg_tmp.start(args.into_options()).await?;
            emit(&instance.dsn().render())
        }
        Command::Stop(args) => {
            pg_tmp.stop(&args.dir, &args.options()).await?;
            Ok(())
        }
        Command::Prewarm => {
            let root = pg_tmp.init(None, false).await?;
            debug!(root = %root, "pre-warmed data directory");
            Ok(())
        }
    }
}

fn emit(line: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}").context("write to stdout")?;
    Ok(())
}

#[cfg(unix)]
fn lower_priority() {
    // SAFETY: setpriority takes plain integers and only touches the calling
    // process's nice value.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, 19) };
    if rc != 0 {
        debug!(error = %std::io::Error::last_os_error(), "could not lower priority");
    }
}

#[cfg(not(unix))]
const fn lower_priority() {}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("pg_tmp").chain(args.iter().copied()))
            .expect("arguments should parse")
    }

    fn start_options(args: &[&str]) -> StartOptions {
        match parse(args).command {
            Command::Start(start) => start.into_options(),
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[test]
    fn bare_start_uses_a_socket() {
        let options = start_options(&["start"]);
        assert!(options.listen.is_none());
        assert!(options.timeout.is_none());
    }

    #[rstest]
    #[case::flag_only(&["start", "--host"], "127.0.0.1", None)]
    #[case::short_flag(&["start", "-t"], "127.0.0.1", None)]
    #[case::explicit_host(&["start", "--host", "0.0.0.0"], "0.0.0.0", None)]
    #[case::port_only(&["start", "--port", "6000"], "127.0.0.1", Some(6000))]
    fn tcp_listen_requests(
        #[case] args: &[&str],
        #[case] host: &str,
        #[case] port: Option<u16>,
    ) {
        let listen = start_options(args).listen.expect("tcp requested");
        assert_eq!(listen.host, host);
        assert_eq!(listen.port, port);
    }

    #[test]
    fn server_options_may_start_with_a_hyphen() {
        let options = start_options(&["start", "-o", "-c work_mem=8MB", "-w", "0"]);
        assert_eq!(options.postgres_options.as_deref(), Some("-c work_mem=8MB"));
        assert_eq!(options.timeout, Some(Duration::ZERO));
    }

    #[test]
    fn stop_defaults_match_the_library() {
        let Command::Stop(stop) = parse(&["stop", "/tmp/pg-tmp-x"]).command else {
            panic!("expected stop");
        };
        assert_eq!(stop.options(), StopOptions::default());
    }

    #[test]
    fn verbose_is_accepted_after_the_subcommand() {
        let cli = parse(&["stop", "/tmp/pg-tmp-x", "--verbose", "--force"]);
        assert!(cli.verbose);
    }

    #[test]
    fn prewarm_is_hidden_but_parses() {
        assert!(matches!(parse(&["prewarm"]).command, Command::Prewarm));
    }
}
