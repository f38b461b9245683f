//! Soft-skip heuristics for tests that need a local PostgreSQL toolchain.
//!
//! Hosts without the server binaries, or runs under root where `initdb`
//! refuses to start, turn into a logged skip instead of a failure.

/// Prefix on every skip line so CI logs can be grepped for skipped tests.
pub(crate) const SKIP_PREFIX: &str = "SKIP-PG-TMP";

/// Message substrings that mean the host cannot run PostgreSQL at all.
const SKIP_CONDITIONS: &[(&str, &str)] = &[
    ("could not find `pg_ctl`", "pg_ctl is not installed"),
    ("failed to spawn `pg_ctl`", "pg_ctl could not be executed"),
    ("cannot be run as root", "initdb refuses to run as root"),
    ("No such file or directory", "PostgreSQL binaries are unavailable"),
];

/// Formats a skip line when `message` matches a known environment failure.
pub(crate) fn skip_message(message: &str) -> Option<String> {
    SKIP_CONDITIONS
        .iter()
        .find(|(needle, _)| message.contains(needle))
        .map(|(_, reason)| format!("{SKIP_PREFIX}: {reason}: {message}"))
}

/// Reports a skip on stderr.
#[expect(clippy::print_stderr, reason = "skip notices must reach the test log")]
pub(crate) fn report_skip(reason: &str) {
    eprintln!("{reason}");
}
