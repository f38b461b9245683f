//! Guarded removal of pooled data directories.

use std::io::ErrorKind;
use std::path::{Component, Path};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::observability::LOG_TARGET;

/// Attempts made before a removal failure is reported.
pub(crate) const REMOVAL_ATTEMPTS: u32 = 3;
/// Pause between removal attempts while the stopped server releases handles.
pub(crate) const REMOVAL_DELAY: Duration = Duration::from_millis(200);

/// Records the outcome of a guarded directory removal attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RemovalOutcome {
    Removed,
    Missing,
}

/// Checks whether a path contains any parent-directory (`..`) components.
pub(crate) fn has_parent_dir(path: &Path) -> bool {
    path.components()
        .any(|component| matches!(component, Component::ParentDir))
}

/// Removes a directory tree once, rejecting unsafe paths before deletion.
pub(crate) async fn try_remove_dir_all(path: &Path) -> Result<RemovalOutcome, std::io::Error> {
    guard_removal_path(path)?;
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(RemovalOutcome::Removed),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RemovalOutcome::Missing),
        Err(err) => Err(err),
    }
}

/// Removes a root data directory, retrying transient failures.
///
/// Unsafe paths are rejected immediately without retrying.
pub(crate) async fn remove_root_with_retry(path: &Path) -> Result<RemovalOutcome, std::io::Error> {
    let mut attempt = 1;
    loop {
        match try_remove_dir_all(path).await {
            Ok(outcome) => {
                log_removal_outcome(outcome, path);
                return Ok(outcome);
            }
            Err(err) if err.kind() == ErrorKind::InvalidInput => return Err(err),
            Err(err) if attempt >= REMOVAL_ATTEMPTS => {
                warn!(
                    target: LOG_TARGET,
                    path = %path.display(),
                    attempts = attempt,
                    error = %err,
                    "giving up on data directory removal"
                );
                return Err(err);
            }
            Err(err) => {
                debug!(
                    target: LOG_TARGET,
                    path = %path.display(),
                    attempt,
                    error = %err,
                    "data directory removal failed; retrying"
                );
                attempt += 1;
                tokio::time::sleep(REMOVAL_DELAY).await;
            }
        }
    }
}

fn log_removal_outcome(outcome: RemovalOutcome, path: &Path) {
    match outcome {
        RemovalOutcome::Removed => info!(
            target: LOG_TARGET,
            path = %path.display(),
            "removed data directory"
        ),
        RemovalOutcome::Missing => debug!(
            target: LOG_TARGET,
            path = %path.display(),
            "data directory already removed"
        ),
    }
}

fn guard_removal_path(path: &Path) -> Result<(), std::io::Error> {
    if is_empty_or_root(path) || has_parent_dir(path) {
        return Err(std::io::Error::new(
            ErrorKind::InvalidInput,
            format!("refuse to remove unsafe path {}", path.display()),
        ));
    }
    Ok(())
}

fn is_empty_or_root(path: &Path) -> bool {
    let mut components = path.components();
    match components.next() {
        None => true,
        Some(Component::CurDir | Component::RootDir) => components.next().is_none(),
        Some(Component::Prefix(_)) => match components.next() {
            None => true,
            Some(Component::RootDir) => components.next().is_none(),
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::root("/")]
    #[case::empty("")]
    #[case::current(".")]
    #[case::traversal("/tmp/pg-tmp-x/../../etc")]
    #[tokio::test]
    async fn unsafe_paths_are_refused(#[case] raw: &str) {
        let err = try_remove_dir_all(Path::new(raw))
            .await
            .expect_err("unsafe path must be refused");
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn removal_reports_missing_directories() {
        let sandbox = tempfile::tempdir().expect("tempdir");
        let target = sandbox.path().join("pg-tmp-gone");
        let outcome = remove_root_with_retry(&target).await.expect("remove");
        assert_eq!(outcome, RemovalOutcome::Missing);
    }

    #[tokio::test]
    async fn removal_deletes_nested_trees() {
        let sandbox = tempfile::tempdir().expect("tempdir");
        let target = sandbox.path().join("pg-tmp-abc");
        std::fs::create_dir_all(target.join("16/base")).expect("seed tree");
        std::fs::write(target.join("NEW"), b"").expect("seed marker");
        let outcome = remove_root_with_retry(&target).await.expect("remove");
        assert_eq!(outcome, RemovalOutcome::Removed);
        assert!(!target.exists());
    }
}
