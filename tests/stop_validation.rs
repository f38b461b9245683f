//! `stop` must refuse directories that do not hold a cluster for the running
//! toolchain, without touching them.

use std::process::Command;

use camino::Utf8PathBuf;
use pg_tmp::{LifecycleErrorKind, PgTmp, PgTmpSettings, PgVersion, StopOptions};
use rstest::{fixture, rstest};
use tempfile::TempDir;

struct Target {
    root: Utf8PathBuf,
    _temp: TempDir,
}

#[fixture]
fn target() -> Target {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(temp.path().join("pg-tmp-stale")).expect("utf8 path");
    std::fs::create_dir_all(root.join("15.4")).expect("other version dir");
    std::fs::write(root.join("keepsake"), b"untouched").expect("sentinel");
    Target { root, _temp: temp }
}

fn pg_tmp_16(root: &Utf8PathBuf) -> PgTmp {
    let version = PgVersion::parse("pg_ctl (PostgreSQL) 16.2").expect("version");
    PgTmp::new(PgTmpSettings::with_root(root.clone()), version)
}

#[rstest]
#[case::draining(StopOptions::default())]
#[case::forced(StopOptions { force: true, ..StopOptions::default() })]
fn mismatched_version_is_rejected_untouched(target: Target, #[case] options: StopOptions) {
    let pg_tmp = pg_tmp_16(&target.root);

    let err = pg_tmp
        .stop_blocking(&target.root, &options)
        .expect_err("stop must reject a directory without 16.2");

    assert_eq!(err.kind(), LifecycleErrorKind::InvalidDataDirectory);
    assert!(
        err.to_string().contains(target.root.join("16.2").as_str()),
        "error should name the missing path: {err}"
    );
    assert!(target.root.join("15.4").is_dir());
    assert_eq!(
        std::fs::read(target.root.join("keepsake")).expect("sentinel"),
        b"untouched"
    );
}

#[rstest]
fn missing_root_is_rejected(target: Target) {
    let missing = target.root.join("absent");
    let err = pg_tmp_16(&target.root)
        .stop_blocking(&missing, &StopOptions::default())
        .expect_err("stop must reject a missing root");

    assert_eq!(err.kind(), LifecycleErrorKind::InvalidDataDirectory);
}

#[rstest]
fn cli_stop_exits_non_zero_for_a_foreign_directory(target: Target) {
    let output = Command::new(env!("CARGO_BIN_EXE_pg_tmp"))
        .args(["stop", "--force", target.root.as_str()])
        .output()
        .expect("run pg_tmp");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("pg_ctl") && !stderr.contains(target.root.as_str()) {
        // Toolchain discovery failed before validation; nothing else to check.
        return;
    }
    assert!(target.root.join("keepsake").exists());
    assert!(target.root.join("15.4").is_dir());
}
