//! Unit tests for the idle-marker claim protocol. None of these run
//! `initdb`; candidates are seeded by hand.

use super::*;
use color_eyre::eyre::{Result, ensure, eyre};
use std::cell::Cell;

#[derive(Default)]
struct CountingPrewarm(Cell<u32>);

impl Prewarm for CountingPrewarm {
    fn fire(&self) {
        self.0.set(self.0.get() + 1);
    }
}

struct Fixture {
    _sandbox: tempfile::TempDir,
    root: Utf8PathBuf,
    toolchain: Toolchain,
    version: PgVersion,
    prewarm: CountingPrewarm,
}

impl Fixture {
    fn new() -> Result<Self> {
        let sandbox = tempfile::tempdir()?;
        let root = Utf8PathBuf::from_path_buf(sandbox.path().to_path_buf())
            .map_err(|path| eyre!("non UTF-8 sandbox {}", path.display()))?;
        // A bin dir without tools makes any accidental initdb call fail loudly.
        let toolchain = Toolchain::new(Some(root.join("no-bin")));
        Ok(Self {
            _sandbox: sandbox,
            root,
            toolchain,
            version: PgVersion::parse("pg_ctl (PostgreSQL) 16.2")?,
            prewarm: CountingPrewarm::default(),
        })
    }

    fn pool(&self) -> DirectoryPool<'_, CountingPrewarm> {
        DirectoryPool {
            toolchain: &self.toolchain,
            version: &self.version,
            root: &self.root,
            prewarm: &self.prewarm,
        }
    }

    fn seed(&self, name: &str, version: &str, marker: bool) -> Result<Utf8PathBuf> {
        let dir = self.root.join(name);
        std::fs::create_dir_all(dir.join(version))?;
        if marker {
            std::fs::write(dir.join("NEW"), b"")?;
        }
        Ok(dir)
    }
}

#[tokio::test]
async fn claims_an_idle_directory_by_deleting_its_marker() -> Result<()> {
    let fixture = Fixture::new()?;
    let seeded = fixture.seed("pg-tmp-idle", "16.2", true)?;

    let claimed = fixture
        .pool()
        .claim_idle_candidate()
        .await?
        .ok_or_else(|| eyre!("expected a claim"))?;

    ensure!(claimed.root() == seeded, "claimed {}", claimed.root());
    ensure!(!seeded.join("NEW").exists(), "marker must be gone");
    ensure!(seeded.join("16.2").is_dir(), "cluster must survive the claim");
    Ok(())
}

#[tokio::test]
async fn ignores_ineligible_entries() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.seed("pg-tmp-adopted", "16.2", false)?;
    fixture.seed("pg-tmp-other-version", "15.6", true)?;
    fixture.seed("unrelated", "16.2", true)?;
    std::fs::write(fixture.root.join("pg-tmp-file"), b"")?;

    let claimed = fixture.pool().claim_idle_candidate().await?;

    ensure!(claimed.is_none(), "nothing should be claimable: {claimed:?}");
    ensure!(fixture.root.join("pg-tmp-other-version/NEW").exists());
    ensure!(fixture.root.join("unrelated/NEW").exists());
    Ok(())
}

#[tokio::test]
async fn missing_root_yields_no_candidates() -> Result<()> {
    let fixture = Fixture::new()?;
    let root = fixture.root.join("never-created");
    let pool = DirectoryPool {
        root: &root,
        ..fixture.pool()
    };
    ensure!(pool.claim_idle_candidate().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn concurrent_claims_on_one_directory_have_one_winner() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.seed("pg-tmp-contested", "16.2", true)?;
    let pool = fixture.pool();

    let (first, second) = tokio::join!(pool.claim_idle_candidate(), pool.claim_idle_candidate());
    let winners = [first?, second?].into_iter().flatten().count();

    ensure!(winners == 1, "expected exactly one winner, saw {winners}");
    Ok(())
}

#[tokio::test]
async fn each_idle_directory_is_claimed_once() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.seed("pg-tmp-a", "16.2", true)?;
    fixture.seed("pg-tmp-b", "16.2", true)?;
    let pool = fixture.pool();

    let first = pool.claim_idle_candidate().await?.ok_or_else(|| eyre!("first claim"))?;
    let second = pool.claim_idle_candidate().await?.ok_or_else(|| eyre!("second claim"))?;

    ensure!(first.root() != second.root(), "a directory was handed out twice");
    ensure!(pool.claim_idle_candidate().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn explicit_initialised_directory_is_adopted_without_prewarm() -> Result<()> {
    let fixture = Fixture::new()?;
    let explicit = fixture.seed("mine", "16.2", false)?;

    let acquisition = fixture.pool().acquire(Some(&explicit)).await?;

    ensure!(acquisition.source == AcquireSource::ExplicitAdopted);
    ensure!(acquisition.layout.root() == explicit);
    ensure!(fixture.prewarm.0.get() == 0, "adoption must not pre-warm");
    Ok(())
}

#[tokio::test]
async fn pooled_claim_fires_prewarm_once() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.seed("pg-tmp-idle", "16.2", true)?;

    let acquisition = fixture.pool().acquire(None).await?;

    ensure!(acquisition.source == AcquireSource::Claimed);
    ensure!(fixture.prewarm.0.get() == 1);
    Ok(())
}

#[tokio::test]
async fn failed_creation_does_not_prewarm() -> Result<()> {
    let fixture = Fixture::new()?;

    let result = fixture.pool().acquire(None).await;

    ensure!(result.is_err(), "creation without initdb must fail");
    ensure!(fixture.prewarm.0.get() == 0);
    Ok(())
}

#[tokio::test]
async fn failed_creation_leaves_no_directory_behind() -> Result<()> {
    let fixture = Fixture::new()?;

    let result = fixture.pool().acquire(None).await;

    ensure!(result.is_err(), "creation without initdb must fail");
    let leftovers: Vec<String> = std::fs::read_dir(&fixture.root)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(DIR_PREFIX))
        .collect();
    ensure!(leftovers.is_empty(), "unclaimable roots left behind: {leftovers:?}");
    Ok(())
}

#[tokio::test]
async fn failed_explicit_initialisation_keeps_the_directory() -> Result<()> {
    let fixture = Fixture::new()?;
    let explicit = fixture.root.join("mine");

    let result = fixture.pool().acquire(Some(&explicit)).await;

    ensure!(result.is_err(), "initialisation without initdb must fail");
    ensure!(explicit.is_dir(), "explicit directories belong to the caller");
    Ok(())
}
