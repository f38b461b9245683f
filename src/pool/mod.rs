//! Claims reusable data directories from the shared temp root.
//!
//! There is no lock file and no coordinating daemon. A directory is idle
//! while its `NEW` marker exists; whoever deletes the marker owns the
//! directory. Deletion is the serialisation point: a process that observes
//! the marker but fails to delete it has lost the race and moves on to the
//! next candidate, eventually creating a fresh directory instead.

use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, Report, eyre};
use tracing::{debug, info, warn};

use crate::error::LifecycleResult;
use crate::initdb::{InitRequest, initialize};
use crate::layout::{DIR_PREFIX, DataDirLayout};
use crate::observability::LOG_TARGET;
use crate::ownership::owned_by_current_user;
use crate::toolchain::{OutputMode, PgVersion, Toolchain};

#[cfg(test)]
mod tests;

/// Fresh directories created before giving up when each one is stolen before
/// its creator can claim it.
const SELF_CLAIM_ATTEMPTS: u32 = 3;

/// Replenishes the pool after an acquisition.
pub(crate) trait Prewarm {
    /// Starts creating one spare idle directory without waiting for it.
    fn fire(&self);
}

/// Describes how [`DirectoryPool::acquire`] obtained its directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireSource {
    /// An explicit directory that already held a cluster was adopted as-is.
    ExplicitAdopted,
    /// An explicit directory was initialised in place.
    ExplicitInitialized,
    /// An idle pooled directory was claimed.
    Claimed,
    /// A brand-new directory was created and claimed by its creator.
    Created,
}

/// Result of a successful [`DirectoryPool::acquire`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Acquisition {
    /// Layout of the acquired directory.
    pub layout: DataDirLayout,
    /// How the directory was obtained.
    pub source: AcquireSource,
}

/// Outcome of a single claim attempt against one candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ClaimOutcome {
    Claimed,
    /// The marker vanished between observation and deletion.
    LostRace,
    /// The candidate has no cluster for this version or no owned marker.
    Ineligible,
}

/// Pool of data directories under a single temp root.
#[derive(Debug)]
pub(crate) struct DirectoryPool<'a, P> {
    pub(crate) toolchain: &'a Toolchain,
    pub(crate) version: &'a PgVersion,
    pub(crate) root: &'a Utf8Path,
    pub(crate) prewarm: &'a P,
}

impl<P: Prewarm> DirectoryPool<'_, P> {
    /// Returns a data directory ready for a server launch.
    ///
    /// Every path except adopting an explicit, already initialised directory
    /// fires the pre-warm hook once the acquisition has completed.
    pub(crate) async fn acquire(&self, explicit: Option<&Utf8Path>) -> LifecycleResult<Acquisition> {
        let acquisition = match explicit {
            Some(dir) => self.acquire_explicit(dir).await?,
            None => self.acquire_pooled().await?,
        };

        if acquisition.source != AcquireSource::ExplicitAdopted {
            self.prewarm.fire();
        }
        Ok(acquisition)
    }

    async fn acquire_explicit(&self, dir: &Utf8Path) -> LifecycleResult<Acquisition> {
        let existing = DataDirLayout::new(dir, self.version);
        if is_dir(existing.versioned()).await
            && owned_by_current_user(existing.versioned().as_std_path()).await
        {
            info!(target: LOG_TARGET, root = %dir, "adopting explicit data directory");
            return Ok(Acquisition {
                layout: existing,
                source: AcquireSource::ExplicitAdopted,
            });
        }

        let layout = self.initialize(Some(dir)).await?;
        if let Err(err) = tokio::fs::remove_file(layout.idle_marker()).await {
            debug!(
                target: LOG_TARGET,
                root = %dir,
                error = %err,
                "ignoring idle marker removal failure for explicit directory"
            );
        }
        Ok(Acquisition {
            layout,
            source: AcquireSource::ExplicitInitialized,
        })
    }

    async fn acquire_pooled(&self) -> LifecycleResult<Acquisition> {
        if let Some(layout) = self.claim_idle_candidate().await? {
            return Ok(Acquisition {
                layout,
                source: AcquireSource::Claimed,
            });
        }

        for attempt in 1..=SELF_CLAIM_ATTEMPTS {
            let layout = self.initialize(None).await?;
            if try_remove_marker(&layout).await == ClaimOutcome::Claimed {
                info!(target: LOG_TARGET, root = %layout.root(), "created data directory");
                return Ok(Acquisition {
                    layout,
                    source: AcquireSource::Created,
                });
            }
            warn!(
                target: LOG_TARGET,
                root = %layout.root(),
                attempt,
                "fresh data directory was claimed by another process"
            );
        }
        Err(eyre!(
            "every freshly created data directory under {} was claimed by another process",
            self.root
        )
        .into())
    }

    /// Scans the root and claims the first eligible idle directory.
    ///
    /// Candidate order follows the directory listing and is not meaningful.
    pub(crate) async fn claim_idle_candidate(&self) -> LifecycleResult<Option<DataDirLayout>> {
        for candidate in self.candidates().await? {
            let layout = DataDirLayout::new(&candidate, self.version);
            match try_claim(&layout).await {
                ClaimOutcome::Claimed => {
                    info!(target: LOG_TARGET, root = %candidate, "claimed idle data directory");
                    return Ok(Some(layout));
                }
                ClaimOutcome::LostRace => {
                    debug!(target: LOG_TARGET, root = %candidate, "lost claim race");
                }
                ClaimOutcome::Ineligible => {}
            }
        }
        Ok(None)
    }

    async fn candidates(&self) -> LifecycleResult<Vec<Utf8PathBuf>> {
        let mut entries = match tokio::fs::read_dir(self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Report::new(err).wrap_err(format!("scan {}", self.root)).into()),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("scan {}", self.root))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with(DIR_PREFIX) {
                found.push(self.root.join(name));
            }
        }
        Ok(found)
    }

    async fn initialize(&self, dir: Option<&Utf8Path>) -> LifecycleResult<DataDirLayout> {
        initialize(InitRequest {
            toolchain: self.toolchain,
            version: self.version,
            pool_root: self.root,
            dir,
            output: OutputMode::Capture,
        })
        .await
    }
}

/// Checks eligibility, then attempts the claiming deletion.
pub(crate) async fn try_claim(layout: &DataDirLayout) -> ClaimOutcome {
    if !is_dir(layout.versioned()).await {
        return ClaimOutcome::Ineligible;
    }
    if !owned_by_current_user(layout.idle_marker().as_std_path()).await {
        return ClaimOutcome::Ineligible;
    }
    try_remove_marker(layout).await
}

async fn try_remove_marker(layout: &DataDirLayout) -> ClaimOutcome {
    match tokio::fs::remove_file(layout.idle_marker()).await {
        Ok(()) => ClaimOutcome::Claimed,
        Err(_) => ClaimOutcome::LostRace,
    }
}

async fn is_dir(path: &Utf8Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|metadata| metadata.is_dir())
}
