//! Runtime construction for the blocking entry points.

use color_eyre::eyre::Context;
use tokio::runtime::{Builder, Runtime};

use crate::error::{LifecycleError, LifecycleResult};

/// Builds the current-thread runtime that drives one blocking call.
pub(crate) fn build_runtime() -> LifecycleResult<Runtime> {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create Tokio runtime for pg_tmp")
        .map_err(LifecycleError::from)
}
