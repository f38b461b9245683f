//! Domain error types for the ephemeral `PostgreSQL` lifecycle.

use color_eyre::Report;
use thiserror::Error;

/// Result alias for operations that may return a [`PgTmpError`].
pub type Result<T> = std::result::Result<T, PgTmpError>;

/// Result alias for lifecycle fallible operations.
pub type LifecycleResult<T> = std::result::Result<T, LifecycleError>;

/// Result alias for configuration fallible operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Top-level error exposed by the crate.
#[derive(Debug, Error)]
pub enum PgTmpError {
    /// Indicates an instance lifecycle operation failed.
    #[error("postgres lifecycle operation failed")]
    Lifecycle(#[from] LifecycleError),
    /// Indicates configuration parsing failed.
    #[error("configuration parsing failed")]
    Config(#[from] ConfigError),
}

/// Categorises lifecycle failures so callers can branch on structured errors.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum LifecycleErrorKind {
    /// Represents errors without a more specific semantic meaning.
    #[default]
    Other,
    /// An external `PostgreSQL` tool exited unsuccessfully or could not be spawned.
    ToolInvocation,
    /// A stop was requested against a path without a matching versioned sub-path.
    InvalidDataDirectory,
    /// The operating system refused to hand out a free TCP port.
    PortAllocation,
    /// No helper binary could be found to host a background task.
    HelperMissing,
}

/// Captures lifecycle failures alongside their diagnostic report.
#[derive(Debug, Error)]
#[error("{report}")]
pub struct LifecycleError {
    kind: LifecycleErrorKind,
    #[source]
    report: Report,
}

impl LifecycleError {
    /// Constructs a new lifecycle error with the provided kind and diagnostic
    /// report.
    #[must_use]
    pub const fn new(kind: LifecycleErrorKind, report: Report) -> Self {
        Self { kind, report }
    }

    /// Returns the semantic category for this failure.
    #[must_use]
    pub const fn kind(&self) -> LifecycleErrorKind {
        self.kind
    }

    /// Extracts the underlying diagnostic report.
    pub fn into_report(self) -> Report {
        self.report
    }
}

impl From<Report> for LifecycleError {
    fn from(report: Report) -> Self {
        Self::new(LifecycleErrorKind::Other, report)
    }
}

impl From<ConfigError> for LifecycleError {
    fn from(err: ConfigError) -> Self {
        let ConfigError(report) = err;
        Self::new(LifecycleErrorKind::Other, report)
    }
}

impl From<PgTmpError> for LifecycleError {
    fn from(err: PgTmpError) -> Self {
        match err {
            PgTmpError::Lifecycle(inner) => inner,
            PgTmpError::Config(inner) => inner.into(),
        }
    }
}

/// Captures configuration failures.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ConfigError(#[from] Report);
