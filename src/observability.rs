//! Tracing target shared by every lifecycle span and event.
//!
//! Pool scans, server launches, drain samples, and helper spawns all log under
//! one target so a subscriber's target filter can isolate `pg_tmp` output.

/// Target used by lifecycle spans and logs.
pub(crate) const LOG_TARGET: &str = "pg_tmp::lifecycle";
