//! Metrics for broker connections and the reconnect loop
//!
//! Recorded through the `metrics` facade. Nothing is exported unless the
//! application installs a recorder.

pub mod counters;
pub mod histograms;
pub mod labels;
