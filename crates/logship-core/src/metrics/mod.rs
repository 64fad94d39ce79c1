//! Relay metrics with Prometheus text export.

mod prometheus;

pub use prometheus::{CommitDurationHistogram, ErrorKind, FilterOutcome, RelayMetrics};
