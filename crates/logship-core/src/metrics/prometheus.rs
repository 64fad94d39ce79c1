//! Prometheus metrics export.

use prometheus::Registry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket boundaries in microseconds for store commit duration.
/// Converts to seconds: [0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5]
const COMMIT_DURATION_BUCKETS_US: [u64; 7] = [1000, 5000, 10000, 25000, 50000, 100000, 500000];

/// Default metric name prefix.
pub const DEFAULT_PREFIX: &str = "logship";

/// Error types for labeled metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Storage failures (commit, open, decode)
    Storage,
    /// Broker failures (connection, delivery)
    Broker,
    /// Configuration failures (missing config for a message)
    Config,
    /// Transformation expression failures
    Transform,
    /// Message parse failures at ingest
    Parse,
    /// Unknown/other errors
    Other,
}

impl ErrorKind {
    /// Get the label value for Prometheus export.
    pub fn as_label(&self) -> &'static str {
        match self {
            ErrorKind::Storage => "storage",
            ErrorKind::Broker => "broker",
            ErrorKind::Config => "config",
            ErrorKind::Transform => "transform",
            ErrorKind::Parse => "parse",
            ErrorKind::Other => "other",
        }
    }
}

/// Filter verdict labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOutcome {
    /// Message passed the filter
    Passing,
    /// Message dropped silently
    Dropped,
    /// Message rejected for redelivery
    Rejected,
}

impl FilterOutcome {
    fn as_label(&self) -> &'static str {
        match self {
            FilterOutcome::Passing => "passing",
            FilterOutcome::Dropped => "dropped",
            FilterOutcome::Rejected => "rejected",
        }
    }
}

/// Relay metrics with counters, gauges, and histograms.
pub struct RelayMetrics {
    // === COUNTERS ===
    /// Total messages durably stashed
    stashed_total: AtomicU64,

    /// Total messages confirmed by the broker and deleted
    acked_total: AtomicU64,

    /// Total messages nacked back to the queue
    nacked_total: AtomicU64,

    /// Total messages moved to the failed table
    perm_failed_total: AtomicU64,

    /// Total backpressure rejections at the ingest channel
    backpressure_total: AtomicU64,

    /// Filter verdicts
    filter_passing: AtomicU64,
    filter_dropped: AtomicU64,
    filter_rejected: AtomicU64,

    /// Broker connection attempts that failed
    broker_connection_errors_total: AtomicU64,

    /// Errors by kind
    errors_total: AtomicU64,
    errors_storage: AtomicU64,
    errors_broker: AtomicU64,
    errors_config: AtomicU64,
    errors_transform: AtomicU64,
    errors_parse: AtomicU64,
    errors_other: AtomicU64,

    // === GAUGES ===
    /// Current queued table size
    queued_size: AtomicU64,

    /// Current sent table size
    sent_size: AtomicU64,

    /// Current failed table size
    failed_size: AtomicU64,

    // === HISTOGRAM: commit_duration_seconds ===
    /// Sum of all commit durations in microseconds
    commit_duration_sum_us: AtomicU64,

    /// Count of commit duration observations
    commit_duration_count: AtomicU64,

    /// Bucket counts for commit duration histogram
    commit_duration_buckets: [AtomicU64; 8],

    /// Prometheus registry (optional)
    #[allow(dead_code)]
    registry: Option<Registry>,
}

impl RelayMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            stashed_total: AtomicU64::new(0),
            acked_total: AtomicU64::new(0),
            nacked_total: AtomicU64::new(0),
            perm_failed_total: AtomicU64::new(0),
            backpressure_total: AtomicU64::new(0),
            filter_passing: AtomicU64::new(0),
            filter_dropped: AtomicU64::new(0),
            filter_rejected: AtomicU64::new(0),
            broker_connection_errors_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            errors_storage: AtomicU64::new(0),
            errors_broker: AtomicU64::new(0),
            errors_config: AtomicU64::new(0),
            errors_transform: AtomicU64::new(0),
            errors_parse: AtomicU64::new(0),
            errors_other: AtomicU64::new(0),
            queued_size: AtomicU64::new(0),
            sent_size: AtomicU64::new(0),
            failed_size: AtomicU64::new(0),
            commit_duration_sum_us: AtomicU64::new(0),
            commit_duration_count: AtomicU64::new(0),
            commit_duration_buckets: Default::default(),
            registry: None,
        }
    }

    /// Create metrics with a Prometheus registry attached.
    pub fn with_registry(registry: Registry) -> Self {
        let mut metrics = Self::new();
        metrics.registry = Some(registry);
        metrics
    }

    // === COUNTER RECORDING ===

    /// Record durably stashed messages.
    pub fn record_stashed(&self, count: u64) {
        self.stashed_total.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a broker-confirmed deletion.
    pub fn record_acked(&self) {
        self.acked_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a nack redelivery.
    pub fn record_nacked(&self) {
        self.nacked_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message moved to the failed table.
    pub fn record_perm_failed(&self) {
        self.perm_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a backpressure rejection.
    pub fn record_backpressure(&self) {
        self.backpressure_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a filter verdict.
    pub fn record_filter(&self, outcome: FilterOutcome) {
        match outcome {
            FilterOutcome::Passing => self.filter_passing.fetch_add(1, Ordering::Relaxed),
            FilterOutcome::Dropped => self.filter_dropped.fetch_add(1, Ordering::Relaxed),
            FilterOutcome::Rejected => self.filter_rejected.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Record a failed broker connection attempt.
    pub fn record_broker_connection_error(&self) {
        self.broker_connection_errors_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error with a kind label.
    pub fn record_error(&self, kind: ErrorKind) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        match kind {
            ErrorKind::Storage => self.errors_storage.fetch_add(1, Ordering::Relaxed),
            ErrorKind::Broker => self.errors_broker.fetch_add(1, Ordering::Relaxed),
            ErrorKind::Config => self.errors_config.fetch_add(1, Ordering::Relaxed),
            ErrorKind::Transform => self.errors_transform.fetch_add(1, Ordering::Relaxed),
            ErrorKind::Parse => self.errors_parse.fetch_add(1, Ordering::Relaxed),
            ErrorKind::Other => self.errors_other.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Record a store commit with duration histogram.
    pub fn record_commit(&self, duration: Duration) {
        let duration_us = duration.as_micros() as u64;
        self.commit_duration_sum_us
            .fetch_add(duration_us, Ordering::Relaxed);
        self.commit_duration_count.fetch_add(1, Ordering::Relaxed);

        // Prometheus buckets are cumulative (le = less than or equal)
        for (i, &bucket_us) in COMMIT_DURATION_BUCKETS_US.iter().enumerate() {
            if duration_us <= bucket_us {
                self.commit_duration_buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.commit_duration_buckets[7].fetch_add(1, Ordering::Relaxed);
    }

    // === GAUGE UPDATES ===

    /// Update the table size gauges.
    pub fn set_table_sizes(&self, queued: u64, sent: u64, failed: u64) {
        self.queued_size.store(queued, Ordering::Relaxed);
        self.sent_size.store(sent, Ordering::Relaxed);
        self.failed_size.store(failed, Ordering::Relaxed);
    }

    // === GETTERS ===

    /// Get total stashed messages.
    pub fn stashed_total(&self) -> u64 {
        self.stashed_total.load(Ordering::Relaxed)
    }

    /// Get total acked messages.
    pub fn acked_total(&self) -> u64 {
        self.acked_total.load(Ordering::Relaxed)
    }

    /// Get total nacked messages.
    pub fn nacked_total(&self) -> u64 {
        self.nacked_total.load(Ordering::Relaxed)
    }

    /// Get total permanently failed messages.
    pub fn perm_failed_total(&self) -> u64 {
        self.perm_failed_total.load(Ordering::Relaxed)
    }

    /// Get total backpressure rejections.
    pub fn backpressure_total(&self) -> u64 {
        self.backpressure_total.load(Ordering::Relaxed)
    }

    /// Get a filter verdict count.
    pub fn filter_total(&self, outcome: FilterOutcome) -> u64 {
        match outcome {
            FilterOutcome::Passing => self.filter_passing.load(Ordering::Relaxed),
            FilterOutcome::Dropped => self.filter_dropped.load(Ordering::Relaxed),
            FilterOutcome::Rejected => self.filter_rejected.load(Ordering::Relaxed),
        }
    }

    /// Get total failed broker connection attempts.
    pub fn broker_connection_errors_total(&self) -> u64 {
        self.broker_connection_errors_total.load(Ordering::Relaxed)
    }

    /// Get total errors.
    pub fn errors_total(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    /// Get error count by kind.
    pub fn errors_by_kind(&self, kind: ErrorKind) -> u64 {
        match kind {
            ErrorKind::Storage => self.errors_storage.load(Ordering::Relaxed),
            ErrorKind::Broker => self.errors_broker.load(Ordering::Relaxed),
            ErrorKind::Config => self.errors_config.load(Ordering::Relaxed),
            ErrorKind::Transform => self.errors_transform.load(Ordering::Relaxed),
            ErrorKind::Parse => self.errors_parse.load(Ordering::Relaxed),
            ErrorKind::Other => self.errors_other.load(Ordering::Relaxed),
        }
    }

    /// Get the current queued table size.
    pub fn queued_size(&self) -> u64 {
        self.queued_size.load(Ordering::Relaxed)
    }

    /// Get the current sent table size.
    pub fn sent_size(&self) -> u64 {
        self.sent_size.load(Ordering::Relaxed)
    }

    /// Get the current failed table size.
    pub fn failed_size(&self) -> u64 {
        self.failed_size.load(Ordering::Relaxed)
    }

    /// Get commit duration histogram data for export.
    pub fn commit_duration_histogram(&self) -> CommitDurationHistogram {
        CommitDurationHistogram {
            sum_seconds: self.commit_duration_sum_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            count: self.commit_duration_count.load(Ordering::Relaxed),
            buckets: [
                (0.001, self.commit_duration_buckets[0].load(Ordering::Relaxed)),
                (0.005, self.commit_duration_buckets[1].load(Ordering::Relaxed)),
                (0.01, self.commit_duration_buckets[2].load(Ordering::Relaxed)),
                (0.025, self.commit_duration_buckets[3].load(Ordering::Relaxed)),
                (0.05, self.commit_duration_buckets[4].load(Ordering::Relaxed)),
                (0.1, self.commit_duration_buckets[5].load(Ordering::Relaxed)),
                (0.5, self.commit_duration_buckets[6].load(Ordering::Relaxed)),
            ],
            inf_bucket: self.commit_duration_buckets[7].load(Ordering::Relaxed),
        }
    }

    /// Export all metrics in Prometheus text format with the default prefix.
    pub fn export_prometheus_text(&self) -> String {
        self.export_prometheus_text_with_prefix(DEFAULT_PREFIX)
    }

    /// Export all metrics in Prometheus text format with a custom prefix.
    pub fn export_prometheus_text_with_prefix(&self, prefix: &str) -> String {
        let mut output = String::with_capacity(4096);

        let mut counter = |name: &str, help: &str, value: u64| {
            output.push_str(&format!("# HELP {}_{} {}\n", prefix, name, help));
            output.push_str(&format!("# TYPE {}_{} counter\n", prefix, name));
            output.push_str(&format!("{}_{} {}\n\n", prefix, name, value));
        };

        counter(
            "messages_stashed_total",
            "Total messages durably stashed",
            self.stashed_total(),
        );
        counter(
            "messages_acked_total",
            "Total messages confirmed by the broker",
            self.acked_total(),
        );
        counter(
            "messages_nacked_total",
            "Total messages nacked back to the queue",
            self.nacked_total(),
        );
        counter(
            "messages_failed_total",
            "Total messages moved to the failed table",
            self.perm_failed_total(),
        );
        counter(
            "backpressure_total",
            "Total ingest rejections due to backpressure",
            self.backpressure_total(),
        );
        counter(
            "broker_connection_errors_total",
            "Total failed broker connection attempts",
            self.broker_connection_errors_total(),
        );
        counter("errors_total", "Total errors encountered", self.errors_total());

        output.push_str(&format!("# HELP {}_filter Messages by filter verdict\n", prefix));
        output.push_str(&format!("# TYPE {}_filter counter\n", prefix));
        for outcome in [
            FilterOutcome::Passing,
            FilterOutcome::Dropped,
            FilterOutcome::Rejected,
        ] {
            output.push_str(&format!(
                "{}_filter{{verdict=\"{}\"}} {}\n",
                prefix,
                outcome.as_label(),
                self.filter_total(outcome)
            ));
        }
        output.push('\n');

        output.push_str(&format!("# HELP {}_errors Errors by kind\n", prefix));
        output.push_str(&format!("# TYPE {}_errors counter\n", prefix));
        for kind in [
            ErrorKind::Storage,
            ErrorKind::Broker,
            ErrorKind::Config,
            ErrorKind::Transform,
            ErrorKind::Parse,
            ErrorKind::Other,
        ] {
            output.push_str(&format!(
                "{}_errors{{kind=\"{}\"}} {}\n",
                prefix,
                kind.as_label(),
                self.errors_by_kind(kind)
            ));
        }
        output.push('\n');

        let mut gauge = |name: &str, help: &str, value: u64| {
            output.push_str(&format!("# HELP {}_{} {}\n", prefix, name, help));
            output.push_str(&format!("# TYPE {}_{} gauge\n", prefix, name));
            output.push_str(&format!("{}_{} {}\n\n", prefix, name, value));
        };

        gauge("queued_messages", "Current queued table size", self.queued_size());
        gauge("sent_messages", "Current sent table size", self.sent_size());
        gauge("failed_messages", "Current failed table size", self.failed_size());

        let hist = self.commit_duration_histogram();
        output.push_str(&format!(
            "# HELP {}_commit_duration_seconds Duration of store commits\n",
            prefix
        ));
        output.push_str(&format!(
            "# TYPE {}_commit_duration_seconds histogram\n",
            prefix
        ));
        for (le, count) in &hist.buckets {
            output.push_str(&format!(
                "{}_commit_duration_seconds_bucket{{le=\"{}\"}} {}\n",
                prefix, le, count
            ));
        }
        output.push_str(&format!(
            "{}_commit_duration_seconds_bucket{{le=\"+Inf\"}} {}\n",
            prefix, hist.inf_bucket
        ));
        output.push_str(&format!(
            "{}_commit_duration_seconds_sum {}\n",
            prefix, hist.sum_seconds
        ));
        output.push_str(&format!(
            "{}_commit_duration_seconds_count {}\n",
            prefix, hist.count
        ));

        output
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Commit duration histogram data for export.
#[derive(Debug, Clone)]
pub struct CommitDurationHistogram {
    /// Sum of all observations in seconds
    pub sum_seconds: f64,
    /// Total count of observations
    pub count: u64,
    /// Bucket counts: (le_boundary_seconds, count)
    pub buckets: [(f64, u64); 7],
    /// +Inf bucket count
    pub inf_bucket: u64,
}
