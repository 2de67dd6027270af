//! OpenTelemetry metrics for dataset reconciliation
//!
//! Instruments are created lazily from the global meter, so they are no-ops
//! until `init_telemetry` installs an exporting meter provider.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("bqkeeper"));

/// Counter of reconciliation passes by outcome
///
/// Labels:
/// - `sync_state`: created, updated, unchanged, deleted, failed
pub static DATASETS_PROCESSED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("bqkeeper_datasets_processed_total")
        .with_description("Total number of BigQueryDataset reconciliation passes")
        .with_unit("{passes}")
        .build()
});

/// Histogram of reconciliation duration
///
/// Labels:
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("bqkeeper_reconcile_duration_seconds")
        .with_description("Duration of BigQueryDataset reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Outcome of a single reconciliation pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// Remote dataset was created
    Created,
    /// Remote dataset was updated (including adoption)
    Updated,
    /// Hash unchanged, nothing pushed
    Unchanged,
    /// Object cleanup finished
    Deleted,
    /// The pass failed or a delete is being retried
    Failed,
}

impl SyncState {
    /// Metric label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
        }
    }
}

/// Record one processed dataset
pub fn record_processed(state: SyncState) {
    DATASETS_PROCESSED.add(1, &[KeyValue::new("sync_state", state.as_str())]);
}

/// Times a reconciliation pass
pub struct ReconcileTimer {
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        self.finish("success");
    }

    /// Record error completion
    pub fn error(self) {
        self.finish("error");
    }

    fn finish(self, result: &'static str) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", result)],
        );
    }
}
