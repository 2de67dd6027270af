//! Common types for bqkeeper: the BigQueryDataset CRD, errors, and telemetry

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod metrics;
pub mod telemetry;

pub use error::Error;

/// Finalizer guarding removal of a BigQueryDataset until remote cleanup ran
pub const DATASET_FINALIZER: &str = "bqkeeper.nais.io/finalizer";

/// Annotation whose value participates in the synchronization hash
pub const CHANGE_CAUSE_ANNOTATION: &str = "kubernetes.io/change-cause";

/// Labels with this prefix are injected by the platform and never hashed
pub const DEFAULT_RESERVED_LABEL_PREFIX: &str = "nais.io/";

/// Remote label carrying the owning team (the object's namespace)
pub const LABEL_TEAM: &str = "team";

/// Object label copied onto the remote dataset when present
pub const LABEL_APP: &str = "app";

/// Field manager name used for all server-side writes
pub const FIELD_MANAGER: &str = "bqkeeper-controller";
