//! Custom Resource Definitions managed by bqkeeper

mod dataset;
mod types;

pub use dataset::{
    BigQueryDataset, BigQueryDatasetSpec, BigQueryDatasetStatus, DatasetAccess,
    CONDITION_READY, REASON_DELETE_ERROR, REASON_UP_TO_DATE,
};
pub use types::{find_condition, set_condition, Condition, ConditionStatus};
