//! BigQueryDataset reconciliation
//!
//! Converges BigQuery datasets onto their `BigQueryDataset` objects:
//! creates, adopts, updates and (optionally) deletes the remote dataset,
//! merging declared access grants with grants made outside the cluster.

pub mod access;
pub mod config;
pub mod controller;
pub mod remote;
pub mod store;

pub use config::DatasetConfig;
pub use controller::{error_policy, reconcile, Context, ContextBuilder, DELETE_RETRY_DELAY};
pub use remote::{
    BigQueryClient, DatasetClient, MetadataTokenProvider, StaticTokenProvider, TokenProvider,
    DEFAULT_BIGQUERY_ENDPOINT,
};
pub use store::{DatasetStore, KubeDatasetStore};
