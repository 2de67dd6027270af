//! Remote dataset model and the client seam to BigQuery
//!
//! The reconciler only talks to BigQuery through [`DatasetClient`]. The
//! production implementation is [`BigQueryClient`]; tests substitute mocks.

mod bigquery;
mod token;

use std::collections::BTreeMap;

use async_trait::async_trait;
use bqkeeper_common::Error;

#[cfg(test)]
use mockall::automock;

pub use bigquery::{BigQueryClient, DEFAULT_BIGQUERY_ENDPOINT};
pub use token::{MetadataTokenProvider, StaticTokenProvider, TokenProvider};

/// Kind of identity an access entry refers to
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EntityType {
    /// A user or service account email
    #[default]
    UserEmail,
    /// A Google group email
    GroupEmail,
    /// Everyone in a domain
    Domain,
    /// Special groups such as projectOwners or allAuthenticatedUsers
    SpecialGroup,
    /// An IAM principal string (e.g. `serviceAccount:sa@p.iam.gserviceaccount.com`)
    IamMember,
    /// An authorized view (no principal)
    View,
    /// An authorized routine (no principal)
    Routine,
    /// An authorized dataset (no principal)
    Dataset,
    /// A kind this client does not model; the raw fields live in `extra`
    Other,
}

/// A single grant in a dataset's access list
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AccessEntry {
    /// BigQuery role; empty for resource grants
    pub role: String,
    /// What `entity` identifies
    pub entity_type: EntityType,
    /// Principal identity; empty for resource grants
    pub entity: String,
    /// Opaque reference for view/routine/dataset grants, preserved as-is
    pub resource: Option<serde_json::Value>,
    /// Fields the operator does not manage (IAM `condition`, unknown entry
    /// kinds), carried through unchanged so re-sent grants stay identical
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AccessEntry {
    /// A grant of `role` to a user or service account email
    pub fn user(role: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            entity_type: EntityType::UserEmail,
            entity: email.into(),
            resource: None,
            extra: serde_json::Map::new(),
        }
    }

    /// A grant of `role` to an IAM member string
    pub fn iam_member(role: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            entity_type: EntityType::IamMember,
            entity: member.into(),
            resource: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// Dataset metadata as stored in BigQuery
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemoteDataset {
    /// Dataset id within the project
    pub dataset_id: String,
    /// Display name
    pub friendly_name: String,
    /// Description
    pub description: String,
    /// Geographic location; immutable after creation
    pub location: String,
    /// Access list
    pub access: Vec<AccessEntry>,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Concurrency token returned by reads
    pub etag: Option<String>,
}

/// Mutable fields pushed on update
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DatasetUpdate {
    /// Display name
    pub friendly_name: String,
    /// Description
    pub description: String,
    /// Complete replacement access list
    pub access: Vec<AccessEntry>,
    /// Labels to set; labels not mentioned are left alone
    pub labels: BTreeMap<String, String>,
}

/// Operations against the remote dataset API
///
/// Outcomes the reconciler branches on are reported as dedicated errors:
/// `create` returns [`Error::AlreadyExists`], `update` returns
/// [`Error::StaleEtag`], `delete` returns [`Error::NotFound`]. A missing
/// dataset on `get` is `Ok(None)`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatasetClient: Send + Sync {
    /// Fetch a dataset together with its etag
    async fn get(&self, project: &str, dataset_id: &str) -> Result<Option<RemoteDataset>, Error>;

    /// Create a dataset
    async fn create(&self, project: &str, dataset: &RemoteDataset) -> Result<(), Error>;

    /// Update a dataset, guarded by the etag from a preceding `get`
    async fn update(
        &self,
        project: &str,
        dataset_id: &str,
        update: &DatasetUpdate,
        etag: Option<String>,
    ) -> Result<(), Error>;

    /// Delete a dataset
    async fn delete(&self, project: &str, dataset_id: &str) -> Result<(), Error>;
}
