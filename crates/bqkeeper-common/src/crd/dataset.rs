//! BigQueryDataset CRD: a declaratively managed BigQuery dataset
//!
//! The spec is the desired state pushed to BigQuery. The status is owned by
//! the controller and records what was last synchronized: the hash of the
//! spec that was pushed, when the dataset was created, and when it was last
//! modified.

use std::collections::BTreeMap;

use aws_lc_rs::digest;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{find_condition, Condition, ConditionStatus};
use crate::{Error, CHANGE_CAUSE_ANNOTATION, DATASET_FINALIZER, LABEL_APP, LABEL_TEAM};

/// Condition type reporting whether the remote dataset matches the spec
pub const CONDITION_READY: &str = "Ready";

/// Ready=True reason after a successful create or update
pub const REASON_UP_TO_DATE: &str = "UpToDate";

/// Ready=False reason after a failed cascading delete
pub const REASON_DELETE_ERROR: &str = "DeleteError";

/// BigQueryDataset declares a dataset in a Google Cloud project.
///
/// Example:
/// ```yaml
/// apiVersion: google.nais.io/v1
/// kind: BigQueryDataset
/// metadata:
///   name: events
///   namespace: team-a
/// spec:
///   name: team_a_events
///   project: team-a-prod
///   location: europe-north1
///   description: Raw event stream
///   cascadingDelete: false
///   access:
///     - role: WRITER
///       userByEmail: app@team-a-prod.iam.gserviceaccount.com
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "google.nais.io",
    version = "v1",
    kind = "BigQueryDataset",
    namespaced,
    status = "BigQueryDatasetStatus",
    shortname = "bqds",
    printcolumn = r#"{"name":"Dataset","type":"string","jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Project","type":"string","jsonPath":".spec.project"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BigQueryDatasetSpec {
    /// BigQuery dataset id, also used as the friendly name
    #[serde(default)]
    pub name: String,

    /// Free-form description shown in the BigQuery console
    #[serde(default)]
    pub description: String,

    /// Geographic location (e.g., "europe-north1", "EU")
    #[serde(default)]
    pub location: String,

    /// Principals granted access to the dataset
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access: Vec<DatasetAccess>,

    /// Google Cloud project owning the dataset
    #[serde(default)]
    pub project: String,

    /// Delete the BigQuery dataset when this object is deleted
    #[serde(default)]
    pub cascading_delete: bool,
}

/// A single access grant on the dataset
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DatasetAccess {
    /// BigQuery role (READER, WRITER, OWNER)
    #[serde(default)]
    pub role: String,

    /// Email address of the user or service account to grant access to
    #[serde(default)]
    pub user_by_email: String,
}

impl DatasetAccess {
    /// Create a grant of `role` to `email`
    pub fn new(role: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            user_by_email: email.into(),
        }
    }
}

/// Observed state recorded by the controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BigQueryDatasetStatus {
    /// Lifecycle conditions; `Ready` is the one the controller maintains
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Hash of the spec last pushed successfully to BigQuery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronization_hash: Option<String>,

    /// Unix seconds when the dataset was created (or adopted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<i64>,

    /// Unix seconds of the last successful create or update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_time: Option<i64>,
}

impl BigQueryDatasetStatus {
    /// Returns true once a creation has been recorded
    pub fn is_created(&self) -> bool {
        self.creation_time.is_some_and(|t| t > 0)
    }

    /// Returns the Ready condition, if any
    pub fn ready_condition(&self) -> Option<&Condition> {
        find_condition(&self.conditions, CONDITION_READY)
    }

    /// Returns true if the Ready condition is True
    pub fn is_ready(&self) -> bool {
        self.ready_condition()
            .is_some_and(|c| c.status == ConditionStatus::True)
    }
}

impl BigQueryDatasetSpec {
    /// Validate that the spec identifies a remote dataset
    ///
    /// Dataset ids may only contain letters, digits and underscores.
    pub fn validate(&self, object_name: &str) -> Result<(), Error> {
        if self.project.trim().is_empty() {
            return Err(Error::validation_for_field(
                object_name,
                "spec.project",
                "project must not be empty",
            ));
        }
        if self.name.is_empty() {
            return Err(Error::validation_for_field(
                object_name,
                "spec.name",
                "dataset name must not be empty",
            ));
        }
        if self.name.len() > 1024 {
            return Err(Error::validation_for_field(
                object_name,
                "spec.name",
                "dataset name must be at most 1024 characters",
            ));
        }
        if let Some(c) = self
            .name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
        {
            return Err(Error::validation_for_field(
                object_name,
                "spec.name",
                format!("dataset name contains invalid character '{}'", c),
            ));
        }
        Ok(())
    }
}

/// The fields that take part in the synchronization hash.
///
/// Field order is part of the hash; do not reorder.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HashInput<'a> {
    spec: &'a BigQueryDatasetSpec,
    labels: Option<BTreeMap<&'a str, &'a str>>,
    change_cause: &'a str,
}

impl BigQueryDataset {
    /// Fingerprint of everything that must be pushed to BigQuery.
    ///
    /// Covers the spec, the labels that do not start with
    /// `reserved_label_prefix`, and the change-cause annotation. Status,
    /// resource version and timestamps never contribute. An empty prefix
    /// excludes nothing.
    pub fn synchronization_hash(&self, reserved_label_prefix: &str) -> Result<String, Error> {
        let labels: BTreeMap<&str, &str> = self
            .labels()
            .iter()
            .filter(|(k, _)| reserved_label_prefix.is_empty() || !k.starts_with(reserved_label_prefix))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let input = HashInput {
            spec: &self.spec,
            labels: if labels.is_empty() { None } else { Some(labels) },
            change_cause: self
                .annotations()
                .get(CHANGE_CAUSE_ANNOTATION)
                .map(String::as_str)
                .unwrap_or_default(),
        };

        let encoded = serde_json::to_vec(&input)
            .map_err(|e| Error::serialization_for_kind("BigQueryDataset", e.to_string()))?;

        let hash = digest::digest(&digest::SHA256, &encoded);
        Ok(hash.as_ref()[..8]
            .iter()
            .fold(String::with_capacity(16), |mut s, b| {
                use std::fmt::Write;
                let _ = write!(s, "{:02x}", b);
                s
            }))
    }

    /// Check if the controller finalizer is present
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == DATASET_FINALIZER)
    }

    /// Check if deletion has been requested
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Labels written onto the remote dataset
    ///
    /// `team` is always the namespace; `app` is copied when the object has one.
    pub fn remote_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_TEAM.to_string(), self.namespace().unwrap_or_default());
        if let Some(app) = self.labels().get(LABEL_APP) {
            labels.insert(LABEL_APP.to_string(), app.clone());
        }
        labels
    }

    /// Last synchronization hash recorded in status
    pub fn recorded_hash(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.synchronization_hash.as_deref())
    }

    /// Returns true once a creation has been recorded in status
    pub fn is_created(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.is_created())
    }
}
