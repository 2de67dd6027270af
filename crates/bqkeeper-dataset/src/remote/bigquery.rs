//! BigQuery v2 REST implementation of [`DatasetClient`]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use bqkeeper_common::Error;

use super::{AccessEntry, DatasetClient, DatasetUpdate, EntityType, RemoteDataset, TokenProvider};

/// Public BigQuery API root
pub const DEFAULT_BIGQUERY_ENDPOINT: &str = "https://bigquery.googleapis.com/bigquery/v2";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// BigQuery REST client
pub struct BigQueryClient {
    http: reqwest::Client,
    endpoint: String,
    tokens: Arc<dyn TokenProvider>,
}

impl BigQueryClient {
    /// Create a client against `endpoint` authenticating with `tokens`
    pub fn new(endpoint: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                Error::internal_with_context(format!("failed to build HTTP client: {}", e), "bigquery")
            })?;
        Ok(Self::with_http_client(http, endpoint, tokens))
    }

    /// Create a client with a preconfigured HTTP client
    pub fn with_http_client(
        http: reqwest::Client,
        endpoint: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    fn datasets_url(&self, project: &str) -> String {
        format!("{}/projects/{}/datasets", self.endpoint, project)
    }

    fn dataset_url(&self, project: &str, dataset_id: &str) -> String {
        format!("{}/{}", self.datasets_url(project), dataset_id)
    }

    async fn request(
        &self,
        method: Method,
        url: String,
        project: &str,
        dataset_id: &str,
    ) -> Result<reqwest::RequestBuilder, Error> {
        let token = self.tokens.token().await?;
        debug!(%method, %url, project, dataset = dataset_id, "bigquery request");
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    async fn send(
        builder: reqwest::RequestBuilder,
        project: &str,
        dataset_id: &str,
    ) -> Result<reqwest::Response, Error> {
        let response = builder
            .send()
            .await
            .map_err(|e| Error::remote(project, dataset_id, format!("request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, &body, project, dataset_id))
    }
}

#[async_trait]
impl DatasetClient for BigQueryClient {
    async fn get(&self, project: &str, dataset_id: &str) -> Result<Option<RemoteDataset>, Error> {
        let builder = self
            .request(Method::GET, self.dataset_url(project, dataset_id), project, dataset_id)
            .await?;

        let response = match Self::send(builder, project, dataset_id).await {
            Ok(r) => r,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        let wire: WireDataset = response.json().await.map_err(|e| {
            Error::serialization_for_kind("Dataset", format!("invalid dataset response: {}", e))
        })?;
        Ok(Some(wire.into()))
    }

    async fn create(&self, project: &str, dataset: &RemoteDataset) -> Result<(), Error> {
        let body = WireDataset::for_create(project, dataset);
        let builder = self
            .request(Method::POST, self.datasets_url(project), project, &dataset.dataset_id)
            .await?
            .json(&body);

        Self::send(builder, project, &dataset.dataset_id).await?;
        info!(project, dataset = %dataset.dataset_id, "created BigQuery dataset");
        Ok(())
    }

    async fn update(
        &self,
        project: &str,
        dataset_id: &str,
        update: &DatasetUpdate,
        etag: Option<String>,
    ) -> Result<(), Error> {
        let body = WirePatch::from(update);
        let mut builder = self
            .request(Method::PATCH, self.dataset_url(project, dataset_id), project, dataset_id)
            .await?
            .json(&body);
        if let Some(etag) = etag.filter(|e| !e.is_empty()) {
            builder = builder.header(reqwest::header::IF_MATCH, etag);
        }

        Self::send(builder, project, dataset_id).await?;
        info!(project, dataset = dataset_id, "updated BigQuery dataset");
        Ok(())
    }

    async fn delete(&self, project: &str, dataset_id: &str) -> Result<(), Error> {
        let builder = self
            .request(Method::DELETE, self.dataset_url(project, dataset_id), project, dataset_id)
            .await?
            .query(&[("deleteContents", "false")]);

        Self::send(builder, project, dataset_id).await?;
        info!(project, dataset = dataset_id, "deleted BigQuery dataset");
        Ok(())
    }
}

/// Map a non-success HTTP response onto the error taxonomy
fn classify_failure(status: StatusCode, body: &str, project: &str, dataset_id: &str) -> Error {
    let message = serde_json::from_str::<WireErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| format!("HTTP {}", status));

    match status {
        StatusCode::NOT_FOUND => Error::not_found(project, dataset_id),
        StatusCode::CONFLICT => Error::already_exists(project, dataset_id),
        StatusCode::PRECONDITION_FAILED => Error::stale_etag(project, dataset_id),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            Error::remote(project, dataset_id, message)
        }
        s if s.is_server_error() => Error::remote(project, dataset_id, message),
        _ => Error::remote_permanent(project, dataset_id, message),
    }
}

#[derive(Debug, Deserialize)]
struct WireErrorBody {
    error: WireErrorDetail,
}

#[derive(Debug, Deserialize)]
struct WireErrorDetail {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireReference {
    project_id: String,
    dataset_id: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireDataset {
    #[serde(default)]
    dataset_reference: WireReference,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    friendly_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    location: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    access: Vec<WireAccess>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
}

impl WireDataset {
    fn for_create(project: &str, dataset: &RemoteDataset) -> Self {
        Self {
            dataset_reference: WireReference {
                project_id: project.to_string(),
                dataset_id: dataset.dataset_id.clone(),
            },
            friendly_name: dataset.friendly_name.clone(),
            description: dataset.description.clone(),
            location: dataset.location.clone(),
            access: dataset.access.iter().map(WireAccess::from).collect(),
            labels: dataset.labels.clone(),
            etag: None,
        }
    }
}

impl From<WireDataset> for RemoteDataset {
    fn from(wire: WireDataset) -> Self {
        Self {
            dataset_id: wire.dataset_reference.dataset_id,
            friendly_name: wire.friendly_name,
            description: wire.description,
            location: wire.location,
            access: wire.access.into_iter().map(AccessEntry::from).collect(),
            labels: wire.labels,
            etag: wire.etag,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WirePatch {
    friendly_name: String,
    description: String,
    access: Vec<WireAccess>,
    labels: BTreeMap<String, String>,
}

impl From<&DatasetUpdate> for WirePatch {
    fn from(update: &DatasetUpdate) -> Self {
        Self {
            friendly_name: update.friendly_name.clone(),
            description: update.description.clone(),
            access: update.access.iter().map(WireAccess::from).collect(),
            labels: update.labels.clone(),
        }
    }
}

/// One access entry as BigQuery encodes it: at most one identity field set.
///
/// Anything else on the entry (IAM `condition`, kinds added to the API later)
/// is kept in `extra` and written back verbatim.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireAccess {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_by_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group_by_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    special_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iam_member: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    view: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    routine: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dataset: Option<serde_json::Value>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl From<WireAccess> for AccessEntry {
    fn from(wire: WireAccess) -> Self {
        let role = wire.role.unwrap_or_default();
        let (entity_type, entity, resource) = if let Some(email) = wire.user_by_email {
            (EntityType::UserEmail, email, None)
        } else if let Some(email) = wire.group_by_email {
            (EntityType::GroupEmail, email, None)
        } else if let Some(domain) = wire.domain {
            (EntityType::Domain, domain, None)
        } else if let Some(group) = wire.special_group {
            (EntityType::SpecialGroup, group, None)
        } else if let Some(member) = wire.iam_member {
            (EntityType::IamMember, member, None)
        } else if let Some(view) = wire.view {
            (EntityType::View, String::new(), Some(view))
        } else if let Some(routine) = wire.routine {
            (EntityType::Routine, String::new(), Some(routine))
        } else if let Some(dataset) = wire.dataset {
            (EntityType::Dataset, String::new(), Some(dataset))
        } else {
            (EntityType::Other, String::new(), None)
        };

        Self {
            role,
            entity_type,
            entity,
            resource,
            extra: wire.extra,
        }
    }
}

impl From<&AccessEntry> for WireAccess {
    fn from(entry: &AccessEntry) -> Self {
        let mut wire = WireAccess {
            role: Some(entry.role.clone()).filter(|r| !r.is_empty()),
            extra: entry.extra.clone(),
            ..Default::default()
        };
        let entity = Some(entry.entity.clone());
        match entry.entity_type {
            EntityType::UserEmail => wire.user_by_email = entity,
            EntityType::GroupEmail => wire.group_by_email = entity,
            EntityType::Domain => wire.domain = entity,
            EntityType::SpecialGroup => wire.special_group = entity,
            EntityType::IamMember => wire.iam_member = entity,
            EntityType::View => wire.view = entry.resource.clone(),
            EntityType::Routine => wire.routine = entry.resource.clone(),
            EntityType::Dataset => wire.dataset = entry.resource.clone(),
            EntityType::Other => {}
        }
        wire
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::StaticTokenProvider;

    fn client() -> BigQueryClient {
        BigQueryClient::new(
            "http://localhost:9050/bigquery/v2/",
            Arc::new(StaticTokenProvider::new("token")),
        )
        .unwrap()
    }

    #[test]
    fn urls_are_built_from_endpoint() {
        let c = client();
        assert_eq!(
            c.dataset_url("proj", "events"),
            "http://localhost:9050/bigquery/v2/projects/proj/datasets/events"
        );
        assert_eq!(
            c.datasets_url("proj"),
            "http://localhost:9050/bigquery/v2/projects/proj/datasets"
        );
    }

    mod classification {
        use super::*;

        #[test]
        fn status_codes_map_to_outcomes() {
            assert!(classify_failure(StatusCode::NOT_FOUND, "", "p", "d").is_not_found());
            assert!(classify_failure(StatusCode::CONFLICT, "", "p", "d").is_already_exists());
            assert!(matches!(
                classify_failure(StatusCode::PRECONDITION_FAILED, "", "p", "d"),
                Error::StaleEtag { .. }
            ));
        }

        #[test]
        fn throttling_and_server_errors_are_retryable() {
            assert!(classify_failure(StatusCode::TOO_MANY_REQUESTS, "", "p", "d").is_retryable());
            assert!(classify_failure(StatusCode::SERVICE_UNAVAILABLE, "", "p", "d").is_retryable());
        }

        #[test]
        fn client_errors_are_permanent_and_keep_message() {
            let body = r#"{"error":{"code":403,"message":"Access Denied: Project p","status":"PERMISSION_DENIED"}}"#;
            let err = classify_failure(StatusCode::FORBIDDEN, body, "p", "d");
            assert!(!err.is_retryable());
            assert!(err.to_string().contains("Access Denied"));
        }

        #[test]
        fn unparseable_body_falls_back_to_status() {
            let err = classify_failure(StatusCode::BAD_REQUEST, "<html>", "p", "d");
            assert!(err.to_string().contains("400"));
        }
    }

    mod wire_format {
        use super::*;

        #[test]
        fn dataset_response_decodes_all_entry_kinds() {
            let json = r#"{
                "datasetReference": {"projectId": "proj", "datasetId": "events"},
                "friendlyName": "events",
                "location": "europe-north1",
                "etag": "abc==",
                "labels": {"team": "team-a"},
                "access": [
                    {"role": "WRITER", "userByEmail": "a@x.com"},
                    {"role": "READER", "groupByEmail": "g@x.com"},
                    {"role": "READER", "iamMember": "deleted:serviceAccount:old@x.com?uid=1"},
                    {"role": "OWNER", "specialGroup": "projectOwners"},
                    {"view": {"projectId": "proj", "datasetId": "other", "tableId": "v"}}
                ]
            }"#;
            let wire: WireDataset = serde_json::from_str(json).unwrap();
            let remote = RemoteDataset::from(wire);

            assert_eq!(remote.dataset_id, "events");
            assert_eq!(remote.etag.as_deref(), Some("abc=="));
            assert_eq!(remote.access.len(), 5);
            assert_eq!(remote.access[0], AccessEntry::user("WRITER", "a@x.com"));
            assert_eq!(remote.access[1].entity_type, EntityType::GroupEmail);
            assert_eq!(remote.access[2].entity_type, EntityType::IamMember);
            assert_eq!(remote.access[3].entity_type, EntityType::SpecialGroup);
            assert_eq!(remote.access[4].entity_type, EntityType::View);
            assert!(remote.access[4].entity.is_empty());
            assert!(remote.access[4].resource.is_some());
        }

        #[test]
        fn view_entries_keep_their_reference_on_encode() {
            let view = serde_json::json!({"projectId": "p", "datasetId": "d", "tableId": "t"});
            let entry = AccessEntry {
                role: String::new(),
                entity_type: EntityType::View,
                entity: String::new(),
                resource: Some(view.clone()),
                ..Default::default()
            };
            let encoded = serde_json::to_value(WireAccess::from(&entry)).unwrap();
            assert_eq!(encoded, serde_json::json!({ "view": view }));
        }

        fn reencode(json: &str) -> String {
            let wire: WireAccess = serde_json::from_str(json).unwrap();
            let entry = AccessEntry::from(wire);
            serde_json::to_string(&WireAccess::from(&entry)).unwrap()
        }

        #[test]
        fn conditional_grant_keeps_its_condition() {
            let json = r#"{"role":"READER","userByEmail":"c@x.com","condition":{"expression":"request.time < timestamp(\"2030-01-01T00:00:00Z\")","title":"expires"}}"#;
            assert_eq!(reencode(json), json);
        }

        #[test]
        fn unknown_entry_kind_is_kept_verbatim() {
            let json = r#"{"role":"READER","futureKind":{"x":1}}"#;
            let entry = AccessEntry::from(serde_json::from_str::<WireAccess>(json).unwrap());
            assert_eq!(entry.entity_type, EntityType::Other);
            assert!(entry.entity.is_empty());
            assert_eq!(reencode(json), json);
        }

        #[test]
        fn preserved_condition_survives_merge_into_patch() {
            let json = r#"{"role":"READER","userByEmail":"c@x.com","condition":{"expression":"true"}}"#;
            let remote = AccessEntry::from(serde_json::from_str::<WireAccess>(json).unwrap());
            let merged = crate::access::merge_access(
                vec![AccessEntry::user("WRITER", "a@x.com")],
                vec![remote],
            );
            let update = DatasetUpdate {
                access: merged,
                ..Default::default()
            };
            let body = serde_json::to_value(WirePatch::from(&update)).unwrap();
            assert_eq!(body["access"][1]["condition"]["expression"], "true");
            assert_eq!(body["access"][1]["userByEmail"], "c@x.com");
        }

        #[test]
        fn create_body_carries_reference_and_labels() {
            let dataset = RemoteDataset {
                dataset_id: "events".to_string(),
                friendly_name: "events".to_string(),
                location: "EU".to_string(),
                access: vec![AccessEntry::user("OWNER", "op@x.com")],
                labels: BTreeMap::from([("team".to_string(), "team-a".to_string())]),
                ..Default::default()
            };
            let body = serde_json::to_value(WireDataset::for_create("proj", &dataset)).unwrap();
            assert_eq!(body["datasetReference"]["projectId"], "proj");
            assert_eq!(body["datasetReference"]["datasetId"], "events");
            assert_eq!(body["location"], "EU");
            assert_eq!(body["labels"]["team"], "team-a");
            assert_eq!(body["access"][0]["userByEmail"], "op@x.com");
            assert!(body.get("description").is_none());
            assert!(body.get("etag").is_none());
        }

        #[test]
        fn patch_body_always_sends_access() {
            let update = DatasetUpdate {
                friendly_name: "events".to_string(),
                ..Default::default()
            };
            let body = serde_json::to_value(WirePatch::from(&update)).unwrap();
            assert_eq!(body["access"], serde_json::json!([]));
            assert_eq!(body["friendlyName"], "events");
        }
    }
}
