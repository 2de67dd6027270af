//! Writes back to the Kubernetes API: finalizers and status
//!
//! All writes are JSON merge patches. Finalizer patches carry the object's
//! `resourceVersion`, so the API server rejects them with 409 Conflict when
//! the object changed since it was read. The controller then requeues and
//! works from a fresh copy.

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::debug;

use bqkeeper_common::crd::{BigQueryDataset, BigQueryDatasetStatus};
use bqkeeper_common::{Error, DATASET_FINALIZER, FIELD_MANAGER};

#[cfg(test)]
use mockall::automock;

/// Persistence operations the reconciler needs from the object store
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatasetStore: Send + Sync {
    /// Add the controller finalizer to the object
    async fn add_finalizer(&self, dataset: &BigQueryDataset) -> Result<(), Error>;

    /// Remove the controller finalizer; an object that no longer exists counts as done
    async fn remove_finalizer(&self, dataset: &BigQueryDataset) -> Result<(), Error>;

    /// Replace the status subresource
    async fn patch_status(
        &self,
        dataset: &BigQueryDataset,
        status: &BigQueryDatasetStatus,
    ) -> Result<(), Error>;
}

/// [`DatasetStore`] backed by the Kubernetes API
pub struct KubeDatasetStore {
    client: Client,
}

impl KubeDatasetStore {
    /// Create a store wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, dataset: &BigQueryDataset) -> Api<BigQueryDataset> {
        match dataset.namespace() {
            Some(ns) => Api::namespaced(self.client.clone(), &ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

/// Build a merge patch that sets the finalizer list, guarded by resourceVersion
fn finalizer_patch(dataset: &BigQueryDataset, finalizers: Vec<String>) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": dataset.resource_version(),
        }
    })
}

fn with_finalizer(dataset: &BigQueryDataset) -> Vec<String> {
    let mut finalizers = dataset.finalizers().to_vec();
    if !finalizers.iter().any(|f| f == DATASET_FINALIZER) {
        finalizers.push(DATASET_FINALIZER.to_string());
    }
    finalizers
}

fn without_finalizer(dataset: &BigQueryDataset) -> Vec<String> {
    dataset
        .finalizers()
        .iter()
        .filter(|f| *f != DATASET_FINALIZER)
        .cloned()
        .collect()
}

/// Treat a 404 as success; the object is gone, so there is nothing left to release
fn tolerate_missing<T>(name: &str, result: Result<T, kube::Error>) -> Result<(), Error> {
    match result {
        Ok(_) => {
            debug!(dataset = %name, "removed finalizer");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            debug!(dataset = %name, "object already gone while removing finalizer");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl DatasetStore for KubeDatasetStore {
    async fn add_finalizer(&self, dataset: &BigQueryDataset) -> Result<(), Error> {
        let name = dataset.name_any();
        let patch = finalizer_patch(dataset, with_finalizer(dataset));

        self.api(dataset)
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        debug!(dataset = %name, "added finalizer");
        Ok(())
    }

    async fn remove_finalizer(&self, dataset: &BigQueryDataset) -> Result<(), Error> {
        let name = dataset.name_any();
        let patch = finalizer_patch(dataset, without_finalizer(dataset));

        let result = self
            .api(dataset)
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await;
        tolerate_missing(&name, result)
    }

    async fn patch_status(
        &self,
        dataset: &BigQueryDataset,
        status: &BigQueryDatasetStatus,
    ) -> Result<(), Error> {
        let name = dataset.name_any();
        let patch = serde_json::json!({ "status": status });

        self.api(dataset)
            .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }
}
