//! BigQueryDataset controller
//!
//! One pass of [`reconcile`] moves a single object through its lifecycle:
//!
//! - no finalizer: add it first, so a crash after creating the remote
//!   dataset can never lose track of it
//! - not yet created: create the remote dataset; if it already exists,
//!   adopt it through the update path
//! - created and hash unchanged: nothing to do
//! - created and hash changed: fetch, merge access, update guarded by etag
//! - being deleted: optionally delete the remote dataset, then release the
//!   finalizer
//!
//! Every successful create or update records the synchronization hash in
//! status; the next pass compares against it to skip redundant remote calls.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use bqkeeper_common::crd::{
    set_condition, BigQueryDataset, BigQueryDatasetStatus, Condition, ConditionStatus,
    CONDITION_READY, REASON_DELETE_ERROR, REASON_UP_TO_DATE,
};
use bqkeeper_common::metrics::{record_processed, ReconcileTimer, SyncState};
use bqkeeper_common::Error;

use crate::access::{desired_access, merge_access};
use crate::config::DatasetConfig;
use crate::remote::{DatasetClient, DatasetUpdate, RemoteDataset};
use crate::store::{DatasetStore, KubeDatasetStore};

/// Revisit delay after a failed cascading delete
pub const DELETE_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Requeue after a concurrent remote modification
const REQUEUE_STALE_ETAG: Duration = Duration::from_secs(1);
/// Requeue after a transient failure
const REQUEUE_RETRYABLE: Duration = Duration::from_secs(5);
/// Requeue after an error that needs a spec or permission change
const REQUEUE_PERMANENT: Duration = Duration::from_secs(60);

const MESSAGE_UP_TO_DATE: &str = "The resource is up to date";

/// Controller context shared by every reconciliation
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client, bigquery)
///     .config(config)
///     .build();
/// ```
pub struct Context {
    /// Object store writes (trait object for testability)
    pub store: Arc<dyn DatasetStore>,
    /// Remote dataset API
    pub bigquery: Arc<dyn DatasetClient>,
    /// Operator configuration
    pub config: DatasetConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, bigquery: Arc<dyn DatasetClient>) -> ContextBuilder {
        ContextBuilder::new(client, bigquery)
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn DatasetStore>,
        bigquery: Arc<dyn DatasetClient>,
        config: DatasetConfig,
    ) -> Self {
        Self {
            store,
            bigquery,
            config,
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    bigquery: Arc<dyn DatasetClient>,
    config: DatasetConfig,
}

impl ContextBuilder {
    fn new(client: Client, bigquery: Arc<dyn DatasetClient>) -> Self {
        Self {
            client,
            bigquery,
            config: DatasetConfig::default(),
        }
    }

    /// Set the operator configuration
    pub fn config(mut self, config: DatasetConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            store: Arc::new(KubeDatasetStore::new(self.client)),
            bigquery: self.bigquery,
            config: self.config,
        }
    }
}

/// What a pass did and when to come back
struct Outcome {
    action: Action,
    state: SyncState,
}

impl Outcome {
    fn done(state: SyncState) -> Self {
        Self {
            action: Action::await_change(),
            state,
        }
    }
}

/// Reconcile a BigQueryDataset
///
/// Returns `Action::await_change()` once the object has converged; the
/// controller is woken again by the status or finalizer write, or by the
/// next user edit. Failures are returned as errors and requeued by
/// [`error_policy`].
#[instrument(
    skip(dataset, ctx),
    fields(
        dataset = %dataset.name_any(),
        namespace = %dataset.namespace().unwrap_or_default(),
        project = %dataset.spec.project,
    )
)]
pub async fn reconcile(dataset: Arc<BigQueryDataset>, ctx: Arc<Context>) -> Result<Action, Error> {
    let timer = ReconcileTimer::start();

    match reconcile_dataset(&dataset, &ctx).await {
        Ok(outcome) => {
            record_processed(outcome.state);
            timer.success();
            Ok(outcome.action)
        }
        Err(e) => {
            record_processed(SyncState::Failed);
            timer.error();
            Err(e)
        }
    }
}

async fn reconcile_dataset(dataset: &BigQueryDataset, ctx: &Context) -> Result<Outcome, Error> {
    let hash = dataset.synchronization_hash(&ctx.config.reserved_label_prefix)?;

    if dataset.is_being_deleted() {
        if !dataset.has_finalizer() {
            debug!("being deleted without our finalizer, nothing to clean up");
            return Ok(Outcome::done(SyncState::Unchanged));
        }
        return handle_deletion(dataset, ctx).await;
    }

    ensure_finalizer(dataset, ctx).await?;
    dataset.spec.validate(&dataset.name_any())?;

    if !dataset.is_created() {
        return on_create(dataset, ctx, hash).await;
    }

    if dataset.recorded_hash() == Some(hash.as_str()) {
        debug!(hash = %hash, "synchronization hash unchanged");
        return Ok(Outcome::done(SyncState::Unchanged));
    }

    on_update(dataset, ctx, hash).await
}

/// Persist the finalizer before anything is created remotely
async fn ensure_finalizer(dataset: &BigQueryDataset, ctx: &Context) -> Result<(), Error> {
    if dataset.has_finalizer() {
        return Ok(());
    }
    ctx.store.add_finalizer(dataset).await?;
    info!("added finalizer");
    Ok(())
}

async fn handle_deletion(dataset: &BigQueryDataset, ctx: &Context) -> Result<Outcome, Error> {
    let spec = &dataset.spec;

    if spec.cascading_delete {
        if let Err(e) = spec.validate(&dataset.name_any()) {
            // Creation validates first, so an invalid spec never produced a remote dataset
            warn!(error = %e, "invalid spec, skipping remote delete");
        } else {
            match ctx.bigquery.delete(&spec.project, &spec.name).await {
                Ok(()) => info!("deleted remote dataset"),
                Err(e) if e.is_not_found() => info!("remote dataset already gone"),
                Err(e) => {
                    warn!(error = %e, "failed to delete remote dataset, keeping finalizer");
                    let status = delete_error_status(dataset, &e);
                    ctx.store.patch_status(dataset, &status).await?;
                    return Ok(Outcome {
                        action: Action::requeue(DELETE_RETRY_DELAY),
                        state: SyncState::Failed,
                    });
                }
            }
        }
    } else {
        debug!("cascading delete disabled, leaving remote dataset in place");
    }

    ctx.store.remove_finalizer(dataset).await?;
    info!("released finalizer");
    Ok(Outcome::done(SyncState::Deleted))
}

async fn on_create(dataset: &BigQueryDataset, ctx: &Context, hash: String) -> Result<Outcome, Error> {
    let spec = &dataset.spec;
    let remote = RemoteDataset {
        dataset_id: spec.name.clone(),
        friendly_name: spec.name.clone(),
        description: spec.description.clone(),
        location: spec.location.clone(),
        access: desired_access(dataset, ctx.config.operator_principal.as_deref()),
        labels: dataset.remote_labels(),
        etag: None,
    };

    match ctx.bigquery.create(&spec.project, &remote).await {
        Ok(()) => {
            let now = Utc::now().timestamp();
            let status = synced_status(dataset, hash, Some(now), now);
            ctx.store.patch_status(dataset, &status).await?;
            info!("created remote dataset");
            Ok(Outcome::done(SyncState::Created))
        }
        Err(e) if e.is_already_exists() => {
            info!("remote dataset already exists, adopting it");
            on_update(dataset, ctx, hash).await
        }
        Err(e) => Err(e),
    }
}

async fn on_update(dataset: &BigQueryDataset, ctx: &Context, hash: String) -> Result<Outcome, Error> {
    let spec = &dataset.spec;
    let existing = ctx
        .bigquery
        .get(&spec.project, &spec.name)
        .await?
        .ok_or_else(|| Error::not_found(&spec.project, &spec.name))?;

    if !spec.location.is_empty()
        && !existing.location.is_empty()
        && !spec.location.eq_ignore_ascii_case(&existing.location)
    {
        warn!(
            desired = %spec.location,
            actual = %existing.location,
            "dataset location cannot be changed after creation"
        );
    }

    let desired = desired_access(dataset, ctx.config.operator_principal.as_deref());
    let update = DatasetUpdate {
        friendly_name: spec.name.clone(),
        description: spec.description.clone(),
        access: merge_access(desired, existing.access),
        labels: dataset.remote_labels(),
    };

    ctx.bigquery
        .update(&spec.project, &spec.name, &update, existing.etag)
        .await?;

    let now = Utc::now().timestamp();
    let created_at = if dataset.is_created() { None } else { Some(now) };
    let status = synced_status(dataset, hash, created_at, now);
    ctx.store.patch_status(dataset, &status).await?;
    info!(grants = update.access.len(), "updated remote dataset");
    Ok(Outcome::done(SyncState::Updated))
}

/// Status after a successful push: Ready, hash recorded, timestamps stamped.
/// `created_at` is only set on create or adoption; otherwise the recorded
/// creation time is kept.
fn synced_status(
    dataset: &BigQueryDataset,
    hash: String,
    created_at: Option<i64>,
    now: i64,
) -> BigQueryDatasetStatus {
    let mut status = dataset.status.clone().unwrap_or_default();
    if let Some(created_at) = created_at {
        status.creation_time = Some(created_at);
    }
    status.last_modified_time = Some(now);
    status.synchronization_hash = Some(hash);
    set_condition(
        &mut status.conditions,
        Condition::new(
            CONDITION_READY,
            ConditionStatus::True,
            REASON_UP_TO_DATE,
            MESSAGE_UP_TO_DATE,
        ),
    );
    status
}

fn delete_error_status(dataset: &BigQueryDataset, err: &Error) -> BigQueryDatasetStatus {
    let mut status = dataset.status.clone().unwrap_or_default();
    set_condition(
        &mut status.conditions,
        Condition::new(
            CONDITION_READY,
            ConditionStatus::False,
            REASON_DELETE_ERROR,
            format!("Unable to delete from Google: {}", err),
        ),
    );
    status
}

/// Error policy for the controller
///
/// Concurrent remote modifications are retried almost immediately with a
/// fresh fetch; transient failures shortly after; everything else slowly.
pub fn error_policy(dataset: Arc<BigQueryDataset>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        dataset = %dataset.name_any(),
        namespace = %dataset.namespace().unwrap_or_default(),
        "reconciliation failed"
    );
    Action::requeue(retry_delay(error))
}

fn retry_delay(error: &Error) -> Duration {
    match error {
        Error::StaleEtag { .. } => REQUEUE_STALE_ETAG,
        e if e.is_retryable() => REQUEUE_RETRYABLE,
        _ => REQUEUE_PERMANENT,
    }
}
