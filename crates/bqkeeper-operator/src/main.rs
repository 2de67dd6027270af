//! bqkeeper - keeps BigQuery datasets in line with BigQueryDataset objects

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use bqkeeper_common::crd::BigQueryDataset;
use bqkeeper_common::telemetry::{init_telemetry, TelemetryConfig};
use bqkeeper_common::{DEFAULT_RESERVED_LABEL_PREFIX, FIELD_MANAGER};
use bqkeeper_dataset::{
    error_policy, reconcile, BigQueryClient, Context, DatasetClient, DatasetConfig,
    MetadataTokenProvider, StaticTokenProvider, TokenProvider, DEFAULT_BIGQUERY_ENDPOINT,
};

/// Server-side watch timeout; kept below the client read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// bqkeeper - reconciles BigQueryDataset objects against Google BigQuery
#[derive(Parser, Debug)]
#[command(name = "bqkeeper", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Install or update the CRD with server-side apply on startup
    #[arg(long)]
    install_crd: bool,

    /// Service account granted OWNER on every managed dataset
    #[arg(long, env = "SA_ACCOUNT_EMAIL")]
    operator_principal: Option<String>,

    /// Labels with this prefix do not trigger a resync
    #[arg(long, env = "BQKEEPER_RESERVED_LABEL_PREFIX", default_value = DEFAULT_RESERVED_LABEL_PREFIX)]
    reserved_label_prefix: String,

    /// BigQuery REST API root
    #[arg(long, env = "BQKEEPER_BIGQUERY_ENDPOINT", default_value = DEFAULT_BIGQUERY_ENDPOINT)]
    bigquery_endpoint: String,

    /// Use this access token instead of the metadata server
    #[arg(long, env = "BQKEEPER_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Only watch this namespace (default: all namespaces)
    #[arg(long, env = "BQKEEPER_WATCH_NAMESPACE")]
    watch_namespace: Option<String>,
}

impl Cli {
    fn dataset_config(&self) -> DatasetConfig {
        DatasetConfig::new(
            self.operator_principal.clone(),
            self.reserved_label_prefix.clone(),
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&BigQueryDataset::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    // Install crypto provider - aws-lc-rs, shared with kube and reqwest
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let telemetry = TelemetryConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Invalid telemetry configuration: {}", e))?;
    init_telemetry(telemetry).map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    run_controller(cli).await
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if cli.install_crd {
        ensure_crd_installed(&client).await?;
    }

    let config = cli.dataset_config();
    if config.operator_principal.is_none() {
        tracing::warn!("no operator principal configured; datasets will not get an owner grant");
    }

    let bigquery = build_bigquery_client(&cli)?;
    let ctx = Arc::new(Context::builder(client.clone(), bigquery).config(config).build());

    let datasets: Api<BigQueryDataset> = match &cli.watch_namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    tracing::info!(
        namespace = cli.watch_namespace.as_deref().unwrap_or("*"),
        endpoint = %cli.bigquery_endpoint,
        "Starting BigQueryDataset controller"
    );

    Controller::new(datasets, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    tracing::debug!(dataset = %obj.name, ?action, "Dataset reconciliation completed");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Dataset reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Controller shut down");
    Ok(())
}

fn build_bigquery_client(cli: &Cli) -> anyhow::Result<Arc<dyn DatasetClient>> {
    let tokens: Arc<dyn TokenProvider> = match cli.access_token.as_deref().filter(|t| !t.is_empty()) {
        Some(token) => {
            tracing::info!("Using static access token");
            Arc::new(StaticTokenProvider::new(token))
        }
        None => {
            let http = reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create metadata HTTP client: {}", e))?;
            Arc::new(MetadataTokenProvider::new(http))
        }
    };

    let client = BigQueryClient::new(cli.bigquery_endpoint.clone(), tokens)
        .map_err(|e| anyhow::anyhow!("Failed to create BigQuery client: {}", e))?;
    Ok(Arc::new(client))
}

/// Install the BigQueryDataset CRD with server-side apply
///
/// Keeps the installed schema in step with the operator version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing BigQueryDataset CRD...");
    crds.patch(
        BigQueryDataset::crd_name(),
        &params,
        &Patch::Apply(&BigQueryDataset::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install BigQueryDataset CRD: {}", e))?;

    tracing::info!("BigQueryDataset CRD installed/updated");
    Ok(())
}
