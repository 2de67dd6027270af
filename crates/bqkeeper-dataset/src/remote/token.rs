//! OAuth access tokens for the BigQuery API
//!
//! On GKE the operator runs with workload identity, so tokens come from the
//! metadata server and are cached until shortly before they expire.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::debug;

use bqkeeper_common::Error;

/// Default metadata server token endpoint
pub const METADATA_TOKEN_ENDPOINT: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh this long before the reported expiry
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Source of bearer tokens for BigQuery requests
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return a currently valid access token
    async fn token(&self) -> Result<String, Error>;
}

/// A fixed token, for local development and emulators
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Wrap an existing access token
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<String, Error> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Fetches tokens from the GCE/GKE metadata server
pub struct MetadataTokenProvider {
    client: reqwest::Client,
    endpoint: String,
    cached: RwLock<Option<CachedToken>>,
}

impl MetadataTokenProvider {
    /// Create a provider for the default metadata endpoint
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_endpoint(client, METADATA_TOKEN_ENDPOINT)
    }

    /// Create a provider for a custom endpoint
    pub fn with_endpoint(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            cached: RwLock::new(None),
        }
    }

    fn cached_token(&self) -> Option<String> {
        self.cached
            .read()
            .as_ref()
            .filter(|c| Instant::now() < c.refresh_at)
            .map(|c| c.token.clone())
    }

    async fn fetch(&self) -> Result<MetadataToken, Error> {
        let response = self
            .client
            .get(&self.endpoint)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| {
                Error::internal_with_context(format!("metadata request failed: {}", e), "token")
            })?;

        if !response.status().is_success() {
            return Err(Error::internal_with_context(
                format!("metadata server returned HTTP {}", response.status()),
                "token",
            ));
        }

        response.json().await.map_err(|e| {
            Error::internal_with_context(format!("invalid token response: {}", e), "token")
        })
    }
}

#[async_trait]
impl TokenProvider for MetadataTokenProvider {
    async fn token(&self) -> Result<String, Error> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        let fetched = self.fetch().await?;
        let lifetime = Duration::from_secs(fetched.expires_in).saturating_sub(EXPIRY_MARGIN);
        debug!(expires_in = fetched.expires_in, "fetched access token from metadata server");

        *self.cached.write() = Some(CachedToken {
            token: fetched.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(fetched.access_token)
    }
}
