//! Corral Registry Client
//!
//! A small, type-safe HTTP client for the remote registry that publishes the
//! runner image family. It knows two endpoints: the anonymous bearer token
//! endpoint and the tag listing of one image repository.
//!
//! # Example
//!
//! ```no_run
//! use corral_registry::{RegistryApi, RegistryClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client =
//!         RegistryClient::for_repository("iad.ocir.io/odx-pipelines/wercker/wercker-runner")?;
//!
//!     let token = client.fetch_token().await?;
//!     let listing = client.list_tags(&token).await?;
//!
//!     println!("Found {} tags", listing.tags.len());
//!     Ok(())
//! }
//! ```

pub mod error;
mod tags;

// Re-export commonly used types
pub use corral_core::dto::registry::{RemoteTag, TagListing};
pub use error::{ClientError, Result};

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Version segment of the registry API paths
pub const API_VERSION: &str = "20180419";

/// Timeout applied to every registry request unless a custom client is given
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Operations the image resolver needs from a remote registry
///
/// Implemented by [`RegistryClient`]; tests substitute canned listings.
#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// Obtain an anonymous bearer token for read access
    async fn fetch_token(&self) -> Result<String>;

    /// List every tag of the runner image repository
    async fn list_tags(&self, token: &str) -> Result<TagListing>;
}

/// HTTP client for the remote image registry
#[derive(Debug, Clone)]
pub struct RegistryClient {
    /// Base URL of the registry (e.g., "https://iad.ocir.io")
    base_url: String,
    /// Tenancy namespace owning the repository (e.g., "odx-pipelines")
    namespace: String,
    /// Repository path inside the namespace (e.g., "wercker/wercker-runner")
    repository: String,
    /// HTTP client instance
    client: Client,
}

impl RegistryClient {
    /// Create a new registry client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the registry (e.g., "https://iad.ocir.io")
    /// * `namespace` - Namespace that owns the repository
    /// * `repository` - Repository path inside the namespace
    ///
    /// # Example
    /// ```
    /// use corral_registry::RegistryClient;
    ///
    /// let client = RegistryClient::new("https://iad.ocir.io", "odx-pipelines", "wercker/wercker-runner");
    /// ```
    pub fn new(
        base_url: impl Into<String>,
        namespace: impl Into<String>,
        repository: impl Into<String>,
    ) -> Self {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self::with_client(base_url, namespace, repository, client)
    }

    /// Create a new registry client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(
        base_url: impl Into<String>,
        namespace: impl Into<String>,
        repository: impl Into<String>,
        client: Client,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            namespace: namespace.into(),
            repository: repository.into(),
            client,
        }
    }

    /// Create a client from a full image repository reference
    ///
    /// `iad.ocir.io/odx-pipelines/wercker/wercker-runner` maps to host
    /// `https://iad.ocir.io`, namespace `odx-pipelines` and repository
    /// `wercker/wercker-runner`. A trailing tag is ignored.
    pub fn for_repository(image_repository: &str) -> Result<Self> {
        let (repository, _) = corral_core::domain::image::split_reference(image_repository);
        let mut parts = repository.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(namespace), Some(repo))
                if !host.is_empty() && !namespace.is_empty() && !repo.is_empty() =>
            {
                Ok(Self::new(format!("https://{}", host), namespace, repo))
            }
            _ => Err(ClientError::InvalidRepository(image_repository.to_string())),
        }
    }

    /// Get the base URL of the registry
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle a registry response and deserialize JSON
    ///
    /// This method checks the status code and returns an appropriate error if
    /// the request failed, or deserializes the response body if successful.
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }
}
