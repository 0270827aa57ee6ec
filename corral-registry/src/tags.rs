//! Token and tag listing endpoints

use async_trait::async_trait;
use corral_core::dto::registry::{RegistryToken, TagListing};
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::{API_VERSION, RegistryApi, RegistryClient};

impl RegistryClient {
    fn token_url(&self) -> String {
        format!("{}/{}/docker/token", self.base_url, API_VERSION)
    }

    fn images_url(&self) -> String {
        format!(
            "{}/{}/docker/images/{}",
            self.base_url, API_VERSION, self.namespace
        )
    }
}

#[async_trait]
impl RegistryApi for RegistryClient {
    /// Fetch an anonymous bearer token
    ///
    /// The token is short-lived and only grants read access to public
    /// repositories, which is all the resolver needs.
    async fn fetch_token(&self) -> Result<String> {
        let response = self.client.get(self.token_url()).send().await?;
        let token: RegistryToken = self.handle_response(response).await?;

        let bearer = token.bearer();
        if bearer.is_empty() {
            return Err(ClientError::EmptyToken);
        }

        debug!("Obtained registry token (expires in {}s)", token.expires_in);
        Ok(bearer.to_string())
    }

    /// List the tags of the runner image repository
    ///
    /// # Arguments
    /// * `token` - Bearer token from [`RegistryApi::fetch_token`]
    async fn list_tags(&self, token: &str) -> Result<TagListing> {
        let response = self
            .client
            .get(self.images_url())
            .query(&[("repo", self.repository.as_str())])
            .bearer_auth(token)
            .send()
            .await?;

        let listing: TagListing = self.handle_response(response).await?;
        debug!(
            "Registry lists {} tag(s) for {}",
            listing.tags.len(),
            self.repository
        );

        Ok(listing)
    }
}
