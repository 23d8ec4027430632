use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::AssetBackend;
use super::decode::{ListingDecoder, decode_listing, default_decoders};
use crate::assets::AssetId;
use crate::error::{ResourceError, ResourceResult};

/// Upper bound for one listing call; fetches are bounded by the provisioner
const LIST_TIMEOUT: Duration = Duration::from_secs(30);

/// Model registry reachable over HTTP
///
/// Lists with `GET {base_url}{list_path}` and fetches with a bodiless
/// `POST {base_url}{fetch_path}`, where `{id}` in `fetch_path` is replaced by
/// the fully qualified asset id.
pub struct HttpAssetBackend {
    client: Client,
    base_url: String,
    list_path: String,
    fetch_path: String,
    list_timeout: Duration,
    decoders: Vec<Box<dyn ListingDecoder>>,
}

impl HttpAssetBackend {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        list_path: impl Into<String>,
        fetch_path: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            list_path: list_path.into(),
            fetch_path: fetch_path.into(),
            list_timeout: LIST_TIMEOUT,
            decoders: default_decoders(),
        }
    }

    /// Replace the decoder chain
    pub fn with_decoders(mut self, decoders: Vec<Box<dyn ListingDecoder>>) -> Self {
        self.decoders = decoders;
        self
    }

    pub fn with_list_timeout(mut self, timeout: Duration) -> Self {
        self.list_timeout = timeout;
        self
    }

    pub fn fetch_url(&self, asset: &AssetId) -> String {
        format!(
            "{}{}",
            self.base_url,
            self.fetch_path.replace("{id}", asset.as_str())
        )
    }
}

#[async_trait]
impl AssetBackend for HttpAssetBackend {
    async fn list(&self) -> ResourceResult<Vec<String>> {
        let url = format!("{}{}", self.base_url, self.list_path);
        let response = self
            .client
            .get(&url)
            .timeout(self.list_timeout)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ResourceError::Http(format!(
                "GET {} returned {}: {}",
                url, status, body
            )));
        }

        let value: serde_json::Value = serde_json::from_str(&body)?;
        let names = decode_listing(&self.decoders, &value)?;
        debug!(%url, count = names.len(), "Listed assets");
        Ok(names)
    }

    async fn fetch(&self, asset: &AssetId) -> ResourceResult<()> {
        let url = self.fetch_url(asset);
        let response = self.client.post(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ResourceError::provisioning_http(
                asset.as_str(),
                status.as_u16(),
                body,
            ));
        }

        debug!(%url, status = status.as_u16(), "Fetch accepted");
        Ok(())
    }
}
