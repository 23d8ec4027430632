use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::AssetBackend;
use super::decode::parse_cli_rows;
use crate::assets::AssetId;
use crate::error::{ResourceError, ResourceResult};
use crate::runtime::ContainerRuntime;

/// Model store driven by commands executed inside the container
///
/// `list_cmd` prints one asset per row (name in the first column);
/// `pull_cmd` gets the asset id appended.
pub struct CliAssetBackend {
    runtime: Arc<dyn ContainerRuntime>,
    container_id: String,
    list_cmd: Vec<String>,
    pull_cmd: Vec<String>,
}

impl CliAssetBackend {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        container_id: impl Into<String>,
        list_cmd: Vec<String>,
        pull_cmd: Vec<String>,
    ) -> Self {
        Self {
            runtime,
            container_id: container_id.into(),
            list_cmd,
            pull_cmd,
        }
    }
}

#[async_trait]
impl AssetBackend for CliAssetBackend {
    async fn list(&self) -> ResourceResult<Vec<String>> {
        let output = self.runtime.exec(&self.container_id, &self.list_cmd).await?;
        if !output.success() {
            return Err(ResourceError::Runtime(format!(
                "{} exited with {:?}: {}",
                self.list_cmd.join(" "),
                output.exit_code,
                output.combined()
            )));
        }

        let names = parse_cli_rows(&output.stdout);
        debug!(container_id = %self.container_id, count = names.len(), "Listed assets");
        Ok(names)
    }

    async fn fetch(&self, asset: &AssetId) -> ResourceResult<()> {
        let mut cmd = self.pull_cmd.clone();
        cmd.push(asset.as_str().to_string());

        let output = self.runtime.exec(&self.container_id, &cmd).await?;
        if !output.success() {
            return Err(ResourceError::provisioning_exec(
                asset.as_str(),
                output.exit_code,
                output.combined(),
            ));
        }
        Ok(())
    }
}
