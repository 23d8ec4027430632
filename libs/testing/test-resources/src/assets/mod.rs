//! Idempotent asset provisioning
//!
//! `ensure` makes a named model available inside a running service:
//!
//! 1. optional host-cache hint (logged, never decisive)
//! 2. remote listing; `name` and `name:tag` count as the same asset
//! 3. fetch of the exact requested id when absent, bounded by the fetch timeout
//! 4. nothing is remembered about failures, so the next call starts over
//!
//! Calls for the same (instance, asset) pair are serialized, so concurrent
//! callers see a single fetch.

mod cache;
pub mod cli;
pub mod decode;
pub mod http;
mod id;

pub use cache::{cache_path, is_cached};
pub use cli::CliAssetBackend;
pub use http::HttpAssetBackend;
pub use id::AssetId;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use strum::Display;
use tracing::{debug, info, warn};

use crate::error::{ResourceError, ResourceResult};
use crate::instance::RunningInstance;
use crate::metrics::ResourceMetrics;

/// Presence of an asset inside one running instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AssetState {
    Absent,
    Downloading,
    Present,
}

/// Outcome of an `ensure` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetRecord {
    pub container_id: String,
    pub asset: AssetId,
    pub state: AssetState,
    /// Whether this call issued the fetch
    pub fetched: bool,
}

/// Lists and fetches assets of one running service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AssetBackend: Send + Sync {
    /// Identifiers the service currently has
    async fn list(&self) -> ResourceResult<Vec<String>>;

    /// Materialize exactly `asset`
    async fn fetch(&self, asset: &AssetId) -> ResourceResult<()>;
}

type AssetKey = (String, AssetId);

pub struct AssetProvisioner {
    fetch_timeout: Duration,
    ledger: Mutex<HashMap<AssetKey, AssetState>>,
    gates: Mutex<HashMap<AssetKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl AssetProvisioner {
    pub fn new(fetch_timeout: Duration) -> Self {
        Self {
            fetch_timeout,
            ledger: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    /// Last known state of `asset` in `instance`
    pub fn state(&self, instance: &RunningInstance, asset: &AssetId) -> AssetState {
        let key = (instance.container_id.clone(), asset.clone());
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .copied()
            .unwrap_or(AssetState::Absent)
    }

    /// Drop everything known about a container (called when it is stopped)
    pub fn forget_instance(&self, container_id: &str) {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(id, _), _| id != container_id);
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(id, _), _| id != container_id);
    }

    /// Make `asset` present in `instance`, fetching it at most once
    pub async fn ensure(
        &self,
        instance: &RunningInstance,
        backend: &dyn AssetBackend,
        asset: &AssetId,
        cache_dir: Option<&Path>,
    ) -> ResourceResult<AssetRecord> {
        let key: AssetKey = (instance.container_id.clone(), asset.clone());
        let gate = self.gate(&key);
        let _guard = gate.lock().await;

        if let Some(dir) = cache_dir {
            if is_cached(dir, asset) {
                debug!(asset = %asset, path = %cache_path(dir, asset).display(), "Asset found in host cache");
            }
        }

        let listing = backend
            .list()
            .await
            .map_err(|e| as_provisioning(asset, e))?;

        if asset.is_listed(&listing) {
            debug!(service = %instance.label, asset = %asset, "Asset already present");
            self.set_state(&key, AssetState::Present);
            return Ok(self.record(instance, asset, AssetState::Present, false));
        }

        self.set_state(&key, AssetState::Downloading);
        info!(service = %instance.label, asset = %asset, "Fetching asset");
        let started = Instant::now();

        let result = match tokio::time::timeout(self.fetch_timeout, backend.fetch(asset)).await {
            Ok(result) => result.map_err(|e| as_provisioning(asset, e)),
            Err(_) => Err(ResourceError::Provisioning {
                asset: asset.to_string(),
                status: None,
                exit_code: None,
                body: format!(
                    "fetch did not finish within {}s",
                    self.fetch_timeout.as_secs()
                ),
            }),
        };

        match result {
            Ok(()) => {
                self.set_state(&key, AssetState::Present);
                ResourceMetrics::asset_fetched(instance.label.as_str(), started.elapsed());
                info!(
                    service = %instance.label,
                    asset = %asset,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Asset fetched"
                );
                Ok(self.record(instance, asset, AssetState::Present, true))
            }
            Err(err) => {
                self.clear_state(&key);
                ResourceMetrics::asset_fetch_failed(instance.label.as_str());
                warn!(service = %instance.label, asset = %asset, error = %err, "Asset fetch failed");
                Err(err)
            }
        }
    }

    fn gate(&self, key: &AssetKey) -> Arc<tokio::sync::Mutex<()>> {
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone()
    }

    fn set_state(&self, key: &AssetKey, state: AssetState) {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), state);
    }

    fn clear_state(&self, key: &AssetKey) {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    fn record(
        &self,
        instance: &RunningInstance,
        asset: &AssetId,
        state: AssetState,
        fetched: bool,
    ) -> AssetRecord {
        AssetRecord {
            container_id: instance.container_id.clone(),
            asset: asset.clone(),
            state,
            fetched,
        }
    }
}

fn as_provisioning(asset: &AssetId, err: ResourceError) -> ResourceError {
    match err {
        err @ ResourceError::Provisioning { .. } => err,
        other => ResourceError::Provisioning {
            asset: asset.to_string(),
            status: None,
            exit_code: None,
            body: other.to_string(),
        },
    }
}
