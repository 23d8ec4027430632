//! Host-side model cache hint
//!
//! Services that mount a host cache (Hugging Face hub layout) store
//! `org/model` under `models--org--model`. A non-empty directory there means
//! the asset was downloaded before; the remote listing still decides.

use std::path::{Path, PathBuf};

use super::AssetId;

/// Directory an asset occupies inside a hub-style cache
pub fn cache_path(cache_dir: &Path, asset: &AssetId) -> PathBuf {
    cache_dir.join(format!("models--{}", asset.name().replace('/', "--")))
}

/// Whether the cache directory for `asset` exists and has content
pub fn is_cached(cache_dir: &Path, asset: &AssetId) -> bool {
    std::fs::read_dir(cache_path(cache_dir, asset))
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}
