//! Layer cache: maps a step's cache key to the layer it produced.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dockwright_shared::errors::DockwrightResult;

use crate::pipeline::{BuildStage, CacheKey};
use crate::util::write_json_atomic;

const CACHE_FILE: &str = "layers.json";

/// A committed layer blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    /// Digest of the compressed blob.
    pub digest: String,
    /// Digest of the uncompressed tar.
    pub diff_id: String,
    pub size: u64,
    pub media_type: String,
    pub stage: BuildStage,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    layers: BTreeMap<CacheKey, LayerRecord>,
}

/// Persistent cache of step layers, keyed by [`CacheKey`].
///
/// Every insert is written through, so layers committed by earlier steps of
/// a failed build remain reusable.
#[derive(Debug)]
pub struct LayerCache {
    path: PathBuf,
    data: CacheFile,
}

impl LayerCache {
    /// Load the cache from `cache_dir`.
    ///
    /// A missing or unreadable file yields an empty cache; the blobs are
    /// still on disk and will be re-associated as steps run again.
    pub fn load(cache_dir: &Path) -> Self {
        let path = cache_dir.join(CACHE_FILE);

        let data = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<CacheFile>(&bytes) {
                Ok(data) => {
                    tracing::debug!(entries = data.layers.len(), "Loaded layer cache");
                    data
                }
                Err(e) => {
                    tracing::warn!("Corrupted layer cache, starting empty: {}", e);
                    CacheFile::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CacheFile::new(),
            Err(e) => {
                tracing::warn!("Failed to read layer cache, starting empty: {}", e);
                CacheFile::new()
            }
        };

        Self { path, data }
    }

    pub fn get(&self, key: &CacheKey) -> Option<&LayerRecord> {
        self.data.layers.get(key)
    }

    /// Record a layer and persist the cache.
    pub fn insert(&mut self, key: CacheKey, record: LayerRecord) -> DockwrightResult<()> {
        tracing::trace!(cache_key = %key.short(), digest = %record.digest, "Caching layer");
        self.data.layers.insert(key, record);
        write_json_atomic(&self.path, &self.data)
    }

    /// Drop an entry whose blob is gone.
    pub fn evict(&mut self, key: &CacheKey) -> DockwrightResult<()> {
        if self.data.layers.remove(key).is_some() {
            write_json_atomic(&self.path, &self.data)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.layers.is_empty()
    }
}

impl CacheFile {
    fn new() -> Self {
        Self {
            version: 1,
            layers: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(digest: &str) -> LayerRecord {
        LayerRecord {
            digest: digest.to_string(),
            diff_id: "sha256:diff".to_string(),
            size: 42,
            media_type: dockwright_shared::constants::media_types::LAYER_GZIP.to_string(),
            stage: BuildStage::DepsInstalled,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_persists() {
        let temp = tempfile::tempdir().unwrap();
        let key = CacheKey::derive(None, "RUN pip install", "");

        let mut cache = LayerCache::load(temp.path());
        assert!(cache.is_empty());
        cache.insert(key.clone(), record("sha256:one")).unwrap();

        let reloaded = LayerCache::load(temp.path());
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get(&key).unwrap().digest, "sha256:one");
    }

    #[test]
    fn test_evict() {
        let temp = tempfile::tempdir().unwrap();
        let key = CacheKey::derive(None, "COPY . .", "x");
        let mut cache = LayerCache::load(temp.path());
        cache.insert(key.clone(), record("sha256:two")).unwrap();
        cache.evict(&key).unwrap();
        assert!(LayerCache::load(temp.path()).get(&key).is_none());
    }

    #[test]
    fn test_corrupted_file_yields_empty_cache() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join(CACHE_FILE), "{not json").unwrap();
        assert!(LayerCache::load(temp.path()).is_empty());
    }
}
