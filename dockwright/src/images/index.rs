//! Image index: fetched base images and built image tags.
//!
//! Fetched bases are recorded so a pinned reference is served locally on
//! later builds; built images are recorded only after every step succeeded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dockwright_shared::errors::DockwrightResult;

use crate::pipeline::CacheKey;
use crate::util::write_json_atomic;

const INDEX_FILE: &str = "index.json";

/// A base image available in blob storage.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BaseRecord {
    pub manifest_digest: String,
    pub config_digest: String,
    /// Layer blob digests, bottom first.
    pub layers: Vec<String>,
    pub layer_sizes: Vec<u64>,
    #[serde(default)]
    pub layer_media_types: Vec<String>,
    pub fetched_at: DateTime<Utc>,
}

/// A successfully built image.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    pub tag: String,
    pub build_id: String,
    pub manifest_digest: String,
    pub manifest_size: u64,
    pub config_digest: String,
    pub base: String,
    pub layers: Vec<String>,
    /// Cache key of each step, in build order.
    pub cache_keys: Vec<CacheKey>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
struct IndexData {
    version: String,
    #[serde(default)]
    bases: BTreeMap<String, BaseRecord>,
    #[serde(default)]
    images: BTreeMap<String, BuiltImage>,
}

/// On-disk index under `<home>/images/index.json`.
#[derive(Debug, Clone)]
pub struct ImageIndex {
    path: PathBuf,
    data: IndexData,
}

impl ImageIndex {
    /// Load the index; a missing or corrupted file yields an empty index.
    ///
    /// A corrupted file is moved to `index.json.corrupt` before the next
    /// save can replace it.
    pub fn load(images_dir: &Path) -> Self {
        let path = images_dir.join(INDEX_FILE);

        let data = if !path.exists() {
            tracing::debug!("Index file not found, starting empty");
            IndexData::new()
        } else {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match serde_json::from_str::<IndexData>(&contents) {
                    Ok(data) => {
                        tracing::debug!(
                            bases = data.bases.len(),
                            images = data.images.len(),
                            "Loaded image index"
                        );
                        data
                    }
                    Err(e) => {
                        let aside = path.with_extension("json.corrupt");
                        match std::fs::rename(&path, &aside) {
                            Ok(()) => tracing::warn!(
                                moved_to = %aside.display(),
                                "Corrupted index file, starting empty: {}",
                                e
                            ),
                            Err(rename_err) => tracing::warn!(
                                "Corrupted index file, starting empty: {} (could not move it aside: {})",
                                e,
                                rename_err
                            ),
                        }
                        IndexData::new()
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read index file, starting empty: {}", e);
                    IndexData::new()
                }
            }
        };

        Self { path, data }
    }

    pub fn save(&self) -> DockwrightResult<()> {
        write_json_atomic(&self.path, &self.data)?;
        tracing::debug!(images = self.data.images.len(), "Saved image index");
        Ok(())
    }

    pub fn base(&self, reference: &str) -> Option<&BaseRecord> {
        self.data.bases.get(reference)
    }

    pub fn upsert_base(&mut self, reference: String, record: BaseRecord) {
        self.data.bases.insert(reference, record);
    }

    pub fn image(&self, tag: &str) -> Option<&BuiltImage> {
        self.data.images.get(tag)
    }

    pub fn upsert_image(&mut self, image: BuiltImage) {
        self.data.images.insert(image.tag.clone(), image);
    }

    pub fn remove_image(&mut self, tag: &str) -> Option<BuiltImage> {
        self.data.images.remove(tag)
    }

    /// Built images, ordered by tag.
    pub fn images(&self) -> impl Iterator<Item = &BuiltImage> {
        self.data.images.values()
    }
}

impl IndexData {
    fn new() -> Self {
        Self {
            version: "1".to_string(),
            bases: BTreeMap::new(),
            images: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn built(tag: &str) -> BuiltImage {
        BuiltImage {
            tag: tag.to_string(),
            build_id: ulid::Ulid::new().to_string(),
            manifest_digest: "sha256:m".into(),
            manifest_size: 500,
            config_digest: "sha256:c".into(),
            base: "python:3.11.9-slim".into(),
            layers: vec!["sha256:l1".into()],
            cache_keys: vec![CacheKey::derive(None, "FROM x", "")],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_empty_index() {
        let temp = tempfile::tempdir().unwrap();
        let index = ImageIndex::load(temp.path());
        assert_eq!(index.images().count(), 0);
        assert!(index.image("dashboard:latest").is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let temp = tempfile::tempdir().unwrap();
        let mut index = ImageIndex::load(temp.path());
        index.upsert_image(built("dashboard:latest"));
        index.upsert_base(
            "docker.io/library/python:3.11.9-slim".into(),
            BaseRecord {
                manifest_digest: "sha256:b".into(),
                config_digest: "sha256:bc".into(),
                layers: vec![],
                layer_sizes: vec![],
                layer_media_types: vec![],
                fetched_at: Utc::now(),
            },
        );
        index.save().unwrap();

        let reloaded = ImageIndex::load(temp.path());
        assert_eq!(reloaded.image("dashboard:latest").unwrap().manifest_digest, "sha256:m");
        assert!(reloaded.base("docker.io/library/python:3.11.9-slim").is_some());
    }

    #[test]
    fn test_remove_image() {
        let temp = tempfile::tempdir().unwrap();
        let mut index = ImageIndex::load(temp.path());
        index.upsert_image(built("a"));
        assert!(index.remove_image("a").is_some());
        assert!(index.remove_image("a").is_none());
    }

    #[test]
    fn test_corrupted_index_is_kept_aside() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join(INDEX_FILE), "{\"images\": [").unwrap();

        let mut index = ImageIndex::load(temp.path());
        assert_eq!(index.images().count(), 0);
        index.upsert_image(built("dashboard:latest"));
        index.save().unwrap();

        let aside = temp.path().join("index.json.corrupt");
        assert_eq!(std::fs::read_to_string(aside).unwrap(), "{\"images\": [");
        assert!(ImageIndex::load(temp.path()).image("dashboard:latest").is_some());
    }
}
