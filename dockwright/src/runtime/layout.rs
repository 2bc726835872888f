use dockwright_shared::errors::{DockwrightError, DockwrightResult};
use std::path::{Path, PathBuf};

/// Directory structure constants
pub mod dirs {
    /// Base directory name for dockwright data
    pub const DOCKWRIGHT_DIR: &str = ".dockwright";

    /// Content-addressed blobs (layers, configs, manifests)
    pub const BLOBS_DIR: &str = "blobs";

    /// Subdirectory for layer tarballs
    pub const LAYERS_DIR: &str = "layers";

    /// Subdirectory for image manifests
    pub const MANIFESTS_DIR: &str = "manifests";

    /// Subdirectory for image configs
    pub const CONFIGS_DIR: &str = "configs";

    /// Layer cache (cache key -> layer record)
    pub const CACHE_DIR: &str = "cache";

    /// Built and fetched image index
    pub const IMAGES_DIR: &str = "images";

    /// Per-build staging directories
    pub const STAGING_DIR: &str = "staging";

    /// Transient files on the same filesystem as the blobs
    pub const TMP_DIR: &str = "tmp";
}

// ============================================================================
// HOME LAYOUT
// ============================================================================

/// Layout of the dockwright home directory.
///
/// ```text
/// ~/.dockwright/
/// ├── .lock
/// ├── blobs/
/// │   ├── layers/      # sha256-<hex>.tar.gz
/// │   ├── configs/     # sha256-<hex>.json
/// │   └── manifests/   # sha256-<hex>.json
/// ├── cache/
/// │   └── layers.json  # cache key -> layer record
/// ├── images/
/// │   └── index.json   # tag -> built image
/// ├── staging/
/// │   └── <build-id>/  # rootfs materialized for run steps
/// └── tmp/
/// ```
#[derive(Clone, Debug)]
pub struct HomeLayout {
    home_dir: PathBuf,
}

impl HomeLayout {
    pub fn new(home_dir: PathBuf) -> Self {
        Self { home_dir }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::BLOBS_DIR)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::CACHE_DIR)
    }

    /// Image index directory: ~/.dockwright/images
    pub fn images_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::IMAGES_DIR)
    }

    /// Per-build staging root: ~/.dockwright/staging
    pub fn staging_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::STAGING_DIR)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::TMP_DIR)
    }

    /// Blob layout rooted at ~/.dockwright/blobs
    pub fn blob_layout(&self) -> BlobLayout {
        BlobLayout::new(self.blobs_dir())
    }

    /// Staging directory for a single build.
    pub fn build_staging(&self, build_id: &str) -> PathBuf {
        self.staging_dir().join(build_id)
    }

    /// Initialize the filesystem structure.
    pub fn prepare(&self) -> DockwrightResult<()> {
        for (dir, what) in [
            (self.home_dir.clone(), "home"),
            (self.cache_dir(), "cache dir"),
            (self.images_dir(), "images dir"),
            (self.staging_dir(), "staging dir"),
            (self.temp_dir(), "temp dir"),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| DockwrightError::Storage(format!("failed to create {what}: {e}")))?;
        }

        self.blob_layout().prepare()
    }
}

// ============================================================================
// BLOB LAYOUT
// ============================================================================

/// Filesystem layout for content-addressed blobs.
#[derive(Clone, Debug)]
pub struct BlobLayout {
    blobs_dir: PathBuf,
}

impl BlobLayout {
    pub fn new(blobs_dir: PathBuf) -> Self {
        Self { blobs_dir }
    }

    pub fn root(&self) -> &Path {
        &self.blobs_dir
    }

    pub fn layers_dir(&self) -> PathBuf {
        self.blobs_dir.join(dirs::LAYERS_DIR)
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.blobs_dir.join(dirs::MANIFESTS_DIR)
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.blobs_dir.join(dirs::CONFIGS_DIR)
    }

    pub fn prepare(&self) -> DockwrightResult<()> {
        std::fs::create_dir_all(self.layers_dir())
            .map_err(|e| DockwrightError::Storage(format!("failed to create layers dir: {e}")))?;

        std::fs::create_dir_all(self.manifests_dir()).map_err(|e| {
            DockwrightError::Storage(format!("failed to create manifests dir: {e}"))
        })?;

        std::fs::create_dir_all(self.configs_dir())
            .map_err(|e| DockwrightError::Storage(format!("failed to create configs dir: {e}")))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_creates_tree() {
        let temp = tempfile::tempdir().unwrap();
        let layout = HomeLayout::new(temp.path().join("home"));

        layout.prepare().unwrap();

        assert!(layout.cache_dir().is_dir());
        assert!(layout.images_dir().is_dir());
        assert!(layout.staging_dir().is_dir());
        assert!(layout.blob_layout().layers_dir().is_dir());
        assert!(layout.blob_layout().configs_dir().is_dir());
        assert!(layout.blob_layout().manifests_dir().is_dir());
    }

    #[test]
    fn test_build_staging_is_per_build() {
        let layout = HomeLayout::new(PathBuf::from("/tmp/dw"));
        assert_eq!(
            layout.build_staging("01HXYZ"),
            PathBuf::from("/tmp/dw/staging/01HXYZ")
        );
    }
}
