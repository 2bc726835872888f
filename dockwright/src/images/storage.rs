//! Content-addressed blob storage.
//!
//! Layers, configs and manifests are stored under their `sha256:` digest.
//! Every write goes through a staged file that is verified and then renamed
//! into place, so a blob path either holds complete, verified content or
//! does not exist.
//!
//! Does NOT handle:
//! - which blobs belong to which image (ImageIndex)
//! - which layer a build step produced (LayerCache)

use std::path::{Path, PathBuf};

use dockwright_shared::errors::{DockwrightError, DockwrightResult};

use crate::runtime::layout::BlobLayout;
use crate::util::{digest_hex, sha256_digest};

use super::archive::PackedLayer;

fn blob_file_name(digest: &str) -> String {
    digest.replace(':', "-")
}

/// Persistent blob store.
pub struct BlobStorage {
    layout: BlobLayout,
}

impl std::fmt::Debug for BlobStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStorage")
            .field("blobs_dir", &self.layout.root())
            .finish()
    }
}

impl BlobStorage {
    pub fn new(layout: BlobLayout) -> DockwrightResult<Self> {
        layout.prepare()?;
        Ok(Self { layout })
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    // ========================================================================
    // LAYERS
    // ========================================================================

    pub fn layer_path(&self, digest: &str) -> PathBuf {
        self.layout
            .layers_dir()
            .join(format!("{}.tar.gz", blob_file_name(digest)))
    }

    pub fn has_layer(&self, digest: &str) -> bool {
        self.layer_path(digest).exists()
    }

    /// Unique scratch path for packing a new layer before its digest is known.
    pub fn layer_scratch_path(&self) -> PathBuf {
        self.layout
            .layers_dir()
            .join(format!("{}.packing", uuid::Uuid::new_v4().simple()))
    }

    /// Move a packed layer from its scratch path to its content address.
    ///
    /// If the blob already exists the scratch file is discarded; identical
    /// digests mean identical bytes.
    pub fn commit_layer(&self, scratch: &Path, packed: &PackedLayer) -> DockwrightResult<PathBuf> {
        let final_path = self.layer_path(&packed.digest);
        if final_path.exists() {
            let _ = std::fs::remove_file(scratch);
            tracing::trace!(digest = %packed.digest, "Layer blob already present");
            return Ok(final_path);
        }

        std::fs::rename(scratch, &final_path).map_err(|e| {
            let _ = std::fs::remove_file(scratch);
            DockwrightError::Storage(format!(
                "failed to move {} to {}: {}",
                scratch.display(),
                final_path.display(),
                e
            ))
        })?;

        tracing::debug!(digest = %packed.digest, size = packed.size, "Committed layer blob");
        Ok(final_path)
    }

    /// Recompute a stored layer's digest and compare.
    pub async fn verify_layer(&self, digest: &str) -> DockwrightResult<bool> {
        let path = self.layer_path(digest);
        if !path.exists() {
            return Ok(false);
        }

        let data = tokio::fs::read(&path).await.map_err(|e| {
            DockwrightError::Storage(format!(
                "failed to read layer {} for verification: {}",
                path.display(),
                e
            ))
        })?;

        let computed = sha256_digest(&data);
        if computed != digest {
            tracing::error!(
                expected = %digest,
                computed = %computed,
                size = data.len(),
                "Layer integrity check failed"
            );
            return Ok(false);
        }
        Ok(true)
    }

    pub async fn stage_layer_download(&self, digest: &str) -> DockwrightResult<StagedDownload> {
        StagedDownload::create(self.layout.layers_dir(), self.layer_path(digest), digest).await
    }

    // ========================================================================
    // CONFIGS AND MANIFESTS
    // ========================================================================

    pub fn config_path(&self, digest: &str) -> PathBuf {
        self.layout
            .configs_dir()
            .join(format!("{}.json", blob_file_name(digest)))
    }

    pub fn manifest_path(&self, digest: &str) -> PathBuf {
        self.layout
            .manifests_dir()
            .join(format!("{}.json", blob_file_name(digest)))
    }

    pub fn has_config(&self, digest: &str) -> bool {
        self.config_path(digest).exists()
    }

    pub fn has_manifest(&self, digest: &str) -> bool {
        self.manifest_path(digest).exists()
    }

    pub async fn stage_config_download(&self, digest: &str) -> DockwrightResult<StagedDownload> {
        StagedDownload::create(self.layout.configs_dir(), self.config_path(digest), digest).await
    }

    /// Store a config blob, returning its digest.
    pub fn put_config(&self, bytes: &[u8]) -> DockwrightResult<String> {
        let digest = sha256_digest(bytes);
        write_blob(&self.config_path(&digest), bytes)?;
        Ok(digest)
    }

    /// Store a manifest blob, returning its digest.
    pub fn put_manifest(&self, bytes: &[u8]) -> DockwrightResult<String> {
        let digest = sha256_digest(bytes);
        write_blob(&self.manifest_path(&digest), bytes)?;
        Ok(digest)
    }

    pub fn read_config(&self, digest: &str) -> DockwrightResult<Vec<u8>> {
        read_blob(&self.config_path(digest), "config", digest)
    }

    pub fn read_manifest(&self, digest: &str) -> DockwrightResult<Vec<u8>> {
        read_blob(&self.manifest_path(digest), "manifest", digest)
    }

    /// True when every digest has a stored layer blob.
    pub fn has_layers(&self, digests: &[String]) -> bool {
        digests.iter().all(|d| self.has_layer(d))
    }
}

fn write_blob(path: &Path, bytes: &[u8]) -> DockwrightResult<()> {
    if path.exists() {
        return Ok(());
    }

    let staged = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    std::fs::write(&staged, bytes).map_err(|e| {
        DockwrightError::Storage(format!("failed to write {}: {}", staged.display(), e))
    })?;
    std::fs::rename(&staged, path).map_err(|e| {
        let _ = std::fs::remove_file(&staged);
        DockwrightError::Storage(format!("failed to store {}: {}", path.display(), e))
    })
}

fn read_blob(path: &Path, what: &str, digest: &str) -> DockwrightResult<Vec<u8>> {
    if !path.exists() {
        return Err(DockwrightError::Storage(format!("{what} blob not found: {digest}")));
    }
    std::fs::read(path).map_err(|e| {
        DockwrightError::Storage(format!("failed to read {}: {}", path.display(), e))
    })
}

// ============================================================================
// STAGED DOWNLOAD
// ============================================================================

/// An in-progress download that is verified before it becomes visible.
///
/// ```ignore
/// let mut staged = storage.stage_layer_download(digest).await?;
/// client.pull_blob(reference, &descriptor, staged.file()).await?;
/// if !staged.commit().await? {
///     // digest mismatch, staged file already removed
/// }
/// ```
pub struct StagedDownload {
    staged_path: PathBuf,
    final_path: PathBuf,
    expected_hex: String,
    file: tokio::fs::File,
}

impl StagedDownload {
    async fn create(dir: PathBuf, final_path: PathBuf, digest: &str) -> DockwrightResult<Self> {
        let expected_hex = digest_hex(digest)?.to_string();
        let staged_path = dir.join(format!(
            "{}.{}.downloading",
            blob_file_name(digest),
            uuid::Uuid::new_v4().simple()
        ));

        let file = tokio::fs::File::create(&staged_path).await.map_err(|e| {
            DockwrightError::Storage(format!(
                "failed to create temp file {}: {}",
                staged_path.display(),
                e
            ))
        })?;

        Ok(Self {
            staged_path,
            final_path,
            expected_hex,
            file,
        })
    }

    pub fn file(&mut self) -> &mut tokio::fs::File {
        &mut self.file
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Verify the content and move it into place.
    ///
    /// Returns `Ok(false)` on a digest mismatch; the staged file is removed.
    pub async fn commit(self) -> DockwrightResult<bool> {
        use sha2::{Digest, Sha256};
        use tokio::io::AsyncReadExt;

        let Self {
            staged_path,
            final_path,
            expected_hex,
            file,
        } = self;
        drop(file);

        let mut reader = tokio::fs::File::open(&staged_path)
            .await
            .map_err(|e| DockwrightError::Storage(format!("failed to open temp file: {e}")))?;

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let n = reader
                .read(&mut buffer)
                .await
                .map_err(|e| DockwrightError::Storage(format!("failed to read temp file: {e}")))?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        if hex::encode(hasher.finalize()) != expected_hex {
            let _ = tokio::fs::remove_file(&staged_path).await;
            return Ok(false);
        }

        tokio::fs::rename(&staged_path, &final_path)
            .await
            .map_err(|e| {
                DockwrightError::Storage(format!(
                    "failed to move {} to {}: {}",
                    staged_path.display(),
                    final_path.display(),
                    e
                ))
            })?;

        Ok(true)
    }

    /// Discard the staged file.
    pub async fn abort(self) {
        let Self {
            staged_path, file, ..
        } = self;
        drop(file);
        let _ = tokio::fs::remove_file(&staged_path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::archive::{LayerEntry, write_layer};
    use tokio::io::AsyncWriteExt;

    fn storage(temp: &tempfile::TempDir) -> BlobStorage {
        BlobStorage::new(BlobLayout::new(temp.path().join("blobs"))).unwrap()
    }

    #[test]
    fn test_paths_are_content_addressed() {
        let temp = tempfile::tempdir().unwrap();
        let store = storage(&temp);
        assert_eq!(
            store.layer_path("sha256:abc"),
            temp.path().join("blobs/layers/sha256-abc.tar.gz")
        );
        assert_eq!(
            store.config_path("sha256:abc"),
            temp.path().join("blobs/configs/sha256-abc.json")
        );
    }

    #[test]
    fn test_put_and_read_blobs() {
        let temp = tempfile::tempdir().unwrap();
        let store = storage(&temp);

        let digest = store.put_config(br#"{"architecture":"amd64"}"#).unwrap();
        assert!(store.has_config(&digest));
        assert_eq!(store.read_config(&digest).unwrap(), br#"{"architecture":"amd64"}"#);

        let again = store.put_config(br#"{"architecture":"amd64"}"#).unwrap();
        assert_eq!(digest, again);

        assert!(store.read_manifest("sha256:missing").is_err());
    }

    #[tokio::test]
    async fn test_commit_layer_and_verify() {
        let temp = tempfile::tempdir().unwrap();
        let store = storage(&temp);

        let scratch = store.layer_scratch_path();
        let packed = write_layer(&[LayerEntry::directory("app", 0o755)], &scratch).unwrap();
        let path = store.commit_layer(&scratch, &packed).unwrap();

        assert!(!scratch.exists());
        assert!(path.exists());
        assert!(store.verify_layer(&packed.digest).await.unwrap());
        assert!(store.has_layers(&[packed.digest.clone()]));
    }

    #[tokio::test]
    async fn test_staged_download_rejects_wrong_content() {
        let temp = tempfile::tempdir().unwrap();
        let store = storage(&temp);
        let digest = sha256_digest(b"expected");

        let mut staged = store.stage_layer_download(&digest).await.unwrap();
        staged.file().write_all(b"something else").await.unwrap();
        staged.file().flush().await.unwrap();
        assert!(!staged.commit().await.unwrap());
        assert!(!store.has_layer(&digest));

        let mut staged = store.stage_layer_download(&digest).await.unwrap();
        staged.file().write_all(b"expected").await.unwrap();
        staged.file().flush().await.unwrap();
        assert!(staged.commit().await.unwrap());
        assert!(store.has_layer(&digest));
    }

    #[tokio::test]
    async fn test_stage_rejects_malformed_digest() {
        let temp = tempfile::tempdir().unwrap();
        let store = storage(&temp);
        assert!(store.stage_config_download("md5:abc").await.is_err());
    }
}
