//! Base image fetching.

use async_trait::async_trait;
use oci_client::Reference;
use oci_client::manifest::{ImageIndexEntry, OciDescriptor, OciImageIndex, OciManifest};
use oci_client::secrets::RegistryAuth;

use dockwright_shared::constants::media_types;
use dockwright_shared::errors::{DockwrightError, DockwrightResult};

use crate::recipe::BaseImageRef;

use super::config::ImageRuntimeConfig;
use super::manifest::{HistoryEntry, ImageConfigDocument};
use super::storage::BlobStorage;

/// A base layer blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseLayer {
    pub digest: String,
    pub size: u64,
    pub media_type: String,
}

/// A resolved base runtime whose blobs are present in storage.
#[derive(Debug, Clone)]
pub struct BaseImage {
    /// Canonical reference.
    pub reference: String,
    pub manifest_digest: String,
    pub config_digest: String,
    pub layers: Vec<BaseLayer>,
    pub diff_ids: Vec<String>,
    pub architecture: String,
    pub os: String,
    pub runtime: ImageRuntimeConfig,
    pub history: Vec<HistoryEntry>,
}

impl BaseImage {
    /// Assemble from a stored config blob.
    pub fn from_stored_config(
        reference: String,
        manifest_digest: String,
        config_digest: String,
        layers: Vec<BaseLayer>,
        storage: &BlobStorage,
    ) -> DockwrightResult<Self> {
        let bytes = storage.read_config(&config_digest)?;

        let oci_config: oci_spec::image::ImageConfiguration = serde_json::from_slice(&bytes)
            .map_err(|e| {
                DockwrightError::Fetch(format!("invalid base image config {config_digest}: {e}"))
            })?;
        let document: ImageConfigDocument = serde_json::from_slice(&bytes)?;

        let runtime = ImageRuntimeConfig::from_oci_config(&oci_config)?;
        let diff_ids = oci_config.rootfs().diff_ids().clone();

        if diff_ids.len() != layers.len() {
            return Err(DockwrightError::Fetch(format!(
                "base image {} lists {} layers but {} diff ids",
                reference,
                layers.len(),
                diff_ids.len()
            )));
        }

        Ok(Self {
            reference,
            manifest_digest,
            config_digest,
            layers,
            diff_ids,
            architecture: oci_config.architecture().to_string(),
            os: oci_config.os().to_string(),
            runtime,
            history: document.history,
        })
    }

    pub fn layer_digests(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.digest.clone()).collect()
    }
}

/// Resolves a pinned reference into a base image stored in `storage`.
#[async_trait]
pub trait BaseFetcher: Send + Sync {
    async fn fetch(
        &self,
        reference: &BaseImageRef,
        storage: &BlobStorage,
    ) -> DockwrightResult<BaseImage>;
}

/// Pulls base images from an OCI registry.
pub struct RegistryFetcher {
    client: oci_client::Client,
    auth: RegistryAuth,
}

impl Default for RegistryFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryFetcher {
    pub fn new() -> Self {
        Self {
            client: oci_client::Client::new(Default::default()),
            auth: RegistryAuth::Anonymous,
        }
    }

    pub fn with_basic_auth(username: String, password: String) -> Self {
        Self {
            client: oci_client::Client::new(Default::default()),
            auth: RegistryAuth::Basic(username, password),
        }
    }

    fn detect_platform() -> (&'static str, &'static str) {
        let arch = match std::env::consts::ARCH {
            "aarch64" => "arm64",
            "x86_64" => "amd64",
            "x86" => "386",
            "arm" => "arm",
            other => other,
        };
        ("linux", arch)
    }

    fn select_platform<'a>(index: &'a OciImageIndex) -> DockwrightResult<&'a ImageIndexEntry> {
        let (os, arch) = Self::detect_platform();
        index
            .manifests
            .iter()
            .find(|m| {
                m.platform
                    .as_ref()
                    .is_some_and(|p| p.os == os && p.architecture == arch)
            })
            .ok_or_else(|| {
                let available = index
                    .manifests
                    .iter()
                    .filter_map(|m| {
                        m.platform
                            .as_ref()
                            .map(|p| format!("{}/{}", p.os, p.architecture))
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                DockwrightError::Fetch(format!(
                    "no image for platform {os}/{arch}. Available platforms: {available}"
                ))
            })
    }

    async fn pull_image_manifest(
        &self,
        reference: &Reference,
    ) -> DockwrightResult<(oci_client::manifest::OciImageManifest, String)> {
        let (manifest, digest) = self
            .client
            .pull_manifest(reference, &self.auth)
            .await
            .map_err(|e| DockwrightError::Fetch(format!("failed to pull manifest: {e}")))?;

        match manifest {
            OciManifest::Image(image) => Ok((image, digest)),
            OciManifest::ImageIndex(index) => {
                let entry = Self::select_platform(&index)?;
                tracing::debug!(
                    digest = %entry.digest,
                    "Image index detected, pulling platform manifest"
                );

                let platform_ref: Reference = format!(
                    "{}/{}@{}",
                    reference.registry(),
                    reference.repository(),
                    entry.digest
                )
                .parse()
                .map_err(|e| DockwrightError::Fetch(format!("invalid platform reference: {e}")))?;

                let (platform_manifest, platform_digest) = self
                    .client
                    .pull_manifest(&platform_ref, &self.auth)
                    .await
                    .map_err(|e| {
                        DockwrightError::Fetch(format!("failed to pull platform manifest: {e}"))
                    })?;

                match platform_manifest {
                    OciManifest::Image(image) => Ok((image, platform_digest)),
                    OciManifest::ImageIndex(_) => Err(DockwrightError::Fetch(
                        "platform manifest is a nested index".to_string(),
                    )),
                }
            }
        }
    }

    async fn download_blob(
        &self,
        reference: &Reference,
        digest: &str,
        media_type: &str,
        storage: &BlobStorage,
        is_layer: bool,
    ) -> DockwrightResult<()> {
        let present = if is_layer {
            storage.has_layer(digest) && storage.verify_layer(digest).await?
        } else {
            storage.has_config(digest)
        };
        if present {
            tracing::debug!(digest, "Blob already present");
            return Ok(());
        }

        tracing::info!(digest, "Downloading blob");

        let mut staged = if is_layer {
            storage.stage_layer_download(digest).await?
        } else {
            storage.stage_config_download(digest).await?
        };

        let descriptor = OciDescriptor {
            digest: digest.to_string(),
            media_type: media_type.to_string(),
            size: 0,
            urls: None,
            annotations: None,
        };

        if let Err(e) = self
            .client
            .pull_blob(reference, &descriptor, staged.file())
            .await
        {
            staged.abort().await;
            return Err(DockwrightError::Fetch(format!("failed to pull blob {digest}: {e}")));
        }

        if !staged.commit().await? {
            return Err(DockwrightError::Fetch(format!(
                "blob {digest} failed integrity verification"
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl BaseFetcher for RegistryFetcher {
    async fn fetch(
        &self,
        base: &BaseImageRef,
        storage: &BlobStorage,
    ) -> DockwrightResult<BaseImage> {
        let reference = base.reference();
        tracing::info!(image = %base.canonical(), "Pulling base image");

        let (manifest, manifest_digest) = self.pull_image_manifest(reference).await?;

        let layers: Vec<BaseLayer> = manifest
            .layers
            .iter()
            .map(|l| BaseLayer {
                digest: l.digest.clone(),
                size: l.size.max(0) as u64,
                media_type: l.media_type.clone(),
            })
            .collect();

        let downloads = layers
            .iter()
            .map(|l| self.download_blob(reference, &l.digest, &l.media_type, storage, true));
        futures::future::try_join_all(downloads).await?;

        self.download_blob(
            reference,
            &manifest.config.digest,
            media_types::IMAGE_CONFIG,
            storage,
            false,
        )
        .await?;

        BaseImage::from_stored_config(
            base.canonical(),
            manifest_digest,
            manifest.config.digest.clone(),
            layers,
            storage,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::layout::BlobLayout;

    #[test]
    fn test_from_stored_config_checks_layer_count() {
        let temp = tempfile::tempdir().unwrap();
        let storage = BlobStorage::new(BlobLayout::new(temp.path().to_path_buf())).unwrap();
        let config = br#"{"architecture":"amd64","os":"linux","config":{"Cmd":["python3"]},"rootfs":{"type":"layers","diff_ids":["sha256:aa"]},"history":[{"created_by":"base"}]}"#;
        let digest = storage.put_config(config).unwrap();

        let layer = BaseLayer {
            digest: "sha256:bb".into(),
            size: 1,
            media_type: media_types::LAYER_GZIP.into(),
        };

        let base = BaseImage::from_stored_config(
            "docker.io/library/python:3.11.9-slim".into(),
            "sha256:m".into(),
            digest.clone(),
            vec![layer],
            &storage,
        )
        .unwrap();
        assert_eq!(base.architecture, "amd64");
        assert_eq!(base.runtime.cmd, vec!["python3"]);
        assert_eq!(base.history.len(), 1);

        let err = BaseImage::from_stored_config(
            "x".into(),
            "sha256:m".into(),
            digest,
            vec![],
            &storage,
        )
        .unwrap_err();
        assert!(matches!(err, DockwrightError::Fetch(_)));
    }

    #[test]
    fn test_detect_platform_is_linux() {
        let (os, arch) = RegistryFetcher::detect_platform();
        assert_eq!(os, "linux");
        assert!(!arch.is_empty());
    }
}
