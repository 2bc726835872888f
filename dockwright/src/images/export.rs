//! OCI image layout export.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use dockwright_shared::constants::media_types;
use dockwright_shared::errors::{DockwrightError, DockwrightResult};

use crate::util::digest_hex;

use super::index::BuiltImage;
use super::manifest::{Descriptor, ImageManifest};
use super::storage::BlobStorage;

const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OciLayoutFile {
    image_layout_version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LayoutIndex {
    schema_version: u32,
    media_type: &'static str,
    manifests: Vec<Descriptor>,
}

/// Write `image` as an OCI image layout in `dest`.
///
/// The directory can be loaded with `skopeo copy oci:<dest> ...` or
/// `podman load`.
pub fn export_oci_layout(
    storage: &BlobStorage,
    image: &BuiltImage,
    dest: &Path,
) -> DockwrightResult<()> {
    let blobs_dir = dest.join("blobs").join("sha256");
    std::fs::create_dir_all(&blobs_dir).map_err(|e| {
        DockwrightError::Storage(format!("failed to create {}: {}", blobs_dir.display(), e))
    })?;

    let manifest_bytes = storage.read_manifest(&image.manifest_digest)?;
    let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)?;

    write_blob(&blobs_dir, &image.manifest_digest, &manifest_bytes)?;
    write_blob(
        &blobs_dir,
        &manifest.config.digest,
        &storage.read_config(&manifest.config.digest)?,
    )?;

    for layer in &manifest.layers {
        let target = blobs_dir.join(digest_hex(&layer.digest)?);
        if target.exists() {
            continue;
        }
        std::fs::copy(storage.layer_path(&layer.digest), &target).map_err(|e| {
            DockwrightError::Storage(format!("failed to export layer {}: {}", layer.digest, e))
        })?;
    }

    let mut descriptor = Descriptor::new(
        media_types::IMAGE_MANIFEST,
        &image.manifest_digest,
        manifest_bytes.len() as u64,
    );
    descriptor.annotations = Some(BTreeMap::from([(
        REF_NAME_ANNOTATION.to_string(),
        image.tag.clone(),
    )]));

    let index = LayoutIndex {
        schema_version: 2,
        media_type: media_types::IMAGE_INDEX,
        manifests: vec![descriptor],
    };

    write_json(&dest.join("oci-layout"), &OciLayoutFile {
        image_layout_version: "1.0.0",
    })?;
    write_json(&dest.join("index.json"), &index)?;

    tracing::info!(
        tag = %image.tag,
        digest = %image.manifest_digest,
        dest = %dest.display(),
        "Exported OCI layout"
    );
    Ok(())
}

fn write_blob(blobs_dir: &Path, digest: &str, bytes: &[u8]) -> DockwrightResult<()> {
    let path = blobs_dir.join(digest_hex(digest)?);
    std::fs::write(&path, bytes)
        .map_err(|e| DockwrightError::Storage(format!("failed to write {}: {}", path.display(), e)))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> DockwrightResult<()> {
    let json = serde_json::to_vec_pretty(value)?;
    std::fs::write(path, json)
        .map_err(|e| DockwrightError::Storage(format!("failed to write {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::archive::{LayerEntry, write_layer};
    use crate::runtime::layout::BlobLayout;

    #[test]
    fn test_export_writes_layout() {
        let temp = tempfile::tempdir().unwrap();
        let storage = BlobStorage::new(BlobLayout::new(temp.path().join("blobs"))).unwrap();

        let scratch = storage.layer_scratch_path();
        let packed = write_layer(&[LayerEntry::directory("app", 0o755)], &scratch).unwrap();
        storage.commit_layer(&scratch, &packed).unwrap();

        let config_digest = storage.put_config(b"{}").unwrap();
        let manifest = ImageManifest::new(
            Descriptor::new(media_types::IMAGE_CONFIG, &config_digest, 2),
            vec![Descriptor::new(media_types::LAYER_GZIP, &packed.digest, packed.size)],
        );
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
        let manifest_digest = storage.put_manifest(&manifest_bytes).unwrap();

        let image = BuiltImage {
            tag: "dashboard:1".into(),
            build_id: "b".into(),
            manifest_digest: manifest_digest.clone(),
            manifest_size: manifest_bytes.len() as u64,
            config_digest,
            base: "python:3.11.9-slim".into(),
            layers: vec![packed.digest.clone()],
            cache_keys: vec![],
            created_at: chrono::Utc::now(),
        };

        let out = temp.path().join("out");
        export_oci_layout(&storage, &image, &out).unwrap();

        assert!(out.join("oci-layout").exists());
        let index: serde_json::Value =
            serde_json::from_slice(&std::fs::read(out.join("index.json")).unwrap()).unwrap();
        assert_eq!(index["manifests"][0]["digest"], manifest_digest);
        assert_eq!(
            index["manifests"][0]["annotations"][REF_NAME_ANNOTATION],
            "dashboard:1"
        );
        let layer_blob = out.join("blobs/sha256").join(digest_hex(&packed.digest).unwrap());
        assert!(layer_blob.exists());
    }
}
