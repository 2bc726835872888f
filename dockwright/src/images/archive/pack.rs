//! Reproducible layer packing.
//!
//! Entries are sorted by path and written with zeroed timestamps and root
//! ownership; the gzip header carries no mtime or file name. The same entries
//! always produce the same bytes.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use flate2::{Compression, GzBuilder};
use sha2::{Digest, Sha256};
use tar::{EntryType, Header};

use dockwright_shared::errors::{DockwrightError, DockwrightResult};

use super::{EntrySource, LayerEntry};

/// Digests and size of a layer written by [`write_layer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedLayer {
    /// sha256 of the compressed blob.
    pub digest: String,
    /// sha256 of the uncompressed tar stream.
    pub diff_id: String,
    /// Compressed size in bytes.
    pub size: u64,
}

/// Writer that hashes and counts everything passing through it.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> (W, String, u64) {
        let digest = format!("sha256:{}", hex::encode(self.hasher.finalize()));
        (self.inner, digest, self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn base_header(entry_type: EntryType, mode: u32, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_size(size);
    header
}

fn pack_error(path: &str, e: impl std::fmt::Display) -> DockwrightError {
    DockwrightError::Storage(format!("failed to pack layer entry {path}: {e}"))
}

/// Write `entries` as a gzip tar layer at `dest`.
pub fn write_layer(entries: &[LayerEntry], dest: &Path) -> DockwrightResult<PackedLayer> {
    let mut sorted: Vec<&LayerEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));
    sorted.dedup_by(|a, b| a.path == b.path);

    let file = File::create(dest).map_err(|e| {
        DockwrightError::Storage(format!("failed to create layer {}: {}", dest.display(), e))
    })?;

    let compressed = HashingWriter::new(file);
    let encoder = GzBuilder::new()
        .mtime(0)
        .write(compressed, Compression::default());
    let uncompressed = HashingWriter::new(encoder);
    let mut builder = tar::Builder::new(uncompressed);

    for entry in sorted {
        let path = entry.archive_path();
        match &entry.source {
            EntrySource::Directory => {
                let mut header = base_header(EntryType::Directory, entry.mode, 0);
                builder
                    .append_data(&mut header, &path, io::empty())
                    .map_err(|e| pack_error(&path, e))?;
            }
            EntrySource::File(source) => {
                let file = File::open(source).map_err(|e| pack_error(&path, e))?;
                let size = file.metadata().map_err(|e| pack_error(&path, e))?.len();
                let mut header = base_header(EntryType::Regular, entry.mode, size);
                builder
                    .append_data(&mut header, &path, file)
                    .map_err(|e| pack_error(&path, e))?;
            }
            EntrySource::Bytes(content) => {
                let mut header =
                    base_header(EntryType::Regular, entry.mode, content.len() as u64);
                builder
                    .append_data(&mut header, &path, content.as_slice())
                    .map_err(|e| pack_error(&path, e))?;
            }
            EntrySource::Symlink(target) => {
                let mut header = base_header(EntryType::Symlink, 0o777, 0);
                builder
                    .append_link(&mut header, &path, target)
                    .map_err(|e| pack_error(&path, e))?;
            }
            EntrySource::Whiteout => {
                let mut header = base_header(EntryType::Regular, 0o644, 0);
                builder
                    .append_data(&mut header, &path, io::empty())
                    .map_err(|e| pack_error(&path, e))?;
            }
        }
    }

    let uncompressed = builder
        .into_inner()
        .map_err(|e| DockwrightError::Storage(format!("failed to finish layer tar: {e}")))?;
    let (encoder, diff_id, _) = uncompressed.finish();
    let compressed = encoder
        .finish()
        .map_err(|e| DockwrightError::Storage(format!("failed to finish layer gzip: {e}")))?;
    let (file, digest, size) = compressed.finish();
    file.sync_all()?;

    tracing::trace!(
        layer = %dest.display(),
        digest = %digest,
        diff_id = %diff_id,
        size,
        "Packed layer"
    );

    Ok(PackedLayer {
        digest,
        diff_id,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    fn sample_entries(content: &str) -> Vec<LayerEntry> {
        vec![
            LayerEntry::bytes("app/streamlit_app.py", 0o644, content.as_bytes().to_vec()),
            LayerEntry::directory("app", 0o755),
            LayerEntry {
                path: "app/current".into(),
                mode: 0o777,
                source: EntrySource::Symlink("streamlit_app.py".into()),
            },
            LayerEntry::whiteout("app/old.py"),
        ]
    }

    #[test]
    fn test_same_entries_same_bytes() {
        let temp = tempfile::tempdir().unwrap();
        let a = write_layer(&sample_entries("x"), &temp.path().join("a.tar.gz")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let b = write_layer(&sample_entries("x"), &temp.path().join("b.tar.gz")).unwrap();

        assert_eq!(a, b);
        assert_eq!(
            std::fs::read(temp.path().join("a.tar.gz")).unwrap(),
            std::fs::read(temp.path().join("b.tar.gz")).unwrap()
        );
    }

    #[test]
    fn test_content_change_changes_digest() {
        let temp = tempfile::tempdir().unwrap();
        let a = write_layer(&sample_entries("x"), &temp.path().join("a.tar.gz")).unwrap();
        let b = write_layer(&sample_entries("y"), &temp.path().join("b.tar.gz")).unwrap();
        assert_ne!(a.digest, b.digest);
        assert_ne!(a.diff_id, b.diff_id);
    }

    #[test]
    fn test_digest_matches_file_and_headers_are_normalized() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("layer.tar.gz");
        let packed = write_layer(&sample_entries("x"), &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(packed.digest, crate::util::sha256_digest(&bytes));
        assert_eq!(packed.size, bytes.len() as u64);

        let mut archive = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                assert_eq!(e.header().mtime().unwrap(), 0);
                assert_eq!(e.header().uid().unwrap(), 0);
                e.path().unwrap().to_string_lossy().into_owned()
            })
            .collect();
        assert_eq!(
            names,
            vec!["app", "app/current", "app/.wh.old.py", "app/streamlit_app.py"]
        );
    }
}
