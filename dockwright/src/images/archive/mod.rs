//! Layer archives.
//!
//! `pack` writes reproducible gzip tar layers from a list of entries;
//! `apply` unpacks OCI layers into a directory, handling whiteouts inline.

mod apply;
mod pack;

use std::path::PathBuf;

pub use apply::{apply_layer, apply_layer_file};
pub use pack::{PackedLayer, write_layer};

/// Prefix marking a deleted path in a layer.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Marker hiding all lower-layer content of its directory.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Where a layer entry's content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySource {
    Directory,
    /// Regular file read from the host path at pack time.
    File(PathBuf),
    /// Regular file with inline content.
    Bytes(Vec<u8>),
    Symlink(PathBuf),
    /// Deletion of the entry's path from lower layers.
    Whiteout,
}

/// One entry of a layer, addressed by its path inside the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerEntry {
    /// Relative path inside the image, `/` separated, no leading slash.
    pub path: String,
    pub mode: u32,
    pub source: EntrySource,
}

impl LayerEntry {
    pub fn directory(path: impl Into<String>, mode: u32) -> Self {
        Self {
            path: path.into(),
            mode,
            source: EntrySource::Directory,
        }
    }

    pub fn bytes(path: impl Into<String>, mode: u32, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            mode,
            source: EntrySource::Bytes(content.into()),
        }
    }

    pub fn whiteout(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: 0o644,
            source: EntrySource::Whiteout,
        }
    }

    /// Path written into the tar stream.
    pub(crate) fn archive_path(&self) -> String {
        match self.source {
            EntrySource::Whiteout => match self.path.rsplit_once('/') {
                Some((parent, name)) => format!("{parent}/{WHITEOUT_PREFIX}{name}"),
                None => format!("{WHITEOUT_PREFIX}{}", self.path),
            },
            _ => self.path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whiteout_archive_path() {
        assert_eq!(LayerEntry::whiteout("app/old.py").archive_path(), "app/.wh.old.py");
        assert_eq!(LayerEntry::whiteout("top").archive_path(), ".wh.top");
        assert_eq!(LayerEntry::directory("app", 0o755).archive_path(), "app");
    }
}
