//! Root filesystem snapshots for run steps.
//!
//! A run step's layer is the difference between the staged root filesystem
//! before and after the command.

use std::collections::BTreeMap;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use dockwright_shared::errors::{DockwrightError, DockwrightResult};

use crate::images::archive::{EntrySource, LayerEntry};

/// Paths whose content belongs to the sandbox, not the image.
const SKIPPED: &[&str] = &["proc", "sys", "dev", "tmp", "etc/resolv.conf", "etc/hosts"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Dir,
    File,
    Symlink,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Stamp {
    kind: Kind,
    mode: u32,
    size: u64,
    mtime: i64,
    mtime_nsec: i64,
    ino: u64,
    link: Option<PathBuf>,
}

/// Metadata of every path under a root filesystem.
#[derive(Debug, Default)]
pub struct FsSnapshot {
    entries: BTreeMap<String, Stamp>,
}

impl FsSnapshot {
    pub fn capture(root: &Path) -> DockwrightResult<Self> {
        let mut entries = BTreeMap::new();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !is_skipped(&relative(root, e.path())));

        for entry in walker {
            let entry = entry.map_err(|e| {
                DockwrightError::Execution(format!("failed to snapshot {}: {}", root.display(), e))
            })?;
            let meta = entry.metadata().map_err(|e| {
                DockwrightError::Execution(format!(
                    "failed to stat {}: {}",
                    entry.path().display(),
                    e
                ))
            })?;

            let file_type = entry.file_type();
            let kind = if file_type.is_dir() {
                Kind::Dir
            } else if file_type.is_symlink() {
                Kind::Symlink
            } else if file_type.is_file() {
                Kind::File
            } else {
                Kind::Other
            };

            let link = if kind == Kind::Symlink {
                std::fs::read_link(entry.path()).ok()
            } else {
                None
            };

            entries.insert(
                relative(root, entry.path()),
                Stamp {
                    kind,
                    mode: meta.permissions().mode() & 0o7777,
                    size: meta.len(),
                    mtime: meta.mtime(),
                    mtime_nsec: meta.mtime_nsec(),
                    ino: meta.ino(),
                    link,
                },
            );
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Layer entries turning `self` into `after`, reading content from `root`.
    pub fn diff(&self, after: &FsSnapshot, root: &Path) -> Vec<LayerEntry> {
        let mut changes = Vec::new();

        for (path, stamp) in &after.entries {
            if self.entries.get(path) == Some(stamp) {
                continue;
            }
            let source = match stamp.kind {
                Kind::Dir => EntrySource::Directory,
                Kind::File => EntrySource::File(root.join(path)),
                Kind::Symlink => match &stamp.link {
                    Some(target) => EntrySource::Symlink(target.clone()),
                    None => continue,
                },
                Kind::Other => {
                    tracing::debug!(path = %path, "Skipping special file in run step output");
                    continue;
                }
            };
            changes.push(LayerEntry {
                path: path.clone(),
                mode: stamp.mode,
                source,
            });
        }

        for path in self.entries.keys() {
            if after.entries.contains_key(path) {
                continue;
            }
            let parent_also_deleted = ancestors(path)
                .any(|a| self.entries.contains_key(a) && !after.entries.contains_key(a));
            if !parent_also_deleted {
                changes.push(LayerEntry::whiteout(path.clone()));
            }
        }

        changes
    }
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

fn is_skipped(relative: &str) -> bool {
    SKIPPED.contains(&relative)
}

fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').map(move |(i, _)| &path[..i])
}
