//! Streaming OCI layer applier.
//!
//! Runs unprivileged: ownership is not restored and device nodes are
//! skipped, which is enough for a staging root filesystem whose only job is
//! to host run steps.

use std::collections::{HashSet, VecDeque};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{self, BufReader, Read};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use filetime::{FileTime, set_file_mtime, set_symlink_file_times};
use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::{debug, trace};
use walkdir::WalkDir;

use dockwright_shared::errors::{DockwrightError, DockwrightResult};

use super::{OPAQUE_WHITEOUT, WHITEOUT_PREFIX};

/// Symlinks followed while resolving one path, as `ELOOP` on Linux.
const MAX_SYMLINK_HOPS: usize = 40;

/// Apply a layer file into `dest`, detecting gzip by its magic bytes.
pub fn apply_layer_file(layer_path: &Path, dest: &Path) -> DockwrightResult<u64> {
    let open = || {
        File::open(layer_path).map_err(|e| {
            DockwrightError::Storage(format!(
                "failed to open layer {}: {}",
                layer_path.display(),
                e
            ))
        })
    };

    let mut magic = [0u8; 2];
    let is_gzip = match open()?.read_exact(&mut magic) {
        Ok(()) => magic == [0x1f, 0x8b],
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => false,
        Err(e) => {
            return Err(DockwrightError::Storage(format!(
                "failed to read layer header {}: {}",
                layer_path.display(),
                e
            )));
        }
    };

    let reader: Box<dyn Read> = if is_gzip {
        Box::new(GzDecoder::new(BufReader::new(open()?)))
    } else {
        debug!(layer = %layer_path.display(), "Layer is not gzip-compressed");
        Box::new(BufReader::new(open()?))
    };

    apply_layer(reader, dest)
}

/// Apply a tar stream into `dest`, processing whiteouts inline.
///
/// Returns the total size of the entries' content.
pub fn apply_layer<R: Read>(reader: R, dest: &Path) -> DockwrightResult<u64> {
    fs::create_dir_all(dest).map_err(|e| {
        DockwrightError::Storage(format!("failed to create {}: {}", dest.display(), e))
    })?;

    let mut archive = Archive::new(reader);
    let mut unpacked: HashSet<PathBuf> = HashSet::new();
    let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();
    let mut total = 0u64;

    let entries = archive
        .entries()
        .map_err(|e| DockwrightError::Storage(format!("tar read error: {e}")))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| DockwrightError::Storage(format!("tar entry error: {e}")))?;
        let raw_path = entry
            .path()
            .map_err(|e| DockwrightError::Storage(format!("tar path error: {e}")))?
            .into_owned();

        let Some(relative) = normalize_entry_path(&raw_path) else {
            debug!(path = %raw_path.display(), "Skipping entry outside root");
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }

        let full_path = contained_path(dest, &relative)?;
        let header = entry.header();
        let entry_type = header.entry_type();
        let mode = header.mode().unwrap_or(0o644) & 0o7777;
        let mtime = header.mtime().unwrap_or(0);
        total = total.saturating_add(header.size().unwrap_or(0));

        if handle_whiteout(&full_path, &unpacked, entry_type)? {
            continue;
        }

        ensure_parent(&full_path)?;
        remove_existing(&full_path, entry_type)?;

        match entry_type {
            EntryType::Directory => {
                if !full_path.is_dir() {
                    fs::create_dir(&full_path).map_err(|e| io_error("create dir", &full_path, e))?;
                }
                dir_modes.push((full_path.clone(), mode));
            }
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                let mut file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(mode | 0o200)
                    .open(&full_path)
                    .map_err(|e| io_error("create file", &full_path, e))?;
                io::copy(&mut entry, &mut file).map_err(|e| io_error("write", &full_path, e))?;
                drop(file);
                fs::set_permissions(&full_path, Permissions::from_mode(mode))
                    .map_err(|e| io_error("chmod", &full_path, e))?;
                let _ = set_file_mtime(&full_path, FileTime::from_unix_time(mtime as i64, 0));
            }
            EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(|e| DockwrightError::Storage(format!("tar link error: {e}")))?
                    .ok_or_else(|| {
                        DockwrightError::Storage(format!(
                            "symlink without target: {}",
                            raw_path.display()
                        ))
                    })?
                    .into_owned();
                std::os::unix::fs::symlink(&target, &full_path)
                    .map_err(|e| io_error("symlink", &full_path, e))?;
                let time = FileTime::from_unix_time(mtime as i64, 0);
                let _ = set_symlink_file_times(&full_path, time, time);
            }
            EntryType::Link => {
                let target = entry
                    .link_name()
                    .map_err(|e| DockwrightError::Storage(format!("tar link error: {e}")))?
                    .and_then(|p| normalize_entry_path(&p))
                    .filter(|p| !p.as_os_str().is_empty())
                    .ok_or_else(|| {
                        DockwrightError::Storage(format!(
                            "hardlink without target: {}",
                            raw_path.display()
                        ))
                    })?;
                let target_path = contained_path(dest, &target)?;
                if target_path.exists() {
                    fs::hard_link(&target_path, &full_path)
                        .map_err(|e| io_error("hardlink", &full_path, e))?;
                } else {
                    trace!(path = %full_path.display(), "Skipping hardlink with missing target");
                }
            }
            EntryType::Block | EntryType::Char | EntryType::Fifo => {
                trace!(path = %full_path.display(), "Skipping device node");
                continue;
            }
            EntryType::XGlobalHeader | EntryType::XHeader => continue,
            other => {
                return Err(DockwrightError::Storage(format!(
                    "unhandled tar entry type {:?} for {}",
                    other,
                    raw_path.display()
                )));
            }
        }

        unpacked.insert(full_path);
    }

    // Deepest first so a read-only parent does not block its children.
    dir_modes.sort_unstable_by(|a, b| b.0.cmp(&a.0));
    for (dir, mode) in dir_modes {
        if dir.is_dir() {
            fs::set_permissions(&dir, Permissions::from_mode(mode | 0o700))
                .map_err(|e| io_error("chmod", &dir, e))?;
        }
    }

    Ok(total)
}

fn io_error(action: &str, path: &Path, e: io::Error) -> DockwrightError {
    DockwrightError::Storage(format!("failed to {} {}: {}", action, path.display(), e))
}

fn normalize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                components.pop()?;
            }
            Component::Normal(c) => components.push(c.to_os_string()),
        }
    }
    Some(components.into_iter().collect())
}

/// Resolve `relative` under `root` the way a chroot would.
///
/// Symlinks met along the way are followed inside `root`: absolute targets
/// restart at `root` and `..` never climbs above it. Components that do not
/// exist yet are kept as they are.
fn resolve_in_root(root: &Path, relative: &Path) -> DockwrightResult<PathBuf> {
    let mut pending: VecDeque<OsString> = path_parts(relative).collect();
    let mut resolved = PathBuf::new();
    let mut hops = 0;

    while let Some(part) = pending.pop_front() {
        if part == ".." {
            resolved.pop();
            continue;
        }

        let candidate = resolved.join(&part);
        let on_disk = root.join(&candidate);
        match fs::symlink_metadata(&on_disk) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(DockwrightError::Storage(format!(
                        "too many levels of symbolic links resolving {}",
                        relative.display()
                    )));
                }
                let target = fs::read_link(&on_disk).map_err(|e| io_error("readlink", &on_disk, e))?;
                if target.is_absolute() {
                    resolved = PathBuf::new();
                }
                let parts: Vec<OsString> = path_parts(&target).collect();
                for part in parts.into_iter().rev() {
                    pending.push_front(part);
                }
            }
            _ => resolved = candidate,
        }
    }

    Ok(root.join(resolved))
}

/// Normal components of `path`, with `..` kept as a literal part.
fn path_parts(path: &Path) -> impl Iterator<Item = OsString> + '_ {
    path.components().filter_map(|c| match c {
        Component::Normal(c) => Some(c.to_os_string()),
        Component::ParentDir => Some(OsString::from("..")),
        Component::RootDir | Component::Prefix(_) | Component::CurDir => None,
    })
}

/// Host path of a normalized entry path: its parent resolved under `dest`,
/// its final component left unresolved.
fn contained_path(dest: &Path, relative: &Path) -> DockwrightResult<PathBuf> {
    let name = relative.file_name().ok_or_else(|| {
        DockwrightError::Storage(format!("entry has no file name: {}", relative.display()))
    })?;
    let parent = resolve_in_root(dest, relative.parent().unwrap_or(Path::new("")))?;
    Ok(parent.join(name))
}

fn ensure_parent(path: &Path) -> DockwrightResult<()> {
    if let Some(parent) = path.parent() {
        if let Ok(meta) = fs::symlink_metadata(parent)
            && !meta.is_dir()
        {
            fs::remove_file(parent).map_err(|e| io_error("replace", parent, e))?;
        }
        fs::create_dir_all(parent).map_err(|e| io_error("create dir", parent, e))?;
    }
    Ok(())
}

fn remove_existing(path: &Path, entry_type: EntryType) -> DockwrightResult<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            if meta.is_dir() && entry_type == EntryType::Directory {
                return Ok(());
            }
            if meta.is_dir() {
                fs::remove_dir_all(path)
            } else {
                fs::remove_file(path)
            }
            .map_err(|e| io_error("remove", path, e))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error("stat", path, e)),
    }
}

fn handle_whiteout(
    path: &Path,
    unpacked: &HashSet<PathBuf>,
    entry_type: EntryType,
) -> DockwrightResult<bool> {
    if entry_type != EntryType::Regular {
        return Ok(false);
    }
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(false);
    };
    let Some(parent) = path.parent() else {
        return Ok(false);
    };

    if name == OPAQUE_WHITEOUT {
        if parent.is_dir() {
            for entry in WalkDir::new(parent).min_depth(1).max_depth(1) {
                let Ok(entry) = entry else { continue };
                if unpacked.contains(entry.path()) {
                    continue;
                }
                remove_any(entry.path());
            }
        }
        return Ok(true);
    }

    if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
        if target.is_empty() || target == "." || target == ".." {
            debug!(path = %path.display(), "Ignoring malformed whiteout");
            return Ok(true);
        }
        let target = parent.join(target);
        if fs::symlink_metadata(&target).is_ok() {
            remove_any(&target);
            debug!(path = %target.display(), "Whiteout removed");
        }
        return Ok(true);
    }

    Ok(false)
}

fn remove_any(path: &Path) {
    let is_dir = fs::symlink_metadata(path).map(|m| m.is_dir()).unwrap_or(false);
    let _ = if is_dir {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
}
