//! Build context scanning.
//!
//! Splits the context directory into the dependency manifest files and the
//! remaining application payload, and digests each side separately so the
//! install step's cache key never covers payload content.

use std::fs::File;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use dockwright_shared::errors::{DockwrightError, DockwrightResult};

use crate::images::archive::{EntrySource, LayerEntry};
use crate::recipe::BuildRecipe;

/// A file or directory found in the build context.
#[derive(Debug, Clone)]
pub struct ContextEntry {
    /// Path relative to the context root, `/` separated.
    pub relative: String,
    pub mode: u32,
    pub source: EntrySource,
    /// Content digest for files, link target for symlinks, empty for dirs.
    pub content_digest: String,
}

impl ContextEntry {
    /// Layer entry placing this item under `prefix` inside the image.
    pub fn to_layer_entry(&self, prefix: &str) -> LayerEntry {
        LayerEntry {
            path: join_image_path(prefix, &self.relative),
            mode: self.mode,
            source: self.source.clone(),
        }
    }
}

/// Result of scanning a build context.
#[derive(Debug, Clone)]
pub struct BuildContext {
    root: PathBuf,
    manifest: Vec<ContextEntry>,
    payload: Vec<ContextEntry>,
    manifest_digest: String,
    payload_digest: String,
}

impl BuildContext {
    /// Walk `root` and classify its entries according to `recipe`.
    pub fn scan(root: &Path, recipe: &BuildRecipe) -> DockwrightResult<Self> {
        if !root.is_dir() {
            return Err(DockwrightError::Recipe(format!(
                "build context {} is not a directory",
                root.display()
            )));
        }

        let mut manifest = Vec::with_capacity(recipe.manifest.files.len());
        for file in &recipe.manifest.files {
            let path = root.join(file);
            if !path.is_file() {
                return Err(DockwrightError::Recipe(format!(
                    "dependency manifest '{}' not found in build context {}",
                    file,
                    root.display()
                )));
            }
            manifest.push(describe(&path, normalize(file))?);
        }
        manifest.sort_by(|a, b| a.relative.cmp(&b.relative));

        let manifest_names: Vec<&str> = manifest.iter().map(|e| e.relative.as_str()).collect();
        let mut payload = Vec::new();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| {
                let relative = relative_path(root, entry.path());
                !is_excluded(&relative, &recipe.exclude)
            });

        for entry in walker {
            let entry = entry.map_err(|e| {
                DockwrightError::Recipe(format!("failed to walk build context: {e}"))
            })?;
            let relative = relative_path(root, entry.path());
            if manifest_names.contains(&relative.as_str()) {
                continue;
            }
            payload.push(describe(entry.path(), relative)?);
        }

        let manifest_digest = digest_entries(&manifest);
        let payload_digest = digest_entries(&payload);

        tracing::debug!(
            context = %root.display(),
            manifest_files = manifest.len(),
            payload_entries = payload.len(),
            manifest_digest = %manifest_digest,
            payload_digest = %payload_digest,
            "Scanned build context"
        );

        Ok(Self {
            root: root.to_path_buf(),
            manifest,
            payload,
            manifest_digest,
            payload_digest,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_files(&self) -> &[ContextEntry] {
        &self.manifest
    }

    pub fn payload_files(&self) -> &[ContextEntry] {
        &self.payload
    }

    pub fn manifest_digest(&self) -> &str {
        &self.manifest_digest
    }

    pub fn payload_digest(&self) -> &str {
        &self.payload_digest
    }

    pub fn contains(&self, relative: &str) -> bool {
        let wanted = normalize(relative);
        self.manifest
            .iter()
            .chain(self.payload.iter())
            .any(|e| e.relative == wanted)
    }
}

/// Join an absolute image directory and a relative path into a layer path.
pub(crate) fn join_image_path(prefix: &str, relative: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        relative.to_string()
    } else {
        format!("{prefix}/{relative}")
    }
}

fn normalize(path: &str) -> String {
    path.trim_start_matches("./").trim_end_matches('/').to_string()
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Excludes without a slash match any path component; others match the
/// path itself or anything beneath it.
fn is_excluded(relative: &str, excludes: &[String]) -> bool {
    excludes.iter().any(|pattern| {
        let pattern = normalize(pattern);
        if pattern.contains('/') {
            relative == pattern || relative.starts_with(&format!("{pattern}/"))
        } else {
            relative.split('/').any(|component| component == pattern)
        }
    })
}

fn describe(path: &Path, relative: String) -> DockwrightResult<ContextEntry> {
    let metadata = std::fs::symlink_metadata(path).map_err(|e| {
        DockwrightError::Recipe(format!("failed to stat {}: {}", path.display(), e))
    })?;
    let mode = metadata.permissions().mode() & 0o7777;
    let file_type = metadata.file_type();

    let (source, content_digest) = if file_type.is_symlink() {
        let target = std::fs::read_link(path).map_err(|e| {
            DockwrightError::Recipe(format!("failed to read link {}: {}", path.display(), e))
        })?;
        let digest = target.to_string_lossy().into_owned();
        (EntrySource::Symlink(target), digest)
    } else if file_type.is_dir() {
        (EntrySource::Directory, String::new())
    } else if file_type.is_file() {
        (EntrySource::File(path.to_path_buf()), hash_file(path)?)
    } else {
        return Err(DockwrightError::Recipe(format!(
            "unsupported file type in build context: {}",
            path.display()
        )));
    };

    Ok(ContextEntry {
        relative,
        mode,
        source,
        content_digest,
    })
}

fn hash_file(path: &Path) -> DockwrightResult<String> {
    let mut file = File::open(path).map_err(|e| {
        DockwrightError::Recipe(format!("failed to open {}: {}", path.display(), e))
    })?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn digest_entries(entries: &[ContextEntry]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        let kind = match entry.source {
            EntrySource::Directory => "d",
            EntrySource::Symlink(_) => "l",
            _ => "f",
        };
        hasher.update(format!("{}\0{}\0{:o}\0{}\n", kind, entry.relative, entry.mode, entry.content_digest));
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> tempfile::TempDir {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        std::fs::write(root.join("requirements.txt"), "streamlit==1.36.0\n").unwrap();
        std::fs::write(root.join("streamlit_app.py"), "print('hi')\n").unwrap();
        std::fs::create_dir_all(root.join("pages")).unwrap();
        std::fs::write(root.join("pages/1_Overview.py"), "x = 1\n").unwrap();
        std::fs::create_dir_all(root.join("__pycache__")).unwrap();
        std::fs::write(root.join("__pycache__/app.pyc"), "junk").unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join(".git/HEAD"), "ref").unwrap();
        temp
    }

    #[test]
    fn test_manifest_separated_from_payload() {
        let temp = project();
        let context = BuildContext::scan(temp.path(), &BuildRecipe::default()).unwrap();

        let manifest: Vec<&str> = context.manifest_files().iter().map(|e| e.relative.as_str()).collect();
        assert_eq!(manifest, vec!["requirements.txt"]);

        let payload: Vec<&str> = context.payload_files().iter().map(|e| e.relative.as_str()).collect();
        assert_eq!(payload, vec!["pages", "pages/1_Overview.py", "streamlit_app.py"]);
        assert!(context.contains("./streamlit_app.py"));
    }

    #[test]
    fn test_payload_edit_leaves_manifest_digest() {
        let temp = project();
        let recipe = BuildRecipe::default();
        let before = BuildContext::scan(temp.path(), &recipe).unwrap();

        std::fs::write(temp.path().join("streamlit_app.py"), "print('changed')\n").unwrap();
        let after = BuildContext::scan(temp.path(), &recipe).unwrap();

        assert_eq!(before.manifest_digest(), after.manifest_digest());
        assert_ne!(before.payload_digest(), after.payload_digest());
    }

    #[test]
    fn test_manifest_edit_changes_manifest_digest() {
        let temp = project();
        let recipe = BuildRecipe::default();
        let before = BuildContext::scan(temp.path(), &recipe).unwrap();

        std::fs::write(temp.path().join("requirements.txt"), "streamlit==1.37.0\n").unwrap();
        let after = BuildContext::scan(temp.path(), &recipe).unwrap();

        assert_ne!(before.manifest_digest(), after.manifest_digest());
        assert_eq!(before.payload_digest(), after.payload_digest());
    }

    #[test]
    fn test_missing_manifest_is_recipe_error() {
        let temp = tempfile::tempdir().unwrap();
        let err = BuildContext::scan(temp.path(), &BuildRecipe::default()).unwrap_err();
        assert!(matches!(err, DockwrightError::Recipe(_)));
        assert!(err.to_string().contains("requirements.txt"));
    }

    #[test]
    fn test_exclude_matching() {
        let excludes = vec![".git".to_string(), "data/raw".to_string()];
        assert!(is_excluded(".git", &excludes));
        assert!(is_excluded("sub/.git/config", &excludes));
        assert!(is_excluded("data/raw/file.csv", &excludes));
        assert!(!is_excluded("data/rawfile.csv", &excludes));
        assert!(!is_excluded("gitignore", &excludes));
    }

    #[test]
    fn test_layer_entry_prefix() {
        assert_eq!(join_image_path("/app", "pages/a.py"), "app/pages/a.py");
        assert_eq!(join_image_path("/", "a.py"), "a.py");
    }
}
