use std::path::PathBuf;

/// Removes a build's staging directory on every exit path.
///
/// While armed, dropping the guard also logs that the build failed. Call
/// [`BuildGuard::disarm`] once the image has been recorded.
pub struct BuildGuard {
    build_id: String,
    staging_dir: PathBuf,
    armed: bool,
}

impl BuildGuard {
    pub fn new(build_id: impl Into<String>, staging_dir: PathBuf) -> Self {
        Self {
            build_id: build_id.into(),
            staging_dir,
            armed: true,
        }
    }

    pub fn staging_dir(&self) -> &std::path::Path {
        &self.staging_dir
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(build_id = %self.build_id, "Build failed, cleaning up staging");
        }

        if self.staging_dir.exists()
            && let Err(e) = remove_tree(&self.staging_dir)
        {
            tracing::warn!(
                build_id = %self.build_id,
                path = %self.staging_dir.display(),
                "Failed to remove staging directory: {}",
                e
            );
        }
    }
}

/// Remove a directory tree, restoring owner write permission where a read-only
/// directory would otherwise block removal.
fn remove_tree(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            for entry in walkdir::WalkDir::new(path).into_iter().flatten() {
                if entry.file_type().is_dir() {
                    let mut perms = entry.metadata().map_err(std::io::Error::other)?.permissions();
                    perms.set_mode(perms.mode() | 0o700);
                    let _ = std::fs::set_permissions(entry.path(), perms);
                }
            }
            std::fs::remove_dir_all(path)
        }
        Err(e) => Err(e),
    }
}
