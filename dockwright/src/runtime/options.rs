//! Options for a dockwright home.

use crate::runtime::layout::dirs as const_dirs;
use dirs::home_dir;
use dockwright_shared::constants::envs as const_envs;
use std::path::PathBuf;

/// Where dockwright keeps blobs, caches and the image index.
#[derive(Clone, Debug)]
pub struct DockwrightOptions {
    pub home_dir: PathBuf,
}

impl Default for DockwrightOptions {
    fn default() -> Self {
        let home_dir = std::env::var(const_envs::DOCKWRIGHT_HOME)
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let mut path = home_dir().unwrap_or_else(|| PathBuf::from("."));
                path.push(const_dirs::DOCKWRIGHT_DIR);
                path
            });

        Self { home_dir }
    }
}

impl DockwrightOptions {
    pub fn with_home(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: home_dir.into(),
        }
    }
}
