//! Fixtures for dockwright integration tests.
//!
//! `FixtureFetcher` stands in for a registry, `ScriptedRunner` for the
//! bubblewrap sandbox, and `ProjectTree` for a build context on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use dockwright::builder::{CommandRunner, ImageBuilder, RunInvocation, RunOutput};
use dockwright::images::archive::{LayerEntry, write_layer};
use dockwright::images::manifest::{
    Descriptor, ExecConfig, HistoryEntry, ImageConfigDocument, ImageManifest, RootFs,
};
use dockwright::images::{BaseFetcher, BaseImage, BaseLayer, BlobStorage};
use dockwright::pipeline::BuildStage;
use dockwright::recipe::BaseImageRef;
use dockwright::runtime::DockwrightOptions;
use dockwright_shared::constants::media_types;
use dockwright_shared::errors::{DockwrightError, DockwrightResult};

// ============================================================================
// BASE IMAGE FIXTURE
// ============================================================================

/// Serves a small synthetic base image without network access.
#[derive(Default)]
pub struct FixtureFetcher {
    calls: AtomicUsize,
    fail: bool,
}

impl FixtureFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fetcher whose registry is unreachable.
    pub fn unreachable() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BaseFetcher for FixtureFetcher {
    async fn fetch(
        &self,
        reference: &BaseImageRef,
        storage: &BlobStorage,
    ) -> DockwrightResult<BaseImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DockwrightError::Fetch(format!(
                "failed to pull manifest: {} is unreachable",
                reference.canonical()
            )));
        }

        let entries = vec![
            LayerEntry::directory("bin", 0o755),
            LayerEntry::directory("etc", 0o755),
            LayerEntry::bytes("etc/os-release", 0o644, "ID=fixture\n"),
            LayerEntry::directory("usr", 0o755),
            LayerEntry::directory("usr/local", 0o755),
            LayerEntry::directory("usr/local/bin", 0o755),
        ];
        let scratch = storage.layer_scratch_path();
        let packed = write_layer(&entries, &scratch)?;
        storage.commit_layer(&scratch, &packed)?;

        let document = ImageConfigDocument {
            created: None,
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            config: ExecConfig {
                env: vec![
                    "PATH=/usr/local/bin:/usr/bin:/bin".to_string(),
                    "LANG=C.UTF-8".to_string(),
                ],
                cmd: vec!["python3".to_string()],
                ..Default::default()
            },
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids: vec![packed.diff_id.clone()],
            },
            history: vec![HistoryEntry {
                created_by: Some("fixture base".to_string()),
                ..Default::default()
            }],
        };
        let config_bytes = document.to_bytes()?;
        let config_digest = storage.put_config(&config_bytes)?;

        let manifest = ImageManifest::new(
            Descriptor::new(
                media_types::IMAGE_CONFIG,
                &config_digest,
                config_bytes.len() as u64,
            ),
            vec![Descriptor::new(
                media_types::LAYER_GZIP,
                &packed.digest,
                packed.size,
            )],
        );
        let manifest_digest = storage.put_manifest(&serde_json::to_vec(&manifest)?)?;

        BaseImage::from_stored_config(
            reference.canonical(),
            manifest_digest,
            config_digest,
            vec![BaseLayer {
                digest: packed.digest,
                size: packed.size,
                media_type: media_types::LAYER_GZIP.to_string(),
            }],
            storage,
        )
    }
}

// ============================================================================
// RUN STEP FIXTURE
// ============================================================================

type Script = Box<dyn Fn(&RunInvocation) -> RunOutput + Send + Sync>;

/// Executes run steps in-process by editing the staged rootfs directly.
pub struct ScriptedRunner {
    script: Script,
    invocations: Mutex<Vec<RunInvocation>>,
}

impl ScriptedRunner {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&RunInvocation) -> RunOutput + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Installs a marker per step; the dependency marker copies the manifest
    /// found in the working directory.
    pub fn succeeding() -> Self {
        Self::new(|inv| {
            let rootfs = &inv.rootfs;
            let result = match inv.stage {
                BuildStage::DepsInstalled => {
                    let workdir = rootfs.join(inv.workdir.trim_start_matches('/'));
                    let manifest =
                        std::fs::read(workdir.join("requirements.txt")).unwrap_or_default();
                    let site = rootfs.join("usr/local/lib/site-packages");
                    std::fs::create_dir_all(&site)
                        .and_then(|_| std::fs::write(site.join("installed.txt"), manifest))
                }
                _ => {
                    let doc = rootfs.join("usr/share/doc/fixture");
                    std::fs::create_dir_all(&doc)
                        .and_then(|_| std::fs::write(doc.join("packages"), &inv.command))
                }
            };
            match result {
                Ok(()) => RunOutput::default(),
                Err(e) => RunOutput {
                    exit_code: 1,
                    stderr_tail: vec![e.to_string()],
                },
            }
        })
    }

    /// Fails the given stage with `stderr`, succeeding everywhere else.
    pub fn failing_on(stage: BuildStage, exit_code: i32, stderr: &str) -> Self {
        let ok = Self::succeeding();
        let stderr = stderr.to_string();
        Self::new(move |inv| {
            if inv.stage == stage {
                RunOutput {
                    exit_code,
                    stderr_tail: vec![stderr.clone()],
                }
            } else {
                (ok.script)(inv)
            }
        })
    }

    pub fn invocations(&self) -> Vec<RunInvocation> {
        self.invocations.lock().clone()
    }

    /// Number of times each stage ran.
    pub fn counts(&self) -> HashMap<BuildStage, usize> {
        let mut counts = HashMap::new();
        for inv in self.invocations.lock().iter() {
            *counts.entry(inv.stage).or_insert(0) += 1;
        }
        counts
    }

    pub fn count(&self, stage: BuildStage) -> usize {
        self.counts().get(&stage).copied().unwrap_or(0)
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, invocation: &RunInvocation) -> DockwrightResult<RunOutput> {
        self.invocations.lock().push(invocation.clone());
        Ok((self.script)(invocation))
    }
}

// ============================================================================
// BUILD CONTEXT FIXTURE
// ============================================================================

/// A dashboard project in a temporary directory.
pub struct ProjectTree {
    dir: TempDir,
}

impl ProjectTree {
    /// Manifest, entry module and a helper module.
    pub fn dashboard() -> Self {
        let tree = Self::empty();
        tree.write("requirements.txt", "streamlit==1.36.0\npandas==2.2.2\n");
        tree.write(
            "streamlit_app.py",
            "import streamlit as st\nst.title(\"Dashboard\")\n",
        );
        tree.write("pages/overview.py", "import streamlit as st\n");
        tree
    }

    pub fn empty() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create project dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    pub fn write(&self, relative: &str, content: &str) {
        let path = self.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dir");
        }
        std::fs::write(path, content).expect("write project file");
    }

    pub fn remove(&self, relative: &str) {
        std::fs::remove_file(self.join(relative)).expect("remove project file");
    }
}

// ============================================================================
// BUILDER FIXTURE
// ============================================================================

/// An isolated dockwright home with fixture fetcher and runner.
pub struct TestBuilder {
    pub home: TempDir,
    pub fetcher: Arc<FixtureFetcher>,
    pub runner: Arc<ScriptedRunner>,
    pub builder: ImageBuilder,
}

impl TestBuilder {
    pub fn new(runner: ScriptedRunner) -> Self {
        Self::with_fetcher(FixtureFetcher::new(), runner)
    }

    pub fn with_fetcher(fetcher: FixtureFetcher, runner: ScriptedRunner) -> Self {
        let home = tempfile::tempdir().expect("create home dir");
        let fetcher = Arc::new(fetcher);
        let runner = Arc::new(runner);
        let builder = ImageBuilder::new(
            &DockwrightOptions::with_home(home.path()),
            fetcher.clone(),
            runner.clone(),
        )
        .expect("create builder");

        Self {
            home,
            fetcher,
            runner,
            builder,
        }
    }
}
