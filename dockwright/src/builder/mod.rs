//! Image builder.
//!
//! Plans a recipe into ordered steps, resolves the base runtime, then runs
//! every step in order. Layer steps are served from the layer cache when
//! their cache key is known; run steps execute in a staged root filesystem
//! that is only materialized when one of them actually runs.

pub mod guard;
pub mod runner;
pub mod snapshot;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use dockwright_shared::constants::media_types;
use dockwright_shared::errors::{DockwrightError, DockwrightResult};

use crate::images::archive::{LayerEntry, apply_layer_file, write_layer};
use crate::images::manifest::{Descriptor, HistoryEntry, ImageConfigDocument, ImageManifest, RootFs};
use crate::images::{
    BaseFetcher, BaseImage, BaseLayer, BaseRecord, BlobStorage, BuiltImage, ImageIndex,
    LayerCache, LayerRecord,
};
use crate::pipeline::{
    BuildContext, BuildPlan, BuildProgress, BuildStage, CacheKey, Instruction, PlannedStep,
    PlannedStepSummary,
};
use crate::recipe::{BaseImageRef, BuildRecipe};
use crate::runtime::{DockwrightOptions, HomeLayout, HomeLock};

pub use guard::BuildGuard;
pub use runner::{BwrapRunner, CommandRunner, RunInvocation, RunOutput};
pub use snapshot::FsSnapshot;

/// Environment used for run steps when the base image declares none.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Inputs of one build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub context_dir: PathBuf,
    pub recipe: BuildRecipe,
    pub tag: String,
}

/// How a step was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Layer reused from the cache.
    Cached,
    /// Layer produced by this build.
    Built,
    /// Recorded in the image config only.
    Metadata,
    /// Nothing to do with this recipe.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub stage: BuildStage,
    pub cache_key: CacheKey,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
}

/// Result of a successful build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub image: BuiltImage,
    pub steps: Vec<StepOutcome>,
}

impl BuildReport {
    pub fn outcome(&self, stage: BuildStage) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.stage == stage)
    }
}

/// A planned step and whether its layer is already cached.
#[derive(Debug, Clone, Serialize)]
pub struct PlanEntry {
    #[serde(flatten)]
    pub step: PlannedStepSummary,
    /// `None` for steps without a layer.
    pub cached: Option<bool>,
}

/// Result of planning without executing.
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub base: String,
    pub base_digest: String,
    pub entries: Vec<PlanEntry>,
}

/// Layer of the image being assembled.
#[derive(Debug, Clone)]
struct ImageLayer {
    digest: String,
    diff_id: String,
    size: u64,
    media_type: String,
}

/// Root filesystem of a build, populated lazily from the layer stack.
struct Staging {
    rootfs: PathBuf,
    applied: usize,
}

/// Builds images into a dockwright home.
pub struct ImageBuilder {
    layout: HomeLayout,
    fetcher: Arc<dyn BaseFetcher>,
    runner: Arc<dyn CommandRunner>,
}

impl ImageBuilder {
    pub fn new(
        options: &DockwrightOptions,
        fetcher: Arc<dyn BaseFetcher>,
        runner: Arc<dyn CommandRunner>,
    ) -> DockwrightResult<Self> {
        let layout = HomeLayout::new(options.home_dir.clone());
        layout.prepare()?;
        Ok(Self {
            layout,
            fetcher,
            runner,
        })
    }

    pub fn layout(&self) -> &HomeLayout {
        &self.layout
    }

    /// Plan a build and report which layer steps would hit the cache.
    ///
    /// Resolves the base image, fetching it when it is not yet stored.
    pub async fn plan(&self, context_dir: &Path, recipe: &BuildRecipe) -> DockwrightResult<PlanReport> {
        let _lock = HomeLock::acquire(self.layout.home_dir())?;
        recipe.validate()?;

        let base_ref = recipe.base_ref()?;
        let storage = BlobStorage::new(self.layout.blob_layout())?;
        let mut index = ImageIndex::load(&self.layout.images_dir());
        let cache = LayerCache::load(&self.layout.cache_dir());

        let (base, context) = tokio::try_join!(
            self.resolve_base(&base_ref, &storage, &index),
            scan_context(context_dir, recipe)
        )?;
        record_base(&mut index, &base)?;

        let plan = BuildPlan::new(recipe, &base.manifest_digest, &context);
        let entries = plan
            .summaries()
            .into_iter()
            .zip(plan.steps())
            .map(|(summary, step)| {
                let cached = step.instruction.produces_layer().then(|| {
                    cache
                        .get(&step.cache_key)
                        .is_some_and(|r| storage.has_layer(&r.digest))
                });
                PlanEntry {
                    step: summary,
                    cached,
                }
            })
            .collect();

        Ok(PlanReport {
            base: base.reference,
            base_digest: base.manifest_digest,
            entries,
        })
    }

    /// Run every step of `request.recipe` and tag the result.
    ///
    /// The tag is recorded only after all steps succeeded. Layers committed
    /// by steps before a failure stay in the cache.
    pub async fn build(&self, request: BuildRequest) -> DockwrightResult<BuildReport> {
        let BuildRequest {
            context_dir,
            recipe,
            tag,
        } = request;

        if tag.trim().is_empty() {
            return Err(DockwrightError::Config("image tag must not be empty".to_string()));
        }

        let _lock = HomeLock::acquire(self.layout.home_dir())?;
        recipe.validate()?;

        let base_ref = recipe.base_ref()?;
        let storage = BlobStorage::new(self.layout.blob_layout())?;
        let mut index = ImageIndex::load(&self.layout.images_dir());
        let mut cache = LayerCache::load(&self.layout.cache_dir());

        let build_id = ulid::Ulid::new().to_string();
        tracing::info!(
            build_id = %build_id,
            tag = %tag,
            context = %context_dir.display(),
            "Starting build"
        );

        let (base, context) = tokio::try_join!(
            self.resolve_base(&base_ref, &storage, &index),
            scan_context(&context_dir, &recipe)
        )?;
        record_base(&mut index, &base)?;

        if !context.contains(&recipe.entrypoint.entry_module) {
            tracing::warn!(
                entry = %recipe.entrypoint.entry_module,
                "Entry module is not in the build context; the image will fail at startup"
            );
        }

        let plan = BuildPlan::new(&recipe, &base.manifest_digest, &context);

        let mut guard = BuildGuard::new(build_id.clone(), self.layout.build_staging(&build_id));
        let mut staging = Staging {
            rootfs: guard.staging_dir().join("rootfs"),
            applied: 0,
        };

        let mut layers: Vec<ImageLayer> = base
            .layers
            .iter()
            .zip(&base.diff_ids)
            .map(|(l, diff_id)| ImageLayer {
                digest: l.digest.clone(),
                diff_id: diff_id.clone(),
                size: l.size,
                media_type: l.media_type.clone(),
            })
            .collect();
        let mut history = base.history.clone();
        let mut outcomes = Vec::with_capacity(plan.steps().len());
        let mut progress = BuildProgress::new();

        for step in plan.steps() {
            let stage = step.stage();

            let (status, layer) = if step.instruction.is_noop() {
                (StepStatus::Skipped, None)
            } else if step.instruction.produces_layer() {
                let (record, status) = self
                    .layer_step(
                        step,
                        &recipe,
                        &context,
                        &base,
                        &storage,
                        &mut cache,
                        &layers,
                        &mut staging,
                    )
                    .await?;
                layers.push(ImageLayer {
                    digest: record.digest.clone(),
                    diff_id: record.diff_id.clone(),
                    size: record.size,
                    media_type: record.media_type.clone(),
                });
                (status, Some(record.digest))
            } else if matches!(step.instruction, Instruction::From { .. }) {
                (StepStatus::Cached, None)
            } else {
                (StepStatus::Metadata, None)
            };

            if !matches!(step.instruction, Instruction::From { .. }) && status != StepStatus::Skipped {
                history.push(HistoryEntry {
                    created: None,
                    created_by: Some(step.instruction.to_string()),
                    comment: Some(format!("dockwright {}", stage)),
                    empty_layer: layer.is_none(),
                });
            }

            progress.advance(stage)?;
            tracing::info!(
                step = stage.step_number(),
                stage = %stage,
                cache_key = %step.cache_key.short(),
                status = ?status,
                "Step complete"
            );

            outcomes.push(StepOutcome {
                stage,
                cache_key: step.cache_key.clone(),
                status,
                layer,
            });
        }

        if !progress.is_complete() {
            return Err(DockwrightError::InvalidState(format!(
                "build stopped at {:?}",
                progress.current()
            )));
        }

        let (manifest_digest, manifest_size, config_digest) =
            assemble_image(&recipe, &base, &layers, history, &storage)?;

        let image = BuiltImage {
            tag: tag.clone(),
            build_id,
            manifest_digest,
            manifest_size,
            config_digest,
            base: base.reference.clone(),
            layers: layers.iter().map(|l| l.digest.clone()).collect(),
            cache_keys: plan.steps().iter().map(|s| s.cache_key.clone()).collect(),
            created_at: Utc::now(),
        };

        index.upsert_image(image.clone());
        index.save()?;
        guard.disarm();

        tracing::info!(tag = %tag, digest = %image.manifest_digest, "Build complete");

        Ok(BuildReport {
            image,
            steps: outcomes,
        })
    }

    /// Serve the base from storage when this reference was fetched before.
    async fn resolve_base(
        &self,
        reference: &BaseImageRef,
        storage: &BlobStorage,
        index: &ImageIndex,
    ) -> DockwrightResult<BaseImage> {
        let canonical = reference.canonical();

        if let Some(record) = index.base(&canonical)
            && storage.has_layers(&record.layers)
            && storage.has_config(&record.config_digest)
        {
            tracing::debug!(image = %canonical, digest = %record.manifest_digest, "Base image served locally");
            let layers = record
                .layers
                .iter()
                .enumerate()
                .map(|(i, digest)| BaseLayer {
                    digest: digest.clone(),
                    size: record.layer_sizes.get(i).copied().unwrap_or_default(),
                    media_type: record
                        .layer_media_types
                        .get(i)
                        .cloned()
                        .unwrap_or_else(|| media_types::LAYER_GZIP.to_string()),
                })
                .collect();
            return BaseImage::from_stored_config(
                canonical,
                record.manifest_digest.clone(),
                record.config_digest.clone(),
                layers,
                storage,
            );
        }

        self.fetcher.fetch(reference, storage).await
    }

    /// Produce or reuse the layer of `step`.
    #[allow(clippy::too_many_arguments)]
    async fn layer_step(
        &self,
        step: &PlannedStep,
        recipe: &BuildRecipe,
        context: &BuildContext,
        base: &BaseImage,
        storage: &BlobStorage,
        cache: &mut LayerCache,
        layers: &[ImageLayer],
        staging: &mut Staging,
    ) -> DockwrightResult<(LayerRecord, StepStatus)> {
        if let Some(record) = cache.get(&step.cache_key) {
            if storage.has_layer(&record.digest) {
                tracing::debug!(
                    stage = %step.stage(),
                    cache_key = %step.cache_key.short(),
                    digest = %record.digest,
                    "Cache hit"
                );
                return Ok((record.clone(), StepStatus::Cached));
            }
            tracing::warn!(
                cache_key = %step.cache_key.short(),
                digest = %record.digest,
                "Cached layer blob is missing, rebuilding"
            );
            cache.evict(&step.cache_key)?;
        }

        let workdir = recipe.workdir.as_str();
        let entries = match &step.instruction {
            Instruction::Workdir { path } => workdir_entries(path),
            Instruction::CopyManifest { .. } => {
                let mut entries = workdir_entries(workdir);
                entries.extend(context.manifest_files().iter().map(|e| e.to_layer_entry(workdir)));
                entries
            }
            Instruction::CopyPayload => {
                let mut entries = workdir_entries(workdir);
                entries.extend(context.payload_files().iter().map(|e| e.to_layer_entry(workdir)));
                entries
            }
            instruction => {
                let command = instruction.shell_command().ok_or_else(|| {
                    DockwrightError::Internal(format!("{} has no command", step.stage()))
                })?;
                self.run_step(step.stage(), command, recipe, base, storage, layers, staging)
                    .await?
            }
        };

        let scratch = storage.layer_scratch_path();
        let packed = {
            let scratch = scratch.clone();
            blocking(move || write_layer(&entries, &scratch)).await?
        };
        storage.commit_layer(&scratch, &packed)?;

        let record = LayerRecord {
            digest: packed.digest.clone(),
            diff_id: packed.diff_id.clone(),
            size: packed.size,
            media_type: media_types::LAYER_GZIP.to_string(),
            stage: step.stage(),
            created_at: Utc::now(),
        };
        cache.insert(step.cache_key.clone(), record.clone())?;

        tracing::debug!(
            stage = %step.stage(),
            digest = %record.digest,
            size = record.size,
            "Layer committed"
        );
        Ok((record, StepStatus::Built))
    }

    /// Execute a run step and return the filesystem changes it made.
    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        stage: BuildStage,
        command: String,
        recipe: &BuildRecipe,
        base: &BaseImage,
        storage: &BlobStorage,
        layers: &[ImageLayer],
        staging: &mut Staging,
    ) -> DockwrightResult<Vec<LayerEntry>> {
        sync_rootfs(staging, layers, storage).await?;

        let rootfs = staging.rootfs.clone();
        let before = {
            let rootfs = rootfs.clone();
            blocking(move || FsSnapshot::capture(&rootfs)).await?
        };

        let invocation = RunInvocation {
            stage,
            rootfs: rootfs.clone(),
            workdir: recipe.workdir.clone(),
            command,
            env: run_env(base),
        };

        tracing::info!(stage = %stage, command = %invocation.command, "Running step");
        let output = self.runner.run(&invocation).await?;

        if !output.success() {
            let detail = if output.stderr_tail.is_empty() {
                String::new()
            } else {
                format!(":\n{}", output.stderr_tail.join("\n"))
            };
            let message = format!(
                "`{}` exited with status {}{}",
                invocation.command, output.exit_code, detail
            );
            return Err(match stage {
                BuildStage::SystemPackagesInstalled => DockwrightError::Fetch(message),
                BuildStage::DepsInstalled => DockwrightError::Resolve(message),
                _ => DockwrightError::Execution(message),
            });
        }

        let after = {
            let rootfs = rootfs.clone();
            blocking(move || FsSnapshot::capture(&rootfs)).await?
        };

        // The rootfs now reflects this step's layer as well.
        staging.applied = layers.len() + 1;

        Ok(before.diff(&after, &rootfs))
    }
}

async fn scan_context(context_dir: &Path, recipe: &BuildRecipe) -> DockwrightResult<BuildContext> {
    let root = context_dir.to_path_buf();
    let recipe = recipe.clone();
    blocking(move || BuildContext::scan(&root, &recipe)).await
}

fn record_base(index: &mut ImageIndex, base: &BaseImage) -> DockwrightResult<()> {
    if index
        .base(&base.reference)
        .is_some_and(|r| r.manifest_digest == base.manifest_digest)
    {
        return Ok(());
    }

    index.upsert_base(
        base.reference.clone(),
        BaseRecord {
            manifest_digest: base.manifest_digest.clone(),
            config_digest: base.config_digest.clone(),
            layers: base.layer_digests(),
            layer_sizes: base.layers.iter().map(|l| l.size).collect(),
            layer_media_types: base.layers.iter().map(|l| l.media_type.clone()).collect(),
            fetched_at: Utc::now(),
        },
    );
    index.save()
}

/// Apply layers not yet present in the staged rootfs, bottom first.
async fn sync_rootfs(
    staging: &mut Staging,
    layers: &[ImageLayer],
    storage: &BlobStorage,
) -> DockwrightResult<()> {
    if staging.applied >= layers.len() && staging.rootfs.exists() {
        return Ok(());
    }

    let pending: Vec<PathBuf> = layers[staging.applied.min(layers.len())..]
        .iter()
        .map(|l| storage.layer_path(&l.digest))
        .collect();
    let rootfs = staging.rootfs.clone();

    tracing::debug!(
        rootfs = %rootfs.display(),
        layers = pending.len(),
        "Materializing staged rootfs"
    );

    blocking(move || {
        std::fs::create_dir_all(&rootfs).map_err(|e| {
            DockwrightError::Storage(format!("failed to create {}: {}", rootfs.display(), e))
        })?;
        for path in &pending {
            apply_layer_file(path, &rootfs)?;
        }
        Ok(())
    })
    .await?;

    staging.applied = layers.len();
    Ok(())
}

/// Environment for run steps: the base image's, with a usable `PATH`.
fn run_env(base: &BaseImage) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = base
        .runtime
        .env
        .iter()
        .filter_map(|e| e.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    if !env.iter().any(|(k, _)| k == "PATH") {
        env.push(("PATH".to_string(), DEFAULT_PATH.to_string()));
    }
    env.push(("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string()));
    env
}

/// Directory entries for an absolute path and each of its ancestors.
fn workdir_entries(workdir: &str) -> Vec<LayerEntry> {
    let mut entries = Vec::new();
    let mut current = String::new();
    for part in workdir.split('/').filter(|p| !p.is_empty()) {
        if !current.is_empty() {
            current.push('/');
        }
        current.push_str(part);
        entries.push(LayerEntry::directory(current.clone(), 0o755));
    }
    entries
}

/// Write the image config and manifest; returns (manifest digest, size, config digest).
fn assemble_image(
    recipe: &BuildRecipe,
    base: &BaseImage,
    layers: &[ImageLayer],
    history: Vec<HistoryEntry>,
    storage: &BlobStorage,
) -> DockwrightResult<(String, u64, String)> {
    let mut runtime = base.runtime.clone();
    runtime.working_dir = recipe.workdir.clone();
    runtime.merge_env(&recipe.runtime_env());
    runtime.expose_tcp(recipe.expose);
    runtime.entrypoint = Vec::new();
    runtime.cmd = recipe.startup_command().argv();
    runtime
        .labels
        .extend(recipe.labels.iter().map(|(k, v)| (k.clone(), v.clone())));

    let document = ImageConfigDocument {
        created: None,
        architecture: base.architecture.clone(),
        os: base.os.clone(),
        config: runtime.to_exec_config(),
        rootfs: RootFs {
            fs_type: "layers".to_string(),
            diff_ids: layers.iter().map(|l| l.diff_id.clone()).collect(),
        },
        history,
    };

    let config_bytes = document.to_bytes()?;
    let config_digest = storage.put_config(&config_bytes)?;

    let manifest = ImageManifest::new(
        Descriptor::new(
            media_types::IMAGE_CONFIG,
            &config_digest,
            config_bytes.len() as u64,
        ),
        layers
            .iter()
            .map(|l| Descriptor::new(&l.media_type, &l.digest, l.size))
            .collect(),
    );
    let manifest_bytes = serde_json::to_vec(&manifest)?;
    let manifest_digest = storage.put_manifest(&manifest_bytes)?;

    Ok((manifest_digest, manifest_bytes.len() as u64, config_digest))
}

/// Run blocking filesystem work off the async runtime.
async fn blocking<T, F>(f: F) -> DockwrightResult<T>
where
    F: FnOnce() -> DockwrightResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DockwrightError::Internal(format!("blocking task failed: {e}")))?
}
