//! Dockwright - Image builder and foreground launcher for dashboard applications
//!
//! The builder turns a build context and a declarative recipe into a layered,
//! cacheable OCI image whose startup command runs the dashboard server. The
//! launcher is that startup command's supervisor inside the container.

pub mod builder;
pub mod images;
pub mod launcher;
pub mod pipeline;
pub mod recipe;
pub mod runtime;
pub mod util;

pub use builder::{
    BuildReport, BuildRequest, BwrapRunner, CommandRunner, ImageBuilder, PlanReport, StepOutcome,
    StepStatus,
};
pub use images::{BaseFetcher, BuiltImage, RegistryFetcher};
pub use launcher::{LaunchSpec, Launcher, RunOutcome, RunStatus, ServerConfig, StartupCommand};
pub use pipeline::{BuildPlan, BuildProgress, BuildStage, CacheKey, Instruction};
pub use recipe::{BaseImageRef, BuildRecipe, render_containerfile, render_dockerignore};
pub use runtime::DockwrightOptions;

pub use dockwright_shared::constants;
pub use dockwright_shared::{DockwrightError, DockwrightResult};
