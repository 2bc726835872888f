use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use dockwright::DockwrightOptions;
use dockwright::recipe::BuildRecipe;
use tracing_subscriber::EnvFilter;

use crate::commands;

#[derive(Parser, Debug)]
#[command(name = "dockwright", author, version, about = "Build and launch dashboard container images")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build an image from a context directory
    Build(commands::build::BuildArgs),

    /// Show the build steps, cache keys and cache hits without executing
    Plan(commands::plan::PlanArgs),

    /// Print the equivalent Containerfile
    Render(commands::render::RenderArgs),

    /// List built images
    #[command(visible_alias = "ls")]
    Images(commands::images::ImagesArgs),

    /// Print an image config as JSON
    Inspect(commands::inspect::InspectArgs),

    /// Write an image as an OCI layout directory
    Export(commands::export::ExportArgs),

    /// Run the startup command in the foreground
    Launch(commands::launch::LaunchArgs),

    /// Write the default recipe into a directory
    Init(commands::init::InitArgs),

    /// Generate shell completions
    Completions(commands::completions::CompletionsArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(clap::Args, Debug)]
pub struct GlobalFlags {
    /// Dockwright home directory (blobs, caches, image index)
    #[arg(long, global = true, env = "DOCKWRIGHT_HOME")]
    pub home: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl GlobalFlags {
    pub fn options(&self) -> DockwrightOptions {
        match &self.home {
            Some(home) => DockwrightOptions::with_home(home.clone()),
            None => DockwrightOptions::default(),
        }
    }

    /// Install the tracing subscriber. Logs go to stderr so command output
    /// on stdout stays machine readable.
    pub fn init_logging(&self) {
        let fallback = if self.verbose { "debug" } else { "info" };
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false);

        let _ = match self.log_format {
            LogFormat::Json => builder.json().try_init(),
            LogFormat::Pretty => builder.try_init(),
        };
    }
}

/// `-f <file>` when given, otherwise the context's recipe file or defaults.
pub fn load_recipe(context: &Path, file: Option<&Path>) -> anyhow::Result<BuildRecipe> {
    let recipe = match file {
        Some(path) => BuildRecipe::load(path)?,
        None => BuildRecipe::discover(context)?,
    };
    Ok(recipe)
}
