use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use dockwright::builder::{BuildRequest, BwrapRunner, CommandRunner, ImageBuilder};
use dockwright::images::RegistryFetcher;

use crate::cli::{GlobalFlags, load_recipe};

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Build context directory
    #[arg(default_value = ".")]
    pub context: PathBuf,

    /// Recipe file (defaults to dockwright.yaml in the context)
    #[arg(short = 'f', long = "file")]
    pub file: Option<PathBuf>,

    /// Image tag (defaults to <context dir>:latest)
    #[arg(short, long)]
    pub tag: Option<String>,

    #[command(flatten)]
    pub registry: RegistryArgs,

    /// Print the build report as JSON instead of the image digest
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct RegistryArgs {
    /// Registry username for pulling the base image
    #[arg(long, env = "DOCKWRIGHT_REGISTRY_USER", requires = "registry_password")]
    pub registry_user: Option<String>,

    /// Registry password for pulling the base image
    #[arg(long, env = "DOCKWRIGHT_REGISTRY_PASSWORD", hide_env_values = true)]
    pub registry_password: Option<String>,

    /// bubblewrap binary used to run build steps (searched in PATH by default)
    #[arg(long, env = "DOCKWRIGHT_BWRAP")]
    pub bwrap: Option<PathBuf>,
}

impl RegistryArgs {
    /// Builder backed by the registry and bubblewrap.
    ///
    /// With `require_runner` unset a missing bubblewrap is tolerated; the
    /// runner is then only an error source if a step actually runs.
    pub fn image_builder(
        &self,
        global: &GlobalFlags,
        require_runner: bool,
    ) -> anyhow::Result<ImageBuilder> {
        let fetcher = match (&self.registry_user, &self.registry_password) {
            (Some(user), Some(password)) => {
                RegistryFetcher::with_basic_auth(user.clone(), password.clone())
            }
            _ => RegistryFetcher::new(),
        };

        let runner: Arc<dyn CommandRunner> = match &self.bwrap {
            Some(path) => Arc::new(BwrapRunner::with_binary(path.clone())),
            None => match BwrapRunner::new() {
                Ok(runner) => Arc::new(runner),
                Err(e) if require_runner => return Err(e.into()),
                Err(_) => Arc::new(BwrapRunner::with_binary(PathBuf::from("bwrap"))),
            },
        };

        Ok(ImageBuilder::new(
            &global.options(),
            Arc::new(fetcher),
            runner,
        )?)
    }
}

pub async fn execute(args: BuildArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let recipe = load_recipe(&args.context, args.file.as_deref())?;
    let tag = args
        .tag
        .clone()
        .unwrap_or_else(|| super::default_tag(&args.context));

    let builder = args.registry.image_builder(global, true)?;
    let report = builder
        .build(BuildRequest {
            context_dir: args.context.clone(),
            recipe,
            tag,
        })
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for step in &report.steps {
        eprintln!(
            "Step {}/9 {:<26} {:<8} {}",
            step.stage.step_number(),
            step.stage,
            format!("{:?}", step.status).to_lowercase(),
            step.layer.as_deref().map(super::short_digest).unwrap_or("-")
        );
    }
    eprintln!("Tagged {}", report.image.tag);
    println!("{}", report.image.manifest_digest);
    Ok(())
}
