use std::path::PathBuf;

use clap::Args;
use comfy_table::{Table, presets::NOTHING};

use crate::cli::{GlobalFlags, load_recipe};

use super::build::RegistryArgs;

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Build context directory
    #[arg(default_value = ".")]
    pub context: PathBuf,

    /// Recipe file (defaults to dockwright.yaml in the context)
    #[arg(short = 'f', long = "file")]
    pub file: Option<PathBuf>,

    #[command(flatten)]
    pub registry: RegistryArgs,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: PlanArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let recipe = load_recipe(&args.context, args.file.as_deref())?;
    let builder = args.registry.image_builder(global, false)?;
    let report = builder.plan(&args.context, &recipe).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Base: {} ({})", report.base, report.base_digest);

    let mut table = Table::new();
    table.load_preset(NOTHING);
    table.set_header(vec!["STEP", "STAGE", "CACHE KEY", "CACHED", "INSTRUCTION"]);

    for entry in &report.entries {
        let cached = match entry.cached {
            Some(true) => "yes",
            Some(false) => "no",
            None => "-",
        };
        let instruction = entry.step.instruction.lines().next().unwrap_or_default();
        table.add_row(vec![
            entry.step.step.to_string(),
            entry.step.stage.to_string(),
            entry.step.cache_key.short().to_string(),
            cached.to_string(),
            instruction.to_string(),
        ]);
    }

    println!("{table}");
    Ok(())
}
