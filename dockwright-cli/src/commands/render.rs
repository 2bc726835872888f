use std::path::PathBuf;

use clap::Args;
use dockwright::recipe::{render_containerfile, render_dockerignore};

use crate::cli::load_recipe;

#[derive(Args, Debug)]
pub struct RenderArgs {
    /// Build context directory used to discover the recipe
    #[arg(default_value = ".")]
    pub context: PathBuf,

    /// Recipe file (defaults to dockwright.yaml in the context)
    #[arg(short = 'f', long = "file")]
    pub file: Option<PathBuf>,

    /// Print the matching .dockerignore instead of the Containerfile
    #[arg(long, conflicts_with = "output")]
    pub dockerignore: bool,

    /// Write Containerfile and .dockerignore into this directory
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

pub fn execute(args: RenderArgs) -> anyhow::Result<()> {
    let recipe = load_recipe(&args.context, args.file.as_deref())?;
    recipe.validate()?;

    if let Some(dir) = &args.output {
        std::fs::create_dir_all(dir)?;
        let containerfile = dir.join("Containerfile");
        let ignore = dir.join(".dockerignore");
        std::fs::write(&containerfile, render_containerfile(&recipe))?;
        std::fs::write(&ignore, render_dockerignore(&recipe))?;
        println!("{}", containerfile.display());
        println!("{}", ignore.display());
    } else if args.dockerignore {
        print!("{}", render_dockerignore(&recipe));
    } else {
        print!("{}", render_containerfile(&recipe));
    }
    Ok(())
}
