use std::path::PathBuf;

use clap::Args;
use dockwright::recipe::BuildRecipe;
use dockwright::constants::recipe::RECIPE_FILE;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Directory to write the recipe into
    #[arg(default_value = ".")]
    pub dir: PathBuf,

    /// Overwrite an existing recipe
    #[arg(long)]
    pub force: bool,
}

pub fn execute(args: InitArgs) -> anyhow::Result<()> {
    let path = args.dir.join(RECIPE_FILE);
    if path.exists() && !args.force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    std::fs::create_dir_all(&args.dir)?;
    std::fs::write(&path, BuildRecipe::default().to_yaml()?)?;
    println!("{}", path.display());
    Ok(())
}
