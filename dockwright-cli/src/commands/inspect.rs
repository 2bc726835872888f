use clap::Args;
use dockwright::DockwrightError;
use dockwright::images::manifest::ImageConfigDocument;
use dockwright::images::{BlobStorage, ImageIndex};
use dockwright::launcher::StartupCommand;
use dockwright::runtime::HomeLayout;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Image tag
    pub tag: String,

    /// Print the manifest instead of the config
    #[arg(long, conflicts_with = "command")]
    pub manifest: bool,

    /// Print only the startup command recorded in the config
    #[arg(long)]
    pub command: bool,
}

pub fn execute(args: InspectArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let layout = HomeLayout::new(global.options().home_dir);
    let index = ImageIndex::load(&layout.images_dir());
    let image = index
        .image(&args.tag)
        .ok_or_else(|| DockwrightError::NotFound(format!("no such image: {}", args.tag)))?;

    let storage = BlobStorage::new(layout.blob_layout())?;
    if args.command {
        let document: ImageConfigDocument =
            serde_json::from_slice(&storage.read_config(&image.config_digest)?)?;
        let command = StartupCommand::from_image_config(&document.config).ok_or_else(|| {
            anyhow::anyhow!("image {} records no startup command", args.tag)
        })?;
        println!("{command}");
        return Ok(());
    }

    let bytes = if args.manifest {
        storage.read_manifest(&image.manifest_digest)?
    } else {
        storage.read_config(&image.config_digest)?
    };

    let value: serde_json::Value = serde_json::from_slice(&bytes)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
