use std::path::PathBuf;

use clap::Args;
use dockwright::DockwrightError;
use dockwright::images::{BlobStorage, ImageIndex, export_oci_layout};
use dockwright::runtime::HomeLayout;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Image tag
    pub tag: String,

    /// Destination directory for the OCI layout
    pub dest: PathBuf,
}

pub fn execute(args: ExportArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let layout = HomeLayout::new(global.options().home_dir);
    let index = ImageIndex::load(&layout.images_dir());
    let image = index
        .image(&args.tag)
        .ok_or_else(|| DockwrightError::NotFound(format!("no such image: {}", args.tag)))?;

    let storage = BlobStorage::new(layout.blob_layout())?;
    export_oci_layout(&storage, image, &args.dest)?;
    println!("{}", args.dest.display());
    Ok(())
}
