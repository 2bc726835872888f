use clap::Args;
use comfy_table::{Table, presets::NOTHING};
use dockwright::images::ImageIndex;
use dockwright::runtime::HomeLayout;

use crate::cli::GlobalFlags;

#[derive(Args, Debug)]
pub struct ImagesArgs {
    /// Only print tags
    #[arg(short, long)]
    pub quiet: bool,
}

pub fn execute(args: ImagesArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let layout = HomeLayout::new(global.options().home_dir);
    let index = ImageIndex::load(&layout.images_dir());

    if args.quiet {
        for image in index.images() {
            println!("{}", image.tag);
        }
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(NOTHING);
    table.set_header(vec!["TAG", "DIGEST", "BASE", "LAYERS", "CREATED"]);

    for image in index.images() {
        table.add_row(vec![
            image.tag.clone(),
            super::short_digest(&image.manifest_digest).to_string(),
            image.base.clone(),
            image.layers.len().to_string(),
            image.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }

    println!("{table}");
    Ok(())
}
