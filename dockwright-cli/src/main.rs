mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    cli.global.init_logging();

    let result = match cli.command {
        Commands::Build(args) => commands::build::execute(args, &cli.global).await.map(|_| 0),
        Commands::Plan(args) => commands::plan::execute(args, &cli.global).await.map(|_| 0),
        Commands::Render(args) => commands::render::execute(args).map(|_| 0),
        Commands::Images(args) => commands::images::execute(args, &cli.global).map(|_| 0),
        Commands::Inspect(args) => commands::inspect::execute(args, &cli.global).map(|_| 0),
        Commands::Export(args) => commands::export::execute(args, &cli.global).map(|_| 0),
        Commands::Launch(args) => commands::launch::execute(args).await,
        Commands::Init(args) => commands::init::execute(args).map(|_| 0),
        Commands::Completions(args) => commands::completions::execute(args).map(|_| 0),
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}
