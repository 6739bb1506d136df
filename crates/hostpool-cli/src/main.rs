mod cli;
mod commands;
mod output;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            port,
            bind,
            store_path,
        } => commands::serve(port, bind, store_path).await,
        Command::Status => commands::status(cli.remote).await,
        Command::Parameters => commands::parameters(cli.remote).await,
        Command::Machines { args } => commands::machines(cli.remote, args).await,
    }
}
