use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "hostpool",
    about = "Machine-pool broker: query, provision, reserve and tear down lab hosts",
    version
)]
pub struct Cli {
    /// Base URL of the hostpool server the client commands talk to.
    #[arg(long, env = "HOSTPOOL_URL", global = true, default_value = "http://127.0.0.1:8080")]
    pub remote: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the broker server.
    Serve {
        /// Listen port; overrides APP_PORT.
        #[arg(long)]
        port: Option<u16>,

        /// Listen address; overrides APP_BIND.
        #[arg(long)]
        bind: Option<String>,

        /// redb database file; overrides APP_STORE_PATH.
        #[arg(long)]
        store_path: Option<PathBuf>,
    },

    /// Show the server and pool summary.
    Status,

    /// Print the merged parameter schema.
    Parameters,

    /// List machines matching `key=value` / `key:op=value` pairs.
    Machines {
        /// Query arguments, e.g. `cpu-arch=x86_64 memory-total_size:gte=8192`.
        args: Vec<String>,
    },
}
