// SPDX-License-Identifier: AGPL-3.0-or-later
//! shardfs CLI
//!
//! Runs the router or a storage node, and talks to a running router.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "shardfs")]
#[command(author, version, about = "shardfs - Extension-sharded file storage", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Cluster configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Router address (defaults to the configured router)
    #[arg(short, long, global = true)]
    addr: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the router
    Router,

    /// Run the storage node for a file type
    Store {
        /// Extension (`pdf`, `.txt`) or node name (`s2`)
        ext: String,
    },

    /// Upload a file
    #[command(alias = "put")]
    Upload {
        /// Local file to upload
        file: PathBuf,

        /// Destination directory, e.g. `~s1/reports`
        #[arg(default_value = "~s1")]
        dest: String,
    },

    /// Download a file
    #[command(alias = "get")]
    Download {
        /// Virtual path of the file
        path: String,

        /// Output file (defaults to the file name in the current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Remove a file
    Rm {
        /// Virtual path of the file
        path: String,
    },

    /// List files across the cluster
    #[command(alias = "dir")]
    Ls {
        /// Directory to list
        #[arg(default_value = ".")]
        path: String,
    },

    /// Download an archive of every file of one type
    Tar {
        /// Extension, e.g. `.c` or `pdf`
        ext: String,

        /// Output file (defaults to the archive name in the current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_writer(std::io::stderr)
        .init();

    let ctx = match commands::CliContext::load(cli.config.as_deref(), cli.addr, cli.verbose) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Router => commands::router(&ctx).await,
        Commands::Store { ext } => commands::store(&ctx, &ext).await,
        Commands::Upload { file, dest } => commands::upload(&ctx, &file, &dest).await,
        Commands::Download { path, output } => {
            commands::download(&ctx, &path, output.as_deref()).await
        }
        Commands::Rm { path } => commands::rm(&ctx, &path).await,
        Commands::Ls { path } => commands::ls(&ctx, &path).await,
        Commands::Tar { ext, output } => commands::tar(&ctx, &ext, output.as_deref()).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
