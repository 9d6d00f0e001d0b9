// SPDX-License-Identifier: AGPL-3.0-or-later
//! CLI command implementations

use bytesize::ByteSize;
use console::style;
use shardfs_core::{Ack, ClusterConfig, ShardError, ShardResult};
use shardfs_router::{Router, RouterClient};
use shardfs_store::StorageNode;
use std::path::{Path, PathBuf};

/// Configuration and target shared by every command
pub struct CliContext {
    config: ClusterConfig,
    addr: String,
    verbose: bool,
}

impl CliContext {
    pub fn load(config: Option<&Path>, addr: Option<String>, verbose: bool) -> ShardResult<Self> {
        let config = ClusterConfig::load(config)?;
        let addr = addr.unwrap_or_else(|| config.router.address());
        Ok(Self { config, addr, verbose })
    }

    async fn connect(&self) -> ShardResult<RouterClient> {
        if self.verbose {
            eprintln!("Connecting to {}", self.addr);
        }
        RouterClient::connect(&self.addr, &self.config.limits).await
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Turn a failure acknowledgment into an error
fn check(ack: &Ack) -> ShardResult<()> {
    if ack.is_success() {
        Ok(())
    } else {
        Err(ShardError::Rejected(ack.to_string()))
    }
}

/// Final path segment of a virtual path
fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Run the router until interrupted
pub async fn router(ctx: &CliContext) -> ShardResult<()> {
    let router = Router::from_config(&ctx.config).await?;
    router.serve_until(shutdown_signal()).await
}

/// Run a storage node until interrupted
pub async fn store(ctx: &CliContext, ext: &str) -> ShardResult<()> {
    let node = StorageNode::from_config(&ctx.config, ext).await?;
    node.serve_until(shutdown_signal()).await
}

/// Upload a local file
pub async fn upload(ctx: &CliContext, file: &Path, dest: &str) -> ShardResult<()> {
    let size = tokio::fs::metadata(file).await?.len();
    let mut client = ctx.connect().await?;
    let ack = client.upload(file, dest).await?;
    check(&ack)?;

    println!(
        "{} Uploaded {} ({}) to {}",
        style("✓").green(),
        file.display(),
        ByteSize(size),
        style(dest).cyan()
    );
    client.exit().await?;
    Ok(())
}

/// Download a file
pub async fn download(ctx: &CliContext, path: &str, output: Option<&Path>) -> ShardResult<()> {
    let output = match output {
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(base_name(path)),
    };
    let mut client = ctx.connect().await?;
    let (ack, size) = client.download_to(path, &output).await?;
    check(&ack)?;

    println!(
        "{} Downloaded {} ({}) to {}",
        style("✓").green(),
        style(path).cyan(),
        ByteSize(size),
        output.display()
    );
    client.exit().await?;
    Ok(())
}

/// Remove a file
pub async fn rm(ctx: &CliContext, path: &str) -> ShardResult<()> {
    let mut client = ctx.connect().await?;
    let ack = client.remove(path).await?;
    check(&ack)?;

    if ctx.verbose {
        println!("{} Removed {}", style("✓").green(), path);
    }
    client.exit().await?;
    Ok(())
}

/// List files across the cluster
pub async fn ls(ctx: &CliContext, path: &str) -> ShardResult<()> {
    let mut client = ctx.connect().await?;
    let (ack, names) = client.list(path).await?;
    check(&ack)?;

    for name in &names {
        println!("{}", name);
    }
    if ctx.verbose {
        eprintln!("{} file(s)", names.len());
    }
    client.exit().await?;
    Ok(())
}

/// Download the archive for one file type
pub async fn tar(ctx: &CliContext, ext: &str, output: Option<&Path>) -> ShardResult<()> {
    let cwd = std::env::current_dir()?;
    let mut client = ctx.connect().await?;
    let (ack, size) = client.archive_to(ext, &cwd, output).await?;
    check(&ack)?;

    let name = match (&ack, output) {
        (_, Some(path)) => path.display().to_string(),
        (Ack::Archive(name), None) => name.clone(),
        _ => String::new(),
    };
    println!(
        "{} Saved {} ({})",
        style("✓").green(),
        style(name).cyan(),
        ByteSize(size)
    );
    client.exit().await?;
    Ok(())
}
