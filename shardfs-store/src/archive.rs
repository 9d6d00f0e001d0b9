// SPDX-License-Identifier: AGPL-3.0-or-later
//! Archive builders
//!
//! A node exports every managed file under its root as one tar archive.
//! Entry paths are relative to the root.

use async_trait::async_trait;
use shardfs_core::{ArchiverKind, Extension, ShardError, ShardResult};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use walkdir::WalkDir;

/// Builds an archive of the files with `extension` under `root` at `output`
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Returns the number of files archived.
    async fn build(&self, root: &Path, extension: &Extension, output: &Path) -> ShardResult<usize>;

    fn name(&self) -> &'static str;
}

/// Relative paths (`/`-separated, sorted) of every file under `root` whose
/// name carries `extension`. A missing root has no files.
pub fn managed_files(root: &Path, extension: &Extension) -> ShardResult<Vec<String>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if extension.matches(&rel) {
            files.push(rel);
        }
    }
    files.sort();
    Ok(files)
}

/// In-process tar writer with deterministic headers
#[derive(Debug, Default, Clone, Copy)]
pub struct TarArchiver;

#[async_trait]
impl Archiver for TarArchiver {
    async fn build(&self, root: &Path, extension: &Extension, output: &Path) -> ShardResult<usize> {
        let root = root.to_path_buf();
        let extension = extension.clone();
        let output = output.to_path_buf();

        tokio::task::spawn_blocking(move || -> ShardResult<usize> {
            let files = managed_files(&root, &extension)?;
            let file = std::fs::File::create(&output)?;
            let mut builder = tar::Builder::new(file);
            builder.mode(tar::HeaderMode::Deterministic);
            for rel in &files {
                builder.append_path_with_name(root.join(rel), rel)?;
            }
            builder.into_inner()?.sync_all()?;
            Ok(files.len())
        })
        .await
        .map_err(|e| ShardError::Archive(e.to_string()))?
    }

    fn name(&self) -> &'static str {
        "builtin"
    }
}

/// Check whether an external tool is on the `PATH`
pub async fn check_tool(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Delegates to an external `tar` program, fed an explicit file list
#[derive(Debug, Clone)]
pub struct SystemTarArchiver {
    program: PathBuf,
}

impl Default for SystemTarArchiver {
    fn default() -> Self {
        Self { program: PathBuf::from("tar") }
    }
}

impl SystemTarArchiver {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    pub async fn is_available(&self) -> bool {
        check_tool(&self.program.to_string_lossy()).await
    }
}

#[async_trait]
impl Archiver for SystemTarArchiver {
    async fn build(&self, root: &Path, extension: &Extension, output: &Path) -> ShardResult<usize> {
        tokio::fs::create_dir_all(root).await?;

        let list_root = root.to_path_buf();
        let extension = extension.clone();
        let (count, list) = tokio::task::spawn_blocking(move || -> ShardResult<_> {
            let files = managed_files(&list_root, &extension)?;
            let mut list = tempfile::NamedTempFile::new()?;
            for rel in &files {
                writeln!(list, "{}", rel)?;
            }
            list.flush()?;
            Ok((files.len(), list))
        })
        .await
        .map_err(|e| ShardError::Archive(e.to_string()))??;

        let result = Command::new(&self.program)
            .arg("-cf")
            .arg(output)
            .arg("-C")
            .arg(root)
            .arg("-T")
            .arg(list.path())
            .output()
            .await
            .map_err(|e| {
                ShardError::Archive(format!("Failed to run {}: {}", self.program.display(), e))
            })?;

        if !result.status.success() {
            return Err(ShardError::Archive(format!(
                "{} exited with {}: {}",
                self.program.display(),
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }
        Ok(count)
    }

    fn name(&self) -> &'static str {
        "system"
    }
}

/// Archiver selected by configuration
pub fn archiver_for(kind: ArchiverKind) -> Arc<dyn Archiver> {
    match kind {
        ArchiverKind::Builtin => Arc::new(TarArchiver),
        ArchiverKind::System => Arc::new(SystemTarArchiver::default()),
    }
}
