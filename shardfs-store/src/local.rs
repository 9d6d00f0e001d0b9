// SPDX-License-Identifier: AGPL-3.0-or-later
//! Namespace root on the local filesystem
//!
//! Each node persists exactly one file type under `<home>/<node>`. Every
//! incoming path is translated into this node's namespace before any
//! filesystem access.

use shardfs_core::{
    Connection, Extension, NamespaceTranslator, NodeIdentity, ShardError, ShardResult,
    TransferBuffer,
};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::archive::{managed_files, Archiver};

/// Local directory tree owned by one node
#[derive(Debug, Clone)]
pub struct NamespaceRoot {
    node: String,
    extension: Extension,
    translator: NamespaceTranslator,
}

/// Sibling file a payload is received into before being renamed in place
fn part_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.part", name))
}

impl NamespaceRoot {
    pub fn new(node: &NodeIdentity, translator: NamespaceTranslator) -> Self {
        Self {
            node: node.name.clone(),
            extension: node.extension.clone(),
            translator,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn extension(&self) -> &Extension {
        &self.extension
    }

    pub fn root(&self) -> PathBuf {
        self.translator.root_of(&self.node)
    }

    pub fn translator(&self) -> &NamespaceTranslator {
        &self.translator
    }

    pub async fn ensure_root(&self) -> ShardResult<()> {
        fs::create_dir_all(self.root()).await?;
        Ok(())
    }

    fn check_managed(&self, name: &str) -> ShardResult<()> {
        match Extension::of(name) {
            None => Err(ShardError::MissingExtension(name.to_string())),
            Some(ext) if ext == self.extension => Ok(()),
            Some(ext) => Err(ShardError::UnsupportedType(ext.to_string())),
        }
    }

    /// Physical path of a managed file named by `raw`.
    pub fn file_path(&self, raw: &str) -> ShardResult<PathBuf> {
        let vpath = self.translator.parse(raw)?;
        let name = vpath
            .name()
            .ok_or_else(|| ShardError::InvalidPath(format!("{} does not name a file", raw)))?;
        self.check_managed(name)?;
        Ok(self.translator.resolve_parsed(&vpath, &self.node))
    }

    /// Validate a store request and create the destination directory.
    pub async fn store_target(&self, name: &str, dest: &str) -> ShardResult<PathBuf> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(ShardError::InvalidPath(format!("{} is not a file name", name)));
        }
        self.check_managed(name)?;
        let dir = self.translator.parse(dest)?;
        let target = self.translator.resolve_parsed(&dir.join(name)?, &self.node);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(target)
    }

    /// Receive one payload from `conn` and store it as `dest/name`.
    ///
    /// The file only appears under its final name once the whole payload has
    /// arrived. If the request is rejected the payload is still consumed.
    pub async fn store_from<S>(
        &self,
        name: &str,
        dest: &str,
        conn: &mut Connection<S>,
        buf: &mut TransferBuffer,
        limit: u64,
    ) -> ShardResult<u64>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let target = match self.store_target(name, dest).await {
            Ok(target) => target,
            Err(e) => {
                conn.drain_payload(buf).await?;
                return Err(e);
            }
        };
        let part = part_path(&target);
        let mut file = match fs::File::create(&part).await {
            Ok(file) => file,
            Err(e) => {
                conn.drain_payload(buf).await?;
                return Err(e.into());
            }
        };

        let result = async {
            let n = conn.recv_payload(&mut file, buf, limit).await?;
            file.sync_all().await?;
            fs::rename(&part, &target).await?;
            Ok::<_, ShardError>(n)
        }
        .await;
        if result.is_err() {
            let _ = fs::remove_file(&part).await;
        }
        if let Ok(n) = &result {
            tracing::debug!(node = %self.node, path = %target.display(), bytes = n, "Stored file");
        }
        result
    }

    /// Open a managed file for reading. Anything that is not a regular file
    /// is reported as not found.
    pub async fn open(&self, raw: &str) -> ShardResult<(fs::File, u64)> {
        let path = self.file_path(raw)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok((fs::File::open(&path).await?, meta.len())),
            _ => Err(ShardError::NotFound(raw.to_string())),
        }
    }

    pub async fn remove(&self, raw: &str) -> ShardResult<()> {
        let path = self.file_path(raw)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {
                fs::remove_file(&path).await?;
                tracing::debug!(node = %self.node, path = %path.display(), "Removed file");
                Ok(())
            }
            _ => Err(ShardError::NotFound(raw.to_string())),
        }
    }

    /// Sorted paths of every managed file under `raw`. Names are relative to
    /// the node root, not to `raw`: listing `~s1/reports` yields
    /// `reports/a.pdf`. A missing directory lists as empty.
    pub async fn list(&self, raw: &str) -> ShardResult<Vec<String>> {
        let vpath = self.translator.parse(raw)?;
        let dir = self.translator.resolve_parsed(&vpath, &self.node);
        let extension = self.extension.clone();
        let files = tokio::task::spawn_blocking(move || managed_files(&dir, &extension))
            .await
            .map_err(|e| ShardError::Io(std::io::Error::other(e)))??;

        if vpath.is_root() {
            return Ok(files);
        }
        let prefix = vpath.segments.join("/");
        Ok(files.into_iter().map(|f| format!("{}/{}", prefix, f)).collect())
    }

    /// Build an archive of every managed file under the root at `output`.
    pub async fn archive(&self, archiver: &dyn Archiver, output: &Path) -> ShardResult<usize> {
        self.ensure_root().await?;
        archiver
            .build(&self.root(), &self.extension, output)
            .await
            .map_err(|e| match e {
                ShardError::Archive(_) => e,
                other => ShardError::Archive(other.to_string()),
            })
    }
}
