// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster configuration
//!
//! Loaded from an optional TOML file. Every field has a default matching the
//! stock four-node deployment, so an empty file (or no file) is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ShardError, ShardResult};
use crate::frame::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use crate::node::{Extension, NodeIdentity, RouteTable};
use crate::path::NamespaceTranslator;

/// Which archive builder a node uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiverKind {
    /// In-process deterministic tar writer
    #[default]
    Builtin,
    /// External `tar` program
    System,
}

/// Transfer limits and deadlines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub chunk_size: usize,
    pub max_payload_bytes: u64,
    pub max_listing_bytes: u64,
    pub request_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub connect_timeout_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_payload_bytes: 1024 * 1024 * 1024, // 1 GiB
            max_listing_bytes: 16 * 1024 * 1024,
            request_timeout_secs: 300,
            idle_timeout_secs: 900,
            connect_timeout_ms: 5000,
        }
    }
}

impl Limits {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Whole-cluster configuration shared by the router and the storage nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Directory holding every node root; defaults to the user's home
    pub home: Option<PathBuf>,
    pub router: NodeIdentity,
    pub stores: Vec<NodeIdentity>,
    pub archiver: ArchiverKind,
    pub limits: Limits,
}

fn identity(name: &str, port: u16, ext: &str, archive_name: &str) -> NodeIdentity {
    NodeIdentity {
        name: name.to_string(),
        host: "127.0.0.1".to_string(),
        port,
        extension: Extension(format!(".{}", ext)),
        archive_name: archive_name.to_string(),
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            home: None,
            router: identity("s1", 5077, "c", "cfiles.tar"),
            stores: vec![
                identity("s2", 7082, "pdf", "pdfiles.tar"),
                identity("s3", 3032, "txt", "txtfiles.tar"),
                identity("s4", 2022, "zip", "zipfiles.tar"),
            ],
            archiver: ArchiverKind::default(),
            limits: Limits::default(),
        }
    }
}

impl ClusterConfig {
    /// Load from `path`, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> ShardResult<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    ShardError::Configuration(format!("cannot read {}: {}", path.display(), e))
                })?;
                tracing::debug!("Loading cluster configuration from {}", path.display());
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> ShardResult<Self> {
        toml::from_str(text).map_err(|e| ShardError::Configuration(e.to_string()))
    }

    pub fn validate(&self) -> ShardResult<()> {
        if self.limits.chunk_size == 0 || self.limits.chunk_size > MAX_CHUNK_SIZE {
            return Err(ShardError::Configuration(format!(
                "chunk_size must be between 1 and {}",
                MAX_CHUNK_SIZE
            )));
        }
        for node in std::iter::once(&self.router).chain(&self.stores) {
            if node.name.is_empty() || node.name.contains(['/', ' ', '~']) {
                return Err(ShardError::Configuration(format!("invalid node name: {:?}", node.name)));
            }
            if node.archive_name.is_empty() || node.archive_name.contains(['/', ' ']) {
                return Err(ShardError::Configuration(format!(
                    "invalid archive name for {}: {:?}",
                    node.name, node.archive_name
                )));
            }
        }
        self.route_table().map(|_| ())
    }

    pub fn route_table(&self) -> ShardResult<RouteTable> {
        RouteTable::new(self.router.clone(), self.stores.clone())
    }

    pub fn store(&self, name_or_ext: &str) -> ShardResult<&NodeIdentity> {
        let ext = Extension::new(name_or_ext).ok();
        self.stores
            .iter()
            .find(|n| n.name == name_or_ext || Some(&n.extension) == ext.as_ref())
            .ok_or_else(|| ShardError::Configuration(format!("no storage node for {}", name_or_ext)))
    }

    /// Translator over every configured node, rooted at `home` or the
    /// process home directory.
    pub fn translator(&self) -> ShardResult<NamespaceTranslator> {
        let names = std::iter::once(&self.router)
            .chain(&self.stores)
            .map(|n| n.name.clone());
        match &self.home {
            Some(home) => Ok(NamespaceTranslator::new(home.clone(), names)),
            None => NamespaceTranslator::from_home_dir(names),
        }
    }
}
