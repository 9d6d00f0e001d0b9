// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node identities and the extension route table

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ShardError, ShardResult};

/// A managed file extension, always stored with its leading dot (`.pdf`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Extension(pub(crate) String);

impl Extension {
    /// Parse `pdf` or `.pdf`; case is preserved.
    pub fn new(raw: impl AsRef<str>) -> ShardResult<Self> {
        let raw = raw.as_ref().trim();
        let bare = raw.strip_prefix('.').unwrap_or(raw);
        if bare.is_empty() || bare.contains(['.', '/', ' ']) {
            return Err(ShardError::UnsupportedType(raw.to_string()));
        }
        Ok(Self(format!(".{}", bare)))
    }

    /// Extension of the last segment of `path`, if any.
    pub fn of(path: &str) -> Option<Self> {
        let name = path.rsplit('/').next()?;
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(Self(format!(".{}", ext)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, path: &str) -> bool {
        Self::of(path).as_ref() == Some(self)
    }
}

impl TryFrom<String> for Extension {
    type Error = ShardError;

    fn try_from(value: String) -> ShardResult<Self> {
        Self::new(value)
    }
}

impl From<Extension> for String {
    fn from(value: Extension) -> Self {
        value.0
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Static identity of one node in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Node name; also the name of its directory under the home directory
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Type persisted by this node
    pub extension: Extension,
    /// Name of the archive produced by `downltar` for this type
    pub archive_name: String,
}

impl NodeIdentity {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} @ {})", self.name, self.extension, self.address())
    }
}

/// Where a file type is served from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route<'a> {
    Local(&'a NodeIdentity),
    Remote(&'a NodeIdentity),
}

impl<'a> Route<'a> {
    pub fn node(&self) -> &'a NodeIdentity {
        match self {
            Route::Local(node) | Route::Remote(node) => node,
        }
    }
}

/// Extension → owning node
#[derive(Debug, Clone)]
pub struct RouteTable {
    local: NodeIdentity,
    remotes: Vec<NodeIdentity>,
}

impl RouteTable {
    pub fn new(local: NodeIdentity, remotes: Vec<NodeIdentity>) -> ShardResult<Self> {
        let mut seen_names = vec![local.name.as_str()];
        let mut seen_exts = vec![&local.extension];
        for node in &remotes {
            if seen_names.contains(&node.name.as_str()) {
                return Err(ShardError::Configuration(format!(
                    "duplicate node name: {}",
                    node.name
                )));
            }
            if seen_exts.contains(&&node.extension) {
                return Err(ShardError::Configuration(format!(
                    "extension {} routed to more than one node",
                    node.extension
                )));
            }
            seen_names.push(&node.name);
            seen_exts.push(&node.extension);
        }
        Ok(Self { local, remotes })
    }

    pub fn local(&self) -> &NodeIdentity {
        &self.local
    }

    pub fn remotes(&self) -> &[NodeIdentity] {
        &self.remotes
    }

    /// All nodes in aggregation order: local first, then remotes as configured.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeIdentity> {
        std::iter::once(&self.local).chain(self.remotes.iter())
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes().map(|n| n.name.clone()).collect()
    }

    pub fn route(&self, extension: &Extension) -> Option<Route<'_>> {
        if &self.local.extension == extension {
            return Some(Route::Local(&self.local));
        }
        self.remotes
            .iter()
            .find(|n| &n.extension == extension)
            .map(Route::Remote)
    }

    /// Route for the file named by the last segment of `path`.
    pub fn route_path(&self, path: &str) -> ShardResult<Route<'_>> {
        let ext = Extension::of(path).ok_or_else(|| ShardError::MissingExtension(path.to_string()))?;
        self.route(&ext)
            .ok_or_else(|| ShardError::UnsupportedType(ext.to_string()))
    }
}
