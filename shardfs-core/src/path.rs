// SPDX-License-Identifier: AGPL-3.0-or-later
//! Virtual paths and namespace translation
//!
//! Every node owns `<home>/<node-name>`. Clients address files with virtual
//! paths such as `~s1/reports/a.pdf`; before touching a filesystem the path is
//! rewritten for the node that owns the file type (`~s2/reports/a.pdf`) and
//! then resolved under that node's root.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::config::ClusterConfig;
use crate::error::{ShardError, ShardResult};

/// How a virtual path was anchored before normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anchor {
    /// `~<node>/...`, `~/<node>/...` or `<home>/<node>/...`
    Node(String),
    /// Bare relative path, taken relative to the target node's root
    Root,
}

/// A normalized virtual path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VirtualPath {
    /// Node named by the path, if any
    pub node: Option<String>,
    /// Path segments below the node root
    pub segments: Vec<String>,
}

impl VirtualPath {
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(|s| s.as_str())
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn join(&self, name: impl AsRef<str>) -> ShardResult<Self> {
        let mut segments = self.segments.clone();
        push_segments(&mut segments, name.as_ref())?;
        Ok(Self { node: self.node.clone(), segments })
    }

    /// Node-relative form for `target`: `~<target>/<segments>`.
    pub fn for_node(&self, target: &str) -> String {
        if self.segments.is_empty() {
            format!("~{}", target)
        } else {
            format!("~{}/{}", target, self.segments.join("/"))
        }
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            Some(node) => f.write_str(&self.for_node(node)),
            None => write!(f, "{}", self.segments.join("/")),
        }
    }
}

fn push_segments(segments: &mut Vec<String>, raw: &str) -> ShardResult<()> {
    for part in raw.split('/').filter(|s| !s.is_empty()) {
        match part {
            "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(ShardError::InvalidPath(format!(
                        "{} escapes the namespace root",
                        raw
                    )));
                }
            }
            seg => segments.push(seg.to_string()),
        }
    }
    Ok(())
}

/// Maps virtual paths onto node namespace roots
#[derive(Debug, Clone)]
pub struct NamespaceTranslator {
    home: PathBuf,
    nodes: Vec<String>,
}

impl NamespaceTranslator {
    pub fn new(home: impl Into<PathBuf>, nodes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            home: home.into(),
            nodes: nodes.into_iter().map(Into::into).collect(),
        }
    }

    /// Translator rooted at the process home directory.
    pub fn from_home_dir(nodes: impl IntoIterator<Item = impl Into<String>>) -> ShardResult<Self> {
        let home = directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .ok_or_else(|| ShardError::Configuration("home directory cannot be determined".into()))?;
        Ok(Self::new(home, nodes))
    }

    pub fn from_config(config: &ClusterConfig) -> ShardResult<Self> {
        config.translator()
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn is_node(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n == name)
    }

    /// Physical root of `node`.
    pub fn root_of(&self, node: &str) -> PathBuf {
        self.home.join(node)
    }

    pub fn parse(&self, raw: &str) -> ShardResult<VirtualPath> {
        let raw = raw.trim();
        let (anchor, rest) = self.split_anchor(raw)?;
        let mut segments = Vec::new();
        push_segments(&mut segments, rest)?;
        let node = match anchor {
            Anchor::Node(node) => Some(node),
            Anchor::Root => None,
        };
        Ok(VirtualPath { node, segments })
    }

    fn split_anchor<'a>(&self, raw: &'a str) -> ShardResult<(Anchor, &'a str)> {
        if let Some(after) = raw.strip_prefix('~') {
            if after.is_empty() || after.starts_with('/') {
                return self.split_home_relative(raw, after);
            }
            let (node, rest) = after.split_once('/').unwrap_or((after, ""));
            if !self.is_node(node) {
                return Err(ShardError::InvalidPath(format!("unknown node in {}", raw)));
            }
            return Ok((Anchor::Node(node.to_string()), rest));
        }

        if raw.starts_with('/') {
            let home = self.home.to_string_lossy();
            let home = home.trim_end_matches('/');
            let after = raw
                .strip_prefix(home)
                .filter(|rest| rest.is_empty() || rest.starts_with('/'))
                .ok_or_else(|| ShardError::InvalidPath(format!("{} is outside the home directory", raw)))?;
            return self.split_home_relative(raw, after);
        }

        Ok((Anchor::Root, raw))
    }

    fn split_home_relative<'a>(&self, raw: &str, after: &'a str) -> ShardResult<(Anchor, &'a str)> {
        let trimmed = after.trim_start_matches('/');
        let (first, rest) = trimmed.split_once('/').unwrap_or((trimmed, ""));
        if self.is_node(first) {
            Ok((Anchor::Node(first.to_string()), rest))
        } else {
            Err(ShardError::InvalidPath(format!(
                "{} does not name a node namespace",
                raw
            )))
        }
    }

    /// Rewrite `raw` into `target`'s namespace, in virtual form.
    pub fn rewrite(&self, raw: &str, target: &str) -> ShardResult<String> {
        Ok(self.parse(raw)?.for_node(target))
    }

    /// Resolve `raw` to a physical path inside `target`'s root.
    pub fn resolve(&self, raw: &str, target: &str) -> ShardResult<PathBuf> {
        let vpath = self.parse(raw)?;
        Ok(self.resolve_parsed(&vpath, target))
    }

    pub fn resolve_parsed(&self, vpath: &VirtualPath, target: &str) -> PathBuf {
        let mut path = self.root_of(target);
        for seg in &vpath.segments {
            path.push(seg);
        }
        path
    }

    /// Whether `path` lies within `target`'s root, judged lexically.
    pub fn contains(&self, target: &str, path: &Path) -> bool {
        let root = self.root_of(target);
        path.starts_with(&root)
            && !path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
    }
}
