// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage nodes for shardfs
//!
//! Each node owns one file type under `<home>/<node>` and answers `STORE`,
//! `DOWNLOAD`, `REMOVE`, `LIST` and `TAR:` requests, one per connection.

pub mod archive;
pub mod client;
mod local;
pub mod node;
pub mod transport;

pub use archive::{archiver_for, Archiver, SystemTarArchiver, TarArchiver};
pub use client::StoreClient;
pub use local::NamespaceRoot;
pub use node::StorageNode;
pub use transport::{ConnectionConfig, TcpConnection};
