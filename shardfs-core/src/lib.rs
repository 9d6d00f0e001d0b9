// SPDX-License-Identifier: AGPL-3.0-or-later
//! shardfs core
//!
//! Wire vocabulary, framing, namespace translation and cluster configuration
//! shared by the router, the storage nodes and the client.

pub mod config;
pub mod error;
pub mod frame;
pub mod node;
pub mod path;
pub mod protocol;

pub use config::{ArchiverKind, ClusterConfig, Limits};
pub use error::{ShardError, ShardResult};
pub use frame::{Connection, TransferBuffer, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MAX_LINE_LEN};
pub use node::{Extension, NodeIdentity, Route, RouteTable};
pub use path::{NamespaceTranslator, VirtualPath};
pub use protocol::{Ack, Command, CommandError, NodeRequest, Operation, Reason};
