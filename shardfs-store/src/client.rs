// SPDX-License-Identifier: AGPL-3.0-or-later
//! Router-side client for a storage node
//!
//! Every request opens a fresh connection. Anything that goes wrong while
//! talking to the node is reported as `BackendUnavailable`.

use shardfs_core::{
    Ack, Connection, Limits, NodeIdentity, NodeRequest, Operation, ShardError, ShardResult,
    TransferBuffer,
};
use std::future::Future;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;

use crate::transport::{ConnectionConfig, TcpConnection};

/// Client for one storage node
#[derive(Debug, Clone)]
pub struct StoreClient {
    node: NodeIdentity,
    connect: ConnectionConfig,
    request_timeout: Duration,
}

impl StoreClient {
    pub fn new(node: &NodeIdentity, limits: &Limits) -> Self {
        Self {
            node: node.clone(),
            connect: ConnectionConfig::for_node(node, limits),
            request_timeout: limits.request_timeout(),
        }
    }

    pub fn node(&self) -> &NodeIdentity {
        &self.node
    }

    fn unavailable(&self, err: ShardError) -> ShardError {
        match err {
            ShardError::BackendUnavailable { .. } => err,
            other => ShardError::backend(&self.node.name, other),
        }
    }

    async fn bounded<T>(&self, fut: impl Future<Output = ShardResult<T>>) -> ShardResult<T> {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result.map_err(|e| self.unavailable(e)),
            Err(_) => Err(self.unavailable(ShardError::Timeout)),
        }
    }

    async fn open(&self) -> ShardResult<Connection<TcpStream>> {
        let conn = TcpConnection::connect(self.connect.clone())
            .await
            .map_err(|e| self.unavailable(e))?;
        Ok(conn.framed())
    }

    /// Send `request` and read the node's acknowledgment. The connection is
    /// returned so the caller can consume a payload that follows it.
    pub async fn request(&self, request: &NodeRequest) -> ShardResult<(Ack, Connection<TcpStream>)> {
        tracing::debug!(node = %self.node.name, request = %request, "Sending request");
        self.bounded(async {
            let mut conn = self.open().await?;
            conn.write_line(&request.to_string()).await?;
            let ack = conn.recv_ack().await?;
            Ok::<_, ShardError>((ack, conn))
        })
        .await
    }

    /// Forward `reader` as the payload of a `STORE` request.
    pub async fn store<R>(&self, name: &str, dest: &str, reader: &mut R, buf: &mut TransferBuffer) -> ShardResult<Ack>
    where
        R: AsyncRead + Unpin,
    {
        let request = NodeRequest::Store {
            name: name.to_string(),
            dest: dest.to_string(),
        };
        tracing::debug!(node = %self.node.name, request = %request, "Sending request");
        self.bounded(async {
            let mut conn = self.open().await?;
            conn.write_line(&request.to_string()).await?;
            conn.send_payload(reader, buf).await?;
            conn.recv_ack().await
        })
        .await
    }

    pub async fn remove(&self, path: &str) -> ShardResult<Ack> {
        let (ack, _conn) = self.request(&NodeRequest::Remove { path: path.to_string() }).await?;
        Ok(ack)
    }

    /// Ask for the listing of `path`. On success the returned connection is
    /// positioned at the start of the listing payload.
    pub async fn open_list(&self, path: &str) -> ShardResult<Connection<TcpStream>> {
        match self.request(&NodeRequest::List { path: path.to_string() }).await? {
            (Ack::Success(Operation::List), conn) => Ok(conn),
            (other, _) => Err(self.unavailable(ShardError::Protocol(format!(
                "listing refused: {}",
                other
            )))),
        }
    }

    pub async fn download(&self, path: &str) -> ShardResult<(Ack, Connection<TcpStream>)> {
        self.request(&NodeRequest::Download { path: path.to_string() }).await
    }

    pub async fn archive(&self, name: &str) -> ShardResult<(Ack, Connection<TcpStream>)> {
        self.request(&NodeRequest::Archive { name: name.to_string() }).await
    }
}
