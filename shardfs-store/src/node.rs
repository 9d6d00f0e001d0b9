// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage node server
//!
//! A node serves one request per connection and handles connections strictly
//! one at a time: the accept loop awaits each session before accepting the
//! next.

use shardfs_core::{
    Ack, ClusterConfig, Connection, Limits, NamespaceTranslator, NodeIdentity, NodeRequest,
    Operation, Reason, ShardError, ShardResult, TransferBuffer,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::archive::{archiver_for, Archiver};
use crate::local::NamespaceRoot;

/// File name of the archive inside its staging directory
const STAGED_ARCHIVE: &str = "export.tar";

/// Turn a per-request error into a failure acknowledgment, or propagate it
/// when the connection can no longer be answered.
fn failure(op: Operation, err: ShardError) -> ShardResult<Ack> {
    if err.is_connection_fatal() {
        return Err(err);
    }
    tracing::debug!(operation = op.as_str(), error = %err, "Request failed");
    Ok(Ack::failed(op, err.reason()))
}

pub struct StorageNode {
    identity: NodeIdentity,
    namespace: NamespaceRoot,
    archiver: Arc<dyn Archiver>,
    limits: Limits,
    listener: TcpListener,
}

impl StorageNode {
    /// Bind the node's configured address and create its namespace root.
    pub async fn bind(
        identity: NodeIdentity,
        translator: NamespaceTranslator,
        archiver: Arc<dyn Archiver>,
        limits: Limits,
    ) -> ShardResult<Self> {
        let namespace = NamespaceRoot::new(&identity, translator);
        namespace.ensure_root().await?;

        let listener = TcpListener::bind(identity.address()).await.map_err(|e| {
            ShardError::Configuration(format!("cannot bind {}: {}", identity.address(), e))
        })?;

        Ok(Self {
            identity,
            namespace,
            archiver,
            limits,
            listener,
        })
    }

    /// Bind the storage node named `store` (by name or extension) in `config`.
    pub async fn from_config(config: &ClusterConfig, store: &str) -> ShardResult<Self> {
        let identity = config.store(store)?.clone();
        Self::bind(
            identity,
            config.translator()?,
            archiver_for(config.archiver),
            config.limits.clone(),
        )
        .await
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn local_addr(&self) -> ShardResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> ShardResult<()> {
        self.serve_until(std::future::pending()).await
    }

    /// Serve sessions until `shutdown` completes.
    pub async fn serve_until<F>(self, shutdown: F) -> ShardResult<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(
            node = %self.identity.name,
            addr = %self.local_addr()?,
            root = %self.namespace.root().display(),
            archiver = self.archiver.name(),
            "Storage node listening"
        );
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.session(stream, peer).await,
                    Err(e) => tracing::warn!(node = %self.identity.name, error = %e, "Accept failed"),
                },
            }
        }
        tracing::info!(node = %self.identity.name, "Storage node stopped");
        Ok(())
    }

    async fn session(&self, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let mut conn = Connection::new(stream);
        match tokio::time::timeout(self.limits.request_timeout(), self.handle(&mut conn)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(node = %self.identity.name, %peer, error = %e, "Session failed")
            }
            Err(_) => tracing::warn!(node = %self.identity.name, %peer, "Session timed out"),
        }
        let _ = conn.shutdown().await;
    }

    /// Serve one request on `conn`.
    pub async fn handle<S>(&self, conn: &mut Connection<S>) -> ShardResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(line) = conn.read_line().await? else {
            return Ok(());
        };
        let request = match NodeRequest::parse(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(node = %self.identity.name, error = %e, "Rejected request");
                return conn.send_ack(&e.ack()).await;
            }
        };
        tracing::debug!(node = %self.identity.name, request = %request, "Handling request");

        let mut buf = TransferBuffer::new(self.limits.chunk_size);
        let op = request.operation();
        match request {
            NodeRequest::Store { name, dest } => {
                let ack = match self
                    .namespace
                    .store_from(&name, &dest, conn, &mut buf, self.limits.max_payload_bytes)
                    .await
                {
                    Ok(_) => Ack::Success(op),
                    Err(e) => failure(op, e)?,
                };
                conn.send_ack(&ack).await
            }
            NodeRequest::Download { path } => match self.namespace.open(&path).await {
                Ok((mut file, _)) => {
                    conn.send_ack(&Ack::Success(op)).await?;
                    conn.send_payload(&mut file, &mut buf).await?;
                    Ok(())
                }
                Err(e) => conn.send_ack(&failure(op, e)?).await,
            },
            NodeRequest::Remove { path } => {
                let ack = match self.namespace.remove(&path).await {
                    Ok(()) => Ack::Success(op),
                    Err(e) => failure(op, e)?,
                };
                conn.send_ack(&ack).await
            }
            NodeRequest::List { path } => match self.namespace.list(&path).await {
                Ok(files) => {
                    conn.send_ack(&Ack::Success(op)).await?;
                    conn.send_bytes(files.join("\n").as_bytes(), &buf).await
                }
                Err(e) => conn.send_ack(&failure(op, e)?).await,
            },
            NodeRequest::Archive { name } => self.export(conn, name, &mut buf).await,
        }
    }

    async fn export<S>(&self, conn: &mut Connection<S>, name: String, buf: &mut TransferBuffer) -> ShardResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let op = Operation::Tar;
        let staging = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                tracing::error!(node = %self.identity.name, error = %e, "Cannot create archive staging directory");
                return conn.send_ack(&Ack::failed(op, Reason::TempFile)).await;
            }
        };
        let output = staging.path().join(STAGED_ARCHIVE);
        let count = match self.namespace.archive(self.archiver.as_ref(), &output).await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(node = %self.identity.name, error = %e, "Archive failed");
                return conn.send_ack(&failure(op, e)?).await;
            }
        };
        let mut file = match tokio::fs::File::open(&output).await {
            Ok(file) => file,
            Err(e) => {
                tracing::error!(node = %self.identity.name, error = %e, "Cannot open staged archive");
                return conn.send_ack(&Ack::failed(op, Reason::FileOpenError)).await;
            }
        };
        tracing::info!(node = %self.identity.name, archive = %name, files = count, "Exporting archive");
        conn.send_ack(&Ack::Archive(name)).await?;
        conn.send_payload(&mut file, buf).await?;
        Ok(())
    }
}
