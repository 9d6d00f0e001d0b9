// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-connection command dispatch
//!
//! A session reads one command line at a time, serves it completely
//! (including any payload in either direction) and goes back to waiting for
//! the next command. It ends on `exit`, end-of-stream, an expired deadline or
//! an error that leaves the stream out of sync.

use shardfs_core::{
    Ack, Command, CommandError, Connection, Extension, Operation, Reason, Route, ShardError,
    ShardResult, TransferBuffer,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::aggregate;
use crate::server::RouterContext;

/// Whether the session continues after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Relay a storage node's acknowledgment to the client under `op`.
fn relay_ack(ack: Ack, op: Operation) -> Ack {
    match ack {
        Ack::Success(_) | Ack::Failed(..) | Ack::InvalidCommand => ack.relabel(op),
        other => {
            tracing::warn!(ack = %other, "Unexpected acknowledgment from storage node");
            Ack::failed(op, Reason::BackendUnavailable)
        }
    }
}

fn failure(op: Operation, err: ShardError) -> ShardResult<Ack> {
    if err.is_connection_fatal() {
        return Err(err);
    }
    tracing::debug!(operation = op.as_str(), error = %err, "Command failed");
    Ok(Ack::failed(op, err.reason()))
}

pub struct Session<S> {
    ctx: Arc<RouterContext>,
    conn: Connection<S>,
    peer: SocketAddr,
    buf: TransferBuffer,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(ctx: Arc<RouterContext>, stream: S, peer: SocketAddr) -> Self {
        let buf = TransferBuffer::new(ctx.limits.chunk_size);
        Self {
            ctx,
            conn: Connection::new(stream),
            peer,
            buf,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(peer = %self.peer, "Client connected");
        loop {
            let line = match tokio::time::timeout(self.ctx.limits.idle_timeout(), self.conn.read_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    tracing::warn!(peer = %self.peer, error = %e, "Read failed");
                    break;
                }
                Err(_) => {
                    tracing::info!(peer = %self.peer, "Idle timeout");
                    break;
                }
            };

            let deadline = self.ctx.limits.request_timeout();
            match tokio::time::timeout(deadline, self.dispatch(&line)).await {
                Ok(Ok(Flow::Continue)) => {}
                Ok(Ok(Flow::Close)) => break,
                Ok(Err(e)) => {
                    tracing::warn!(peer = %self.peer, command = %line, error = %e, "Closing connection");
                    break;
                }
                Err(_) => {
                    tracing::warn!(peer = %self.peer, command = %line, "Command timed out");
                    break;
                }
            }
        }
        let _ = self.conn.shutdown().await;
        tracing::info!(peer = %self.peer, "Client disconnected");
    }

    /// Serve one command line.
    pub async fn dispatch(&mut self, line: &str) -> ShardResult<Flow> {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(e) => return self.reject(line, e).await,
        };
        tracing::debug!(peer = %self.peer, command = %command, "Dispatching");

        match command {
            Command::Store { name, dest } => self.store(&name, &dest).await?,
            Command::Retrieve { path } => self.retrieve(&path).await?,
            Command::Remove { path } => self.remove(&path).await?,
            Command::List { path } => self.list(&path).await?,
            Command::ArchiveExport { extension } => self.export(&extension).await?,
            Command::Terminate => {
                self.conn.send_ack(&Ack::Goodbye).await?;
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    async fn reject(&mut self, line: &str, err: CommandError) -> ShardResult<Flow> {
        tracing::debug!(peer = %self.peer, error = %err, "Rejected command");
        if Command::has_payload(line) {
            self.conn.drain_payload(&mut self.buf).await?;
        }
        self.conn.send_ack(&err.ack()).await?;
        Ok(Flow::Continue)
    }

    async fn store(&mut self, name: &str, dest: &str) -> ShardResult<()> {
        let op = Operation::Upload;
        let ctx = self.ctx.clone();
        let limit = ctx.limits.max_payload_bytes;

        let route = match ctx.routes.route_path(name) {
            Ok(route) => route,
            Err(e) => {
                self.conn.drain_payload(&mut self.buf).await?;
                return self.conn.send_ack(&failure(op, e)?).await;
            }
        };

        let ack = match route {
            Route::Local(_) => {
                match ctx.local.store_from(name, dest, &mut self.conn, &mut self.buf, limit).await {
                    Ok(bytes) => {
                        tracing::info!(peer = %self.peer, file = %name, bytes, "Stored locally");
                        Ack::Success(op)
                    }
                    Err(e) => failure(op, e)?,
                }
            }
            Route::Remote(node) => {
                let client = ctx.client_for(&node.name)?;
                let rewritten = match ctx.translator.rewrite(dest, &node.name) {
                    Ok(rewritten) => rewritten,
                    Err(e) => {
                        self.conn.drain_payload(&mut self.buf).await?;
                        return self.conn.send_ack(&failure(op, e)?).await;
                    }
                };

                // The whole payload is spooled before the node is contacted.
                let spooled = tempfile::NamedTempFile::new().and_then(|spool| {
                    let file = spool.reopen()?;
                    Ok((spool, file))
                });
                let (spool, file) = match spooled {
                    Ok(spooled) => spooled,
                    Err(e) => {
                        self.conn.drain_payload(&mut self.buf).await?;
                        return self.conn.send_ack(&failure(op, e.into())?).await;
                    }
                };
                let mut file = tokio::fs::File::from_std(file);
                match self.conn.recv_payload(&mut file, &mut self.buf, limit).await {
                    Ok(_) => {
                        drop(file);
                        let forwarded = match tokio::fs::File::open(spool.path()).await {
                            Ok(mut reader) => client.store(name, &rewritten, &mut reader, &mut self.buf).await,
                            Err(e) => Err(e.into()),
                        };
                        match forwarded {
                            Ok(ack) => {
                                tracing::info!(peer = %self.peer, file = %name, node = %node.name, ack = %ack, "Forwarded upload");
                                relay_ack(ack, op)
                            }
                            Err(e) => {
                                tracing::warn!(node = %node.name, error = %e, "Forwarding upload failed");
                                failure(op, e)?
                            }
                        }
                    }
                    Err(e) => failure(op, e)?,
                }
            }
        };
        self.conn.send_ack(&ack).await
    }

    async fn retrieve(&mut self, path: &str) -> ShardResult<()> {
        let op = Operation::Download;
        let ctx = self.ctx.clone();
        let route = match ctx.routes.route_path(path) {
            Ok(route) => route,
            Err(e) => return self.conn.send_ack(&failure(op, e)?).await,
        };

        match route {
            Route::Local(_) => match ctx.local.open(path).await {
                Ok((mut file, size)) => {
                    self.conn.send_ack(&Ack::Success(op)).await?;
                    self.conn.send_payload(&mut file, &mut self.buf).await?;
                    tracing::info!(peer = %self.peer, file = %path, bytes = size, "Sent local file");
                    Ok(())
                }
                Err(e) => self.conn.send_ack(&failure(op, e)?).await,
            },
            Route::Remote(node) => {
                let client = ctx.client_for(&node.name)?;
                let rewritten = match ctx.translator.rewrite(path, &node.name) {
                    Ok(rewritten) => rewritten,
                    Err(e) => return self.conn.send_ack(&failure(op, e)?).await,
                };
                match client.download(&rewritten).await {
                    Ok((Ack::Success(_), mut upstream)) => {
                        self.conn.send_ack(&Ack::Success(op)).await?;
                        match upstream.relay_payload(&mut self.conn, &mut self.buf).await {
                            Ok(bytes) => {
                                tracing::info!(peer = %self.peer, file = %path, node = %node.name, bytes, "Relayed file")
                            }
                            Err(e) => {
                                tracing::warn!(node = %node.name, error = %e, "Relay aborted")
                            }
                        }
                        Ok(())
                    }
                    Ok((ack, _)) => self.conn.send_ack(&relay_ack(ack, op)).await,
                    Err(e) => self.conn.send_ack(&failure(op, e)?).await,
                }
            }
        }
    }

    async fn remove(&mut self, path: &str) -> ShardResult<()> {
        let op = Operation::Remove;
        let ctx = self.ctx.clone();
        let ack = match ctx.routes.route_path(path) {
            Err(e) => failure(op, e)?,
            Ok(Route::Local(_)) => match ctx.local.remove(path).await {
                Ok(()) => Ack::Success(op),
                Err(e) => failure(op, e)?,
            },
            Ok(Route::Remote(node)) => {
                let client = ctx.client_for(&node.name)?;
                match ctx.translator.rewrite(path, &node.name) {
                    Err(e) => failure(op, e)?,
                    Ok(rewritten) => match client.remove(&rewritten).await {
                        Ok(ack) => relay_ack(ack, op),
                        Err(e) => failure(op, e)?,
                    },
                }
            }
        };
        tracing::info!(peer = %self.peer, file = %path, ack = %ack, "Remove");
        self.conn.send_ack(&ack).await
    }

    async fn list(&mut self, path: &str) -> ShardResult<()> {
        let op = Operation::List;
        if let Err(e) = self.ctx.translator.parse(path) {
            return self.conn.send_ack(&failure(op, e)?).await;
        }
        let ctx = self.ctx.clone();
        let segments = aggregate::stream(&ctx, path, &mut self.conn, &mut self.buf).await?;
        let bytes: u64 = segments.iter().map(|s| s.bytes).sum();
        tracing::info!(peer = %self.peer, path = %path, bytes, "Listed");
        Ok(())
    }

    async fn export(&mut self, extension: &str) -> ShardResult<()> {
        let op = Operation::Tar;
        let ctx = self.ctx.clone();
        let route = match Extension::new(extension) {
            Ok(ext) => ctx.routes.route(&ext),
            Err(_) => None,
        };
        let Some(route) = route else {
            return self.conn.send_ack(&Ack::failed(op, Reason::InvalidFileType)).await;
        };

        match route {
            Route::Local(node) => {
                let staging = match tempfile::tempdir() {
                    Ok(dir) => dir,
                    Err(e) => {
                        tracing::error!(error = %e, "Cannot create archive staging directory");
                        return self.conn.send_ack(&Ack::failed(op, Reason::TempFile)).await;
                    }
                };
                let output = staging.path().join(&node.archive_name);
                let count = match ctx.local.archive(ctx.archiver.as_ref(), &output).await {
                    Ok(count) => count,
                    Err(e) => {
                        tracing::error!(error = %e, "Local archive failed");
                        return self.conn.send_ack(&Ack::failed(op, Reason::ArchiveFailed)).await;
                    }
                };
                let mut file = match tokio::fs::File::open(&output).await {
                    Ok(file) => file,
                    Err(e) => {
                        tracing::error!(error = %e, "Cannot open staged archive");
                        return self.conn.send_ack(&Ack::failed(op, Reason::FileOpenError)).await;
                    }
                };
                self.conn.send_ack(&Ack::Archive(node.archive_name.clone())).await?;
                self.conn.send_payload(&mut file, &mut self.buf).await?;
                tracing::info!(peer = %self.peer, archive = %node.archive_name, files = count, "Sent local archive");
                Ok(())
            }
            Route::Remote(node) => {
                let client = ctx.client_for(&node.name)?;
                match client.archive(&node.archive_name).await {
                    Ok((Ack::Archive(name), mut upstream)) => {
                        self.conn.send_ack(&Ack::Archive(name.clone())).await?;
                        match upstream.relay_payload(&mut self.conn, &mut self.buf).await {
                            Ok(bytes) => {
                                tracing::info!(peer = %self.peer, archive = %name, node = %node.name, bytes, "Relayed archive")
                            }
                            Err(e) => tracing::warn!(node = %node.name, error = %e, "Relay aborted"),
                        }
                        Ok(())
                    }
                    Ok((ack, _)) => self.conn.send_ack(&relay_ack(ack, op)).await,
                    Err(e) => self.conn.send_ack(&failure(op, e)?).await,
                }
            }
        }
    }
}
