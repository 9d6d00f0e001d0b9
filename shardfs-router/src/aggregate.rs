// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster-wide listing
//!
//! The local listing and one `LIST` per storage node are issued concurrently.
//! The results are then streamed to the client as one payload, in route-table
//! order, with each node's payload relayed chunk by chunk. Every name is
//! followed by a newline. A node that cannot be reached contributes an empty
//! segment; once the payload has started, a failure or an overflow of
//! `max_listing_bytes` aborts it.

use futures::future::join_all;
use shardfs_core::{Ack, Connection, Operation, ShardError, ShardResult, TransferBuffer};
use shardfs_store::StoreClient;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::server::RouterContext;

/// What one node contributed to a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingSegment {
    pub node: String,
    /// Payload bytes sent for this node
    pub bytes: u64,
    /// Set when the node could not be listed
    pub error: Option<String>,
}

impl ListingSegment {
    fn listed(node: &str, bytes: u64) -> Self {
        Self { node: node.to_string(), bytes, error: None }
    }

    fn failed(node: &str, err: &ShardError) -> Self {
        tracing::warn!(node = %node, error = %err, "Listing failed, segment left empty");
        Self {
            node: node.to_string(),
            bytes: 0,
            error: Some(err.to_string()),
        }
    }
}

/// Newline-terminated names, as they appear in the payload.
fn render(names: &[String]) -> String {
    names.iter().map(|n| format!("{}\n", n)).collect()
}

async fn open_remote(ctx: &RouterContext, client: &StoreClient, path: &str) -> ShardResult<Connection<TcpStream>> {
    let rewritten = ctx.translator.rewrite(path, &client.node().name)?;
    client.open_list(&rewritten).await
}

/// Abort the listing payload after a failure in `node`'s segment.
async fn abort<S>(conn: &mut Connection<S>, mut segments: Vec<ListingSegment>, node: &str, err: ShardError) -> ShardResult<Vec<ListingSegment>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tracing::error!(node = %node, error = %err, "Listing aborted");
    conn.abort_payload().await?;
    segments.push(ListingSegment {
        node: node.to_string(),
        bytes: 0,
        error: Some(err.to_string()),
    });
    Ok(segments)
}

/// List `path` across the whole cluster and send it to `conn`, acknowledgment
/// included. Errors are returned only when `conn` itself fails.
pub async fn stream<S>(
    ctx: &RouterContext,
    path: &str,
    conn: &mut Connection<S>,
    buf: &mut TransferBuffer,
) -> ShardResult<Vec<ListingSegment>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let local = ctx.local.list(path);
    let remotes = join_all(ctx.stores.iter().map(|client| open_remote(ctx, client, path)));
    let (local, remotes) = tokio::join!(local, remotes);

    conn.send_ack(&Ack::Success(Operation::List)).await?;
    let limit = ctx.limits.max_listing_bytes;
    let mut budget = limit;
    let mut segments = Vec::with_capacity(ctx.stores.len() + 1);

    let node = ctx.local.node();
    match local {
        Ok(names) => {
            let text = render(&names);
            let len = text.len() as u64;
            if len > budget {
                return abort(conn, segments, node, ShardError::Capacity { limit }).await;
            }
            for chunk in text.as_bytes().chunks(buf.capacity()) {
                conn.write_chunk(chunk).await?;
            }
            budget -= len;
            segments.push(ListingSegment::listed(node, len));
        }
        Err(e) => segments.push(ListingSegment::failed(node, &e)),
    }

    for (client, opened) in ctx.stores.iter().zip(remotes) {
        let node = &client.node().name;
        let mut upstream = match opened {
            Ok(upstream) => upstream,
            Err(e) => {
                segments.push(ListingSegment::failed(node, &e));
                continue;
            }
        };
        let mut sent = match upstream.forward_chunks(conn, buf, budget).await {
            Ok(sent) => sent,
            Err(e) => return abort(conn, segments, node, e).await,
        };
        // Node payloads are newline-separated; terminate the last name.
        if sent > 0 {
            if budget == sent {
                return abort(conn, segments, node, ShardError::Capacity { limit }).await;
            }
            conn.write_chunk(b"\n").await?;
            sent += 1;
        }
        budget -= sent;
        segments.push(ListingSegment::listed(node, sent));
    }

    conn.finish_payload().await?;
    Ok(segments)
}
