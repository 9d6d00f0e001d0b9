// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCP transport to storage nodes

use shardfs_core::{Connection, Limits, NodeIdentity, ShardError, ShardResult};
use std::time::Duration;
use tokio::net::TcpStream;

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub addr: String,
    pub port: u16,
    pub timeout_ms: u64,
    pub nodelay: bool, // TCP_NODELAY
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1".into(),
            port: 0,
            timeout_ms: 5000,
            nodelay: true,
        }
    }
}

impl ConnectionConfig {
    pub fn for_node(node: &NodeIdentity, limits: &Limits) -> Self {
        Self {
            addr: node.host.clone(),
            port: node.port,
            timeout_ms: limits.connect_timeout_ms,
            ..Default::default()
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }
}

/// TCP connection wrapper
pub struct TcpConnection {
    stream: TcpStream,
    config: ConnectionConfig,
}

impl TcpConnection {
    pub async fn connect(config: ConnectionConfig) -> ShardResult<Self> {
        let addr = config.address();
        let stream = tokio::time::timeout(
            Duration::from_millis(config.timeout_ms),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| ShardError::Network(format!("connect to {} timed out", addr)))?
        .map_err(|e| ShardError::Network(format!("connect to {}: {}", addr, e)))?;

        stream
            .set_nodelay(config.nodelay)
            .map_err(|e| ShardError::Network(e.to_string()))?;

        Ok(Self { stream, config })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn inner(&self) -> &TcpStream {
        &self.stream
    }

    pub fn framed(self) -> Connection<TcpStream> {
        Connection::new(self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let conn = TcpConnection::connect(ConnectionConfig { port, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(conn.config().port, port);
        assert!(conn.inner().nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_connect_refused_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = TcpConnection::connect(ConnectionConfig { port, ..Default::default() })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ShardError::Network(_)));
    }

    #[test]
    fn test_for_node() {
        let config = shardfs_core::ClusterConfig::default();
        let cc = ConnectionConfig::for_node(&config.stores[0], &config.limits);
        assert_eq!(cc.address(), "127.0.0.1:7082");
        assert_eq!(cc.timeout_ms, 5000);
    }
}
