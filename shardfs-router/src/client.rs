// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client for the router's command protocol

use shardfs_core::{
    Ack, Command, Connection, Limits, Operation, ShardError, ShardResult, TransferBuffer,
};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use shardfs_store::{ConnectionConfig, TcpConnection};

/// One client session with a router
pub struct RouterClient {
    conn: Connection<TcpStream>,
    buf: TransferBuffer,
    max_payload: u64,
}

impl RouterClient {
    pub async fn connect(addr: &str, limits: &Limits) -> ShardResult<Self> {
        let (host, port) = addr
            .rsplit_once(':')
            .and_then(|(host, port)| port.parse::<u16>().ok().map(|port| (host, port)))
            .ok_or_else(|| ShardError::Configuration(format!("invalid router address: {}", addr)))?;
        let conn = TcpConnection::connect(ConnectionConfig {
            addr: host.to_string(),
            port,
            timeout_ms: limits.connect_timeout_ms,
            ..Default::default()
        })
        .await?;
        Ok(Self {
            conn: conn.framed(),
            buf: TransferBuffer::new(limits.chunk_size),
            max_payload: limits.max_payload_bytes,
        })
    }

    /// Raw framed connection, for callers speaking the protocol directly.
    pub fn connection(&mut self) -> &mut Connection<TcpStream> {
        &mut self.conn
    }

    async fn command(&mut self, command: &Command) -> ShardResult<Ack> {
        self.conn.write_line(&command.to_string()).await?;
        self.conn.recv_ack().await
    }

    fn file_name(name: &str) -> ShardResult<()> {
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(ShardError::InvalidPath(format!("{:?} cannot be sent as a file name", name)));
        }
        Ok(())
    }

    /// Upload `reader` as `dest/name`.
    pub async fn upload_from<R>(&mut self, name: &str, dest: &str, reader: &mut R) -> ShardResult<Ack>
    where
        R: AsyncRead + Unpin,
    {
        Self::file_name(name)?;
        let command = Command::Store {
            name: name.to_string(),
            dest: dest.to_string(),
        };
        self.conn.write_line(&command.to_string()).await?;
        self.conn.send_payload(reader, &mut self.buf).await?;
        self.conn.recv_ack().await
    }

    pub async fn upload_bytes(&mut self, name: &str, dest: &str, data: &[u8]) -> ShardResult<Ack> {
        let mut reader = data;
        self.upload_from(name, dest, &mut reader).await
    }

    /// Upload the local file at `source`, keeping its file name.
    pub async fn upload(&mut self, source: &Path, dest: &str) -> ShardResult<Ack> {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ShardError::InvalidPath(source.display().to_string()))?;
        let mut file = tokio::fs::File::open(source).await?;
        self.upload_from(&name, dest, &mut file).await
    }

    /// Download `path` into `writer`. Nothing is written unless the router
    /// acknowledges success.
    pub async fn download_into<W>(&mut self, path: &str, writer: &mut W) -> ShardResult<(Ack, u64)>
    where
        W: AsyncWrite + Unpin,
    {
        let ack = self.command(&Command::Retrieve { path: path.to_string() }).await?;
        if ack != Ack::Success(Operation::Download) {
            return Ok((ack, 0));
        }
        let n = self.conn.recv_payload(writer, &mut self.buf, self.max_payload).await?;
        Ok((ack, n))
    }

    pub async fn download_bytes(&mut self, path: &str) -> ShardResult<(Ack, Vec<u8>)> {
        let mut out = Vec::new();
        let (ack, _) = self.download_into(path, &mut out).await?;
        Ok((ack, out))
    }

    /// Download `path` to the local file `output`, created only on success.
    pub async fn download_to(&mut self, path: &str, output: &Path) -> ShardResult<(Ack, u64)> {
        let ack = self.command(&Command::Retrieve { path: path.to_string() }).await?;
        if ack != Ack::Success(Operation::Download) {
            return Ok((ack, 0));
        }
        let n = self.receive_file(output).await?;
        Ok((ack, n))
    }

    async fn receive_file(&mut self, output: &Path) -> ShardResult<u64> {
        let mut file = tokio::fs::File::create(output).await?;
        match self.conn.recv_payload(&mut file, &mut self.buf, self.max_payload).await {
            Ok(n) => Ok(n),
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(output).await;
                Err(e)
            }
        }
    }

    pub async fn remove(&mut self, path: &str) -> ShardResult<Ack> {
        self.command(&Command::Remove { path: path.to_string() }).await
    }

    /// Names of every managed file under `path`, cluster-wide.
    pub async fn list(&mut self, path: &str) -> ShardResult<(Ack, Vec<String>)> {
        let ack = self.command(&Command::List { path: path.to_string() }).await?;
        if ack != Ack::Success(Operation::List) {
            return Ok((ack, Vec::new()));
        }
        let body = self.conn.recv_bytes(&mut self.buf, self.max_payload).await?;
        let names = String::from_utf8_lossy(&body)
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        Ok((ack, names))
    }

    /// Fetch the archive for `extension` into `writer`.
    pub async fn archive_into<W>(&mut self, extension: &str, writer: &mut W) -> ShardResult<(Ack, u64)>
    where
        W: AsyncWrite + Unpin,
    {
        let ack = self
            .command(&Command::ArchiveExport { extension: extension.to_string() })
            .await?;
        if !matches!(ack, Ack::Archive(_)) {
            return Ok((ack, 0));
        }
        let n = self.conn.recv_payload(writer, &mut self.buf, self.max_payload).await?;
        Ok((ack, n))
    }

    /// Fetch the archive for `extension` into `dir`, named as the router
    /// reports it (or `output` when given).
    pub async fn archive_to(&mut self, extension: &str, dir: &Path, output: Option<&Path>) -> ShardResult<(Ack, u64)> {
        let ack = self
            .command(&Command::ArchiveExport { extension: extension.to_string() })
            .await?;
        let Ack::Archive(name) = &ack else {
            return Ok((ack, 0));
        };
        let target = match output {
            Some(path) => path.to_path_buf(),
            None => dir.join(Path::new(name).file_name().unwrap_or_default()),
        };
        let n = self.receive_file(&target).await?;
        Ok((ack, n))
    }

    /// Say goodbye and close the connection.
    pub async fn exit(mut self) -> ShardResult<Ack> {
        let ack = self.command(&Command::Terminate).await?;
        let _ = self.conn.shutdown().await;
        Ok(ack)
    }
}
