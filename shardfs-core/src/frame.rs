// SPDX-License-Identifier: AGPL-3.0-or-later
//! Line and payload framing shared by every hop
//!
//! Commands and acknowledgments are `\n`-terminated text lines. Payloads are
//! a sequence of chunks, each prefixed by a big-endian `u32` length, closed by
//! a zero-length terminator. A sender that fails mid-transfer writes the
//! abort marker instead of the terminator so the receiver never mistakes a
//! truncated file for a complete one.

use bytes::{BufMut, BytesMut};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream,
};

use crate::error::{ShardError, ShardResult};
use crate::protocol::Ack;

/// Longest accepted command or acknowledgment line, terminator included
pub const MAX_LINE_LEN: usize = 4096;

/// Default chunk size for payload transfers
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Largest chunk any peer may put on the wire. Receivers accept chunks up to
/// this size whatever their own buffer size.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

const END_OF_PAYLOAD: u32 = 0;
const ABORT_MARKER: u32 = u32::MAX;

/// One decoded payload frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Data(usize),
    End,
    Abort,
}

/// Fixed-size window used to move payload bytes between a source and a sink
/// without holding the whole file in memory.
pub struct TransferBuffer {
    buf: Vec<u8>,
}

impl TransferBuffer {
    pub fn new(chunk_size: usize) -> Self {
        Self { buf: vec![0; chunk_size.clamp(1, MAX_CHUNK_SIZE)] }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl Default for TransferBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

/// A framed, buffered byte stream (TCP socket, or an in-memory duplex in tests)
#[derive(Debug)]
pub struct Connection<S> {
    stream: BufStream<S>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream: BufStream::new(stream) }
    }

    /// Read one line. `Ok(None)` means the peer closed the connection cleanly
    /// before sending anything.
    pub async fn read_line(&mut self) -> ShardResult<Option<String>> {
        let mut line = Vec::new();
        let n = (&mut self.stream)
            .take(MAX_LINE_LEN as u64)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Ok(None);
        }
        if line.last() != Some(&b'\n') {
            if line.len() >= MAX_LINE_LEN {
                return Err(ShardError::Protocol(format!(
                    "line exceeds {} bytes",
                    MAX_LINE_LEN
                )));
            }
            return Err(ShardError::Network("connection closed mid-line".into()));
        }
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line)
            .map(Some)
            .map_err(|_| ShardError::Protocol("line is not valid UTF-8".into()))
    }

    pub async fn write_line(&mut self, line: &str) -> ShardResult<()> {
        if line.contains('\n') || line.len() >= MAX_LINE_LEN {
            return Err(ShardError::Protocol(format!("cannot frame line: {:?}", line)));
        }
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn send_ack(&mut self, ack: &Ack) -> ShardResult<()> {
        self.write_line(&ack.to_string()).await
    }

    /// Read an acknowledgment line; end-of-stream and unknown tokens are
    /// protocol errors.
    pub async fn recv_ack(&mut self) -> ShardResult<Ack> {
        let line = self
            .read_line()
            .await?
            .ok_or_else(|| ShardError::Network("peer closed before acknowledging".into()))?;
        Ack::parse(&line)
            .ok_or_else(|| ShardError::Protocol(format!("unrecognized acknowledgment: {}", line)))
    }

    /// Read a frame header. Chunk lengths are checked against the protocol
    /// limit, not the local buffer; see `read_piece`.
    pub async fn read_frame(&mut self) -> ShardResult<Frame> {
        let len = self.stream.read_u32().await.map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                ShardError::Network("connection closed mid-payload".into())
            }
            _ => ShardError::Io(e),
        })?;
        match len {
            END_OF_PAYLOAD => Ok(Frame::End),
            ABORT_MARKER => Ok(Frame::Abort),
            n if n as usize > MAX_CHUNK_SIZE => Err(ShardError::Protocol(format!(
                "chunk of {} bytes exceeds limit of {}",
                n, MAX_CHUNK_SIZE
            ))),
            n => Ok(Frame::Data(n as usize)),
        }
    }

    /// Read up to one buffer's worth of the `remaining` bytes of the current
    /// chunk, returning how many landed in `buf`.
    async fn read_piece(&mut self, buf: &mut TransferBuffer, remaining: usize) -> ShardResult<usize> {
        let n = remaining.min(buf.capacity());
        self.stream.read_exact(&mut buf.buf[..n]).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                ShardError::Network("connection closed mid-chunk".into())
            }
            _ => ShardError::Io(e),
        })?;
        Ok(n)
    }

    /// Discard the `remaining` bytes of the current chunk.
    async fn skip_chunk(&mut self, buf: &mut TransferBuffer, mut remaining: usize) -> ShardResult<()> {
        while remaining > 0 {
            remaining -= self.read_piece(buf, remaining).await?;
        }
        Ok(())
    }

    pub async fn write_chunk(&mut self, data: &[u8]) -> ShardResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut header = BytesMut::with_capacity(4);
        header.put_u32(data.len() as u32);
        self.stream.write_all(&header).await?;
        self.stream.write_all(data).await?;
        Ok(())
    }

    pub async fn finish_payload(&mut self) -> ShardResult<()> {
        self.stream.write_u32(END_OF_PAYLOAD).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn abort_payload(&mut self) -> ShardResult<()> {
        self.stream.write_u32(ABORT_MARKER).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Stream everything `reader` yields as one payload. If `reader` fails the
    /// payload is aborted and the read error returned.
    pub async fn send_payload<R>(&mut self, reader: &mut R, buf: &mut TransferBuffer) -> ShardResult<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut total = 0u64;
        loop {
            let n = match reader.read(&mut buf.buf).await {
                Ok(n) => n,
                Err(e) => {
                    self.abort_payload().await?;
                    return Err(e.into());
                }
            };
            if n == 0 {
                break;
            }
            self.write_chunk(&buf.buf[..n]).await?;
            total += n as u64;
        }
        self.finish_payload().await?;
        Ok(total)
    }

    /// Send an in-memory payload, split to the buffer's chunk size.
    pub async fn send_bytes(&mut self, data: &[u8], buf: &TransferBuffer) -> ShardResult<()> {
        for chunk in data.chunks(buf.capacity()) {
            self.write_chunk(chunk).await?;
        }
        self.finish_payload().await
    }

    /// Receive one payload into `writer`, refusing more than `limit` bytes.
    ///
    /// On overflow, or when `writer` fails, the rest of the payload is drained
    /// so the connection stays usable. Overflow returns `ShardError::Capacity`.
    pub async fn recv_payload<W>(
        &mut self,
        writer: &mut W,
        buf: &mut TransferBuffer,
        limit: u64,
    ) -> ShardResult<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut total = 0u64;
        loop {
            match self.read_frame().await? {
                Frame::End => break,
                Frame::Abort => {
                    return Err(ShardError::Network("peer aborted the transfer".into()))
                }
                Frame::Data(mut remaining) => {
                    while remaining > 0 {
                        let n = self.read_piece(buf, remaining).await?;
                        remaining -= n;
                        total += n as u64;
                        if total > limit {
                            self.skip_chunk(buf, remaining).await?;
                            self.drain_payload(buf).await?;
                            return Err(ShardError::Capacity { limit });
                        }
                        let written = writer.write_all(&buf.buf[..n]).await;
                        if let Err(e) = written {
                            self.skip_chunk(buf, remaining).await?;
                            self.drain_payload(buf).await?;
                            return Err(e.into());
                        }
                    }
                }
            }
        }
        writer.flush().await?;
        Ok(total)
    }

    /// Receive a payload into memory; used for listings, which are small.
    pub async fn recv_bytes(&mut self, buf: &mut TransferBuffer, limit: u64) -> ShardResult<Vec<u8>> {
        let mut out = Vec::new();
        self.recv_payload(&mut out, buf, limit).await?;
        Ok(out)
    }

    /// Discard the remainder of a payload.
    pub async fn drain_payload(&mut self, buf: &mut TransferBuffer) -> ShardResult<u64> {
        let mut total = 0u64;
        loop {
            match self.read_frame().await? {
                Frame::End => return Ok(total),
                Frame::Abort => return Ok(total),
                Frame::Data(n) => {
                    self.skip_chunk(buf, n).await?;
                    total += n as u64;
                }
            }
        }
    }

    /// Copy the data chunks of one payload from `self` into the payload `to`
    /// is sending, without ending it. Stops after the source's terminator.
    ///
    /// More than `limit` bytes drains the source and returns
    /// `ShardError::Capacity`; a source abort is a `Network` error. In both
    /// cases `to` is left mid-payload for the caller to finish or abort.
    pub async fn forward_chunks<T>(
        &mut self,
        to: &mut Connection<T>,
        buf: &mut TransferBuffer,
        limit: u64,
    ) -> ShardResult<u64>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut total = 0u64;
        loop {
            match self.read_frame().await? {
                Frame::End => return Ok(total),
                Frame::Abort => {
                    return Err(ShardError::Network("source aborted the transfer".into()))
                }
                Frame::Data(mut remaining) => {
                    while remaining > 0 {
                        let n = self.read_piece(buf, remaining).await?;
                        remaining -= n;
                        if total + n as u64 > limit {
                            self.skip_chunk(buf, remaining).await?;
                            self.drain_payload(buf).await?;
                            return Err(ShardError::Capacity { limit });
                        }
                        to.write_chunk(&buf.buf[..n]).await?;
                        total += n as u64;
                    }
                }
            }
        }
    }

    /// Forward one payload from `self` to `to` chunk by chunk.
    ///
    /// A failure on the source side is propagated to `to` as an abort marker.
    pub async fn relay_payload<T>(&mut self, to: &mut Connection<T>, buf: &mut TransferBuffer) -> ShardResult<u64>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        match self.forward_chunks(to, buf, u64::MAX).await {
            Ok(total) => {
                to.finish_payload().await?;
                Ok(total)
            }
            Err(e) => {
                to.abort_payload().await?;
                Err(e)
            }
        }
    }

    /// Flush and close the write half.
    pub async fn shutdown(&mut self) -> ShardResult<()> {
        self.stream.flush().await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Operation, Reason};
    use tokio::io::duplex;

    fn pair() -> (Connection<tokio::io::DuplexStream>, Connection<tokio::io::DuplexStream>) {
        let (a, b) = duplex(256 * 1024);
        (Connection::new(a), Connection::new(b))
    }

    #[tokio::test]
    async fn test_lines() {
        let (mut a, mut b) = pair();
        a.write_line("uploadf a.c ~s1").await.unwrap();
        a.write_line("exit").await.unwrap();
        assert_eq!(b.read_line().await.unwrap().as_deref(), Some("uploadf a.c ~s1"));
        assert_eq!(b.read_line().await.unwrap().as_deref(), Some("exit"));

        drop(a);
        assert_eq!(b.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_crlf_is_stripped() {
        let (a, b) = duplex(1024);
        let mut raw = a;
        raw.write_all(b"exit\r\n").await.unwrap();
        let mut b = Connection::new(b);
        assert_eq!(b.read_line().await.unwrap().as_deref(), Some("exit"));
    }

    #[tokio::test]
    async fn test_overlong_line_rejected() {
        let (mut raw, b) = duplex(2 * MAX_LINE_LEN);
        raw.write_all(&vec![b'x'; MAX_LINE_LEN + 10]).await.unwrap();
        let mut b = Connection::new(b);
        assert!(matches!(b.read_line().await, Err(ShardError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_write_line_rejects_embedded_newline() {
        let (mut a, _b) = pair();
        assert!(a.write_line("a\nb").await.is_err());
    }

    #[tokio::test]
    async fn test_acks() {
        let (mut a, mut b) = pair();
        a.send_ack(&Ack::failed(Operation::Download, Reason::FileNotFound)).await.unwrap();
        assert_eq!(
            b.recv_ack().await.unwrap(),
            Ack::Failed(Operation::Download, Reason::FileNotFound)
        );

        a.write_line("NONSENSE").await.unwrap();
        assert!(matches!(b.recv_ack().await, Err(ShardError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_payload_transfer_spans_chunks() {
        let (mut a, mut b) = pair();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let sender = {
            let data = data.clone();
            tokio::spawn(async move {
                let mut buf = TransferBuffer::new(1000);
                let mut reader = &data[..];
                let sent = a.send_payload(&mut reader, &mut buf).await.unwrap();
                (a, sent)
            })
        };

        let mut out = Vec::new();
        let mut buf = TransferBuffer::new(1000);
        let received = b.recv_payload(&mut out, &mut buf, u64::MAX).await.unwrap();
        let (_a, sent) = sender.await.unwrap();

        assert_eq!(sent, 10_000);
        assert_eq!(received, 10_000);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let (mut a, mut b) = pair();
        let buf = TransferBuffer::new(16);
        a.send_bytes(&[], &buf).await.unwrap();
        let mut rbuf = TransferBuffer::new(16);
        assert!(b.recv_bytes(&mut rbuf, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_over_limit_is_drained() {
        let (mut a, mut b) = pair();
        let buf = TransferBuffer::new(4);
        a.send_bytes(b"0123456789", &buf).await.unwrap();
        a.write_line("exit").await.unwrap();

        let mut rbuf = TransferBuffer::new(4);
        let mut out = Vec::new();
        let err = b.recv_payload(&mut out, &mut rbuf, 5).await.unwrap_err();
        assert!(matches!(err, ShardError::Capacity { limit: 5 }));
        assert_eq!(b.read_line().await.unwrap().as_deref(), Some("exit"));
    }

    #[tokio::test]
    async fn test_large_chunks_into_small_buffer() {
        let (mut a, mut b) = pair();
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        a.send_bytes(&data, &TransferBuffer::new(4096)).await.unwrap();
        a.send_bytes(b"second", &TransferBuffer::new(4096)).await.unwrap();

        let mut small = TransferBuffer::new(7);
        assert_eq!(b.recv_bytes(&mut small, u64::MAX).await.unwrap(), data);
        assert_eq!(b.recv_bytes(&mut small, u64::MAX).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_overflow_mid_chunk_keeps_stream_in_sync() {
        let (mut a, mut b) = pair();
        a.send_bytes(&[1u8; 3000], &TransferBuffer::new(3000)).await.unwrap();
        a.write_line("exit").await.unwrap();

        let mut small = TransferBuffer::new(100);
        let err = b.recv_bytes(&mut small, 250).await.unwrap_err();
        assert!(matches!(err, ShardError::Capacity { limit: 250 }));
        assert_eq!(b.read_line().await.unwrap().as_deref(), Some("exit"));
    }

    #[tokio::test]
    async fn test_relay_between_buffer_sizes() {
        let (mut src_tx, mut src_rx) = pair();
        let (mut dst_tx, mut dst_rx) = pair();
        src_tx.send_bytes(&[9u8; 2500], &TransferBuffer::new(2500)).await.unwrap();

        let mut relay_buf = TransferBuffer::new(1000);
        assert_eq!(src_rx.relay_payload(&mut dst_tx, &mut relay_buf).await.unwrap(), 2500);

        let mut rbuf = TransferBuffer::new(64);
        assert_eq!(dst_rx.recv_bytes(&mut rbuf, u64::MAX).await.unwrap(), vec![9u8; 2500]);
    }

    #[tokio::test]
    async fn test_forward_chunks_respects_limit() {
        let (mut src_tx, mut src_rx) = pair();
        let (mut dst_tx, mut dst_rx) = pair();
        let buf = TransferBuffer::new(16);
        src_tx.send_bytes(b"first", &buf).await.unwrap();
        src_tx.send_bytes(&[3u8; 100], &buf).await.unwrap();
        src_tx.write_line("exit").await.unwrap();

        let mut fwd = TransferBuffer::new(16);
        dst_tx.write_chunk(b"[").await.unwrap();
        assert_eq!(src_rx.forward_chunks(&mut dst_tx, &mut fwd, 50).await.unwrap(), 5);
        let err = src_rx.forward_chunks(&mut dst_tx, &mut fwd, 50).await.unwrap_err();
        assert!(matches!(err, ShardError::Capacity { limit: 50 }));
        assert_eq!(src_rx.read_line().await.unwrap().as_deref(), Some("exit"));

        dst_tx.finish_payload().await.unwrap();
        let mut rbuf = TransferBuffer::new(64);
        let got = dst_rx.recv_bytes(&mut rbuf, u64::MAX).await.unwrap();
        assert!(got.starts_with(b"[first"));
        assert!(got.len() <= 1 + 5 + 50);
    }

    #[tokio::test]
    async fn test_chunk_over_protocol_limit_rejected() {
        let (mut raw, b) = duplex(64);
        raw.write_u32((MAX_CHUNK_SIZE + 1) as u32).await.unwrap();
        let mut b = Connection::new(b);
        let mut buf = TransferBuffer::default();
        let err = b.recv_bytes(&mut buf, u64::MAX).await.unwrap_err();
        assert!(matches!(err, ShardError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_abort_is_reported() {
        let (mut a, mut b) = pair();
        a.write_chunk(b"partial").await.unwrap();
        a.abort_payload().await.unwrap();

        let mut buf = TransferBuffer::new(64);
        let err = b.recv_bytes(&mut buf, u64::MAX).await.unwrap_err();
        assert!(matches!(err, ShardError::Network(_)));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_network_error() {
        let (mut a, mut b) = pair();
        a.write_chunk(b"partial").await.unwrap();
        a.shutdown().await.unwrap();
        drop(a);

        let mut buf = TransferBuffer::new(64);
        let err = b.recv_bytes(&mut buf, u64::MAX).await.unwrap_err();
        assert!(err.is_connection_fatal());
    }

    #[tokio::test]
    async fn test_relay() {
        let (mut src_tx, mut src_rx) = pair();
        let (mut dst_tx, mut dst_rx) = pair();

        let buf = TransferBuffer::new(3);
        src_tx.send_bytes(b"hello relay", &buf).await.unwrap();

        let mut relay_buf = TransferBuffer::new(3);
        let relayed = src_rx.relay_payload(&mut dst_tx, &mut relay_buf).await.unwrap();
        assert_eq!(relayed, 11);

        let mut rbuf = TransferBuffer::new(3);
        assert_eq!(dst_rx.recv_bytes(&mut rbuf, 100).await.unwrap(), b"hello relay");
    }

    #[tokio::test]
    async fn test_relay_forwards_abort() {
        let (mut src_tx, mut src_rx) = pair();
        let (mut dst_tx, mut dst_rx) = pair();

        src_tx.write_chunk(b"abc").await.unwrap();
        src_tx.abort_payload().await.unwrap();

        let mut relay_buf = TransferBuffer::new(16);
        assert!(src_rx.relay_payload(&mut dst_tx, &mut relay_buf).await.is_err());

        let mut rbuf = TransferBuffer::new(16);
        assert!(dst_rx.recv_bytes(&mut rbuf, 100).await.is_err());
    }
}
