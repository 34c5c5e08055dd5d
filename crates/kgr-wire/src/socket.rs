//! Byte transports.

use crate::{WireError, WireResult};
use async_trait::async_trait;
use kgr_security::SocketEncryption;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};

/// Bytes read per call when the caller does not bound it.
pub const READ_CHUNK: usize = 64 * 1024;

/// How long `close` waits to flush and shut down the write half.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// A bidirectional byte stream.
///
/// Every method may be called from any task. `close` is idempotent and wakes
/// pending reads, which then report end of stream.
#[async_trait]
pub trait Socket: Send + Sync + 'static {
    /// False once the socket has been closed or has failed.
    fn valid(&self) -> bool;

    async fn close(&self);

    /// Read up to `max` bytes. An empty result means end of stream.
    async fn read(&self, max: usize) -> WireResult<Vec<u8>>;

    /// Write all of `data`.
    async fn write(&self, data: &[u8]) -> WireResult<()>;

    /// Wait up to `timeout` for readable data. `true` also on end of stream,
    /// so a following `read` never blocks.
    async fn wait(&self, timeout: Duration) -> bool;

    /// Key control, for sockets that encrypt.
    fn encryption(&self) -> Option<Arc<dyn SocketEncryption>> {
        None
    }
}

struct ReadHalf<R> {
    reader: R,
    /// Bytes pulled in by `wait` and not yet handed out.
    ahead: Vec<u8>,
    eof: bool,
}

/// A socket over any split tokio stream: TCP, Unix, or `tokio::io::duplex`.
pub struct StreamSocket<R, W> {
    read: Mutex<ReadHalf<R>>,
    write: Mutex<W>,
    open: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl<R, W> StreamSocket<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            read: Mutex::new(ReadHalf {
                reader,
                ahead: Vec::new(),
                eof: false,
            }),
            write: Mutex::new(writer),
            open: AtomicBool::new(true),
            closed_tx,
        }
    }

    /// Resolves once `close` has been called.
    async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl StreamSocket<tokio::net::tcp::OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf> {
    pub fn from_tcp(stream: tokio::net::TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer)
    }
}

impl
    StreamSocket<
        tokio::io::ReadHalf<tokio::io::DuplexStream>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
    >
{
    /// Two sockets joined in memory.
    pub fn pair(buffer: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(buffer);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (Self::new(ar, aw), Self::new(br, bw))
    }
}

#[async_trait]
impl<R, W> Socket for StreamSocket<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn valid(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        self.closed_tx.send_replace(true);
        // A pending write gives the lock back as soon as it sees the close.
        if let Ok(mut writer) = tokio::time::timeout(SHUTDOWN_GRACE, self.write.lock()).await {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await;
        }
    }

    async fn read(&self, max: usize) -> WireResult<Vec<u8>> {
        let mut half = self.read.lock().await;
        if !half.ahead.is_empty() {
            let n = max.min(half.ahead.len());
            return Ok(half.ahead.drain(..n).collect());
        }
        if half.eof || !self.valid() {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; max.max(1)];
        let n = tokio::select! {
            res = half.reader.read(&mut buf) => res?,
            _ = self.closed() => 0,
        };
        if n == 0 {
            half.eof = true;
        }
        buf.truncate(n);
        Ok(buf)
    }

    async fn write(&self, data: &[u8]) -> WireResult<()> {
        if !self.valid() {
            return Err(WireError::ConnectionClosed);
        }
        let mut writer = tokio::select! {
            writer = self.write.lock() => writer,
            _ = self.closed() => return Err(WireError::ConnectionClosed),
        };
        let written = tokio::select! {
            res = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => res,
            _ = self.closed() => return Err(WireError::ConnectionClosed),
        };
        written?;
        Ok(())
    }

    async fn wait(&self, timeout: Duration) -> bool {
        let mut half = self.read.lock().await;
        if !half.ahead.is_empty() || half.eof || !self.valid() {
            return true;
        }
        let mut buf = vec![0u8; READ_CHUNK];
        let read = tokio::select! {
            res = tokio::time::timeout(timeout, half.reader.read(&mut buf)) => res,
            _ = self.closed() => return true,
        };
        match read {
            Ok(Ok(0)) | Ok(Err(_)) => {
                half.eof = true;
                true
            }
            Ok(Ok(n)) => {
                half.ahead.extend_from_slice(&buf[..n]);
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_transfers_bytes() {
        let (a, b) = StreamSocket::pair(1024);
        a.write(b"hello").await.unwrap();
        assert!(b.wait(Duration::from_secs(1)).await);
        let got = b.read(3).await.unwrap();
        assert_eq!(got, b"hel");
        let got = b.read(READ_CHUNK).await.unwrap();
        assert_eq!(got, b"lo");
    }

    #[tokio::test]
    async fn test_wait_times_out_without_data() {
        let (_a, b) = StreamSocket::pair(64);
        assert!(!b.wait(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_close_wakes_reader_and_is_idempotent() {
        let (a, _b) = StreamSocket::pair(64);
        let a = Arc::new(a);
        let reader = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.read(16).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        a.close().await;
        a.close().await;
        assert!(reader.await.unwrap().unwrap().is_empty());
        assert!(!a.valid());
        assert!(matches!(a.write(b"x").await, Err(WireError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_close_releases_stuck_writer() {
        // The peer never reads, so the write fills the duplex and blocks.
        let (a, _b) = StreamSocket::pair(16);
        let a = Arc::new(a);
        let writer = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.write(&vec![7u8; 1024 * 1024]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        tokio::time::timeout(Duration::from_secs(1), a.close())
            .await
            .expect("close must not wait for a blocked write");
        let res = tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(WireError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_peer_close_is_eof() {
        let (a, b) = StreamSocket::pair(64);
        a.close().await;
        assert!(b.wait(Duration::from_secs(1)).await);
        assert!(b.read(16).await.unwrap().is_empty());
    }
}
