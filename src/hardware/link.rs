//! Controller Link
//!
//! One persistent byte-stream connection to the motion controller.
//!
//! Protocol framing at this layer is minimal:
//! - A command is the ASCII text followed by a single `\r`
//! - The reply is whatever arrives in **one** read of at most `capacity` bytes
//! - No command is split across reads and no partial write is retried
//!
//! A short write means the socket is no longer trustworthy and is reported as
//! [`GuiderError::ConnectionFailure`]. There is no reconnection: the link lives as long as
//! the process.
//!
//! The stream sits behind a `tokio::sync::Mutex`, so concurrent callers are serialized and a
//! command/reply pair is never interleaved with another.

use crate::error::{GuiderError, GuiderResult};
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, instrument, trace, warn};

/// Command terminator expected by the controller.
pub const TERMINATOR: u8 = b'\r';

/// Request/response seam between the codec and the transport.
///
/// Implemented by [`StreamLink`] for real hardware and by
/// [`crate::hardware::mock::SimulatedController`] for tests and dry runs.
#[async_trait]
pub trait Link: Send + Sync {
    /// Send one command line and return the raw reply bytes from a single read.
    ///
    /// The reply is read into a zero-filled buffer of `capacity` bytes and truncated to the
    /// number of bytes actually received.
    async fn send(&self, command: &str, capacity: usize) -> GuiderResult<Vec<u8>>;
}

/// Trait alias for async link I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can carry the link:
/// - `tokio::net::TcpStream` (real controller)
/// - `tokio::io::DuplexStream` or `tokio_test::io::Mock` (testing)
pub trait LinkIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> LinkIO for T {}

/// Type-erased boxed link stream.
pub type DynStream = Box<dyn LinkIO>;

/// Link over a byte stream (TCP in production).
pub struct StreamLink {
    /// Stream protected by Mutex for exclusive access
    stream: Mutex<DynStream>,
    /// Per-reply read timeout
    timeout: Duration,
}

impl StreamLink {
    /// Wrap an already-open stream.
    pub fn new(stream: DynStream, timeout: Duration) -> Self {
        Self {
            stream: Mutex::new(stream),
            timeout,
        }
    }

    /// Open the TCP connection to the controller and flush its output buffer.
    ///
    /// # Errors
    /// Returns [`GuiderError::ConnectionFailure`] if the socket cannot be opened within the
    /// timeout or the flush exchange fails.
    #[instrument(skip(timeout), err)]
    pub async fn connect(host: Ipv4Addr, port: u16, timeout: Duration) -> GuiderResult<Self> {
        let addr = SocketAddrV4::new(host, port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| GuiderError::ConnectionFailure(format!("connect to {addr} timed out")))?
            .map_err(|e| GuiderError::ConnectionFailure(format!("connect to {addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| GuiderError::ConnectionFailure(e.to_string()))?;

        let link = Self::new(Box::new(stream), timeout);
        link.flush_output().await?;
        debug!(%addr, "connected to controller");
        Ok(link)
    }

    /// Send a bare terminator and discard whatever the controller had queued.
    async fn flush_output(&self) -> GuiderResult<()> {
        let mut stream = self.stream.lock().await;
        stream
            .write_all(&[TERMINATOR])
            .await
            .map_err(|e| GuiderError::ConnectionFailure(format!("flush write: {e}")))?;

        let mut discard = [0u8; 256];
        match tokio::time::timeout(self.timeout, stream.read(&mut discard)).await {
            Ok(Ok(n)) => {
                trace!(discarded = n, "flushed controller output");
                Ok(())
            }
            Ok(Err(e)) => Err(GuiderError::ConnectionFailure(format!("flush read: {e}"))),
            Err(_) => {
                warn!("controller did not answer the flush terminator");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Link for StreamLink {
    async fn send(&self, command: &str, capacity: usize) -> GuiderResult<Vec<u8>> {
        let mut stream = self.stream.lock().await;

        let mut line = Vec::with_capacity(command.len() + 1);
        line.extend_from_slice(command.as_bytes());
        line.push(TERMINATOR);

        let written = stream.write(&line).await?;
        if written != line.len() {
            return Err(GuiderError::ConnectionFailure(format!(
                "short write: {written} of {} bytes for '{command}'",
                line.len()
            )));
        }
        stream.flush().await?;

        let mut reply = vec![0u8; capacity];
        let n = tokio::time::timeout(self.timeout, stream.read(&mut reply))
            .await
            .map_err(|_| GuiderError::timeout(format!("reply to '{command}'"), 1))??;
        if n == 0 && capacity > 0 {
            return Err(GuiderError::ConnectionFailure(
                "controller closed the connection".to_string(),
            ));
        }
        reply.truncate(n);

        trace!(command, reply = %String::from_utf8_lossy(&reply).escape_debug(), "link exchange");
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    #[tokio::test]
    async fn appends_terminator_and_reads_one_reply() -> anyhow::Result<()> {
        let mock = tokio_test::io::Builder::new()
            .write(b"TPA\r")
            .read(b" 1234\r\n:")
            .build();
        let link = StreamLink::new(Box::new(mock), Duration::from_secs(1));

        let reply = link.send("TPA", 80).await?;
        assert_eq!(reply, b" 1234\r\n:");
        Ok(())
    }

    #[tokio::test]
    async fn reply_is_bounded_by_capacity() -> anyhow::Result<()> {
        let (mut host, device) = tokio::io::duplex(256);
        let link = StreamLink::new(Box::new(device), Duration::from_secs(1));

        host.write_all(b"0123456789").await?;
        let reply = link.send("MG", 4).await?;
        assert_eq!(reply, b"0123");

        let mut sent = [0u8; 3];
        host.read_exact(&mut sent).await?;
        assert_eq!(&sent, b"MG\r");
        Ok(())
    }

    #[tokio::test]
    async fn closed_stream_is_connection_failure() {
        let (host, device) = tokio::io::duplex(64);
        let link = StreamLink::new(Box::new(device), Duration::from_secs(1));
        drop(host);

        let err = link.send("TSA", 80).await.unwrap_err();
        assert!(err.is_link_fault());
    }

    #[tokio::test]
    async fn silent_controller_times_out() {
        let (_host, device) = tokio::io::duplex(64);
        let link = StreamLink::new(Box::new(device), Duration::from_millis(20));

        let err = link.send("TSA", 80).await.unwrap_err();
        assert!(matches!(err, GuiderError::Timeout { attempts: 1, .. }));
    }

    /// Stream that accepts only half of every write.
    struct HalfWriter;

    impl AsyncRead for HalfWriter {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for HalfWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(buf.len() / 2))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn short_write_is_not_retried() {
        let link = StreamLink::new(Box::new(HalfWriter), Duration::from_secs(1));

        let err = link.send("SHA", 80).await.unwrap_err();
        match err {
            GuiderError::ConnectionFailure(msg) => assert!(msg.contains("short write: 2 of 4")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
