//! Bidirectional byte relay between two streams.
//!
//! Both copy directions run concurrently and each runs to its own end: EOF on
//! one side is forwarded as a write shutdown to the other side, and the pipe
//! returns only once both directions have finished. The streams are owned by
//! the pipe and dropped (closed) when it returns or is cancelled.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::transport::RelayStream;

/// Copy buffer size per direction.
pub const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Outcome of one copy direction.
#[derive(Debug, Default)]
pub struct Transfer {
    /// Bytes written to the destination.
    pub bytes: u64,
    /// Error that ended the direction early, if any.
    pub error: Option<io::Error>,
}

/// Outcome of a finished pipe.
#[derive(Debug, Default)]
pub struct PipeReport {
    pub a_to_b: Transfer,
    pub b_to_a: Transfer,
}

impl PipeReport {
    /// First error seen in either direction.
    pub fn first_error(&self) -> Option<&io::Error> {
        self.a_to_b.error.as_ref().or(self.b_to_a.error.as_ref())
    }
}

/// Relay bytes between `a` and `b` until both directions finish.
pub async fn pipe<A, B>(a: A, b: B, idle_timeout: Option<Duration>) -> PipeReport
where
    A: RelayStream,
    B: RelayStream,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let (a_to_b, b_to_a) = tokio::join!(
        copy_direction(a_read, b_write, idle_timeout),
        copy_direction(b_read, a_write, idle_timeout),
    );

    PipeReport { a_to_b, b_to_a }
}

async fn copy_direction<R, W>(mut reader: R, mut writer: W, idle_timeout: Option<Duration>) -> Transfer
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut bytes = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    let error = loop {
        let read_result = if let Some(timeout) = idle_timeout {
            match tokio::time::timeout(timeout, reader.read(&mut buf)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
            }
        } else {
            reader.read(&mut buf).await
        };

        match read_result {
            Ok(0) => break None,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    break Some(e);
                }
                bytes += n as u64;
            }
            Err(e) => break Some(e),
        }
    };

    // Half-close so the peer sees EOF; it may already be gone.
    let _ = writer.shutdown().await;

    Transfer { bytes, error }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};

    use tokio::io::{duplex, DuplexStream, ReadBuf};

    use super::*;

    /// Duplex stream that counts drops.
    struct Tracked {
        inner: DuplexStream,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl AsyncRead for Tracked {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Tracked {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[tokio::test]
    async fn test_pipe_relays_both_directions() {
        let (mut client, relay_a) = duplex(64 * 1024);
        let (relay_b, mut backend) = duplex(64 * 1024);

        let relay = tokio::spawn(pipe(relay_a, relay_b, None));

        client.write_all(b"PING").await.unwrap();
        let mut buf = [0u8; 4];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");

        backend.write_all(b"PONG").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PONG");

        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        backend.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(backend);

        let report = relay.await.unwrap();
        assert_eq!(report.a_to_b.bytes, 4);
        assert_eq!(report.b_to_a.bytes, 4);
        assert!(report.first_error().is_none());
    }

    #[tokio::test]
    async fn test_pipe_large_interleaved_transfer() {
        const LEN: usize = 1024 * 1024 + 17;
        let (client, relay_a) = duplex(8 * 1024);
        let (relay_b, backend) = duplex(8 * 1024);
        let relay = tokio::spawn(pipe(relay_a, relay_b, None));

        let upstream = pattern(LEN, 7);
        let downstream = pattern(LEN, 131);

        let side = |stream: DuplexStream, outgoing: Vec<u8>| async move {
            let (mut read, mut write) = tokio::io::split(stream);
            let writer = async move {
                for chunk in outgoing.chunks(3001) {
                    write.write_all(chunk).await.unwrap();
                    tokio::task::yield_now().await;
                }
                write.shutdown().await.unwrap();
            };
            let reader = async move {
                let mut received = Vec::with_capacity(LEN);
                read.read_to_end(&mut received).await.unwrap();
                received
            };
            tokio::join!(writer, reader).1
        };

        let (at_client, at_backend) = tokio::join!(
            side(client, upstream.clone()),
            side(backend, downstream.clone()),
        );

        assert_eq!(at_backend, upstream);
        assert_eq!(at_client, downstream);

        let report = relay.await.unwrap();
        assert_eq!(report.a_to_b.bytes, LEN as u64);
        assert_eq!(report.b_to_a.bytes, LEN as u64);
    }

    #[tokio::test]
    async fn test_pipe_waits_for_both_directions() {
        let (mut client, relay_a) = duplex(1024);
        let (relay_b, mut backend) = duplex(1024);
        let relay = tokio::spawn(pipe(relay_a, relay_b, None));

        // Client finishes sending; the backend keeps talking afterwards.
        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let mut request = Vec::new();
        backend.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");

        tokio::task::yield_now().await;
        assert!(!relay.is_finished());

        backend.write_all(b"late response").await.unwrap();
        let mut buf = vec![0u8; 13];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"late response");

        drop(backend);
        let report = relay.await.unwrap();
        assert_eq!(report.b_to_a.bytes, 13);
    }

    #[tokio::test]
    async fn test_pipe_closes_both_streams_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (mut client, relay_a) = duplex(1024);
        let (relay_b, backend) = duplex(1024);

        let a = Tracked {
            inner: relay_a,
            drops: Arc::clone(&drops),
        };
        let b = Tracked {
            inner: relay_b,
            drops: Arc::clone(&drops),
        };

        let relay = tokio::spawn(pipe(a, b, None));
        drop(backend);
        client.shutdown().await.unwrap();

        relay.await.unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pipe_cancelled_releases_streams() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (_client, relay_a) = duplex(1024);
        let (relay_b, _backend) = duplex(1024);

        let a = Tracked {
            inner: relay_a,
            drops: Arc::clone(&drops),
        };
        let b = Tracked {
            inner: relay_b,
            drops: Arc::clone(&drops),
        };

        let relay = tokio::spawn(pipe(a, b, None));
        tokio::task::yield_now().await;
        relay.abort();
        assert!(relay.await.unwrap_err().is_cancelled());
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipe_idle_timeout() {
        let (_client, relay_a) = duplex(1024);
        let (relay_b, _backend) = duplex(1024);

        let report = pipe(relay_a, relay_b, Some(Duration::from_secs(30))).await;
        let err = report.first_error().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
