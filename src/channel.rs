//! Suspending byte channels.
//!
//! Non-blocking, cancellable wrappers over a raw duplex socket. A
//! [`ByteChannel`] gives the codec layer byte-granular reads ("wait
//! until a full header is available") regardless of how the OS chops
//! up the underlying stream, and serializes writes so two concurrent
//! senders never interleave bytes on the wire.
//!
//! All operations suspend the calling task instead of blocking a
//! thread, and unwind promptly with [`MirrorError::ChannelClosed`]
//! when [`close`](ByteChannel::close) is called from another task.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::MirrorError;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Initial capacity of the internal read buffer.
const READ_BUFFER_CAPACITY: usize = 8192;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct ReadState {
    reader: BoxedReader,
    /// Bytes received from the OS but not yet consumed by `read`.
    buffered: BytesMut,
}

/// A cancellable, buffered duplex byte channel.
///
/// Cloning is cheap; clones share the same underlying stream and
/// close state.
#[derive(Clone)]
pub struct ByteChannel {
    read: Arc<Mutex<ReadState>>,
    write: Arc<Mutex<BoxedWriter>>,
    /// Mirror of `buffered.len()` for the non-blocking `available()`.
    buffered_len: Arc<AtomicUsize>,
    closed: CancellationToken,
}

impl ByteChannel {
    /// Wrap a pair of already-connected stream halves.
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            read: Arc::new(Mutex::new(ReadState {
                reader: Box::new(reader),
                buffered: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            })),
            write: Arc::new(Mutex::new(Box::new(writer))),
            buffered_len: Arc::new(AtomicUsize::new(0)),
            closed: CancellationToken::new(),
        }
    }

    /// Wrap a full-duplex stream (TCP socket, in-memory pipe, …).
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
        Self::new(r, w)
    }

    /// Read into `buf`, suspending until at least `min_bytes` are
    /// available or the channel closes.
    ///
    /// Returns the number of bytes actually read, which may exceed
    /// `min_bytes` up to `buf.len()`. `min_bytes` must not exceed
    /// `buf.len()`.
    pub async fn read(&self, buf: &mut [u8], min_bytes: usize) -> Result<usize, MirrorError> {
        debug_assert!(min_bytes <= buf.len());
        let mut state = self.lock_read().await?;
        self.fill_buffer(&mut state, min_bytes).await?;

        let n = state.buffered.len().min(buf.len());
        buf[..n].copy_from_slice(&state.buffered[..n]);
        let _ = state.buffered.split_to(n);
        self.buffered_len.store(state.buffered.len(), Ordering::Release);
        Ok(n)
    }

    /// Read exactly `n` bytes, suspending until they are available.
    pub async fn read_exact(&self, n: usize) -> Result<Bytes, MirrorError> {
        let mut state = self.lock_read().await?;
        self.fill_buffer(&mut state, n).await?;
        let out = state.buffered.split_to(n).freeze();
        self.buffered_len.store(state.buffered.len(), Ordering::Release);
        Ok(out)
    }

    /// Write the entire buffer, suspending until it is flushed to the
    /// OS. Concurrent writers are serialized; a write is either fully
    /// on the wire or failed before any byte of a later write.
    pub async fn write(&self, buf: &[u8]) -> Result<(), MirrorError> {
        // Cancellation wins over an available lock, so a write after
        // close() always reports ChannelClosed rather than whatever
        // the shut-down writer would say.
        let mut writer = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(MirrorError::ChannelClosed),
            guard = self.write.lock() => guard,
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(MirrorError::ChannelClosed),
            result = async {
                writer.write_all(buf).await?;
                writer.flush().await
            } => result.map_err(MirrorError::from),
        }
    }

    /// Number of bytes currently buffered, without consuming them.
    pub fn available(&self) -> usize {
        self.buffered_len.load(Ordering::Acquire)
    }

    /// Close the channel. Idempotent; any in-flight read or write
    /// fails with [`MirrorError::ChannelClosed`] promptly.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        // The pending writer (if any) unwinds on cancellation and
        // releases the lock, after which the underlying stream can be
        // shut down so the peer observes EOF.
        let mut writer = self.write.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// A token that resolves when the channel is closed.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    // ── Internal ─────────────────────────────────────────────────

    async fn lock_read(&self) -> Result<tokio::sync::MutexGuard<'_, ReadState>, MirrorError> {
        tokio::select! {
            guard = self.read.lock() => Ok(guard),
            _ = self.closed.cancelled() => Err(MirrorError::ChannelClosed),
        }
    }

    /// Suspend until at least `min_bytes` are buffered.
    async fn fill_buffer(
        &self,
        state: &mut ReadState,
        min_bytes: usize,
    ) -> Result<(), MirrorError> {
        while state.buffered.len() < min_bytes {
            let n = tokio::select! {
                result = state.reader.read_buf(&mut state.buffered) => result?,
                _ = self.closed.cancelled() => return Err(MirrorError::ChannelClosed),
            };
            if n == 0 {
                // EOF before the requested bytes arrived.
                return Err(MirrorError::ChannelClosed);
            }
            self.buffered_len.store(state.buffered.len(), Ordering::Release);
        }
        Ok(())
    }
}

impl std::fmt::Debug for ByteChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteChannel")
            .field("available", &self.available())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    /// A connected pair of channels over an in-memory pipe.
    fn channel_pair() -> (ByteChannel, ByteChannel) {
        let (a, b) = duplex(64 * 1024);
        (ByteChannel::from_stream(a), ByteChannel::from_stream(b))
    }

    #[tokio::test]
    async fn read_waits_for_min_bytes() {
        let (a, b) = channel_pair();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            b.read(&mut buf, 8).await.map(|n| buf[..n].to_vec())
        });

        // Deliver the bytes in two partial writes.
        a.write(&[1, 2, 3]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        a.write(&[4, 5, 6, 7, 8]).await.unwrap();

        let got = reader.await.unwrap().unwrap();
        assert_eq!(got, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn read_may_return_more_than_min() {
        let (a, b) = channel_pair();
        a.write(&[9u8; 12]).await.unwrap();

        let mut buf = [0u8; 16];
        let n = b.read(&mut buf, 1).await.unwrap();
        assert!(n >= 1);
        assert!(n <= 16);
    }

    #[tokio::test]
    async fn read_exact_roundtrip() {
        let (a, b) = channel_pair();
        a.write(b"header--payload").await.unwrap();

        let header = b.read_exact(8).await.unwrap();
        assert_eq!(&header[..], b"header--");
        let rest = b.read_exact(7).await.unwrap();
        assert_eq!(&rest[..], b"payload");
    }

    #[tokio::test]
    async fn available_is_nonconsuming() {
        let (a, b) = channel_pair();
        a.write(&[0u8; 10]).await.unwrap();

        // Pull everything into the internal buffer, consume 4.
        let mut buf = [0u8; 4];
        b.read(&mut buf, 4).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let before = b.available();
        assert_eq!(before, b.available());
        assert_eq!(before, 6);
    }

    #[tokio::test]
    async fn close_unblocks_pending_read() {
        let (_a, b) = channel_pair();
        let b2 = b.clone();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            b2.read(&mut buf, 4).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        b.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("pending read did not unblock")
            .unwrap();
        assert!(matches!(result, Err(MirrorError::ChannelClosed)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (a, _b) = channel_pair();
        a.close().await;
        a.close().await;
        assert!(a.is_closed());
        assert!(matches!(a.write(&[1]).await, Err(MirrorError::ChannelClosed)));
    }

    #[tokio::test]
    async fn peer_eof_fails_read() {
        let (a, b) = channel_pair();
        a.close().await;

        let mut buf = [0u8; 1];
        let result = tokio::time::timeout(Duration::from_secs(1), b.read(&mut buf, 1))
            .await
            .expect("read did not observe EOF");
        assert!(matches!(result, Err(MirrorError::ChannelClosed)));
    }

    #[tokio::test]
    async fn concurrent_writes_do_not_interleave() {
        let (a, b) = channel_pair();

        let mut writers = Vec::new();
        for fill in 0u8..4 {
            let a = a.clone();
            writers.push(tokio::spawn(async move {
                a.write(&[fill; 100]).await.unwrap();
            }));
        }
        for w in writers {
            w.await.unwrap();
        }

        // Each 100-byte run must be homogeneous.
        for _ in 0..4 {
            let chunk = b.read_exact(100).await.unwrap();
            assert!(chunk.iter().all(|&x| x == chunk[0]));
        }
    }
}
