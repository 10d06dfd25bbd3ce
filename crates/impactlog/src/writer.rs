//! Write coalescing for streamed responses.
//!
//! The renderer produces many small fragments (one per table cell). Sending
//! each one as its own socket write is wasteful on a constrained link, so
//! fragments are gathered here and pushed out once the buffer reaches the
//! flush threshold.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Default number of buffered bytes that triggers a flush.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 2048;

/// Buffers fragments in front of an async sink.
#[derive(Debug)]
pub struct BufferedWriter<W> {
    inner: W,
    buf: Vec<u8>,
    threshold: usize,
    bytes_sent: u64,
}

impl<W: AsyncWrite + Unpin> BufferedWriter<W> {
    /// Wrap `inner`, flushing whenever `threshold` bytes are buffered.
    #[must_use]
    pub fn new(inner: W, threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            inner,
            buf: Vec::with_capacity(threshold),
            threshold,
            bytes_sent: 0,
        }
    }

    /// Buffer `data`, flushing if the threshold is reached.
    ///
    /// Accepts anything byte-like: `&str`, `String`, `&[u8]`, `Vec<u8>`.
    ///
    /// # Errors
    ///
    /// Returns an error if an automatic flush fails.
    pub async fn write(&mut self, data: impl AsRef<[u8]>) -> io::Result<()> {
        self.buf.extend_from_slice(data.as_ref());
        if self.buf.len() >= self.threshold {
            self.flush().await?;
        }
        Ok(())
    }

    /// Send everything buffered to the sink. A no-op when empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink rejects the write.
    pub async fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await?;
        self.bytes_sent += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }

    /// Flush and shut down the sink's write side.
    ///
    /// The shutdown is attempted even if the flush fails; the first error is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing or shutting down fails.
    pub async fn close(&mut self) -> io::Result<()> {
        let flushed = self.flush().await;
        self.buf.clear();
        let shut = self.inner.shutdown().await;
        flushed.and(shut)
    }

    /// Bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Bytes handed to the sink so far.
    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Borrow the wrapped sink.
    #[must_use]
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Unwrap the sink, discarding anything still buffered.
    #[must_use]
    pub fn into_inner(self) -> W {
        self.inner
    }
}
