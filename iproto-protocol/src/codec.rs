//! Async frame reader and writer over a byte stream.

use crate::error::ProtocolError;
use crate::frame::{decode_length, prefix_width, Frame};
use crate::pool::FramePool;
use crate::MAX_FRAME_SIZE;
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads length-prefixed frames, drawing buffers from a shared pool.
pub struct FrameReader<R> {
    inner: R,
    pool: Arc<FramePool>,
    max_frame_size: u32,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, pool: Arc<FramePool>) -> Self {
        Self {
            inner,
            pool,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max: u32) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Reads the next frame.
    ///
    /// The returned frame is exclusively owned by the caller until it is
    /// handed back with [`FrameReader::release`]. On a short read or a
    /// framing error the partially filled frame goes back to the pool and
    /// the stream must not be read again.
    pub async fn read_frame(&mut self) -> Result<Frame, ProtocolError> {
        let mut prefix = [0u8; 5];
        self.inner.read_exact(&mut prefix[..1]).await?;
        let width = prefix_width(prefix[0]).inspect_err(|_| {
            tracing::debug!("Rejected length prefix marker {:#04x}", prefix[0]);
        })?;
        if width > 1 {
            self.inner.read_exact(&mut prefix[1..width]).await?;
        }

        let len = decode_length(&prefix[..width])?;
        if len == 0 {
            tracing::debug!("Rejected zero-length frame");
            return Err(ProtocolError::EmptyFrame);
        }
        if len > self.max_frame_size {
            tracing::debug!(
                "Rejected frame of {} bytes (max {})",
                len,
                self.max_frame_size
            );
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        let mut frame = self.pool.acquire();
        if let Err(e) = self.inner.read_exact(frame.fill_slot(len as usize)).await {
            self.pool.release(frame);
            return Err(e.into());
        }
        if let Err(e) = frame.parse_header() {
            self.pool.release(frame);
            return Err(e);
        }
        Ok(frame)
    }

    /// Returns a frame obtained from [`FrameReader::read_frame`] to the pool.
    pub fn release(&self, frame: Frame) {
        self.pool.release(frame);
    }

    pub fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    /// Reads exactly `buf.len()` raw bytes, bypassing framing.
    pub async fn read_raw(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        self.inner.read_exact(buf).await?;
        Ok(())
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes length-prefixed frames.
///
/// Each frame is assembled into one buffer and written with a single
/// `write_all`, so frames never interleave on the stream. Taking `&mut self`
/// keeps it to one writer at a time.
pub struct FrameWriter<W> {
    inner: W,
    scratch: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            scratch: BytesMut::with_capacity(4096),
        }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        self.scratch.clear();
        frame.write_to(&mut self.scratch)?;
        self.inner.write_all(&self.scratch).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shuts down the write side of the stream.
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
