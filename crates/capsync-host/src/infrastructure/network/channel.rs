//! Framed message channel over any async byte stream.
//!
//! # Why a buffer is needed (for beginners)
//!
//! TCP is a stream protocol.  A single `read()` may return half a frame, or
//! the tail of one frame and the head of the next.  [`FrameReader`] keeps
//! every received byte in `recv_buf` and calls [`decode_frame`] until it
//! reports `InsufficientData`; only then does it go back to the socket.
//!
//! Partial bytes survive a read timeout, so a slow device that delivers a
//! frame across several receive windows still produces one whole message.
//! A stream that ends in the middle of a frame is an error, never a partial
//! message.
//!
//! The length prefix is validated as soon as its four bytes arrive, so an
//! oversized declaration is rejected before any body byte is buffered.

use std::io;
use std::time::Duration;

use capsync_core::protocol::{decode_frame, encode_frame, Message, ProtocolError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::{timeout_at, Instant};

const READ_CHUNK: usize = 8 * 1024;

/// Errors surfaced by the channel.  None of these is retried here.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The peer sent bytes that violate the frame format.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// The underlying stream failed.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// The stream ended partway through a frame.
    #[error("stream closed with {buffered} bytes of an incomplete frame")]
    Truncated { buffered: usize },
}

impl ChannelError {
    /// Protocol violations close the connection at once; transport errors
    /// count against the error threshold instead.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Truncated { .. })
    }
}

/// Result of one [`FrameReader::read`] call.
#[derive(Debug, PartialEq)]
pub enum ReadOutcome {
    /// A complete message and the number of wire bytes it occupied.
    Message(Message, usize),
    /// The timeout elapsed without a complete message.
    Timeout,
    /// The peer closed the stream cleanly between frames.
    Closed,
}

/// Any bidirectional stream a device can be served over (plain TCP, TLS, or
/// an in-memory duplex in tests).
pub trait DeviceStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DeviceStream for T {}

pub type BoxedStream = Box<dyn DeviceStream>;

/// Splits a boxed stream into a framed reader and writer.
pub fn split(stream: BoxedStream) -> (FrameReader<ReadHalf<BoxedStream>>, FrameWriter<WriteHalf<BoxedStream>>) {
    let (read_half, write_half) = tokio::io::split(stream);
    (FrameReader::new(read_half), FrameWriter::new(write_half))
}

// ── Reader ────────────────────────────────────────────────────────────────────

pub struct FrameReader<R> {
    inner: R,
    recv_buf: Vec<u8>,
    read_tmp: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            recv_buf: Vec::with_capacity(READ_CHUNK),
            read_tmp: vec![0u8; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Bytes received but not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.recv_buf.len()
    }

    /// Waits up to `timeout` for one complete message.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Protocol`] for a bad frame, [`ChannelError::Io`] for a
    /// failed read, [`ChannelError::Truncated`] for EOF inside a frame.
    pub async fn read(&mut self, timeout: Duration) -> Result<ReadOutcome, ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            match decode_frame(&self.recv_buf) {
                Ok((message, consumed)) => {
                    self.recv_buf.drain(..consumed);
                    return Ok(ReadOutcome::Message(message, consumed));
                }
                Err(e) if e.is_incomplete() => {}
                Err(e) => return Err(e.into()),
            }

            let n = match timeout_at(deadline, self.inner.read(&mut self.read_tmp)).await {
                Err(_) => return Ok(ReadOutcome::Timeout),
                Ok(result) => result?,
            };
            if n == 0 {
                return if self.recv_buf.is_empty() {
                    Ok(ReadOutcome::Closed)
                } else {
                    Err(ChannelError::Truncated {
                        buffered: self.recv_buf.len(),
                    })
                };
            }
            self.recv_buf.extend_from_slice(&self.read_tmp[..n]);
        }
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encodes and writes one frame, returning the bytes written.
    ///
    /// The whole frame is handed to `write_all` in one buffer, so frames from
    /// one writer never interleave.
    pub async fn write(&mut self, message: &Message) -> Result<usize, ChannelError> {
        let bytes = encode_frame(message)?;
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(bytes.len())
    }

    pub async fn shutdown(&mut self) -> Result<(), ChannelError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
