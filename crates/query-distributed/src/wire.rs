//! Message framing for the data plane and the control plane
//!
//! Every message is a 4-byte little-endian `i32` length followed by that many
//! bytes of Snappy (raw block format) compressed payload. A length of
//! [`EOF_MARKER`] ends the stream and carries no payload; a length of zero is a
//! valid empty message. A transport that closes before the marker is a
//! truncated stream, never a clean end.

use crate::error::{DistributedError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length value reserved for "end of stream, no payload"
pub const EOF_MARKER: i32 = i32::MIN;

/// Default upper bound on a single decoded message
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Message payload (possibly empty)
    Data(Vec<u8>),
    /// End-of-stream marker
    Eof,
}

/// Writes length-prefixed, compressed frames to a byte sink
pub struct FrameWriter<W> {
    inner: W,
    encoder: snap::raw::Encoder,
    finished: bool,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            encoder: snap::raw::Encoder::new(),
            finished: false,
        }
    }

    /// Whether the end-of-stream marker has been written
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Compress and write one message
    pub async fn write_message(&mut self, payload: &[u8]) -> Result<()> {
        if self.finished {
            return Err(DistributedError::StreamFinished);
        }
        if payload.is_empty() {
            self.inner.write_all(&0i32.to_le_bytes()).await?;
            return Ok(());
        }

        let compressed = self.encoder.compress_vec(payload)?;
        let len = i32::try_from(compressed.len()).map_err(|_| {
            DistributedError::MalformedFrame(format!(
                "compressed message of {} bytes exceeds frame limit",
                compressed.len()
            ))
        })?;

        let mut frame = Vec::with_capacity(4 + compressed.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&compressed);
        self.inner.write_all(&frame).await?;
        Ok(())
    }

    /// Serialize `value` as JSON and write it as one message
    pub async fn write_json<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.write_message(&payload).await
    }

    /// Write the end-of-stream marker; later calls are no-ops
    pub async fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.inner.write_all(&EOF_MARKER.to_le_bytes()).await?;
        self.inner.flush().await?;
        self.finished = true;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await?;
        Ok(())
    }

    /// Finish the stream and shut the transport down
    pub async fn close(&mut self) -> Result<()> {
        self.finish().await?;
        self.inner.shutdown().await?;
        Ok(())
    }

    /// Shut the transport down without the end-of-stream marker, so the peer
    /// observes a truncated stream
    pub async fn abort(&mut self) -> Result<()> {
        self.finished = true;
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads frames written by [`FrameWriter`]
pub struct FrameReader<R> {
    inner: R,
    decoder: snap::raw::Decoder,
    max_message_size: usize,
    finished: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_message_size(inner, DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(inner: R, max_message_size: usize) -> Self {
        Self {
            inner,
            decoder: snap::raw::Decoder::new(),
            max_message_size,
            finished: false,
        }
    }

    /// Whether the end-of-stream marker has been read
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Read the next frame. After the end-of-stream marker every call
    /// returns [`Frame::Eof`] without touching the transport.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        if self.finished {
            return Ok(Frame::Eof);
        }

        let mut header = [0u8; 4];
        self.inner
            .read_exact(&mut header)
            .await
            .map_err(|e| truncation(e, "stream closed before end-of-stream marker"))?;
        let len = i32::from_le_bytes(header);

        if len == EOF_MARKER {
            self.finished = true;
            return Ok(Frame::Eof);
        }
        if len < 0 {
            return Err(DistributedError::MalformedFrame(format!(
                "negative frame length {}",
                len
            )));
        }
        if len == 0 {
            return Ok(Frame::Data(Vec::new()));
        }
        let len = len as usize;
        if len > self.max_message_size {
            return Err(DistributedError::MalformedFrame(format!(
                "frame of {} bytes exceeds limit of {}",
                len, self.max_message_size
            )));
        }

        let mut compressed = vec![0u8; len];
        self.inner
            .read_exact(&mut compressed)
            .await
            .map_err(|e| truncation(e, "frame payload cut short"))?;

        let decoded_len = snap::raw::decompress_len(&compressed)?;
        if decoded_len > self.max_message_size {
            return Err(DistributedError::MalformedFrame(format!(
                "message of {} bytes exceeds limit of {}",
                decoded_len, self.max_message_size
            )));
        }
        Ok(Frame::Data(self.decoder.decompress_vec(&compressed)?))
    }

    /// Read one message, `None` at end of stream
    pub async fn read_message(&mut self) -> Result<Option<Vec<u8>>> {
        match self.read_frame().await? {
            Frame::Data(bytes) => Ok(Some(bytes)),
            Frame::Eof => Ok(None),
        }
    }

    /// Read one JSON message, `None` at end of stream
    pub async fn read_json<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.read_message().await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

fn truncation(err: std::io::Error, context: &str) -> DistributedError {
    if err.kind() == ErrorKind::UnexpectedEof {
        DistributedError::Truncated(context.to_string())
    } else {
        DistributedError::NetworkError(err)
    }
}
