//! Length-prefixed framing over a reliable byte stream.
//!
//! Each frame is a 4-byte unsigned big-endian length followed by exactly that
//! many payload bytes. Frame boundaries are the protocol: a writer must never
//! interleave with another writer, so the write half lives behind a mutex in
//! every owner.

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{NetworkError, Result};

pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub struct FrameReader<R> {
    inner: R,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_len: usize) -> Self {
        Self {
            inner,
            max_frame_len,
        }
    }

    /// Reads one full frame, blocking until it is available.
    ///
    /// A clean peer close at a frame boundary is [`NetworkError::EndOfStream`].
    /// A close after a partial length header or mid-payload is a hard
    /// transport error, and a length prefix above the configured maximum is a
    /// framing error; both are fatal to the connection.
    pub async fn receive(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];

        match self.inner.read_exact(&mut len_buf[..1]).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(NetworkError::EndOfStream)
            }
            Err(e) => return Err(e.into()),
        }
        self.inner
            .read_exact(&mut len_buf[1..])
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::UnexpectedEof => {
                    NetworkError::Transport("connection closed inside length header".to_string())
                }
                _ => NetworkError::Transport(e.to_string()),
            })?;

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > self.max_frame_len {
            return Err(NetworkError::Framing(format!(
                "frame length {} exceeds maximum {}",
                len, self.max_frame_len
            )));
        }

        let mut payload = vec![0u8; len];
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::UnexpectedEof => NetworkError::Transport(format!(
                    "connection closed inside a {}-byte frame",
                    len
                )),
                _ => NetworkError::Transport(e.to_string()),
            })?;

        Ok(payload)
    }
}

pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes one frame and flushes it. Callers serialize access; the caller
    /// owning this writer behind a mutex is what keeps frames atomic.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len())
            .map_err(|_| NetworkError::Framing("payload exceeds u32 length".to_string()))?;
        self.inner.write_all(&len.to_be_bytes()).await?;
        self.inner.write_all(payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
