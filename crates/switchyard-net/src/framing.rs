//! Length-prefixed postcard messages
//!
//! Control messages (secure-channel hello, identify, circuit relay) are sent
//! as a 4 byte big-endian length followed by a postcard payload. Frames are
//! read with exact reads so the stream can carry raw bytes afterwards.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (1 MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<postcard::Error> for FrameError {
    fn from(e: postcard::Error) -> Self {
        FrameError::Serialization(e.to_string())
    }
}

/// Serialize and write one frame
pub async fn write_frame<W, T>(io: &mut W, message: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = postcard::to_allocvec(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(payload.len()));
    }

    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    io.write_all(&buf).await?;
    io.flush().await?;
    Ok(())
}

/// Read and deserialize one frame
pub async fn read_frame<R, T>(io: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let length = io.read_u32().await? as usize;
    if length > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(length));
    }

    let mut payload = vec![0u8; length];
    io.read_exact(&mut payload).await?;
    Ok(postcard::from_bytes(&payload)?)
}
