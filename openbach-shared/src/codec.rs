//! Length-prefixed frame codec.
//!
//! Every message, in both directions, is a 4-byte big-endian length followed
//! by that many bytes of UTF-8 JSON.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{TransportError, TransportResult};

/// Largest payload accepted on either side.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Read exactly `buffer.len()` bytes, reporting how far we got on EOF.
async fn read_all<R>(reader: &mut R, buffer: &mut [u8]) -> TransportResult<()>
where
    R: AsyncRead + Unpin,
{
    let expected = buffer.len();
    let mut read = 0;
    while read < expected {
        let received = reader.read(&mut buffer[read..]).await?;
        if received == 0 {
            return Err(TransportError::Truncated { expected, read });
        }
        read += received;
    }
    Ok(())
}

/// Read one raw frame payload.
pub async fn read_frame<R>(reader: &mut R) -> TransportResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    read_all(reader, &mut header).await?;
    let size = u32::from_be_bytes(header) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; size];
    read_all(reader, &mut payload).await?;
    Ok(payload)
}

/// Write one raw frame payload and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> TransportResult<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let header = (payload.len() as u32).to_be_bytes();
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a frame and decode it as JSON.
pub async fn read_json<R, T>(reader: &mut R) -> TransportResult<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let payload = read_frame(reader).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Encode a value as JSON and write it as a frame.
pub async fn write_json<W, T>(writer: &mut W, value: &T) -> TransportResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(value)?;
    write_frame(writer, &payload).await
}
