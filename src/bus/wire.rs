//! Frame codec shared by the TCP bus and the transfer request client.
//!
//! Wire format: all multi-byte integers are big-endian.
//! Frame format: len:u32 | type:u8 | payload
//! `len` counts payload bytes only. Payloads are JSON.

use crate::error::{FerryError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16MB) - prevents OOM from corrupted frames
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Frame header: len:u32 + type:u8
pub const HEADER_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Subscriber -> publisher: list of topic prefixes
    Subscribe = 0x01,
    /// Publisher -> subscriber: one bus message
    Message = 0x02,
    /// Requester -> file owner: transfer request
    Request = 0x03,
    /// File owner -> requester: grant or refusal
    Reply = 0x04,
}

impl FrameType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Subscribe),
            0x02 => Some(Self::Message),
            0x03 => Some(Self::Request),
            0x04 => Some(Self::Reply),
            _ => None,
        }
    }
}

/// Encode a complete frame.
pub fn encode_frame(frame_type: FrameType, payload: &[u8]) -> Result<Bytes> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or_else(|| {
            FerryError::MalformedFrame(format!(
                "payload of {} bytes exceeds maximum frame size {}",
                payload.len(),
                MAX_FRAME_SIZE
            ))
        })?;

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u32(len);
    buf.put_u8(frame_type as u8);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Read a single frame from the stream.
/// Returns (frame_type, payload).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(FrameType, Bytes)> {
    let len = r.read_u32().await?;

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        return Err(FerryError::MalformedFrame(format!(
            "frame size {} exceeds maximum allowed size {}",
            len, MAX_FRAME_SIZE
        )));
    }

    let raw_type = r.read_u8().await?;
    let frame_type = FrameType::from_u8(raw_type)
        .ok_or_else(|| FerryError::MalformedFrame(format!("unknown frame type {:#04x}", raw_type)))?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;

    Ok((frame_type, Bytes::from(payload)))
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await?;
    Ok(())
}

/// Serialize `value` as JSON and write it as one frame, then flush.
pub async fn write_json<W, T>(w: &mut W, frame_type: FrameType, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let frame = encode_frame(frame_type, &serde_json::to_vec(value)?)?;
    write_frame(w, &frame).await?;
    w.flush().await?;
    Ok(())
}

/// Read one frame, check its type, and deserialize the JSON payload.
pub async fn read_json<R, T>(r: &mut R, expected: FrameType) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let (frame_type, payload) = read_frame(r).await?;
    if frame_type != expected {
        return Err(FerryError::MalformedFrame(format!(
            "expected {:?} frame, got {:?}",
            expected, frame_type
        )));
    }
    Ok(serde_json::from_slice(&payload)?)
}
