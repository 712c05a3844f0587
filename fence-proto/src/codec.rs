//! Length-prefixed frame codec over any async byte stream.
//!
//! Each frame is: `[u32 big-endian length][postcard payload]`.

use std::io;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed frame payload (16 MiB).
pub const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Encodes `msg` into a complete frame, header included.
///
/// Building the whole frame up front lets writers emit it with a single
/// `write_all`, so concurrent senders never interleave partial frames.
pub fn to_frame(msg: &impl Serialize) -> io::Result<Vec<u8>> {
    let payload =
        postcard::to_allocvec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&n| n <= MAX_FRAME)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "frame exceeds 16 MiB limit"))?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes a frame payload, rejecting trailing bytes.
pub fn from_payload<T: DeserializeOwned>(payload: &[u8]) -> io::Result<T> {
    let (value, rest) = postcard::take_from_bytes::<T>(payload)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if !rest.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} trailing bytes in frame", rest.len()),
        ));
    }
    Ok(value)
}

/// Reads one frame payload.
///
/// Returns `Ok(None)` on a clean end-of-stream at a frame boundary. A stream
/// that ends inside a frame yields [`io::ErrorKind::UnexpectedEof`].
pub async fn read_frame(r: &mut (impl AsyncRead + Unpin)) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = r.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a frame header",
            ));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 16 MiB limit",
        ));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Encodes `msg` and writes it as one frame, then flushes.
pub async fn send(w: &mut (impl AsyncWrite + Unpin), msg: &impl Serialize) -> io::Result<()> {
    let frame = to_frame(msg)?;
    w.write_all(&frame).await?;
    w.flush().await
}

/// Reads and decodes one frame; `Ok(None)` on clean end-of-stream.
pub async fn recv<T: DeserializeOwned>(r: &mut (impl AsyncRead + Unpin)) -> io::Result<Option<T>> {
    match read_frame(r).await? {
        Some(payload) => from_payload(&payload).map(Some),
        None => Ok(None),
    }
}
