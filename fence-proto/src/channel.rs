//! Frame-level halves of one duplex channel.
//!
//! A channel is split once into a [`FrameReader`], owned by whichever task
//! drains incoming frames, and a cloneable [`FrameWriter`] shared by every
//! task that answers or issues requests.

use std::fmt;
use std::io;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::codec;

/// Splits a duplex stream into frame reader and frame writer.
pub fn split<S>(stream: S) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (r, w) = tokio::io::split(stream);
    (FrameReader::new(r), FrameWriter::new(w))
}

/// The error every send on a closed channel fails with.
pub fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "channel closed")
}

/// Receiving half: yields complete frames in arrival order.
pub struct FrameReader<R> {
    /// Buffered underlying reader.
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wraps a raw reader.
    pub fn new(r: R) -> Self {
        Self {
            inner: BufReader::new(r),
        }
    }

    /// Next raw frame payload; `Ok(None)` once the peer closed cleanly.
    pub async fn recv_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        codec::read_frame(&mut self.inner).await
    }

    /// Next frame decoded as `T`; `Ok(None)` once the peer closed cleanly.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> io::Result<Option<T>> {
        codec::recv(&mut self.inner).await
    }
}

impl<R> fmt::Debug for FrameReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameReader").finish_non_exhaustive()
    }
}

/// Sending half: whole frames under a per-channel lock.
///
/// Once [`close`](Self::close) runs, every later send fails with
/// [`closed()`].
pub struct FrameWriter<W> {
    /// `None` after close.
    inner: Arc<Mutex<Option<W>>>,
}

impl<W> Clone for FrameWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wraps a raw writer.
    pub fn new(w: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(w))),
        }
    }

    /// Writes `msg` as a single frame and flushes.
    pub async fn send(&self, msg: &impl Serialize) -> io::Result<()> {
        let frame = codec::to_frame(msg)?;
        self.send_frame(&frame).await
    }

    /// Writes an already framed message and flushes.
    ///
    /// Not cancel-safe: dropping the future mid-write leaves a partial frame
    /// on the stream. Callers that may be cancelled hand frames to a task
    /// that always runs the write to completion.
    pub async fn send_frame(&self, frame: &[u8]) -> io::Result<()> {
        let mut guard = self.inner.lock().await;
        let w = guard.as_mut().ok_or_else(closed)?;
        w.write_all(frame).await?;
        w.flush().await
    }

    /// Shuts the write side down. Idempotent.
    pub async fn close(&self) {
        let taken = self.inner.lock().await.take();
        if let Some(mut w) = taken {
            let _ = w.shutdown().await;
        }
    }

    /// Whether [`close`](Self::close) has run.
    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}

impl<W> fmt::Debug for FrameWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameWriter").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{InvocationId, RequestFrame};

    #[tokio::test]
    async fn concurrent_senders_never_tear_frames() {
        let (a, b) = tokio::io::duplex(64);
        let (_ra, wa) = split(a);
        let (mut rb, _wb) = split(b);

        let mut tasks = Vec::new();
        for i in 0..16u64 {
            let w = wa.clone();
            tasks.push(tokio::spawn(async move {
                let req = RequestFrame::new(InvocationId(1), i, 2, vec![i as u8; 512]);
                w.send(&req).await.unwrap();
            }));
        }

        let mut seen = Vec::new();
        for _ in 0..16 {
            let req: RequestFrame = rb.recv().await.unwrap().unwrap();
            assert!(req.args.iter().all(|&b| u64::from(b) == req.correlation));
            seen.push(req.correlation);
        }
        for t in tasks {
            t.await.unwrap();
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let (a, b) = tokio::io::duplex(64);
        let (_ra, wa) = split(a);
        let (mut rb, _wb) = split(b);

        wa.close().await;
        assert!(wa.is_closed().await);
        let err = wa.send(&RequestFrame::new(InvocationId(1), 1, 1, Vec::new())).await;
        assert_eq!(err.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
        // Peer observes a clean end-of-stream.
        assert!(rb.recv_frame().await.unwrap().is_none());
    }
}
