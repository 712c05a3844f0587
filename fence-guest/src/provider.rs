//! Blocking privileged-operation provider for interpreter threads.
//!
//! The interpreter's interception layer talks to a [`Syscalls`]
//! implementation instead of the kernel. [`Blocking`] is the implementation
//! that forwards every call over the channel; each calling thread blocks on
//! its own request while others proceed.

use std::io;

use fence_proto::{FileStat, Handle, MAX_IO_CHUNK, OpenMode};
use tokio::runtime::Runtime;

use crate::client::Client;
use crate::endpoint::Endpoint;
use crate::error::Error;

/// Privileged operations as ordinary blocking calls.
///
/// Failures come back as [`io::Error`] with the kind a local operation would
/// have produced; the bridge-level [`Error`] is attached as the source.
pub trait Syscalls {
    /// Opens a file.
    fn open(&self, path: &str, mode: OpenMode) -> io::Result<Handle>;
    /// Reads up to `len` bytes; empty means end of file.
    fn read(&self, handle: Handle, len: usize) -> io::Result<Vec<u8>>;
    /// Writes `data`, returning the bytes accepted.
    fn write(&self, handle: Handle, data: &[u8]) -> io::Result<usize>;
    /// Closes a file or connection.
    fn close(&self, handle: Handle) -> io::Result<()>;
    /// Returns metadata for `path`.
    fn stat(&self, path: &str) -> io::Result<FileStat>;
    /// Removes a file.
    fn unlink(&self, path: &str) -> io::Result<()>;
    /// Opens an outbound TCP connection.
    fn connect(&self, host: &str, port: u16) -> io::Result<Handle>;
    /// Sends `data` on a connection.
    fn send(&self, handle: Handle, data: &[u8]) -> io::Result<usize>;
    /// Receives up to `max` bytes; empty means the peer closed.
    fn recv(&self, handle: Handle, max: usize) -> io::Result<Vec<u8>>;
    /// Reads an inter-invocation state value.
    fn state_get(&self, key: &str) -> io::Result<Option<Vec<u8>>>;
    /// Stores (or with `None`, deletes) an inter-invocation state value.
    fn state_put(&self, key: &str, value: Option<&[u8]>) -> io::Result<()>;

    /// Reads a whole file.
    fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        let h = self.open(path, OpenMode::Read)?;
        let mut out = Vec::new();
        let result = loop {
            match self.read(h, MAX_IO_CHUNK as usize) {
                Ok(chunk) if chunk.is_empty() => break Ok(()),
                Ok(chunk) => out.extend_from_slice(&chunk),
                Err(e) => break Err(e),
            }
        };
        self.close(h)?;
        result.map(|()| out)
    }

    /// Creates or truncates a file and writes all of `data`.
    fn write_file(&self, path: &str, data: &[u8]) -> io::Result<()> {
        let h = self.open(path, OpenMode::Write)?;
        let result = data
            .chunks(MAX_IO_CHUNK as usize)
            .try_for_each(|chunk| write_all(self, h, chunk));
        self.close(h)?;
        result
    }
}

/// Writes every byte of `chunk`, looping over short writes.
fn write_all<S: Syscalls + ?Sized>(sys: &S, h: Handle, mut chunk: &[u8]) -> io::Result<()> {
    while !chunk.is_empty() {
        let n = sys.write(h, chunk)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "host accepted 0 bytes"));
        }
        chunk = &chunk[n.min(chunk.len())..];
    }
    Ok(())
}

/// Chunk sizes must fit the wire's `u32`.
fn chunk_len(n: usize) -> io::Result<u32> {
    u32::try_from(n).map_err(|_| Error::InvalidArgument(format!("{n} bytes")).into())
}

/// Byte counts reported by the host never exceed what was offered.
fn accepted(n: u64, offered: usize) -> usize {
    usize::try_from(n).map_or(offered, |n| n.min(offered))
}

/// [`Syscalls`] over a channel, driven by an owned tokio runtime.
#[derive(Debug)]
pub struct Blocking {
    /// Drives the client; `block_on` may be entered from many threads.
    rt: Runtime,
    /// Async client shared by every calling thread.
    client: Client,
}

impl Blocking {
    /// Connects to `endpoint` on a fresh runtime.
    ///
    /// Must not be called from inside another tokio runtime.
    pub fn connect(endpoint: &Endpoint) -> io::Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("fence-guest")
            .enable_all()
            .build()?;
        let client = rt.block_on(endpoint.connect())?;
        Ok(Self { rt, client })
    }

    /// Connects to the address in [`crate::CHANNEL_ENV`].
    pub fn from_env() -> io::Result<Self> {
        Self::connect(&Endpoint::from_env()?)
    }

    /// The async client underneath.
    pub const fn client(&self) -> &Client {
        &self.client
    }

    /// Closes the channel; the host ends the invocation.
    pub fn disconnect(&self) {
        self.rt.block_on(self.client.disconnect());
    }
}

impl Syscalls for Blocking {
    fn open(&self, path: &str, mode: OpenMode) -> io::Result<Handle> {
        Ok(self.rt.block_on(self.client.open(path, mode))?)
    }

    fn read(&self, handle: Handle, len: usize) -> io::Result<Vec<u8>> {
        let len = chunk_len(len)?;
        Ok(self.rt.block_on(self.client.read(handle, len))?)
    }

    fn write(&self, handle: Handle, data: &[u8]) -> io::Result<usize> {
        let n = self.rt.block_on(self.client.write(handle, data.to_vec()))?;
        Ok(accepted(n, data.len()))
    }

    fn close(&self, handle: Handle) -> io::Result<()> {
        Ok(self.rt.block_on(self.client.close(handle))?)
    }

    fn stat(&self, path: &str) -> io::Result<FileStat> {
        Ok(self.rt.block_on(self.client.stat(path))?)
    }

    fn unlink(&self, path: &str) -> io::Result<()> {
        Ok(self.rt.block_on(self.client.unlink(path))?)
    }

    fn connect(&self, host: &str, port: u16) -> io::Result<Handle> {
        Ok(self.rt.block_on(self.client.connect(host, port))?)
    }

    fn send(&self, handle: Handle, data: &[u8]) -> io::Result<usize> {
        let n = self.rt.block_on(self.client.send(handle, data.to_vec()))?;
        Ok(accepted(n, data.len()))
    }

    fn recv(&self, handle: Handle, max: usize) -> io::Result<Vec<u8>> {
        let max = chunk_len(max)?;
        Ok(self.rt.block_on(self.client.recv(handle, max))?)
    }

    fn state_get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.rt.block_on(self.client.state_get(key))?)
    }

    fn state_put(&self, key: &str, value: Option<&[u8]>) -> io::Result<()> {
        let value = value.map(<[u8]>::to_vec);
        Ok(self.rt.block_on(self.client.state_put(key, value))?)
    }
}

/// A remote file exposed through [`io::Read`] and [`io::Write`].
///
/// Closed on drop; close errors at that point are discarded.
#[derive(Debug)]
pub struct RemoteFile<'a, S: Syscalls + ?Sized> {
    /// Provider the handle belongs to.
    sys: &'a S,
    /// Open handle; `None` once closed.
    handle: Option<Handle>,
}

impl<'a, S: Syscalls + ?Sized> RemoteFile<'a, S> {
    /// Opens `path` through `sys`.
    pub fn open(sys: &'a S, path: &str, mode: OpenMode) -> io::Result<Self> {
        let handle = sys.open(path, mode)?;
        Ok(Self {
            sys,
            handle: Some(handle),
        })
    }

    /// Closes the file, reporting any error.
    pub fn close(mut self) -> io::Result<()> {
        match self.handle.take() {
            Some(h) => self.sys.close(h),
            None => Ok(()),
        }
    }

    /// The live handle.
    fn live(&self) -> io::Result<Handle> {
        self.handle.ok_or_else(|| Error::ChannelClosed.into())
    }
}

impl<S: Syscalls + ?Sized> io::Read for RemoteFile<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let want = buf.len().min(MAX_IO_CHUNK as usize);
        let data = self.sys.read(self.live()?, want)?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }
}

impl<S: Syscalls + ?Sized> io::Write for RemoteFile<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let chunk = &buf[..buf.len().min(MAX_IO_CHUNK as usize)];
        self.sys.write(self.live()?, chunk)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: Syscalls + ?Sized> Drop for RemoteFile<'_, S> {
    fn drop(&mut self) {
        if let Some(h) = self.handle.take() {
            let _ = self.sys.close(h);
        }
    }
}
