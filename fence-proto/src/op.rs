//! Opcodes and their typed argument shapes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::message::{Handle, MAX_IO_CHUNK};

/// Numeric operation identifiers. The set is closed per protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
#[non_exhaustive]
pub enum Opcode {
    /// Open a file.
    Open = 1,
    /// Read from a file handle.
    Read = 2,
    /// Write to a file handle.
    Write = 3,
    /// Close any handle.
    Close = 4,
    /// Stat a path.
    Stat = 5,
    /// Remove a file.
    Unlink = 6,
    /// Open an outbound TCP connection.
    Connect = 7,
    /// Send on a connection handle.
    Send = 8,
    /// Receive from a connection handle.
    Recv = 9,
    /// Read an inter-invocation state value.
    StateGet = 10,
    /// Store or delete an inter-invocation state value.
    StatePut = 11,
}

impl Opcode {
    /// Short lowercase name, used in logs and error messages.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Read => "read",
            Self::Write => "write",
            Self::Close => "close",
            Self::Stat => "stat",
            Self::Unlink => "unlink",
            Self::Connect => "connect",
            Self::Send => "send",
            Self::Recv => "recv",
            Self::StateGet => "state_get",
            Self::StatePut => "state_put",
        }
    }
}

impl TryFrom<u16> for Opcode {
    type Error = DecodeError;

    fn try_from(v: u16) -> Result<Self, DecodeError> {
        Ok(match v {
            1 => Self::Open,
            2 => Self::Read,
            3 => Self::Write,
            4 => Self::Close,
            5 => Self::Stat,
            6 => Self::Unlink,
            7 => Self::Connect,
            8 => Self::Send,
            9 => Self::Recv,
            10 => Self::StateGet,
            11 => Self::StatePut,
            other => return Err(DecodeError::UnknownOpcode(other)),
        })
    }
}

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum OpenMode {
    /// Read only; the file must exist.
    Read,
    /// Write only; create or truncate.
    Write,
    /// Write only; create or append.
    Append,
    /// Write only; fail if the file exists.
    CreateNew,
}

impl OpenMode {
    /// Whether the mode can modify the file.
    pub const fn writes(self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// A decoded request with typed arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Op {
    /// `open(path, mode) -> Handle`
    Open {
        /// Absolute guest path.
        path: String,
        /// Open mode.
        mode: OpenMode,
    },
    /// `read(handle, len) -> Data`
    Read {
        /// File handle.
        handle: Handle,
        /// Maximum bytes to return.
        len: u32,
    },
    /// `write(handle, data) -> Count`
    Write {
        /// File handle.
        handle: Handle,
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// `close(handle) -> Unit`
    Close {
        /// File or connection handle.
        handle: Handle,
    },
    /// `stat(path) -> Stat`
    Stat {
        /// Absolute guest path.
        path: String,
    },
    /// `unlink(path) -> Unit`
    Unlink {
        /// Absolute guest path.
        path: String,
    },
    /// `connect(host, port) -> Handle`
    Connect {
        /// Destination host name or address.
        host: String,
        /// Destination port.
        port: u16,
    },
    /// `send(handle, data) -> Count`
    Send {
        /// Connection handle.
        handle: Handle,
        /// Bytes to send.
        data: Vec<u8>,
    },
    /// `recv(handle, max) -> Data`
    Recv {
        /// Connection handle.
        handle: Handle,
        /// Maximum bytes to return.
        max: u32,
    },
    /// `state_get(key) -> Value`
    StateGet {
        /// State key.
        key: String,
    },
    /// `state_put(key, value) -> Unit`; `None` deletes.
    StatePut {
        /// State key.
        key: String,
        /// New value, or `None` to delete.
        value: Option<Vec<u8>>,
    },
}

impl Op {
    /// The opcode this operation travels under.
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Open { .. } => Opcode::Open,
            Self::Read { .. } => Opcode::Read,
            Self::Write { .. } => Opcode::Write,
            Self::Close { .. } => Opcode::Close,
            Self::Stat { .. } => Opcode::Stat,
            Self::Unlink { .. } => Opcode::Unlink,
            Self::Connect { .. } => Opcode::Connect,
            Self::Send { .. } => Opcode::Send,
            Self::Recv { .. } => Opcode::Recv,
            Self::StateGet { .. } => Opcode::StateGet,
            Self::StatePut { .. } => Opcode::StatePut,
        }
    }

    /// Encodes the argument tuple for the wire.
    pub fn encode_args(&self) -> Result<Vec<u8>, postcard::Error> {
        match self {
            Self::Open { path, mode } => postcard::to_allocvec(&(path, mode)),
            Self::Read { handle, len } => postcard::to_allocvec(&(handle, len)),
            Self::Write { handle, data } | Self::Send { handle, data } => {
                postcard::to_allocvec(&(handle, data))
            }
            Self::Close { handle } => postcard::to_allocvec(handle),
            Self::Stat { path } | Self::Unlink { path } => postcard::to_allocvec(path),
            Self::Connect { host, port } => postcard::to_allocvec(&(host, port)),
            Self::Recv { handle, max } => postcard::to_allocvec(&(handle, max)),
            Self::StateGet { key } => postcard::to_allocvec(key),
            Self::StatePut { key, value } => postcard::to_allocvec(&(key, value)),
        }
    }

    /// Bytes this call asks to move, for the operations that move any.
    pub fn transfer_len(&self) -> Option<usize> {
        match self {
            Self::Read { len: n, .. } | Self::Recv { max: n, .. } => Some(*n as usize),
            Self::Write { data, .. } | Self::Send { data, .. } => Some(data.len()),
            Self::StatePut { value, .. } => value.as_ref().map(Vec::len),
            _ => None,
        }
    }

    /// Decodes `args` according to `opcode`.
    ///
    /// Fails on unknown opcodes, undecodable arguments, trailing bytes and
    /// transfers above [`MAX_IO_CHUNK`].
    pub fn decode(opcode: u16, args: &[u8]) -> Result<Self, DecodeError> {
        let op = Self::decode_shape(opcode, args)?;
        match op.transfer_len() {
            Some(n) if n > MAX_IO_CHUNK as usize => Err(DecodeError::ChunkTooLarge(n)),
            _ => Ok(op),
        }
    }

    /// Decodes the argument tuple without size checks.
    fn decode_shape(opcode: u16, args: &[u8]) -> Result<Self, DecodeError> {
        Ok(match Opcode::try_from(opcode)? {
            Opcode::Open => {
                let (path, mode) = exact(args)?;
                Self::Open { path, mode }
            }
            Opcode::Read => {
                let (handle, len) = exact(args)?;
                Self::Read { handle, len }
            }
            Opcode::Write => {
                let (handle, data) = exact(args)?;
                Self::Write { handle, data }
            }
            Opcode::Close => Self::Close {
                handle: exact(args)?,
            },
            Opcode::Stat => Self::Stat { path: exact(args)? },
            Opcode::Unlink => Self::Unlink { path: exact(args)? },
            Opcode::Connect => {
                let (host, port) = exact(args)?;
                Self::Connect { host, port }
            }
            Opcode::Send => {
                let (handle, data) = exact(args)?;
                Self::Send { handle, data }
            }
            Opcode::Recv => {
                let (handle, max) = exact(args)?;
                Self::Recv { handle, max }
            }
            Opcode::StateGet => Self::StateGet { key: exact(args)? },
            Opcode::StatePut => {
                let (key, value) = exact(args)?;
                Self::StatePut { key, value }
            }
        })
    }
}

/// Decodes `T` and requires every byte to be consumed.
fn exact<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
    let (value, rest) = postcard::take_from_bytes::<T>(bytes)?;
    if rest.is_empty() {
        Ok(value)
    } else {
        Err(DecodeError::TrailingBytes(rest.len()))
    }
}

/// Why a request could not be decoded.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// Opcode outside the closed set.
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),

    /// Argument bytes do not match the opcode's shape.
    #[error("malformed arguments: {0}")]
    Malformed(#[from] postcard::Error),

    /// Argument bytes left over after decoding.
    #[error("{0} trailing bytes after arguments")]
    TrailingBytes(usize),

    /// A read, write, send, recv or stored value above the per-call cap.
    #[error("{0} bytes exceeds the {MAX_IO_CHUNK}-byte chunk limit")]
    ChunkTooLarge(usize),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn open_args_decode() {
        let op = Op::Open {
            path: "/data/file.txt".into(),
            mode: OpenMode::Read,
        };
        let args = op.encode_args().unwrap();
        let back = Op::decode(Opcode::Open as u16, &args).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn rejects_unknown_opcode() {
        let err = Op::decode(999, &[]).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownOpcode(999)));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut args = Op::Close { handle: Handle(3) }.encode_args().unwrap();
        args.push(0);
        let err = Op::decode(Opcode::Close as u16, &args).unwrap_err();
        assert!(matches!(err, DecodeError::TrailingBytes(1)));
    }

    #[test]
    fn rejects_args_for_another_opcode() {
        // A bare handle is not a (host, port) pair.
        let args = Op::Close { handle: Handle(7) }.encode_args().unwrap();
        assert!(Op::decode(Opcode::Connect as u16, &args).is_err());
    }

    #[test]
    fn rejects_oversized_transfers() {
        let over = MAX_IO_CHUNK + 1;
        let read = Op::Read { handle: Handle(1), len: over }.encode_args().unwrap();
        let err = Op::decode(Opcode::Read as u16, &read).unwrap_err();
        assert!(matches!(err, DecodeError::ChunkTooLarge(n) if n == over as usize));

        let write = Op::Write {
            handle: Handle(1),
            data: vec![0; over as usize],
        }
        .encode_args()
        .unwrap();
        assert!(Op::decode(Opcode::Write as u16, &write).is_err());

        let at_cap = Op::Recv { handle: Handle(1), max: MAX_IO_CHUNK };
        let args = at_cap.encode_args().unwrap();
        assert_eq!(Op::decode(Opcode::Recv as u16, &args).unwrap(), at_cap);
    }

    #[test]
    fn state_put_delete_survives() {
        let op = Op::StatePut {
            key: "counter".into(),
            value: None,
        };
        let args = op.encode_args().unwrap();
        assert_eq!(Op::decode(Opcode::StatePut as u16, &args).unwrap(), op);
    }
}
