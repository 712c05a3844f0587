//! Frame envelopes, payloads and error codes shared by guest and host.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

/// Protocol version carried by every frame.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default vsock port the host dispatcher listens on.
pub const HOST_PORT: u32 = 1025;

/// Largest byte count a single read, write, send or recv may move (1 MiB).
pub const MAX_IO_CHUNK: u32 = 1024 * 1024;

/// Identifies one function execution on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(pub u64);

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Guest-visible reference to an open file or connection.
///
/// Handle values are meaningful only within the invocation that opened them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(pub u64);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// First frame on every channel, written by the host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Hello {
    /// Host protocol version.
    pub version: u16,
    /// Invocation the channel belongs to.
    pub invocation: InvocationId,
}

impl Hello {
    /// Greeting for `invocation` at the current protocol version.
    pub const fn new(invocation: InvocationId) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            invocation,
        }
    }
}

/// Request envelope, guest to host.
///
/// Arguments are kept as an opaque byte field so the envelope, and with it
/// the correlation id, still decodes when the opcode or arguments do not.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct RequestFrame {
    /// Protocol version of the sender.
    pub version: u16,
    /// Invocation the request belongs to.
    pub invocation: InvocationId,
    /// Unique among the sender's outstanding requests.
    pub correlation: u64,
    /// Numeric [`Opcode`](crate::Opcode).
    pub opcode: u16,
    /// Postcard-encoded argument tuple for `opcode`.
    pub args: Vec<u8>,
}

impl RequestFrame {
    /// Builds a frame at the current protocol version.
    pub const fn new(invocation: InvocationId, correlation: u64, opcode: u16, args: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            invocation,
            correlation,
            opcode,
            args,
        }
    }
}

/// Response envelope, host to guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ResponseFrame {
    /// Protocol version of the sender.
    pub version: u16,
    /// Echo of the request's correlation id.
    pub correlation: u64,
    /// Success payload or structured error.
    pub outcome: Outcome,
}

impl ResponseFrame {
    /// Builds a frame at the current protocol version.
    pub const fn new(correlation: u64, outcome: Outcome) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            correlation,
            outcome,
        }
    }
}

/// Result of one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::exhaustive_enums)]
pub enum Outcome {
    /// The operation was performed.
    Ok(Payload),
    /// The operation was denied or failed; nothing was performed.
    Err(ErrorInfo),
}

impl From<Result<Payload, ErrorInfo>> for Outcome {
    fn from(r: Result<Payload, ErrorInfo>) -> Self {
        match r {
            Ok(p) => Self::Ok(p),
            Err(e) => Self::Err(e),
        }
    }
}

/// Success payloads. Each opcode produces exactly one of these shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Payload {
    /// No data (`close`, `unlink`, `state_put`).
    Unit,
    /// A freshly opened handle (`open`, `connect`).
    Handle(Handle),
    /// Bytes read (`read`, `recv`); empty means end of stream.
    Data(Vec<u8>),
    /// Bytes accepted (`write`, `send`).
    Count(u64),
    /// File metadata (`stat`).
    Stat(FileStat),
    /// Stored value, if any (`state_get`).
    Value(Option<Vec<u8>>),
}

/// File metadata returned by `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct FileStat {
    /// Size in bytes.
    pub len: u64,
    /// Entry type.
    pub kind: FileKind,
    /// Whether the entry is read-only on the host.
    pub readonly: bool,
    /// Last modification, milliseconds since the Unix epoch.
    pub modified_ms: Option<u64>,
}

impl FileStat {
    /// Builds a stat record.
    pub const fn new(len: u64, kind: FileKind, readonly: bool, modified_ms: Option<u64>) -> Self {
        Self {
            len,
            kind,
            readonly,
            modified_ms,
        }
    }
}

/// Filesystem entry type. `stat` follows symlinks, so a link reports the
/// kind of its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum FileKind {
    /// Regular file.
    File,
    /// Directory.
    Dir,
    /// Anything else (device, socket, fifo).
    Other,
}

/// Structured error carried in [`Outcome::Err`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ErrorInfo {
    /// Normalized error code.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl ErrorInfo {
    /// Creates an error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Malformed or unsupported frame.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Protocol, message)
    }

    /// Well-formed request outside every grant, or quota exhausted.
    pub fn denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Denied, message)
    }

    /// Handle unknown to this invocation or opened in the wrong mode.
    pub fn bad_handle(handle: Handle) -> Self {
        Self::new(ErrorCode::BadHandle, format!("bad handle {handle}"))
    }
}

impl From<&io::Error> for ErrorInfo {
    fn from(e: &io::Error) -> Self {
        Self::new(ErrorCode::from(e.kind()), e.to_string())
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Normalized error codes.
///
/// `Protocol` and `Denied` originate in the bridge itself; every other code
/// mirrors a failure the equivalent local operation would produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorCode {
    /// Malformed frame, unknown version or unknown opcode.
    Protocol,
    /// Not covered by any capability grant, or quota exhausted.
    Denied,
    /// Entry does not exist.
    NotFound,
    /// The host refused the operation on the real resource.
    PermissionDenied,
    /// Entry already exists.
    AlreadyExists,
    /// The operation would block.
    WouldBlock,
    /// Argument rejected by the real operation.
    InvalidInput,
    /// Handle unknown or used in the wrong mode.
    BadHandle,
    /// Remote end refused the connection.
    ConnectionRefused,
    /// Connection reset or closed by the peer.
    ConnectionReset,
    /// The operation timed out.
    TimedOut,
    /// Host or network unreachable.
    Unreachable,
    /// Any other I/O failure.
    Io,
}

impl ErrorCode {
    /// The [`io::ErrorKind`] a local operation would have failed with.
    pub const fn io_kind(self) -> io::ErrorKind {
        match self {
            Self::Protocol => io::ErrorKind::InvalidData,
            Self::Denied | Self::PermissionDenied => io::ErrorKind::PermissionDenied,
            Self::NotFound => io::ErrorKind::NotFound,
            Self::AlreadyExists => io::ErrorKind::AlreadyExists,
            Self::WouldBlock => io::ErrorKind::WouldBlock,
            Self::InvalidInput | Self::BadHandle => io::ErrorKind::InvalidInput,
            Self::ConnectionRefused => io::ErrorKind::ConnectionRefused,
            Self::ConnectionReset => io::ErrorKind::ConnectionReset,
            Self::TimedOut => io::ErrorKind::TimedOut,
            Self::Unreachable => io::ErrorKind::HostUnreachable,
            Self::Io => io::ErrorKind::Other,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> Self {
        use io::ErrorKind as K;
        match kind {
            K::NotFound => Self::NotFound,
            K::PermissionDenied => Self::PermissionDenied,
            K::AlreadyExists => Self::AlreadyExists,
            K::WouldBlock => Self::WouldBlock,
            K::InvalidInput | K::InvalidData => Self::InvalidInput,
            K::ConnectionRefused => Self::ConnectionRefused,
            K::ConnectionReset | K::ConnectionAborted | K::BrokenPipe | K::UnexpectedEof => {
                Self::ConnectionReset
            }
            K::TimedOut => Self::TimedOut,
            K::HostUnreachable | K::NetworkUnreachable | K::AddrNotAvailable => Self::Unreachable,
            _ => Self::Io,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Protocol => "protocol error",
            Self::Denied => "capability denied",
            Self::NotFound => "not found",
            Self::PermissionDenied => "permission denied",
            Self::AlreadyExists => "already exists",
            Self::WouldBlock => "would block",
            Self::InvalidInput => "invalid input",
            Self::BadHandle => "bad handle",
            Self::ConnectionRefused => "connection refused",
            Self::ConnectionReset => "connection reset",
            Self::TimedOut => "timed out",
            Self::Unreachable => "unreachable",
            Self::Io => "i/o error",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_kinds_normalize() {
        assert_eq!(ErrorCode::from(io::ErrorKind::NotFound), ErrorCode::NotFound);
        assert_eq!(
            ErrorCode::from(io::ErrorKind::BrokenPipe),
            ErrorCode::ConnectionReset
        );
        assert_eq!(ErrorCode::from(io::ErrorKind::Interrupted), ErrorCode::Io);
    }

    #[test]
    fn denial_looks_like_local_permission_error() {
        assert_eq!(
            ErrorCode::Denied.io_kind(),
            io::ErrorKind::PermissionDenied
        );
        assert_eq!(ErrorCode::NotFound.io_kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn error_info_from_io() {
        let e = io::Error::new(io::ErrorKind::AlreadyExists, "exists");
        let info = ErrorInfo::from(&e);
        assert_eq!(info.code, ErrorCode::AlreadyExists);
        assert_eq!(info.message, "exists");
    }
}
