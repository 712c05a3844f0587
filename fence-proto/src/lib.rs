//! Wire protocol for fence guest↔host syscall mediation.
//!
//! Messages are serialized with [`postcard`] and framed with a 4-byte
//! big-endian length prefix, suitable for any reliable byte stream
//! (vsock, Unix socket, TCP).
//!
//! One channel carries one invocation. The host speaks first with a
//! [`Hello`]; afterwards the guest writes [`RequestFrame`]s and the host
//! answers each with exactly one [`ResponseFrame`] echoing its correlation
//! id. Responses may arrive in any order.

pub mod channel;
mod codec;
mod message;
mod op;

pub use channel::{FrameReader, FrameWriter};
pub use codec::{MAX_FRAME, from_payload, read_frame, recv, send, to_frame};
pub use message::{
    ErrorCode, ErrorInfo, FileKind, FileStat, HOST_PORT, Handle, Hello, InvocationId,
    MAX_IO_CHUNK, Outcome, PROTOCOL_VERSION, Payload, RequestFrame, ResponseFrame,
};
pub use op::{DecodeError, Op, OpenMode, Opcode};
