//! Guest side of the fence syscall bridge.
//!
//! Function code inside the sandbox reaches host-controlled resources only
//! through this crate. [`Client`] multiplexes concurrent calls over the one
//! channel the invocation owns; [`Blocking`] wraps it as a [`Syscalls`]
//! provider for interpreter threads that expect ordinary blocking calls.
//!
//! ```no_run
//! use fence_guest::{Blocking, Syscalls};
//!
//! let sys = Blocking::from_env()?;
//! let body = sys.read_file("/data/input.json")?;
//! sys.state_put("last-size", Some(&body.len().to_le_bytes()))?;
//! # Ok::<(), std::io::Error>(())
//! ```

#[cfg(target_os = "linux")]
pub mod boot;
mod client;
mod endpoint;
mod error;
mod provider;

pub use client::Client;
pub use endpoint::{CHANNEL_ENV, Endpoint};
pub use error::{Error, Result};
pub use fence_proto::{FileKind, FileStat, Handle, OpenMode};
pub use provider::{Blocking, RemoteFile, Syscalls};
