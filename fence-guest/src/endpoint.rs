//! Where the guest finds its channel.
//!
//! The bootstrap exports the address in [`CHANNEL_ENV`]; the client parses
//! it back before the first privileged call.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::client::Client;
use crate::error::{Error, Result};

/// Environment variable carrying the channel address.
pub const CHANNEL_ENV: &str = "FENCE_CHANNEL";

/// Channel address.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Endpoint {
    /// Unix socket path (`unix:/run/fence.sock`).
    Unix(PathBuf),
    /// vsock address (`vsock:2:1025`).
    Vsock {
        /// Context id; `2` is the host.
        cid: u32,
        /// Port the host dispatcher listens on.
        port: u32,
    },
    /// Inherited, already-connected Unix socket (`fd:3`).
    Fd(i32),
}

impl Endpoint {
    /// Reads [`CHANNEL_ENV`].
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(CHANNEL_ENV)
            .map_err(|_| Error::InvalidArgument(format!("{CHANNEL_ENV} is not set")))?;
        raw.parse()
    }

    /// Connects and completes the handshake.
    pub async fn connect(&self) -> Result<Client> {
        match self {
            Self::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Client::handshake(stream).await
            }
            Self::Vsock { cid, port } => connect_vsock(*cid, *port).await,
            Self::Fd(fd) => Client::handshake(inherited(*fd)?).await,
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::InvalidArgument(format!("bad channel address {s:?}"));
        let (scheme, rest) = s.split_once(':').ok_or_else(bad)?;
        match scheme {
            "unix" if !rest.is_empty() => Ok(Self::Unix(PathBuf::from(rest))),
            "vsock" => {
                let (cid, port) = rest.split_once(':').ok_or_else(bad)?;
                Ok(Self::Vsock {
                    cid: cid.parse().map_err(|_| bad())?,
                    port: port.parse().map_err(|_| bad())?,
                })
            }
            "fd" => rest.parse().map(Self::Fd).map_err(|_| bad()),
            _ => Err(bad()),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(p) => write!(f, "unix:{}", p.display()),
            Self::Vsock { cid, port } => write!(f, "vsock:{cid}:{port}"),
            Self::Fd(fd) => write!(f, "fd:{fd}"),
        }
    }
}

/// Adopts an inherited socket descriptor.
#[allow(unsafe_code)]
fn inherited(fd: i32) -> Result<tokio::net::UnixStream> {
    use std::os::fd::FromRawFd;

    if fd < 0 {
        return Err(Error::InvalidArgument(format!("bad descriptor {fd}")));
    }
    // SAFETY: the bootstrap hands over exactly one connected socket under
    // this number and nothing else in the process owns it.
    let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
    std_stream.set_nonblocking(true)?;
    Ok(tokio::net::UnixStream::from_std(std_stream)?)
}

/// Connects over vsock.
#[cfg(target_os = "linux")]
async fn connect_vsock(cid: u32, port: u32) -> Result<Client> {
    let stream = tokio_vsock::VsockStream::connect(tokio_vsock::VsockAddr::new(cid, port)).await?;
    Client::handshake(stream).await
}

/// vsock exists only inside Linux guests.
#[cfg(not(target_os = "linux"))]
async fn connect_vsock(_cid: u32, _port: u32) -> Result<Client> {
    Err(Error::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "vsock requires Linux",
    )))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_scheme() {
        assert_eq!(
            "unix:/run/fence.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix("/run/fence.sock".into())
        );
        assert_eq!(
            "vsock:2:1025".parse::<Endpoint>().unwrap(),
            Endpoint::Vsock { cid: 2, port: 1025 }
        );
        assert_eq!("fd:3".parse::<Endpoint>().unwrap(), Endpoint::Fd(3));
    }

    #[test]
    fn rejects_garbage() {
        for s in ["", "unix:", "vsock:2", "tcp:1.2.3.4:5", "fd:x"] {
            assert!(s.parse::<Endpoint>().is_err(), "{s}");
        }
    }

    #[test]
    fn display_roundtrip() {
        let e = Endpoint::Vsock { cid: 2, port: 1025 };
        assert_eq!(e.to_string().parse::<Endpoint>().unwrap(), e);
    }
}
