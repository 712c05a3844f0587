//! Error types surfaced to guest code.

use std::io;

use fence_proto::{ErrorCode, ErrorInfo};

/// Alias for `Result<T, fence_guest::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a mediated call did not succeed.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The channel is gone: deadline, disconnect, or a fatal protocol error.
    /// Every outstanding and every later call fails with this.
    #[error("channel closed")]
    ChannelClosed,

    /// The host found no grant covering the request, or its quota is spent.
    #[error("capability denied: {0}")]
    Denied(String),

    /// The host performed the operation and it failed.
    #[error("{code}: {message}")]
    Failed {
        /// Normalized failure code.
        code: ErrorCode,
        /// Host-side detail.
        message: String,
    },

    /// A peer violated the wire protocol; the channel has been torn down.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Arguments failed local shape validation; nothing was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Establishing the channel failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// The normalized code, when the host answered with one.
    pub const fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Denied(_) => Some(ErrorCode::Denied),
            Self::Failed { code, .. } => Some(*code),
            Self::Protocol(_) => Some(ErrorCode::Protocol),
            _ => None,
        }
    }

    /// Whether the channel is closed, so retrying is pointless.
    pub const fn is_channel_closed(&self) -> bool {
        matches!(self, Self::ChannelClosed | Self::Protocol(_))
    }

    /// The [`io::ErrorKind`] a local operation would have produced.
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            Self::ChannelClosed => io::ErrorKind::BrokenPipe,
            Self::Denied(_) => io::ErrorKind::PermissionDenied,
            Self::Failed { code, .. } => code.io_kind(),
            Self::Protocol(_) => io::ErrorKind::InvalidData,
            Self::InvalidArgument(_) => io::ErrorKind::InvalidInput,
            Self::Io(e) => e.kind(),
        }
    }
}

impl From<ErrorInfo> for Error {
    fn from(info: ErrorInfo) -> Self {
        match info.code {
            ErrorCode::Protocol => Self::Protocol(info.message),
            ErrorCode::Denied => Self::Denied(info.message),
            code => Self::Failed {
                code,
                message: info.message,
            },
        }
    }
}

/// Calling code sees the failure shape of a local operation; the bridge
/// error stays reachable through [`io::Error::get_ref`].
impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(inner) => inner,
            other => Self::new(other.kind(), other),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn denial_maps_to_permission_denied() {
        let e = Error::from(ErrorInfo::denied("no grant for /etc/passwd"));
        assert!(matches!(e, Error::Denied(_)));
        let io_err = io::Error::from(e);
        assert_eq!(io_err.kind(), io::ErrorKind::PermissionDenied);
        let inner = io_err.get_ref().unwrap().downcast_ref::<Error>().unwrap();
        assert_eq!(inner.code(), Some(ErrorCode::Denied));
    }

    #[test]
    fn host_failure_keeps_its_code() {
        let e = Error::from(ErrorInfo::new(ErrorCode::NotFound, "no such file"));
        assert_eq!(e.code(), Some(ErrorCode::NotFound));
        assert_eq!(io::Error::from(e).kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn closed_channel_is_terminal() {
        assert!(Error::ChannelClosed.is_channel_closed());
        assert!(!Error::Denied(String::new()).is_channel_closed());
        assert_eq!(
            io::Error::from(Error::ChannelClosed).kind(),
            io::ErrorKind::BrokenPipe
        );
    }
}
