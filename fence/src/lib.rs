//! Host side of the fence syscall bridge.
//!
//! Sandboxed functions reach the network, persistent files and
//! inter-invocation state only by asking the host over their channel. For
//! each invocation the [`Host`] builds a [`CapabilitySet`] from the
//! function's [`Manifest`], checks every request against it, performs the
//! operations it allows and answers each request exactly once.
//!
//! ```no_run
//! # async fn demo(stream: tokio::net::UnixStream) -> fence::Result<()> {
//! use fence::{Host, HostConfig, Manifest};
//!
//! let host = Host::new(HostConfig::new("/srv/fn-root"))?;
//! let manifest = Manifest::load("thumbnailer.json")?;
//! let summary = host.invoke(&manifest, stream).await?;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```

mod capability;
mod dispatch;
mod error;
mod handles;
mod host;
mod invocation;
mod manifest;
mod ops;
mod store;

pub use capability::{
    Budget, CapabilitySet, Denial, EndpointPattern, Grant, OpClass, Permit, Quota, Scope, Target,
    normalize,
};
pub use error::{Error, Result};
pub use host::{Host, HostConfig};
pub use invocation::{CloseReason, Summary};
pub use manifest::{GrantSpec, Limits, Manifest};
pub use store::StateStore;
