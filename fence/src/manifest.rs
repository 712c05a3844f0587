//! Function manifests: the JSON document a capability set is built from.
//!
//! ```json
//! {
//!   "name": "thumbnailer",
//!   "timeout_ms": 5000,
//!   "grants": [
//!     { "op": "read", "prefix": "/data" },
//!     { "op": "write", "prefix": "/out", "max_open": 4 },
//!     { "op": "connect", "endpoint": "api.example.com:443", "max_open": 2 },
//!     { "op": "state_read", "prefix": "thumb/" }
//!   ],
//!   "limits": { "write_bytes": 10485760 }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capability::{Budget, CapabilitySet, EndpointPattern, Grant, OpClass, Scope, normalize};
use crate::error::{Error, Result};

/// Default invocation deadline.
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Longest accepted function name.
const MAX_NAME: usize = 128;

/// Declared needs of one function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
#[non_exhaustive]
pub struct Manifest {
    /// Function name; also the state namespace.
    pub name: String,
    /// Wall-clock budget per invocation in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Grants in priority order.
    #[serde(default)]
    pub grants: Vec<GrantSpec>,
    /// Invocation-wide byte budgets.
    #[serde(default)]
    pub limits: Limits,
}

/// Serde default for [`Manifest::timeout_ms`].
const fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// One grant as written in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
#[non_exhaustive]
pub enum GrantSpec {
    /// Read files under `prefix`.
    Read {
        /// Absolute guest path prefix.
        prefix: String,
        /// Handles open at once through this grant.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_open: Option<u64>,
    },
    /// Create, write and unlink files under `prefix`.
    Write {
        /// Absolute guest path prefix.
        prefix: String,
        /// Handles open at once through this grant.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_open: Option<u64>,
    },
    /// Connect to destinations matching `endpoint`.
    Connect {
        /// `host:port` pattern.
        endpoint: String,
        /// Connections open at once through this grant.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_open: Option<u64>,
    },
    /// Read state keys starting with `prefix`.
    StateRead {
        /// Key prefix; empty covers every key.
        #[serde(default)]
        prefix: String,
    },
    /// Write or delete state keys starting with `prefix`.
    StateWrite {
        /// Key prefix; empty covers every key.
        #[serde(default)]
        prefix: String,
    },
}

impl GrantSpec {
    /// Builds the runtime grant.
    fn build(&self) -> Result<Grant> {
        let path = |prefix: &str| {
            normalize(prefix)
                .map(Scope::PathPrefix)
                .ok_or_else(|| Error::Manifest(format!("prefix {prefix:?} must be absolute and stay under /")))
        };
        let (grant, max_open) = match self {
            Self::Read { prefix, max_open } => (Grant::new(OpClass::Read, path(prefix)?), *max_open),
            Self::Write { prefix, max_open } => (Grant::new(OpClass::Write, path(prefix)?), *max_open),
            Self::Connect { endpoint, max_open } => {
                let pattern: EndpointPattern = endpoint.parse()?;
                (Grant::new(OpClass::Connect, Scope::Endpoint(pattern)), *max_open)
            }
            Self::StateRead { prefix } => {
                (Grant::new(OpClass::StateRead, Scope::KeyPrefix(prefix.clone())), None)
            }
            Self::StateWrite { prefix } => {
                (Grant::new(OpClass::StateWrite, Scope::KeyPrefix(prefix.clone())), None)
            }
        };
        Ok(match max_open {
            Some(n) => grant.with_quota(n),
            None => grant,
        })
    }
}

/// Invocation-wide byte budgets; absent means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
#[non_exhaustive]
pub struct Limits {
    /// Total bytes the guest may write to files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_bytes: Option<u64>,
    /// Total bytes the guest may send on connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_bytes: Option<u64>,
}

impl Manifest {
    /// Reads, parses and validates a manifest file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parses and validates a manifest from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(text)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Checks everything serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > MAX_NAME {
            return Err(Error::Manifest(format!(
                "name must be 1..={MAX_NAME} bytes"
            )));
        }
        if self.name.chars().any(|c| c.is_control() || c == '/') {
            return Err(Error::Manifest(format!("name {:?} has forbidden characters", self.name)));
        }
        if self.timeout_ms == 0 {
            return Err(Error::Manifest("timeout_ms must be positive".into()));
        }
        for spec in &self.grants {
            spec.build()?;
        }
        Ok(())
    }

    /// Invocation deadline relative to start.
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Builds a fresh capability set. Every call yields independent quota
    /// counters, so each invocation gets its own.
    pub fn capabilities(&self) -> Result<CapabilitySet> {
        let grants = self
            .grants
            .iter()
            .map(GrantSpec::build)
            .collect::<Result<Vec<_>>>()?;
        let mut caps = CapabilitySet::new(grants);
        if let Some(n) = self.limits.write_bytes {
            caps = caps.with_budget(Budget::WriteBytes, n);
        }
        if let Some(n) = self.limits.send_bytes {
            caps = caps.with_budget(Budget::SendBytes, n);
        }
        Ok(caps)
    }
}
