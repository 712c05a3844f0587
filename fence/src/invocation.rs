//! One function execution as seen by the host.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fence_proto::{ErrorCode, InvocationId, Outcome};
use tokio::time::Instant;

use crate::capability::CapabilitySet;
use crate::handles::HandleTable;
use crate::store::StateStore;

/// Host resources shared by every invocation of one [`Host`](crate::Host).
#[derive(Debug)]
pub(crate) struct Env {
    /// Canonical directory guest paths are resolved under.
    pub fs_root: PathBuf,
    /// Upper bound on one outbound connect.
    pub connect_timeout: Duration,
    /// Inter-invocation state.
    pub store: StateStore,
}

/// Live state of one invocation: its grants, deadline and open handles.
///
/// Owned by the host; dropped, with everything it holds, when serving ends.
#[derive(Debug)]
pub struct Invocation {
    /// Unique id, announced to the guest in the hello frame.
    id: InvocationId,
    /// Function name; also the state namespace.
    function: String,
    /// Grants, fixed for the invocation's lifetime.
    caps: CapabilitySet,
    /// When serving started.
    started: Instant,
    /// When the channel is torn down regardless of activity.
    deadline: Instant,
    /// Open files and connections.
    handles: HandleTable,
    /// Shared host resources.
    env: Arc<Env>,
    /// Requests answered successfully.
    served: AtomicU64,
    /// Requests answered with `Denied`.
    denied: AtomicU64,
    /// Requests answered with any other error.
    failed: AtomicU64,
}

impl Invocation {
    /// Starts the clock on a new invocation.
    pub(crate) fn new(function: &str, caps: CapabilitySet, timeout: Duration, env: Arc<Env>) -> Self {
        let started = Instant::now();
        Self {
            id: gen_id(),
            function: function.to_owned(),
            caps,
            started,
            deadline: started + timeout,
            handles: HandleTable::new(),
            env,
            served: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Invocation id.
    pub const fn id(&self) -> InvocationId {
        self.id
    }

    /// Function name.
    pub fn function(&self) -> &str {
        &self.function
    }

    /// Grant set.
    pub const fn caps(&self) -> &CapabilitySet {
        &self.caps
    }

    /// Teardown instant.
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Open handles.
    pub const fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Shared host resources.
    pub(crate) fn env(&self) -> &Env {
        &self.env
    }

    /// Counts an answered request by outcome.
    pub(crate) fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Ok(_) => &self.served,
            Outcome::Err(e) if e.code == ErrorCode::Denied => &self.denied,
            Outcome::Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Final accounting.
    pub(crate) fn summary(&self, reason: CloseReason) -> Summary {
        Summary {
            id: self.id,
            function: self.function.clone(),
            reason,
            served: self.served.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            elapsed: self.started.elapsed(),
        }
    }
}

/// Why serving an invocation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CloseReason {
    /// The guest closed its end.
    Completed,
    /// The deadline passed.
    Deadline,
    /// The guest sent something the protocol does not allow.
    ProtocolViolation,
    /// The host is shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::Deadline => "deadline exceeded",
            Self::ProtocolViolation => "protocol violation",
            Self::Shutdown => "shutdown",
        })
    }
}

/// Outcome of one served invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Summary {
    /// Invocation id.
    pub id: InvocationId,
    /// Function name.
    pub function: String,
    /// Why serving stopped.
    pub reason: CloseReason,
    /// Requests answered successfully.
    pub served: u64,
    /// Requests denied by policy.
    pub denied: u64,
    /// Requests that failed while executing.
    pub failed: u64,
    /// Wall time from start to teardown.
    pub elapsed: Duration,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}: {} served, {} denied, {} failed in {:.3}s",
            self.function,
            self.id,
            self.reason,
            self.served,
            self.denied,
            self.failed,
            self.elapsed.as_secs_f64()
        )
    }
}

/// Generates an invocation id unlikely to repeat across processes and
/// guaranteed not to repeat within one.
fn gen_id() -> InvocationId {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::time::{SystemTime, UNIX_EPOCH};

    static SEQ: AtomicU64 = AtomicU64::new(0);

    let mut h = RandomState::new().build_hasher();
    h.write_u64(u64::from(std::process::id()));
    h.write_u128(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos(),
    );
    h.write_u64(SEQ.fetch_add(1, Ordering::Relaxed));
    InvocationId(h.finish())
}
