//! Per-invocation capability grants and quota accounting.
//!
//! A [`CapabilitySet`] is built once from the manifest before the guest
//! starts and is read-only afterwards; only the quota counters inside it
//! change. Lookup is by operation class first, then scope, and the first
//! matching grant decides. No match means denial.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Error;

/// Operation classes a grant can cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum OpClass {
    /// Open for reading, stat.
    Read,
    /// Open for writing or creating, unlink.
    Write,
    /// Outbound TCP connect.
    Connect,
    /// Read inter-invocation state.
    StateRead,
    /// Write or delete inter-invocation state.
    StateWrite,
}

impl fmt::Display for OpClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Connect => "connect",
            Self::StateRead => "state read",
            Self::StateWrite => "state write",
        })
    }
}

/// What a request touches, as seen by scope predicates.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub enum Target<'a> {
    /// A normalized absolute guest path.
    Path(&'a Path),
    /// A network destination.
    Endpoint {
        /// Host name or address as the guest wrote it.
        host: &'a str,
        /// Destination port.
        port: u16,
    },
    /// A state key.
    Key(&'a str),
}

impl fmt::Display for Target<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(p) => write!(f, "{}", p.display()),
            Self::Endpoint { host, port } => write!(f, "{host}:{port}"),
            Self::Key(k) => write!(f, "key {k:?}"),
        }
    }
}

/// Scope predicate of one grant.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Scope {
    /// Paths under this normalized prefix, compared by component.
    PathPrefix(PathBuf),
    /// Destinations matching this pattern.
    Endpoint(EndpointPattern),
    /// Keys starting with this string.
    KeyPrefix(String),
}

impl Scope {
    /// Whether `target` falls inside this scope.
    pub fn matches(&self, target: Target<'_>) -> bool {
        match (self, target) {
            (Self::PathPrefix(prefix), Target::Path(p)) => p.starts_with(prefix),
            (Self::Endpoint(pat), Target::Endpoint { host, port }) => pat.matches(host, port),
            (Self::KeyPrefix(prefix), Target::Key(k)) => k.starts_with(prefix.as_str()),
            _ => false,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PathPrefix(p) => write!(f, "{}", p.display()),
            Self::Endpoint(pat) => write!(f, "{pat}"),
            Self::KeyPrefix(k) => write!(f, "{k}*"),
        }
    }
}

/// Lexically normalizes an absolute guest path.
///
/// `.` components are dropped and `..` pops one component. Returns `None`
/// for relative paths and for paths that climb above `/`.
pub fn normalize(path: &str) -> Option<PathBuf> {
    let mut out = PathBuf::from("/");
    let mut components = Path::new(path).components();
    if components.next() != Some(Component::RootDir) {
        return None;
    }
    for c in components {
        match c {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// `host:port` destination pattern.
///
/// The host part is `*`, `*.suffix`, or an exact name or address, compared
/// case-insensitively; IPv6 literals are written in brackets. The port part
/// is a number or `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPattern {
    /// Host predicate.
    host: HostPattern,
    /// `None` matches any port.
    port: Option<u16>,
}

/// Host half of an [`EndpointPattern`].
#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    /// Any host.
    Any,
    /// Exactly this lowercase name.
    Exact(String),
    /// Any name ending in this lowercase suffix, which starts with a dot.
    Suffix(String),
}

impl EndpointPattern {
    /// Whether `host:port` matches.
    pub fn matches(&self, host: &str, port: u16) -> bool {
        if self.port.is_some_and(|p| p != port) {
            return false;
        }
        let host = host.trim_start_matches('[').trim_end_matches(']');
        match &self.host {
            HostPattern::Any => true,
            HostPattern::Exact(h) => host.eq_ignore_ascii_case(h),
            HostPattern::Suffix(s) => {
                host.len() > s.len() && host.to_ascii_lowercase().ends_with(s.as_str())
            }
        }
    }
}

impl FromStr for EndpointPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let bad = |why: &str| Error::Manifest(format!("endpoint {s:?}: {why}"));
        let (host, port) = s.rsplit_once(':').ok_or_else(|| bad("expected host:port"))?;
        let port = match port {
            "*" => None,
            p => Some(
                p.parse::<u16>()
                    .ok()
                    .filter(|&n| n != 0)
                    .ok_or_else(|| bad("bad port"))?,
            ),
        };
        let host = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();
        let host = match host.as_str() {
            "" => return Err(bad("empty host")),
            "*" => HostPattern::Any,
            h if h.starts_with("*.") && h.len() > 2 => HostPattern::Suffix(h[1..].to_owned()),
            h if h.contains('*') => return Err(bad("wildcard must be a leading `*.`")),
            h => HostPattern::Exact(h.to_owned()),
        };
        Ok(Self { host, port })
    }
}

impl fmt::Display for EndpointPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            HostPattern::Any => f.write_str("*")?,
            HostPattern::Exact(h) if h.contains(':') => write!(f, "[{h}]")?,
            HostPattern::Exact(h) => f.write_str(h)?,
            HostPattern::Suffix(s) => write!(f, "*{s}")?,
        }
        match self.port {
            Some(p) => write!(f, ":{p}"),
            None => f.write_str(":*"),
        }
    }
}

/// Bounded counter with atomic check-and-take.
#[derive(Debug)]
pub struct Quota {
    /// Total units.
    capacity: u64,
    /// Units currently taken.
    used: AtomicU64,
}

impl Quota {
    /// A fresh quota of `capacity` units.
    pub const fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used: AtomicU64::new(0),
        }
    }

    /// Total units.
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Units not currently taken.
    pub fn remaining(&self) -> u64 {
        self.capacity
            .saturating_sub(self.used.load(Ordering::Acquire))
    }

    /// Takes `n` units if available, as one atomic step.
    fn try_take(&self, n: u64) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(n).filter(|&total| total <= self.capacity)
            })
            .is_ok()
    }

    /// Returns `n` units.
    fn give_back(&self, n: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(n))
            });
    }
}

/// Reserved quota units.
///
/// Dropping a permit refunds its units, so a request that is denied further
/// along or whose operation fails consumes nothing. Handle permits live as
/// long as the handle; byte permits are [`settle`](Self::settle)d once the
/// transfer size is known.
#[derive(Debug)]
#[must_use = "dropping a permit refunds it"]
pub struct Permit {
    /// Quota to refund on drop; `None` when nothing is owed.
    quota: Option<Arc<Quota>>,
    /// Reserved units.
    amount: u64,
}

impl Permit {
    /// A permit that reserves nothing.
    pub const fn free() -> Self {
        Self {
            quota: None,
            amount: 0,
        }
    }

    /// Units reserved.
    pub const fn amount(&self) -> u64 {
        self.amount
    }

    /// Keeps `used` units for good and refunds the rest.
    pub fn settle(mut self, used: u64) {
        if let Some(q) = self.quota.take() {
            q.give_back(self.amount.saturating_sub(used));
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(q) = self.quota.take() {
            q.give_back(self.amount);
        }
    }
}

/// One permitted operation class, its scope and an optional quota.
#[derive(Debug)]
pub struct Grant {
    /// Operation class covered.
    class: OpClass,
    /// Scope predicate.
    scope: Scope,
    /// For `Read`, `Write` and `Connect`: handles open through this grant.
    quota: Option<Arc<Quota>>,
}

impl Grant {
    /// A grant without quota.
    pub const fn new(class: OpClass, scope: Scope) -> Self {
        Self {
            class,
            scope,
            quota: None,
        }
    }

    /// Caps how many handles may be open through this grant at once.
    pub fn with_quota(mut self, capacity: u64) -> Self {
        self.quota = Some(Arc::new(Quota::new(capacity)));
        self
    }

    /// Operation class covered.
    pub const fn class(&self) -> OpClass {
        self.class
    }

    /// Scope predicate.
    pub const fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Quota, if any.
    pub fn quota(&self) -> Option<&Quota> {
        self.quota.as_deref()
    }
}

/// Invocation-wide byte budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Budget {
    /// Bytes written to files.
    WriteBytes,
    /// Bytes sent on connections.
    SendBytes,
}

/// Why a request was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Denial {
    /// No grant of the class covers the target.
    NoGrant {
        /// Requested class.
        class: OpClass,
        /// Rendered target.
        target: String,
    },
    /// The first matching grant's quota is spent.
    QuotaExhausted {
        /// Requested class.
        class: OpClass,
        /// Rendered target.
        target: String,
    },
    /// A byte budget is spent.
    BudgetExhausted(Budget),
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoGrant { class, target } => write!(f, "no {class} grant covers {target}"),
            Self::QuotaExhausted { class, target } => {
                write!(f, "{class} quota exhausted for {target}")
            }
            Self::BudgetExhausted(Budget::WriteBytes) => f.write_str("write byte budget exhausted"),
            Self::BudgetExhausted(Budget::SendBytes) => f.write_str("send byte budget exhausted"),
        }
    }
}

/// All grants and budgets of one invocation.
///
/// Not `Clone`: a set belongs to exactly one invocation.
#[derive(Debug, Default)]
pub struct CapabilitySet {
    /// Grants in declaration order.
    grants: Vec<Grant>,
    /// `None` means unlimited.
    write_bytes: Option<Arc<Quota>>,
    /// `None` means unlimited.
    send_bytes: Option<Arc<Quota>>,
}

impl CapabilitySet {
    /// A set with the given grants and no budgets.
    pub const fn new(grants: Vec<Grant>) -> Self {
        Self {
            grants,
            write_bytes: None,
            send_bytes: None,
        }
    }

    /// Caps an invocation-wide byte budget.
    pub fn with_budget(mut self, budget: Budget, bytes: u64) -> Self {
        let q = Some(Arc::new(Quota::new(bytes)));
        match budget {
            Budget::WriteBytes => self.write_bytes = q,
            Budget::SendBytes => self.send_bytes = q,
        }
        self
    }

    /// Grants in declaration order.
    pub fn grants(&self) -> &[Grant] {
        &self.grants
    }

    /// A byte budget, if capped.
    pub fn budget(&self, budget: Budget) -> Option<&Quota> {
        match budget {
            Budget::WriteBytes => self.write_bytes.as_deref(),
            Budget::SendBytes => self.send_bytes.as_deref(),
        }
    }

    /// Decides whether `class` on `target` is allowed.
    ///
    /// With `consume`, one unit of the deciding grant's quota is reserved in
    /// the returned permit. Without it the quota is not consulted.
    pub fn authorize(&self, class: OpClass, target: Target<'_>, consume: bool) -> Result<Permit, Denial> {
        let Some(grant) = self
            .grants
            .iter()
            .filter(|g| g.class == class)
            .find(|g| g.scope.matches(target))
        else {
            return Err(Denial::NoGrant {
                class,
                target: target.to_string(),
            });
        };

        match (&grant.quota, consume) {
            (Some(q), true) => {
                if q.try_take(1) {
                    Ok(Permit {
                        quota: Some(Arc::clone(q)),
                        amount: 1,
                    })
                } else {
                    Err(Denial::QuotaExhausted {
                        class,
                        target: target.to_string(),
                    })
                }
            }
            _ => Ok(Permit::free()),
        }
    }

    /// Reserves `bytes` from a budget.
    pub fn charge(&self, budget: Budget, bytes: u64) -> Result<Permit, Denial> {
        let quota = match budget {
            Budget::WriteBytes => &self.write_bytes,
            Budget::SendBytes => &self.send_bytes,
        };
        match quota {
            None => Ok(Permit::free()),
            Some(q) if q.try_take(bytes) => Ok(Permit {
                quota: Some(Arc::clone(q)),
                amount: bytes,
            }),
            Some(_) => Err(Denial::BudgetExhausted(budget)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Barrier;

    use super::*;

    fn path_grant(class: OpClass, prefix: &str) -> Grant {
        Grant::new(class, Scope::PathPrefix(normalize(prefix).unwrap()))
    }

    #[test]
    fn normalizes_dots_and_rejects_escape() {
        assert_eq!(normalize("/data/./a/../b").unwrap(), PathBuf::from("/data/b"));
        assert_eq!(normalize("/data/").unwrap(), PathBuf::from("/data"));
        assert!(normalize("/../etc/passwd").is_none());
        assert!(normalize("data/file").is_none());
    }

    #[test]
    fn prefix_matches_by_component() {
        let caps = CapabilitySet::new(vec![path_grant(OpClass::Read, "/data/")]);
        let ok = normalize("/data/file.txt").unwrap();
        let sneaky = normalize("/database/file.txt").unwrap();
        let climb = normalize("/data/../etc/passwd").unwrap();
        assert!(caps.authorize(OpClass::Read, Target::Path(&ok), false).is_ok());
        assert!(caps.authorize(OpClass::Read, Target::Path(&sneaky), false).is_err());
        assert!(caps.authorize(OpClass::Read, Target::Path(&climb), false).is_err());
    }

    #[test]
    fn class_is_checked_before_scope() {
        let caps = CapabilitySet::new(vec![path_grant(OpClass::Read, "/data")]);
        let p = normalize("/data/x").unwrap();
        let err = caps.authorize(OpClass::Write, Target::Path(&p), true).unwrap_err();
        assert!(matches!(err, Denial::NoGrant { class: OpClass::Write, .. }));
    }

    #[test]
    fn endpoint_patterns() {
        let exact: EndpointPattern = "api.example.com:443".parse().unwrap();
        assert!(exact.matches("API.example.com", 443));
        assert!(!exact.matches("api.example.com", 80));
        assert!(!exact.matches("evil.example.com", 443));

        let wild: EndpointPattern = "*.example.com:*".parse().unwrap();
        assert!(wild.matches("a.b.example.com", 8080));
        assert!(!wild.matches("example.com", 443));
        assert!(!wild.matches("example.com.evil.net", 443));

        let v6: EndpointPattern = "[::1]:8080".parse().unwrap();
        assert!(v6.matches("::1", 8080));
        assert_eq!(v6.to_string(), "[::1]:8080");

        for bad in ["nohost", ":443", "a.com:0", "a.com:http", "a*.com:1"] {
            assert!(bad.parse::<EndpointPattern>().is_err(), "{bad}");
        }
    }

    #[test]
    fn first_matching_grant_decides_even_when_exhausted() {
        let caps = CapabilitySet::new(vec![
            path_grant(OpClass::Read, "/data").with_quota(1),
            path_grant(OpClass::Read, "/").with_quota(10),
        ]);
        let p = normalize("/data/a").unwrap();
        let held = caps.authorize(OpClass::Read, Target::Path(&p), true).unwrap();
        let err = caps.authorize(OpClass::Read, Target::Path(&p), true).unwrap_err();
        assert!(matches!(err, Denial::QuotaExhausted { .. }));
        drop(held);
        assert!(caps.authorize(OpClass::Read, Target::Path(&p), true).is_ok());
    }

    #[test]
    fn non_consuming_checks_ignore_quota() {
        let caps = CapabilitySet::new(vec![path_grant(OpClass::Read, "/data").with_quota(1)]);
        let p = normalize("/data/a").unwrap();
        let _held = caps.authorize(OpClass::Read, Target::Path(&p), true).unwrap();
        assert!(caps.authorize(OpClass::Read, Target::Path(&p), false).is_ok());
    }

    #[test]
    fn concurrent_takers_never_overdraw() {
        let caps = Arc::new(CapabilitySet::new(vec![
            path_grant(OpClass::Read, "/data").with_quota(2),
        ]));
        let barrier = Arc::new(Barrier::new(8));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let caps = Arc::clone(&caps);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let p = normalize("/data/f").unwrap();
                    barrier.wait();
                    caps.authorize(OpClass::Read, Target::Path(&p), true)
                })
            })
            .collect();
        // All eight must exist before any join, or the barrier never fills.
        let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        // Permits are still held here, so exactly two can exist.
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
    }

    #[test]
    fn budgets_settle_partially() {
        let caps = CapabilitySet::new(Vec::new()).with_budget(Budget::WriteBytes, 10);
        let permit = caps.charge(Budget::WriteBytes, 8).unwrap();
        assert!(caps.charge(Budget::WriteBytes, 3).is_err());
        permit.settle(5);
        assert_eq!(caps.budget(Budget::WriteBytes).unwrap().remaining(), 5);
        drop(caps.charge(Budget::WriteBytes, 5).unwrap());
        assert_eq!(caps.budget(Budget::WriteBytes).unwrap().remaining(), 5);
        assert!(caps.charge(Budget::SendBytes, u64::MAX).is_ok());
    }
}
