//! Per-invocation table of open files and connections.
//!
//! Handles are opaque numbers local to one invocation and never reused
//! within it. Each entry keeps the quota permit that admitted it, so the
//! grant's slot is released exactly when the entry goes away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use fence_proto::Handle;
use tokio::fs::File;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::capability::Permit;

/// A host resource behind a guest handle.
#[derive(Debug)]
#[non_exhaustive]
pub enum Resource {
    /// An open file.
    File {
        /// The file; reads and writes on one handle are serialized.
        file: tokio::sync::Mutex<File>,
        /// Opened with a writing mode.
        writable: bool,
    },
    /// A connected TCP stream, split so send and recv do not wait on each
    /// other.
    Conn {
        /// Receiving half.
        rx: tokio::sync::Mutex<OwnedReadHalf>,
        /// Sending half.
        tx: tokio::sync::Mutex<OwnedWriteHalf>,
    },
}

impl Resource {
    /// Wraps a file.
    pub fn file(file: File, writable: bool) -> Self {
        Self::File {
            file: tokio::sync::Mutex::new(file),
            writable,
        }
    }

    /// Wraps a connected stream.
    pub fn conn(stream: tokio::net::TcpStream) -> Self {
        let (rx, tx) = stream.into_split();
        Self::Conn {
            rx: tokio::sync::Mutex::new(rx),
            tx: tokio::sync::Mutex::new(tx),
        }
    }
}

/// A table entry.
#[derive(Debug)]
pub struct Entry {
    /// The resource.
    pub resource: Resource,
    /// Released when the last reference to the entry drops.
    _permit: Permit,
}

/// Open handles of one invocation.
#[derive(Debug, Default)]
pub struct HandleTable {
    /// Live entries.
    entries: Mutex<HashMap<Handle, Arc<Entry>>>,
    /// Last issued handle number.
    next: AtomicU64,
}

impl HandleTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource and returns its fresh handle.
    pub fn insert(&self, resource: Resource, permit: Permit) -> Handle {
        let handle = Handle(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        let entry = Arc::new(Entry {
            resource,
            _permit: permit,
        });
        self.lock().insert(handle, entry);
        handle
    }

    /// Looks up a live handle.
    ///
    /// The returned reference keeps the resource usable even if the handle
    /// is closed concurrently; the permit is released after both are gone.
    pub fn get(&self, handle: Handle) -> Option<Arc<Entry>> {
        self.lock().get(&handle).cloned()
    }

    /// Removes a handle; `false` if it was not open.
    pub fn remove(&self, handle: Handle) -> bool {
        self.lock().remove(&handle).is_some()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        drop(drained);
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no handle is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Locks the map; a panicked holder cannot leave it inconsistent.
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Handle, Arc<Entry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
