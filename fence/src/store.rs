//! Inter-invocation key/value state with optional JSON persistence.
//!
//! Keys live in namespaces, one per function name, so two functions never
//! see each other's keys whatever their grants say.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};
use std::{fs, io};

/// Namespace → key → value.
type Tables = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// Host-owned state shared by every invocation served by one host.
#[derive(Debug, Default)]
pub struct StateStore {
    /// Current contents.
    tables: RwLock<Tables>,
    /// Where [`save`](Self::save) writes; `None` keeps state in memory.
    path: Option<PathBuf>,
    /// Serializes saves: they share one temp file, and the last rename
    /// must carry the newest snapshot.
    saving: Mutex<()>,
}

impl StateStore {
    /// An empty in-memory store.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens a store persisted at `path`, starting empty if the file does
    /// not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let tables = match fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Tables::new(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            tables: RwLock::new(tables),
            path: Some(path),
            saving: Mutex::new(()),
        })
    }

    /// Backing file, if persistent.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Value of `key` in `ns`.
    pub fn get(&self, ns: &str, key: &str) -> Option<Vec<u8>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.get(ns)?.get(key).cloned()
    }

    /// Sets `key` in `ns`, or deletes it when `value` is `None`.
    pub fn put(&self, ns: &str, key: &str, value: Option<Vec<u8>>) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        match value {
            Some(v) => {
                tables
                    .entry(ns.to_owned())
                    .or_default()
                    .insert(key.to_owned(), v);
            }
            None => {
                if let Some(table) = tables.get_mut(ns) {
                    table.remove(key);
                    if table.is_empty() {
                        tables.remove(ns);
                    }
                }
            }
        }
    }

    /// Writes the store to its file through a rename, so readers never see
    /// a half-written file. A no-op for in-memory stores.
    pub fn save(&self) -> io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _saving = self.saving.lock().unwrap_or_else(PoisonError::into_inner);
        let data = {
            let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
            serde_json::to_vec_pretty(&*tables).map_err(io::Error::other)?
        };
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)
    }
}
