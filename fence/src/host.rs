//! The host process: configuration, shared resources and entry points.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::dispatch;
use crate::error::{Error, Result};
use crate::invocation::{Env, Invocation, Summary};
use crate::manifest::Manifest;
use crate::store::StateStore;

/// Default bound on one outbound connect.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wait for a stuck peer during teardown.
const DEFAULT_GRACE: Duration = Duration::from_millis(500);

/// Host settings.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Directory guest paths are resolved under.
    fs_root: PathBuf,
    /// Bound on one outbound connect.
    connect_timeout: Duration,
    /// Wait for a stuck peer during teardown.
    grace: Duration,
    /// Persist inter-invocation state here.
    state_file: Option<PathBuf>,
}

impl HostConfig {
    /// Settings with defaults, resolving guest paths under `fs_root`.
    pub fn new(fs_root: impl Into<PathBuf>) -> Self {
        Self {
            fs_root: fs_root.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            grace: DEFAULT_GRACE,
            state_file: None,
        }
    }

    /// Sets the outbound connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the teardown grace period.
    #[must_use]
    pub const fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Persists state to `path` instead of keeping it in memory.
    #[must_use]
    pub fn state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }
}

/// Serves invocations; cheap to clone, clones share state and shutdown.
#[derive(Debug, Clone)]
pub struct Host {
    /// Resources every invocation reads.
    env: Arc<Env>,
    /// Teardown grace period.
    grace: Duration,
    /// Flipped to `true` by [`shutdown`](Self::shutdown).
    shutdown: Arc<watch::Sender<bool>>,
}

impl Host {
    /// Validates the configuration and opens the state store.
    pub fn new(config: HostConfig) -> Result<Self> {
        let fs_root = std::fs::canonicalize(&config.fs_root).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("filesystem root {}: {e}", config.fs_root.display()),
            ))
        })?;
        if !fs_root.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("filesystem root {} is not a directory", fs_root.display()),
            )));
        }
        let store = match &config.state_file {
            Some(path) => StateStore::open(path)?,
            None => StateStore::in_memory(),
        };
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            env: Arc::new(Env {
                fs_root,
                connect_timeout: config.connect_timeout,
                store,
            }),
            grace: config.grace,
            shutdown: Arc::new(shutdown),
        })
    }

    /// Canonical filesystem root.
    pub fn fs_root(&self) -> &Path {
        &self.env.fs_root
    }

    /// Inter-invocation state.
    pub fn store(&self) -> &StateStore {
        &self.env.store
    }

    /// Runs one invocation of `manifest` over `stream` to completion.
    ///
    /// The capability set is built before the hello frame goes out, so an
    /// invalid manifest never reaches a guest.
    pub async fn invoke<S>(&self, manifest: &Manifest, stream: S) -> Result<Summary>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let caps = manifest.capabilities()?;
        let inv = Arc::new(Invocation::new(
            &manifest.name,
            caps,
            manifest.timeout(),
            Arc::clone(&self.env),
        ));
        let summary = dispatch::serve(inv, stream, self.grace, self.shutdown.subscribe()).await;
        if let Err(e) = self.env.store.save() {
            warn!(invocation = %summary.id, "state not persisted: {e}");
        }
        Ok(summary)
    }

    /// Ends every running invocation with [`CloseReason::Shutdown`] and
    /// stops accept loops.
    ///
    /// [`CloseReason::Shutdown`]: crate::CloseReason::Shutdown
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Serves one invocation per connection accepted on a Unix socket at
    /// `path` until [`shutdown`](Self::shutdown).
    #[cfg(unix)]
    pub async fn listen_unix(&self, path: impl AsRef<Path>, manifest: Manifest) -> Result<()> {
        let path = path.as_ref();
        manifest.validate()?;
        let listener = tokio::net::UnixListener::bind(path)?;
        info!(socket = %path.display(), function = %manifest.name, "listening");
        let manifest = Arc::new(manifest);
        let mut stop = self.shutdown.subscribe();
        let mut running = tokio::task::JoinSet::new();

        loop {
            let stream = tokio::select! {
                () = dispatch::stopped(&mut stop) => break,
                accepted = listener.accept() => accepted?.0,
            };
            while running.try_join_next().is_some() {}
            let host = self.clone();
            let manifest = Arc::clone(&manifest);
            running.spawn(async move {
                if let Err(e) = host.invoke(&manifest, stream).await {
                    warn!("invocation failed to start: {e}");
                }
            });
        }

        while running.join_next().await.is_some() {}
        let _ = std::fs::remove_file(path);
        Ok(())
    }
}
