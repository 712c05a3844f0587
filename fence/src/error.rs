//! Error types for fence host operations.

/// Alias for `Result<T, fence::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by host-side setup. Per-request failures never surface
/// here; they travel back to the guest as responses.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The manifest parsed but declares something unusable.
    #[error("invalid manifest: {0}")]
    Manifest(String),

    /// JSON parsing error (manifest or state file).
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// An I/O error from setup, listening or state persistence.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
