//! Error types for the melt-rs library.
//!
//! All fallible operations return [`Result<T>`], an alias for
//! `Result<T, MeltError>`. Errors are grouped by effect rather than by
//! origin: an input that cannot be trusted is reported as corrupt
//! (`CorruptManifest`, `CorruptConfig`, `MalformedArchive`), while
//! environmental failures surface as `Io`.
//!
//! # Conversion Traits
//!
//! `From` conversions cover the error types that flow through `?`:
//! - `std::io::Error` → `MeltError::Io`
//! - `serde_json::Error` → `MeltError::JsonParse`
//! - `walkdir::Error` → `MeltError::Walk`

/// Result type alias for operations that may return a [`MeltError`].
pub type Result<T> = std::result::Result<T, MeltError>;

/// Error types for melt operations.
#[derive(Debug, thiserror::Error)]
pub enum MeltError {
    /// The outer archive or a layer archive is not usable as input.
    #[error("malformed archive: {0}")]
    MalformedArchive(String),

    /// `manifest.json` is missing required structure or its retained bytes
    /// cannot be patched.
    #[error("corrupt manifest: {0}")]
    CorruptManifest(String),

    /// An image configuration blob is missing required structure or its
    /// retained bytes cannot be patched.
    #[error("corrupt image configuration: {0}")]
    CorruptConfig(String),

    /// A worker failed in a way that carries no underlying error value.
    #[error("worker failure: {0}")]
    Worker(String),

    /// I/O error during extraction, melting, or repacking.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error in the manifest or an image configuration.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Directory traversal failed while packing a tree.
    #[error("directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
}
