//! Error types for the VFS data plane and the mount lifecycle.
//!
//! The data plane never tears the mount down: [`VfsError`] converts to an
//! errno that is handed back to the kernel for the failing request only.
//! Lifecycle failures are reported to the caller as [`MountError`] and always
//! release every resource acquired so far.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Per-request errors at the VFS boundary.
#[derive(Debug, Error)]
pub enum VfsError {
    /// Path does not exist in the composite tree
    #[error("not found: {0}")]
    NotFound(String),

    /// Staging could not be materialised for a write
    #[error("not writable: {0}")]
    NotWritable(String),

    /// Direct syscall failure on the physical backing
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Create or mkdir on an existing name
    #[error("already exists: {0}")]
    Conflict(String),

    /// Inode unknown or tree corrupted; fatal for the operation, not the mount
    #[error("internal error: {0}")]
    Internal(String),
}

impl VfsError {
    /// The errno surfaced to the kernel for this error.
    pub fn errno(&self) -> i32 {
        match self {
            VfsError::NotFound(_) => libc::ENOENT,
            VfsError::NotWritable(_) => libc::EROFS,
            VfsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            VfsError::Conflict(_) => libc::EEXIST,
            VfsError::Internal(_) => libc::EIO,
        }
    }
}

/// Result alias for data-plane operations.
pub type VfsResult<T> = Result<T, VfsError>;

/// Lifecycle errors for mounting, unmounting and the helper channel.
#[derive(Debug, Error)]
pub enum MountError {
    /// The game data directory is missing
    #[error("game data directory does not exist: {0}")]
    DataDirMissing(PathBuf),

    /// A previous mount is still installed and could not be cleared
    #[error("stale mount at {0} could not be cleaned up")]
    StaleMount(PathBuf),

    /// The FUSE session could not be created or mounted
    #[error("failed to mount FUSE at {mountpoint}: {source}")]
    MountFailed {
        mountpoint: PathBuf,
        source: io::Error,
    },

    /// Pre-mount backing handle could not be opened
    #[error("failed to open backing handle for {0}")]
    BackingHandle(PathBuf),

    /// The sandbox helper process could not be started
    #[error("failed to start VFS helper: {0}")]
    HelperStartFailed(String),

    /// The helper violated the line protocol or reported an error
    #[error("VFS helper protocol error: {0}")]
    HelperProtocolError(String),

    /// The helper did not answer within the per-command deadline
    #[error("VFS helper timed out waiting for '{command}'")]
    HelperTimeout { command: String },

    /// Symlink deployment failure for out-of-mount mappings
    #[error("deployment failed: {0}")]
    Deploy(#[from] crate::deploy::DeployError),

    /// Filesystem error during setup or teardown
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias for lifecycle operations.
pub type MountResult<T> = Result<T, MountError>;
