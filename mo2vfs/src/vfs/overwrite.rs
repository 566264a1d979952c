//! Staging directory ownership and promotion into the overwrite directory.
//!
//! Every kernel-driven write lands in `VFS_staging`, a sibling of the
//! overwrite directory, so the base and mod directories are never touched.
//! On flush (live or at unmount) staged files are promoted into overwrite,
//! preserving relative paths.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::tree::WHITEOUT_SUFFIX;

/// Name of the staging directory created next to the overwrite directory.
pub const STAGING_DIR_NAME: &str = "VFS_staging";

/// Owns the staging directory and the write-side of the overwrite layer.
#[derive(Debug)]
pub struct OverwriteManager {
    staging_dir: PathBuf,
    overwrite_dir: PathBuf,
}

impl OverwriteManager {
    /// Create a manager for `overwrite_dir`, staging into its sibling
    /// `VFS_staging` directory.
    pub fn new(overwrite_dir: impl Into<PathBuf>) -> Self {
        let overwrite_dir = overwrite_dir.into();
        let staging_dir = overwrite_dir
            .parent()
            .map(|p| p.join(STAGING_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(STAGING_DIR_NAME));
        OverwriteManager {
            staging_dir,
            overwrite_dir,
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn overwrite_dir(&self) -> &Path {
        &self.overwrite_dir
    }

    /// Create the staging and overwrite directories.
    ///
    /// Leftover staging content from a crashed session is kept; the next
    /// promotion completes it.
    pub fn init(&self) -> io::Result<()> {
        fs::create_dir_all(&self.staging_dir)?;
        fs::create_dir_all(&self.overwrite_dir)?;
        Ok(())
    }

    /// Physical staging location of a mount-relative path.
    pub fn staging_path(&self, rel: &str) -> PathBuf {
        self.staging_dir.join(rel)
    }

    /// Physical overwrite location of a mount-relative path.
    pub fn overwrite_path(&self, rel: &str) -> PathBuf {
        self.overwrite_dir.join(rel)
    }

    /// Whether a staged copy of `rel` already exists.
    pub fn has_staged(&self, rel: &str) -> bool {
        self.staging_path(rel).is_file()
    }

    /// Writable physical path for `rel`, materialising a staging copy on
    /// first write.
    ///
    /// If a staged copy exists it is returned as-is. Otherwise the staging
    /// path is synthesised; when `read_source` is given (the file exists in a
    /// lower layer) its content and permissions are copied in first.
    pub fn resolve_write(&self, rel: &str, read_source: Option<&mut File>) -> io::Result<PathBuf> {
        let staged = self.staging_path(rel);
        if staged.is_file() {
            return Ok(staged);
        }

        if let Some(parent) = staged.parent() {
            fs::create_dir_all(parent)?;
        }

        if let Some(source) = read_source {
            let mut out = File::create(&staged)?;
            io::copy(source, &mut out)?;
            if let Ok(meta) = source.metadata() {
                let _ = out.set_permissions(meta.permissions());
            }
            debug!(rel, "copied lower-layer file into staging");
        }

        Ok(staged)
    }

    /// Writable physical path for a freshly created file: no copy, just an
    /// empty staging file.
    pub fn resolve_new(&self, rel: &str) -> io::Result<PathBuf> {
        let staged = self.staging_path(rel);
        if let Some(parent) = staged.parent() {
            fs::create_dir_all(parent)?;
        }
        File::create(&staged)?;
        Ok(staged)
    }

    /// Create a directory (and parents) in staging.
    pub fn create_dir(&self, rel: &str) -> io::Result<PathBuf> {
        let staged = self.staging_path(rel);
        fs::create_dir_all(&staged)?;
        Ok(staged)
    }

    /// Remove a staged file if present.
    pub fn remove_staged(&self, rel: &str) -> io::Result<bool> {
        let staged = self.staging_path(rel);
        if staged.is_file() {
            fs::remove_file(staged)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Remove an overwrite file if present.
    pub fn remove_overwrite(&self, rel: &str) -> io::Result<bool> {
        let path = self.overwrite_path(rel);
        if path.is_file() {
            fs::remove_file(path)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Rename a staged file within staging, creating destination parents.
    pub fn rename_staged(&self, old_rel: &str, new_rel: &str) -> io::Result<PathBuf> {
        let from = self.staging_path(old_rel);
        let to = self.staging_path(new_rel);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(from, &to)?;
        Ok(to)
    }

    /// Persist a whiteout for `rel`: a zero-byte sentinel in the overwrite
    /// directory that hides the path from lower layers across sessions.
    pub fn write_whiteout(&self, rel: &str) -> io::Result<()> {
        let sentinel = self
            .overwrite_dir
            .join(format!("{}{}", rel, WHITEOUT_SUFFIX));
        if let Some(parent) = sentinel.parent() {
            fs::create_dir_all(parent)?;
        }
        File::create(sentinel)?;
        Ok(())
    }

    /// Drop a persisted whiteout for `rel`, if any.
    pub fn remove_whiteout(&self, rel: &str) -> io::Result<bool> {
        let sentinel = self
            .overwrite_dir
            .join(format!("{}{}", rel, WHITEOUT_SUFFIX));
        if sentinel.is_file() {
            fs::remove_file(sentinel)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Move every staged file into the overwrite directory, then remove the
    /// staging directory.
    ///
    /// Files are renamed when staging and overwrite share a device, falling
    /// back to copy+delete across devices. Promoting an empty or missing
    /// staging directory is a no-op, which makes promotion idempotent.
    pub fn promote(&self) -> io::Result<()> {
        if !self.staging_dir.exists() {
            return Ok(());
        }

        promote_dir(&self.staging_dir, &self.overwrite_dir)?;
        if let Err(e) = fs::remove_dir_all(&self.staging_dir) {
            warn!("failed to remove staging directory: {}", e);
        }
        debug!("staging promoted into {}", self.overwrite_dir.display());
        Ok(())
    }

    /// Recreate an empty staging directory after a live flush.
    pub fn reset(&self) -> io::Result<()> {
        fs::create_dir_all(&self.staging_dir)
    }
}

fn promote_dir(staging: &Path, overwrite: &Path) -> io::Result<()> {
    fs::create_dir_all(overwrite)?;

    for entry in fs::read_dir(staging)?.flatten() {
        let from = entry.path();
        let to = overwrite.join(entry.file_name());
        let Ok(meta) = entry.path().symlink_metadata() else {
            continue;
        };

        if meta.is_dir() {
            promote_dir(&from, &to)?;
        } else if meta.is_file() {
            if fs::rename(&from, &to).is_err() {
                // Cross-device move: copy, then delete the staged original.
                fs::copy(&from, &to)?;
                fs::remove_file(&from)?;
            }
        }
    }
    Ok(())
}
