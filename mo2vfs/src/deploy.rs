//! Deployment of mappings the kernel overlay cannot serve.
//!
//! Mappings whose destination lies outside the mount point are installed as
//! real symlinks on disk: the source tree is walked, directories are
//! replicated at the destination and each file becomes a symlink back to its
//! source. A pre-existing file that is not a symlink is never overwritten;
//! real game files win. Every created link and directory is tracked so
//! unmount can undo the deployment.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::mapping::Mapping;

/// Errors from symlink deployment.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Mapping source disappeared between classification and deployment
    #[error("mapping source does not exist: {0}")]
    SourceMissing(PathBuf),

    /// Filesystem failure while creating links or directories
    #[error("failed to deploy {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Installs and removes out-of-mount symlink mappings.
#[derive(Debug, Default)]
pub struct ExternalDeployer {
    created_symlinks: Vec<PathBuf>,
    created_dirs: Vec<PathBuf>,
}

impl ExternalDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of symlinks currently tracked.
    pub fn deployed_count(&self) -> usize {
        self.created_symlinks.len()
    }

    /// Deploy every external mapping as physical symlinks.
    pub fn deploy(&mut self, mappings: &[Mapping]) -> Result<(), DeployError> {
        for mapping in mappings {
            if !mapping.source.exists() {
                return Err(DeployError::SourceMissing(mapping.source.clone()));
            }

            if mapping.is_directory {
                self.deploy_dir(&mapping.source, &mapping.destination)?;
            } else {
                self.ensure_dir(mapping.destination.parent().unwrap_or(Path::new("/")))?;
                self.place_symlink(&mapping.source, &mapping.destination)?;
            }
        }
        debug!(
            symlinks = self.created_symlinks.len(),
            "external mappings deployed"
        );
        Ok(())
    }

    fn deploy_dir(&mut self, source: &Path, dest: &Path) -> Result<(), DeployError> {
        self.ensure_dir(dest)?;

        let reader = fs::read_dir(source).map_err(|e| DeployError::Io {
            path: source.to_path_buf(),
            source: e,
        })?;

        for entry in reader.flatten() {
            let from = entry.path();
            let to = dest.join(entry.file_name());
            let Ok(meta) = from.symlink_metadata() else {
                continue;
            };

            if meta.is_dir() {
                self.deploy_dir(&from, &to)?;
            } else {
                self.place_symlink(&from, &to)?;
            }
        }
        Ok(())
    }

    fn ensure_dir(&mut self, dir: &Path) -> Result<(), DeployError> {
        if dir.is_dir() {
            return Ok(());
        }
        fs::create_dir_all(dir).map_err(|e| DeployError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;
        self.created_dirs.push(dir.to_path_buf());
        Ok(())
    }

    fn place_symlink(&mut self, source: &Path, dest: &Path) -> Result<(), DeployError> {
        match dest.symlink_metadata() {
            Ok(meta) if meta.file_type().is_symlink() => {
                // Stale link from a previous session; replace it.
                fs::remove_file(dest).map_err(|e| DeployError::Io {
                    path: dest.to_path_buf(),
                    source: e,
                })?;
            }
            Ok(_) => {
                // A real file or directory owns this name.
                warn!(
                    "not overwriting existing file at '{}', mapping skipped",
                    dest.display()
                );
                return Ok(());
            }
            Err(_) => {}
        }

        symlink(source, dest).map_err(|e| DeployError::Io {
            path: dest.to_path_buf(),
            source: e,
        })?;
        self.created_symlinks.push(dest.to_path_buf());
        Ok(())
    }

    /// Remove every symlink installed by this deployer, then prune the
    /// directories it created where they ended up empty.
    pub fn remove_deployed(&mut self) {
        for link in self.created_symlinks.drain(..) {
            match link.symlink_metadata() {
                Ok(meta) if meta.file_type().is_symlink() => {
                    if let Err(e) = fs::remove_file(&link) {
                        warn!("failed to remove symlink '{}': {}", link.display(), e);
                    }
                }
                // Replaced by something real since deployment; leave it.
                Ok(_) => {}
                Err(_) => {}
            }
        }

        // Deepest first, and only if nothing else moved in.
        for dir in self.created_dirs.drain(..).rev() {
            let _ = fs::remove_dir(&dir);
        }
    }
}
