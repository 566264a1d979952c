//! The boundary the organiser talks to.
//!
//! The GUI hands over a [`MappingSet`] and otherwise only ever needs three
//! operations, captured by [`VfsConnector`]: apply mappings (mount or
//! rebuild), flush live, unmount. [`FuseConnector`] implements the boundary,
//! hosting the mount in-process or delegating to the sandbox helper when the
//! manager itself cannot mount filesystems.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::deploy::ExternalDeployer;
use crate::helper::channel::HelperChannel;
use crate::helper::config::HelperConfig;
use crate::mapping::{classify_mappings, ExtraFile, MappingSet, ModLayer};
use crate::vfs::{
    build_tree, cached_catalog, mount::cleanup_stale_mount, FsContext, MountError, MountResult,
    MountSession, OverlayFs, OverwriteManager,
};

/// The three-method boundary between the organiser and the VFS.
pub trait VfsConnector {
    /// Install a new mapping set: mount if idle, rebuild live otherwise.
    fn apply_mappings(&mut self, mappings: &MappingSet) -> MountResult<()>;

    /// Promote staged writes into overwrite while mounted and refresh the
    /// tree to match.
    fn flush_live(&mut self) -> MountResult<()>;

    /// Tear the mount down, run the final flush and undo deployed symlinks.
    fn unmount(&mut self) -> MountResult<()>;
}

/// How to reach the helper executable when running sandboxed.
#[derive(Debug, Clone)]
pub struct HelperLaunch {
    /// Path to the `mo2-vfs-helper` binary on the host.
    pub helper_bin: PathBuf,
    /// Where the session config file is written.
    pub config_path: PathBuf,
}

enum Backend {
    /// Mount hosted in this process.
    Direct {
        session: MountSession,
        ctx: Arc<FsContext>,
    },
    /// Mount hosted by the helper subprocess.
    Helper(HelperChannel),
}

/// Owns one mount over the game's data directory.
pub struct FuseConnector {
    game_dir: PathBuf,
    data_dir_name: String,
    mount_point: PathBuf,
    overwrite_dir: PathBuf,
    helper: Option<HelperLaunch>,
    backend: Option<Backend>,
    deployer: ExternalDeployer,
    last_mods: Vec<ModLayer>,
    last_extras: Vec<ExtraFile>,
}

impl FuseConnector {
    /// Connector for `game_dir/<data_dir_name>`; the mount point equals the
    /// data directory, so base reads go through a pre-mount handle.
    pub fn new(
        game_dir: impl Into<PathBuf>,
        data_dir_name: impl Into<String>,
        overwrite_dir: impl Into<PathBuf>,
    ) -> Self {
        let game_dir = game_dir.into();
        let data_dir_name = data_dir_name.into();
        let mount_point = game_dir.join(&data_dir_name);
        FuseConnector {
            game_dir,
            data_dir_name,
            mount_point,
            overwrite_dir: overwrite_dir.into(),
            helper: None,
            backend: None,
            deployer: ExternalDeployer::new(),
            last_mods: Vec::new(),
            last_extras: Vec::new(),
        }
    }

    /// Host the mount in a helper subprocess instead of this process.
    pub fn with_helper(mut self, launch: HelperLaunch) -> Self {
        self.helper = Some(launch);
        self
    }

    pub fn is_mounted(&self) -> bool {
        self.backend.is_some()
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Mount with an explicit mod list and extra files, bypassing mapping
    /// classification. Used by the helper, which receives both via its
    /// config file.
    pub fn mount_with(
        &mut self,
        mods: Vec<ModLayer>,
        extra_files: Vec<ExtraFile>,
    ) -> MountResult<()> {
        if self.backend.is_some() {
            return self.rebuild(mods, extra_files);
        }

        if !self.mount_point.is_dir() {
            return Err(MountError::DataDirMissing(self.mount_point.clone()));
        }

        cleanup_stale_mount(&self.mount_point)?;

        if let Some(launch) = self.helper.clone() {
            self.write_helper_config(&launch.config_path, &mods, &extra_files)?;
            let channel = HelperChannel::spawn(&launch.helper_bin, &launch.config_path)?;
            self.backend = Some(Backend::Helper(channel));
        } else {
            let overwrite = OverwriteManager::new(&self.overwrite_dir);
            overwrite.init()?;

            // Scan (or reuse) the base catalog before mounting; afterwards
            // the real files are occluded by our own mount.
            let catalog = cached_catalog(&self.mount_point)?;
            let tree = build_tree(
                &catalog,
                &self.mount_point,
                &mods,
                &self.overwrite_dir,
                &extra_files,
            );

            let ctx = FsContext::new(
                tree,
                Arc::clone(&catalog),
                self.mount_point.clone(),
                mods.clone(),
                overwrite,
            )
            .map_err(|_| MountError::BackingHandle(self.mount_point.clone()))?;

            let session = MountSession::mount(OverlayFs::new(Arc::clone(&ctx)), &self.mount_point)?;
            self.backend = Some(Backend::Direct { session, ctx });
        }

        self.last_mods = mods;
        self.last_extras = extra_files;
        info!(
            mods = self.last_mods.len(),
            "VFS mounted on '{}'",
            self.mount_point.display()
        );
        Ok(())
    }

    /// Build a new tree off the handler path and swap it in under the tree
    /// lock. Open file handles keep their original physical sources.
    pub fn rebuild(
        &mut self,
        mods: Vec<ModLayer>,
        extra_files: Vec<ExtraFile>,
    ) -> MountResult<()> {
        match self.backend {
            None => return self.mount_with(mods, extra_files),
            Some(Backend::Helper(_)) => {
                let launch = self.helper.clone().expect("helper backend without launch");
                self.write_helper_config(&launch.config_path, &mods, &extra_files)?;
                let Some(Backend::Helper(channel)) = self.backend.as_mut() else {
                    unreachable!();
                };
                channel.rebuild()?;
            }
            Some(Backend::Direct { ref ctx, .. }) => {
                let catalog = cached_catalog(&self.mount_point)?;
                let tree = build_tree(
                    &catalog,
                    &self.mount_point,
                    &mods,
                    &self.overwrite_dir,
                    &extra_files,
                );
                ctx.install_tree(tree, mods.clone());
                debug!("VFS tree rebuilt");
            }
        }

        self.last_mods = mods;
        self.last_extras = extra_files;
        Ok(())
    }

    fn write_helper_config(
        &self,
        config_path: &Path,
        mods: &[ModLayer],
        extra_files: &[ExtraFile],
    ) -> MountResult<()> {
        let config = HelperConfig {
            mount_point: self.mount_point.clone(),
            game_dir: self.game_dir.clone(),
            data_dir_name: self.data_dir_name.clone(),
            overwrite_dir: self.overwrite_dir.clone(),
            mods: mods.to_vec(),
            extra_files: extra_files.to_vec(),
        };
        config.save(config_path)?;
        Ok(())
    }
}

impl VfsConnector for FuseConnector {
    fn apply_mappings(&mut self, mappings: &MappingSet) -> MountResult<()> {
        let classified = classify_mappings(mappings, &self.mount_point, &self.overwrite_dir);

        // Out-of-mount mappings become real symlinks now; in-mount file
        // mappings ride along as tree injections.
        self.deployer.deploy(&classified.external)?;

        if self.backend.is_some() {
            self.rebuild(classified.mods, classified.extra_files)
        } else {
            self.mount_with(classified.mods, classified.extra_files)
        }
    }

    fn flush_live(&mut self) -> MountResult<()> {
        match self.backend.as_mut() {
            None => Ok(()),
            Some(Backend::Helper(channel)) => channel.flush(),
            Some(Backend::Direct { ctx, .. }) => {
                ctx.overwrite.promote()?;
                ctx.overwrite.reset()?;

                // Refresh the tree so promoted files are served from
                // overwrite instead of the now-empty staging dir.
                let catalog = cached_catalog(&self.mount_point)?;
                let tree = build_tree(
                    &catalog,
                    &self.mount_point,
                    &self.last_mods,
                    &self.overwrite_dir,
                    &self.last_extras,
                );
                ctx.install_tree(tree, self.last_mods.clone());
                debug!("live staging flush complete");
                Ok(())
            }
        }
    }

    fn unmount(&mut self) -> MountResult<()> {
        let result = match self.backend.take() {
            None => Ok(()),
            Some(Backend::Helper(channel)) => channel.quit(),
            Some(Backend::Direct { session, ctx }) => {
                session.unmount();
                // Final flush; the backing handle closes when the context
                // drops with the last session reference.
                if let Err(e) = ctx.overwrite.promote() {
                    warn!("final staging flush failed: {}", e);
                }
                Ok(())
            }
        };

        self.deployer.remove_deployed();
        info!("VFS unmounted from '{}'", self.mount_point.display());
        result
    }
}

impl Drop for FuseConnector {
    fn drop(&mut self) {
        if self.backend.is_some() {
            let _ = self.unmount();
        }
    }
}
