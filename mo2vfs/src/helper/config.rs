//! The helper configuration file.
//!
//! UTF-8, line-oriented `key=value`; `#` starts a comment and unknown keys
//! are ignored so the format can grow without breaking older helpers. `mod=`
//! and `extra_file=` repeat; their order in the file is authoritative.
//!
//! ```text
//! mount_point=/games/skyrim/Data
//! game_dir=/games/skyrim
//! data_dir_name=Data
//! overwrite_dir=/home/user/mo2/overwrite
//! mod=SkyUI|/home/user/mo2/mods/SkyUI
//! extra_file=patch.esp|/home/user/mo2/mods/Patch/patch.esp
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use crate::mapping::{ExtraFile, ModLayer};

/// Errors loading a helper configuration file.
#[derive(Debug, Error)]
pub enum HelperConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("missing required key '{0}' in config file")]
    MissingKey(&'static str),
}

/// Everything the helper needs to host the mount.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HelperConfig {
    pub mount_point: PathBuf,
    pub game_dir: PathBuf,
    pub data_dir_name: String,
    pub overwrite_dir: PathBuf,
    /// Ordered: later mods shadow earlier mods.
    pub mods: Vec<ModLayer>,
    pub extra_files: Vec<ExtraFile>,
}

impl HelperConfig {
    /// Parse the config file at `path`.
    pub fn load(path: &Path) -> Result<Self, HelperConfigError> {
        let content = fs::read_to_string(path).map_err(|source| HelperConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse config file content.
    pub fn parse(content: &str) -> Result<Self, HelperConfigError> {
        let mut config = HelperConfig::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };

            match key {
                "mount_point" => config.mount_point = PathBuf::from(value),
                "game_dir" => config.game_dir = PathBuf::from(value),
                "data_dir_name" => config.data_dir_name = value.to_string(),
                "overwrite_dir" => config.overwrite_dir = PathBuf::from(value),
                "mod" => match value.split_once('|') {
                    Some((name, path)) => config.mods.push(ModLayer::new(name, path)),
                    None => warn!("malformed mod entry ignored: {}", line),
                },
                "extra_file" => match value.split_once('|') {
                    Some((rel, source)) => {
                        config.extra_files.push(ExtraFile::new(rel, source))
                    }
                    None => warn!("malformed extra_file entry ignored: {}", line),
                },
                _ => {}
            }
        }

        if config.mount_point.as_os_str().is_empty() {
            return Err(HelperConfigError::MissingKey("mount_point"));
        }
        if config.overwrite_dir.as_os_str().is_empty() {
            return Err(HelperConfigError::MissingKey("overwrite_dir"));
        }

        Ok(config)
    }

    /// Write the config to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = fs::File::create(path)?;
        writeln!(out, "mount_point={}", self.mount_point.display())?;
        writeln!(out, "game_dir={}", self.game_dir.display())?;
        writeln!(out, "data_dir_name={}", self.data_dir_name)?;
        writeln!(out, "overwrite_dir={}", self.overwrite_dir.display())?;
        for layer in &self.mods {
            writeln!(out, "mod={}|{}", layer.name, layer.path.display())?;
        }
        for extra in &self.extra_files {
            writeln!(
                out,
                "extra_file={}|{}",
                extra.mount_rel,
                extra.source.display()
            )?;
        }
        Ok(())
    }
}
