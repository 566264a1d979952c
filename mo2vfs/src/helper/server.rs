//! Helper-side host of the mount.
//!
//! Runs on the host outside the sandbox, reads the session config written by
//! the manager, performs the mount itself and then serves the line protocol
//! on stdin/stdout: `rebuild`, `flush` and `quit`, each answered with `ok`
//! or `error: <message>`. Stdin EOF (the manager died) is treated as `quit`
//! so the mount never outlives its manager unattended.

use std::io::{self, BufRead, Write};
use std::path::Path;

use tracing::{info, warn};

use crate::connector::{FuseConnector, VfsConnector};
use crate::vfs::{MountError, MountResult};

use super::config::HelperConfig;

/// Run the helper against `config_path`. Returns the process exit code.
pub fn run(config_path: &Path) -> i32 {
    match serve(config_path) {
        Ok(()) => 0,
        Err(err) => {
            // Exactly one error line on stdout; the manager reports it.
            println!("error: {}", err);
            let _ = io::stdout().flush();
            1
        }
    }
}

fn serve(config_path: &Path) -> MountResult<()> {
    let config = HelperConfig::load(config_path)
        .map_err(|e| MountError::HelperStartFailed(e.to_string()))?;

    let game_dir = if config.game_dir.as_os_str().is_empty() {
        config
            .mount_point
            .parent()
            .unwrap_or(Path::new("/"))
            .to_path_buf()
    } else {
        config.game_dir.clone()
    };
    let data_dir_name = if config.data_dir_name.is_empty() {
        config
            .mount_point
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Data".to_string())
    } else {
        config.data_dir_name.clone()
    };

    let mut connector = FuseConnector::new(game_dir, data_dir_name, &config.overwrite_dir);
    connector.mount_with(config.mods.clone(), config.extra_files.clone())?;

    println!("mounted");
    let _ = io::stdout().flush();
    info!("helper serving on '{}'", connector.mount_point().display());

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };

        match line.trim() {
            "rebuild" => match reload_and_rebuild(&mut connector, config_path) {
                Ok(()) => println!("ok"),
                Err(err) => {
                    warn!("rebuild failed: {}", err);
                    println!("error: {}", err);
                }
            },
            "flush" => match connector.flush_live() {
                Ok(()) => println!("ok"),
                Err(err) => {
                    warn!("flush failed: {}", err);
                    println!("error: {}", err);
                }
            },
            "quit" => break,
            "" => {}
            other => warn!("unknown helper command ignored: '{}'", other),
        }
        let _ = io::stdout().flush();
    }

    connector.unmount()?;
    println!("ok");
    let _ = io::stdout().flush();
    Ok(())
}

/// The manager rewrites the config file before sending `rebuild`; mod order
/// in the file is authoritative.
fn reload_and_rebuild(connector: &mut FuseConnector, config_path: &Path) -> MountResult<()> {
    let config = HelperConfig::load(config_path)
        .map_err(|e| MountError::HelperProtocolError(e.to_string()))?;
    connector.rebuild(config.mods, config.extra_files)
}
