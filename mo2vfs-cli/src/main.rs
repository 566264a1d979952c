//! mo2vfs CLI - mount the overlay filesystem and forward nxm URLs.
//!
//! Two commands matter in production:
//! - `mount <config>` hosts the VFS described by a session config file until
//!   stdin closes; it is mostly useful for testing a mod set outside the GUI.
//! - `nxm-handle <url>` is invoked by the desktop URL-scheme handler and
//!   forwards the URL to the running instance's socket.

mod error;

use std::io::{self, BufRead};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::info;

use error::CliError;
use mo2vfs::connector::{FuseConnector, VfsConnector};
use mo2vfs::helper::HelperConfig;
use mo2vfs::logging;
use mo2vfs::nxm::{self, NxmLink};

#[derive(Parser)]
#[command(name = "mo2vfs")]
#[command(version = mo2vfs::VERSION)]
#[command(about = "Overlay virtual filesystem for Linux mod management", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount the VFS described by a session config file and serve until
    /// stdin closes
    Mount {
        /// Path to a key=value session config (same format the helper reads)
        config: PathBuf,
    },
    /// Forward an nxm:// URL to the running instance and exit
    NxmHandle {
        /// The nxm:// URL received from the URL-scheme handler
        url: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Mount { config } => run_mount(&config),
        Commands::NxmHandle { url } => run_nxm_handle(&url),
    };

    if let Err(err) = result {
        err.exit();
    }
}

fn run_mount(config_path: &Path) -> Result<(), CliError> {
    let _guard = logging::init_logging(Path::new("logs"), "mo2vfs.log")
        .map_err(|e| CliError::LoggingInit(e.to_string()))?;

    let config = HelperConfig::load(config_path).map_err(|e| CliError::Config(e.to_string()))?;
    let game_dir = config
        .mount_point
        .parent()
        .unwrap_or(Path::new("/"))
        .to_path_buf();
    let data_dir_name = config
        .mount_point
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Data".to_string());

    let mut connector = FuseConnector::new(game_dir, data_dir_name, &config.overwrite_dir);
    connector.mount_with(config.mods, config.extra_files)?;

    println!("mounted at {}", connector.mount_point().display());
    println!("press Ctrl+D to unmount");

    // Serve until stdin closes, then run the final flush.
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim() == "quit" {
            break;
        }
    }

    connector.unmount()?;
    info!("session ended");
    Ok(())
}

fn run_nxm_handle(url: &str) -> Result<(), CliError> {
    // Reject garbage before bothering the running instance.
    let link = NxmLink::parse(url).map_err(CliError::InvalidUrl)?;

    nxm::send_url(url).map_err(CliError::NoRunningInstance)?;
    eprintln!("forwarded {}", link.lookup_key());
    Ok(())
}
