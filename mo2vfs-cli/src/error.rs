//! CLI error handling with user-friendly messages and exit codes.

use std::fmt;
use std::process;

use mo2vfs::nxm::NxmParseError;
use mo2vfs::vfs::MountError;

/// CLI-facing errors.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(String),
    /// Session config file problem
    Config(String),
    /// Mount lifecycle failure
    Mount(MountError),
    /// The URL passed to nxm-handle was rejected
    InvalidUrl(NxmParseError),
    /// No running instance is listening on the nxm socket
    NoRunningInstance(std::io::Error),
}

impl CliError {
    /// Exit the process with an appropriate message and a non-zero code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        match self {
            CliError::Mount(MountError::MountFailed { .. }) => {
                eprintln!();
                eprintln!("Common issues:");
                eprintln!("  1. FUSE not installed: install the fuse3 package");
                eprintln!("  2. Mountpoint in use: fusermount3 -u <data dir>");
            }
            CliError::NoRunningInstance(_) => {
                eprintln!();
                eprintln!("Start the manager first; nxm-handle only forwards URLs to it.");
            }
            _ => {}
        }

        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(msg) => write!(f, "failed to initialize logging: {}", msg),
            CliError::Config(msg) => write!(f, "configuration error: {}", msg),
            CliError::Mount(e) => write!(f, "mount failed: {}", e),
            CliError::InvalidUrl(e) => write!(f, "invalid nxm URL: {}", e),
            CliError::NoRunningInstance(e) => {
                write!(f, "could not reach a running instance: {}", e)
            }
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Mount(e) => Some(e),
            CliError::InvalidUrl(e) => Some(e),
            CliError::NoRunningInstance(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MountError> for CliError {
    fn from(e: MountError) -> Self {
        CliError::Mount(e)
    }
}
