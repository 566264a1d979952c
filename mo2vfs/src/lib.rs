//! mo2vfs - Overlay virtual filesystem for managing game mods on Linux
//!
//! This library fuses a read-only base game directory, an ordered list of mod
//! directories and a writable overwrite directory into a single FUSE
//! namespace mounted over the game's data directory. The game sees one
//! directory; reads are redirected to the highest-precedence layer and writes
//! are staged copy-on-write, then promoted into the overwrite directory.
//!
//! # High-Level API
//!
//! Most callers only need the [`connector`] module:
//!
//! ```ignore
//! use mo2vfs::connector::{FuseConnector, VfsConnector};
//! use mo2vfs::mapping::MappingSet;
//!
//! let mut connector = FuseConnector::new(game_dir, "Data", overwrite_dir);
//! connector.apply_mappings(&mappings)?;
//! // ... game session runs against the mounted data directory ...
//! connector.flush_live()?;
//! connector.unmount()?;
//! ```
//!
//! The [`helper`] module hosts the same mount in a subprocess for sandboxed
//! launch contexts, and [`nxm`] implements the download-URL socket.

pub mod connector;
pub mod deploy;
pub mod helper;
pub mod logging;
pub mod mapping;
pub mod nxm;
pub mod vfs;

/// Version of the mo2vfs library and CLI.
///
/// Synchronized across all workspace members via `[workspace.package]`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
