//! Sandbox helper: a subprocess that owns the mount when the manager runs in
//! a container that cannot mount filesystems itself.
//!
//! The manager writes a [`config::HelperConfig`] file, spawns the helper on
//! the host and controls it through [`channel::HelperChannel`]; the helper
//! side lives in [`server`].

pub mod channel;
pub mod config;
pub mod server;

pub use channel::HelperChannel;
pub use config::{HelperConfig, HelperConfigError};
