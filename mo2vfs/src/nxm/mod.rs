//! `nxm://` URL-scheme handling: strict link parsing and the single-instance
//! hand-off socket.

pub mod link;
pub mod socket;

pub use link::{NxmLink, NxmParseError};
pub use socket::{send_url, socket_path, NxmListener};
