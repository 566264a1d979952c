//! The overlay virtual filesystem core.
//!
//! Layer precedence for any path inside the mount, first match wins:
//! overwrite (and this session's staging), then mods in reverse order, then
//! the base game directory, with extra-file injections applied as the final
//! override. Writes never touch base or mod directories; they are staged
//! copy-on-write and promoted into overwrite on flush.

pub mod builder;
pub mod error;
pub mod fs;
pub mod inodes;
pub mod mount;
pub mod overwrite;
pub mod scanner;
pub mod tree;

pub use builder::build_tree;
pub use error::{MountError, MountResult, VfsError, VfsResult};
pub use fs::{FsContext, OverlayFs};
pub use inodes::{InodeTable, ROOT_INODE};
pub use mount::MountSession;
pub use overwrite::{OverwriteManager, STAGING_DIR_NAME};
pub use scanner::{cached_catalog, scan_base_dir, BaseCatalog};
pub use tree::{FileOrigin, VfsNode, VfsTree, WHITEOUT_SUFFIX};
