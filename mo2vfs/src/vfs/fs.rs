//! FUSE callback handlers for the overlay filesystem.
//!
//! Read path: lookup, getattr, readdir, open, read.
//! Write path: write, create, mkdir, unlink, rename, setattr -> staging.
//!
//! Every handler resolves the target inode through the [`InodeTable`], takes
//! shared access to the current tree snapshot for as short as possible, and
//! performs I/O with no tree lock held. Handlers are dispatched onto the
//! rayon pool so the FUSE session thread is freed immediately and requests
//! for distinct files proceed in parallel.
//!
//! Because the mount point equals the backing data directory, base-origin
//! sources are opened through the pre-mount directory handle (`openat`),
//! never through the mount path itself.

use std::collections::HashMap;
use std::ffi::{CString, OsStr};
use std::fs::{self, File, FileTimes, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use tracing::{debug, error, warn};

use crate::mapping::ModLayer;

use super::error::{VfsError, VfsResult};
use super::inodes::{InodeTable, ROOT_INODE};
use super::overwrite::OverwriteManager;
use super::scanner::BaseCatalog;
use super::tree::{FileOrigin, VfsNode, VfsTree};

/// Validity timeout handed to the kernel with every entry and attr reply.
const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u32 = 512;

/// An open file handle: one OS descriptor per kernel open, closed in
/// `release`. A handle keeps reading from its original physical source even
/// after a live rebuild swaps the tree.
pub struct FileHandle {
    file: File,
    writable: bool,
    rel: String,
}

/// Shared state of the data plane.
///
/// The current tree is the only mutable shared state; it sits behind a
/// read/write lock that handlers hold only while resolving paths.
pub struct FsContext {
    pub tree: RwLock<VfsTree>,
    pub inodes: Mutex<InodeTable>,
    pub overwrite: OverwriteManager,
    handles: Mutex<HashMap<u64, FileHandle>>,
    next_fh: AtomicU64,
    /// Directory handle on the data directory, opened before mounting.
    backing_dir: OwnedFd,
    base_dir: PathBuf,
    catalog: Arc<BaseCatalog>,
    mods: Mutex<Vec<ModLayer>>,
    uid: u32,
    gid: u32,
}

impl FsContext {
    /// Create the context, opening the pre-mount backing handle on
    /// `base_dir`. Must be called before the mount is established.
    pub fn new(
        tree: VfsTree,
        catalog: Arc<BaseCatalog>,
        base_dir: PathBuf,
        mods: Vec<ModLayer>,
        overwrite: OverwriteManager,
    ) -> io::Result<Arc<Self>> {
        let backing_dir = open_backing_dir(&base_dir)?;
        Ok(Arc::new(FsContext {
            tree: RwLock::new(tree),
            inodes: Mutex::new(InodeTable::new()),
            overwrite,
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            backing_dir,
            base_dir,
            catalog,
            mods: Mutex::new(mods),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }))
    }

    /// Swap in a freshly built tree (live rebuild / flush).
    pub fn install_tree(&self, tree: VfsTree, mods: Vec<ModLayer>) {
        *self.mods.lock().unwrap() = mods;
        let mut guard = self.tree.write().unwrap();
        *guard = tree;
    }

    /// Open the physical source of a file node for reading.
    ///
    /// Base-origin sources live under the mount point and must go through
    /// the pre-mount handle to avoid recursing into our own mount.
    fn open_source(&self, source: &Path, origin: FileOrigin) -> io::Result<File> {
        if origin == FileOrigin::Base {
            if let Ok(rel) = source.strip_prefix(&self.base_dir) {
                return self.open_at_backing(rel);
            }
            warn!(
                "base source {} outside data dir, opening directly",
                source.display()
            );
        }
        File::open(source)
    }

    fn open_at_backing(&self, rel: &Path) -> io::Result<File> {
        let rel = CString::new(rel.as_os_str().as_bytes())
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let fd = unsafe {
            libc::openat(
                self.backing_dir.as_raw_fd(),
                rel.as_ptr(),
                libc::O_RDONLY | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { File::from_raw_fd(fd) })
    }

    /// Whether a layer below overwrite/staging still contains `rel`, which
    /// decides if an unlink needs a whiteout.
    fn lower_layer_has(&self, rel: &str) -> bool {
        if self.catalog.contains(rel) {
            return true;
        }
        self.mods
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.path.join(rel).exists())
    }

    /// Mode bits for a directory: writable when an overwrite or staging
    /// counterpart exists, read-only for pure-overlay directories.
    fn dir_perm(&self, rel: &str) -> u16 {
        if self.overwrite.overwrite_path(rel).is_dir() || self.overwrite.staging_path(rel).is_dir()
        {
            0o755
        } else {
            0o555
        }
    }

    fn alloc_fh(&self, handle: FileHandle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().unwrap().insert(fh, handle);
        fh
    }

    fn dir_attr(&self, ino: u64, rel: &str, mtime: SystemTime) -> FileAttr {
        FileAttr {
            ino,
            size: 0,
            blocks: 0,
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: FileType::Directory,
            perm: self.dir_perm(rel),
            nlink: 2,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn file_attr(&self, ino: u64, meta: &fs::Metadata) -> FileAttr {
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        FileAttr {
            ino,
            size: meta.len(),
            blocks: meta.len().div_ceil(BLOCK_SIZE as u64),
            atime: meta.accessed().unwrap_or(mtime),
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: FileType::RegularFile,
            // Mirror the source mode but keep the owner write bit so
            // write-intent opens reach us; COW redirects them to staging.
            perm: ((meta.mode() & 0o7777) | 0o200) as u16,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }
}

fn open_backing_dir(base_dir: &Path) -> io::Result<OwnedFd> {
    let path = CString::new(base_dir.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn join_rel(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

fn parent_of(rel: &str) -> &str {
    rel.rsplit_once('/').map(|(p, _)| p).unwrap_or("")
}

fn resolve_inode(ctx: &FsContext, ino: u64) -> VfsResult<String> {
    ctx.inodes
        .lock()
        .unwrap()
        .resolve(ino)
        .map(str::to_string)
        .ok_or_else(|| VfsError::Internal(format!("unknown inode {}", ino)))
}

/// Snapshot of a file node taken under the tree read lock.
#[derive(Debug, Clone)]
struct FileRef {
    source: PathBuf,
    origin: FileOrigin,
}

enum NodeRef {
    Dir,
    File(FileRef),
}

fn resolve_node(ctx: &FsContext, rel: &str) -> VfsResult<NodeRef> {
    let tree = ctx.tree.read().unwrap();
    match tree.lookup(rel) {
        Some(VfsNode::Directory { .. }) => Ok(NodeRef::Dir),
        Some(VfsNode::File { source, origin }) => Ok(NodeRef::File(FileRef {
            source: source.clone(),
            origin: *origin,
        })),
        Some(VfsNode::Whiteout) | None => Err(VfsError::NotFound(rel.to_string())),
    }
}

/// Directory mtime: max of the direct children's source mtimes, current time
/// for directories with no stat-able children.
fn dir_mtime(ctx: &FsContext, rel: &str) -> SystemTime {
    let children: Vec<FileRef> = {
        let tree = ctx.tree.read().unwrap();
        match tree.list_dir(rel) {
            Some(entries) => entries
                .iter()
                .filter_map(|(_, node)| match node {
                    VfsNode::File { source, origin } => Some(FileRef {
                        source: source.clone(),
                        origin: *origin,
                    }),
                    _ => None,
                })
                .collect(),
            None => Vec::new(),
        }
    };

    children
        .iter()
        .filter_map(|f| {
            ctx.open_source(&f.source, f.origin)
                .and_then(|file| file.metadata())
                .ok()
                .and_then(|m| m.modified().ok())
        })
        .max()
        .unwrap_or_else(SystemTime::now)
}

fn attr_for(ctx: &FsContext, ino: u64, rel: &str, node: &NodeRef) -> VfsResult<FileAttr> {
    match node {
        NodeRef::Dir => Ok(ctx.dir_attr(ino, rel, dir_mtime(ctx, rel))),
        NodeRef::File(f) => {
            let meta = ctx.open_source(&f.source, f.origin)?.metadata()?;
            Ok(ctx.file_attr(ino, &meta))
        }
    }
}

fn do_lookup(ctx: &FsContext, parent: u64, name: &str) -> VfsResult<FileAttr> {
    let parent_rel = resolve_inode(ctx, parent)?;
    let rel = join_rel(&parent_rel, name);
    let node = resolve_node(ctx, &rel)?;
    let ino = ctx.inodes.lock().unwrap().allocate_or_reuse(&rel);
    attr_for(ctx, ino, &rel, &node)
}

fn do_getattr(ctx: &FsContext, ino: u64) -> VfsResult<FileAttr> {
    let rel = resolve_inode(ctx, ino)?;
    let node = resolve_node(ctx, &rel)?;
    attr_for(ctx, ino, &rel, &node)
}

fn do_readdir(ctx: &FsContext, ino: u64) -> VfsResult<Vec<(u64, FileType, String)>> {
    let rel = resolve_inode(ctx, ino)?;

    let children: Vec<(String, bool)> = {
        let tree = ctx.tree.read().unwrap();
        let entries = tree
            .list_dir(&rel)
            .ok_or_else(|| VfsError::NotFound(rel.clone()))?;
        entries
            .iter()
            .map(|(name, node)| (name.to_string(), node.is_dir()))
            .collect()
    };

    let mut inodes = ctx.inodes.lock().unwrap();
    let parent_ino = if rel.is_empty() {
        ROOT_INODE
    } else {
        inodes.peek_or_allocate(parent_of(&rel))
    };

    let mut out = Vec::with_capacity(children.len() + 2);
    out.push((ino, FileType::Directory, ".".to_string()));
    out.push((parent_ino, FileType::Directory, "..".to_string()));
    for (name, is_dir) in children {
        let child_ino = inodes.peek_or_allocate(&join_rel(&rel, &name));
        let kind = if is_dir {
            FileType::Directory
        } else {
            FileType::RegularFile
        };
        out.push((child_ino, kind, name));
    }
    Ok(out)
}

/// Materialise `rel` into staging if it is not already served from there and
/// repoint the tree leaf at the staging copy.
fn promote_to_staging(ctx: &FsContext, rel: &str, file_ref: &FileRef) -> VfsResult<PathBuf> {
    if file_ref.source.starts_with(ctx.overwrite.staging_dir()) {
        return Ok(file_ref.source.clone());
    }

    let mut source = ctx.open_source(&file_ref.source, file_ref.origin)?;
    let staged = ctx
        .overwrite
        .resolve_write(rel, Some(&mut source))
        .map_err(|e| VfsError::NotWritable(format!("{}: {}", rel, e)))?;

    ctx.tree
        .write()
        .unwrap()
        .insert_file(rel, staged.clone(), FileOrigin::Overwrite);
    Ok(staged)
}

fn do_open(ctx: &FsContext, ino: u64, flags: i32) -> VfsResult<u64> {
    let rel = resolve_inode(ctx, ino)?;
    let NodeRef::File(file_ref) = resolve_node(ctx, &rel)? else {
        return Err(VfsError::Io(io::Error::from_raw_os_error(libc::EISDIR)));
    };

    let writable = flags & (libc::O_WRONLY | libc::O_RDWR) != 0;
    let handle = if writable {
        let staged = promote_to_staging(ctx, &rel, &file_ref)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(flags & libc::O_TRUNC != 0)
            .open(&staged)?;
        FileHandle {
            file,
            writable: true,
            rel: rel.clone(),
        }
    } else {
        FileHandle {
            file: ctx.open_source(&file_ref.source, file_ref.origin)?,
            writable: false,
            rel: rel.clone(),
        }
    };

    Ok(ctx.alloc_fh(handle))
}

fn do_read(ctx: &FsContext, fh: u64, offset: i64, size: u32) -> VfsResult<Vec<u8>> {
    let file = {
        let handles = ctx.handles.lock().unwrap();
        let handle = handles
            .get(&fh)
            .ok_or_else(|| VfsError::Internal(format!("unknown file handle {}", fh)))?;
        handle.file.try_clone()?
    };

    let mut buf = vec![0u8; size as usize];
    let n = file.read_at(&mut buf, offset as u64)?;
    buf.truncate(n);
    Ok(buf)
}

fn do_write(ctx: &FsContext, fh: u64, offset: i64, data: &[u8]) -> VfsResult<u32> {
    let file = {
        let handles = ctx.handles.lock().unwrap();
        let handle = handles
            .get(&fh)
            .ok_or_else(|| VfsError::Internal(format!("unknown file handle {}", fh)))?;
        if !handle.writable {
            return Err(VfsError::Io(io::Error::from_raw_os_error(libc::EACCES)));
        }
        handle.file.try_clone()?
    };

    file.write_all_at(data, offset as u64)?;
    Ok(data.len() as u32)
}

fn do_create(ctx: &FsContext, parent: u64, name: &str, mode: u32) -> VfsResult<(u64, FileAttr, u64)> {
    let parent_rel = resolve_inode(ctx, parent)?;
    let rel = join_rel(&parent_rel, name);

    if resolve_node(ctx, &rel).is_ok() {
        return Err(VfsError::Conflict(rel));
    }

    let staged = ctx
        .overwrite
        .resolve_new(&rel)
        .map_err(|e| VfsError::NotWritable(format!("{}: {}", rel, e)))?;
    let _ = fs::set_permissions(&staged, fs::Permissions::from_mode(mode & 0o7777));

    // A create over a persisted whiteout revives the path.
    if let Err(e) = ctx.overwrite.remove_whiteout(&rel) {
        warn!("failed to drop whiteout for {}: {}", rel, e);
    }

    ctx.tree
        .write()
        .unwrap()
        .insert_file(&rel, staged.clone(), FileOrigin::Overwrite);

    let ino = ctx.inodes.lock().unwrap().allocate_or_reuse(&rel);
    let meta = fs::metadata(&staged)?;
    let attr = ctx.file_attr(ino, &meta);

    let file = OpenOptions::new().read(true).write(true).open(&staged)?;
    let fh = ctx.alloc_fh(FileHandle {
        file,
        writable: true,
        rel,
    });
    Ok((ino, attr, fh))
}

fn do_mkdir(ctx: &FsContext, parent: u64, name: &str) -> VfsResult<(u64, FileAttr)> {
    let parent_rel = resolve_inode(ctx, parent)?;
    let rel = join_rel(&parent_rel, name);

    if resolve_node(ctx, &rel).is_ok() {
        return Err(VfsError::Conflict(rel));
    }

    ctx.overwrite
        .create_dir(&rel)
        .map_err(|e| VfsError::NotWritable(format!("{}: {}", rel, e)))?;
    ctx.tree.write().unwrap().insert_dir(&rel);

    let ino = ctx.inodes.lock().unwrap().allocate_or_reuse(&rel);
    let attr = ctx.dir_attr(ino, &rel, SystemTime::now());
    Ok((ino, attr))
}

fn do_unlink(ctx: &FsContext, parent: u64, name: &str) -> VfsResult<()> {
    let parent_rel = resolve_inode(ctx, parent)?;
    let rel = join_rel(&parent_rel, name);

    let NodeRef::File(_) = resolve_node(ctx, &rel)? else {
        return Err(VfsError::Io(io::Error::from_raw_os_error(libc::EISDIR)));
    };

    ctx.overwrite.remove_staged(&rel)?;
    ctx.overwrite.remove_overwrite(&rel)?;

    if ctx.lower_layer_has(&rel) {
        // The path survives in base or a mod: hide it in-session and persist
        // the deletion across sessions.
        ctx.tree.write().unwrap().insert_whiteout(&rel);
        if let Err(e) = ctx.overwrite.write_whiteout(&rel) {
            warn!("failed to persist whiteout for {}: {}", rel, e);
        }
    } else {
        ctx.tree.write().unwrap().remove(&rel);
    }
    Ok(())
}

fn do_rename(
    ctx: &FsContext,
    parent: u64,
    name: &str,
    new_parent: u64,
    new_name: &str,
) -> VfsResult<()> {
    let old_rel = join_rel(&resolve_inode(ctx, parent)?, name);
    let new_rel = join_rel(&resolve_inode(ctx, new_parent)?, new_name);

    let file_ref = match resolve_node(ctx, &old_rel)? {
        NodeRef::File(f) => f,
        // Directory renames would have to move whole lower-layer subtrees;
        // report them as crossing a filesystem boundary.
        NodeRef::Dir => return Err(VfsError::Io(io::Error::from_raw_os_error(libc::EXDEV))),
    };

    promote_to_staging(ctx, &old_rel, &file_ref)?;
    let staged_new = ctx.overwrite.rename_staged(&old_rel, &new_rel)?;

    ctx.overwrite.remove_overwrite(&old_rel)?;
    if let Err(e) = ctx.overwrite.remove_whiteout(&new_rel) {
        warn!("failed to drop whiteout for {}: {}", new_rel, e);
    }

    {
        let mut tree = ctx.tree.write().unwrap();
        if ctx.lower_layer_has(&old_rel) {
            tree.insert_whiteout(&old_rel);
        } else {
            tree.remove(&old_rel);
        }
        tree.insert_file(&new_rel, staged_new, FileOrigin::Overwrite);
    }

    if ctx.lower_layer_has(&old_rel) {
        if let Err(e) = ctx.overwrite.write_whiteout(&old_rel) {
            warn!("failed to persist whiteout for {}: {}", old_rel, e);
        }
    }

    ctx.inodes.lock().unwrap().rename(&old_rel, &new_rel);
    Ok(())
}

/// Attribute changes requested by setattr; ownership changes are accepted
/// and ignored because the mount presents a single uid/gid.
struct AttrChanges {
    mode: Option<u32>,
    size: Option<u64>,
    atime: Option<TimeOrNow>,
    mtime: Option<TimeOrNow>,
}

impl AttrChanges {
    fn mutates(&self) -> bool {
        self.mode.is_some() || self.size.is_some() || self.atime.is_some() || self.mtime.is_some()
    }
}

fn to_system_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

fn do_setattr(ctx: &FsContext, ino: u64, changes: AttrChanges) -> VfsResult<FileAttr> {
    let rel = resolve_inode(ctx, ino)?;
    let node = resolve_node(ctx, &rel)?;

    let file_ref = match node {
        NodeRef::Dir => return attr_for(ctx, ino, &rel, &NodeRef::Dir),
        NodeRef::File(f) => f,
    };

    if !changes.mutates() {
        return attr_for(ctx, ino, &rel, &NodeRef::File(file_ref));
    }

    let staged = promote_to_staging(ctx, &rel, &file_ref)?;
    let file = OpenOptions::new().write(true).open(&staged)?;

    if let Some(size) = changes.size {
        file.set_len(size)?;
    }
    if let Some(mode) = changes.mode {
        fs::set_permissions(&staged, fs::Permissions::from_mode(mode & 0o7777))?;
    }
    if changes.atime.is_some() || changes.mtime.is_some() {
        let mut times = FileTimes::new();
        if let Some(atime) = changes.atime {
            times = times.set_accessed(to_system_time(atime));
        }
        if let Some(mtime) = changes.mtime {
            times = times.set_modified(to_system_time(mtime));
        }
        file.set_times(times)?;
    }

    let meta = file.metadata()?;
    Ok(ctx.file_attr(ino, &meta))
}

fn do_release(ctx: &FsContext, fh: u64) {
    if let Some(handle) = ctx.handles.lock().unwrap().remove(&fh) {
        debug!(fh, rel = %handle.rel, writable = handle.writable, "handle released");
    }
}

/// The fuser-facing filesystem: a thin dispatcher around [`FsContext`].
pub struct OverlayFs {
    ctx: Arc<FsContext>,
}

impl OverlayFs {
    pub fn new(ctx: Arc<FsContext>) -> Self {
        OverlayFs { ctx }
    }
}

macro_rules! reply_result {
    ($result:expr, $reply:ident, $ok:expr) => {
        match $result {
            Ok(value) => $ok($reply, value),
            Err(err) => {
                if let VfsError::Internal(ref msg) = err {
                    error!("{}", msg);
                }
                $reply.error(err.errno());
            }
        }
    };
}

impl Filesystem for OverlayFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let ctx = Arc::clone(&self.ctx);
        let name = name.to_string_lossy().into_owned();
        rayon::spawn(move || {
            reply_result!(do_lookup(&ctx, parent, &name), reply, |r: ReplyEntry,
                                                                  attr| {
                r.entry(&TTL, &attr, 0)
            });
        });
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.ctx.inodes.lock().unwrap().forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        let ctx = Arc::clone(&self.ctx);
        rayon::spawn(move || {
            reply_result!(do_getattr(&ctx, ino), reply, |r: ReplyAttr, attr| {
                r.attr(&TTL, &attr)
            });
        });
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let ctx = Arc::clone(&self.ctx);
        rayon::spawn(move || match do_readdir(&ctx, ino) {
            Ok(entries) => {
                for (i, (ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
                    if reply.add(*ino, (i + 1) as i64, *kind, name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(err) => reply.error(err.errno()),
        });
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let ctx = Arc::clone(&self.ctx);
        rayon::spawn(move || {
            reply_result!(do_open(&ctx, ino, flags), reply, |r: ReplyOpen, fh| {
                r.opened(fh, 0)
            });
        });
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let ctx = Arc::clone(&self.ctx);
        rayon::spawn(move || {
            reply_result!(do_read(&ctx, fh, offset, size), reply, |r: ReplyData,
                                                                   data: Vec<u8>| {
                r.data(&data)
            });
        });
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let ctx = Arc::clone(&self.ctx);
        let data = data.to_vec();
        rayon::spawn(move || {
            reply_result!(do_write(&ctx, fh, offset, &data), reply, |r: ReplyWrite,
                                                                     written| {
                r.written(written)
            });
        });
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let ctx = Arc::clone(&self.ctx);
        let name = name.to_string_lossy().into_owned();
        rayon::spawn(move || {
            reply_result!(
                do_create(&ctx, parent, &name, mode),
                reply,
                |r: ReplyCreate, (_ino, attr, fh): (u64, FileAttr, u64)| {
                    r.created(&TTL, &attr, 0, fh, 0)
                }
            );
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let ctx = Arc::clone(&self.ctx);
        let name = name.to_string_lossy().into_owned();
        rayon::spawn(move || {
            reply_result!(do_mkdir(&ctx, parent, &name), reply, |r: ReplyEntry,
                                                                 (_ino, attr): (
                u64,
                FileAttr
            )| {
                r.entry(&TTL, &attr, 0)
            });
        });
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let ctx = Arc::clone(&self.ctx);
        let name = name.to_string_lossy().into_owned();
        rayon::spawn(move || {
            reply_result!(do_unlink(&ctx, parent, &name), reply, |r: ReplyEmpty,
                                                                  _: ()| {
                r.ok()
            });
        });
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let ctx = Arc::clone(&self.ctx);
        let name = name.to_string_lossy().into_owned();
        let newname = newname.to_string_lossy().into_owned();
        rayon::spawn(move || {
            reply_result!(
                do_rename(&ctx, parent, &name, newparent, &newname),
                reply,
                |r: ReplyEmpty, _: ()| r.ok()
            );
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let ctx = Arc::clone(&self.ctx);
        let changes = AttrChanges {
            mode,
            size,
            atime,
            mtime,
        };
        rayon::spawn(move || {
            reply_result!(do_setattr(&ctx, ino, changes), reply, |r: ReplyAttr,
                                                                  attr| {
                r.attr(&TTL, &attr)
            });
        });
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let ctx = Arc::clone(&self.ctx);
        rayon::spawn(move || {
            do_release(&ctx, fh);
            reply.ok();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::builder::build_tree;
    use crate::vfs::scanner::scan_base_dir;
    use crate::vfs::tree::WHITEOUT_SUFFIX;
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        base: PathBuf,
        overwrite: PathBuf,
        ctx: Arc<FsContext>,
    }

    fn fixture(base_files: &[(&str, &str)], mods: Vec<ModLayer>) -> Fixture {
        let root = TempDir::new().unwrap();
        let base = root.path().join("game/Data");
        fs::create_dir_all(&base).unwrap();
        for (rel, content) in base_files {
            let path = base.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }

        let overwrite = root.path().join("profile/overwrite");
        let manager = OverwriteManager::new(&overwrite);
        manager.init().unwrap();

        let catalog = Arc::new(scan_base_dir(&base).unwrap());
        let tree = build_tree(&catalog, &base, &mods, &overwrite, &[]);
        let ctx = FsContext::new(tree, catalog, base.clone(), mods, manager).unwrap();

        Fixture {
            _root: root,
            base,
            overwrite,
            ctx,
        }
    }

    fn lookup_ino(ctx: &FsContext, parent: u64, name: &str) -> u64 {
        do_lookup(ctx, parent, name).unwrap().ino
    }

    #[test]
    fn test_lookup_and_getattr_roundtrip() {
        let fx = fixture(&[("a.txt", "AAAA")], vec![]);

        let attr = do_lookup(&fx.ctx, ROOT_INODE, "a.txt").unwrap();
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.size, 4);

        let again = do_getattr(&fx.ctx, attr.ino).unwrap();
        assert_eq!(again.ino, attr.ino);
        assert_eq!(again.size, 4);
    }

    #[test]
    fn test_lookup_missing_is_not_found() {
        let fx = fixture(&[("a.txt", "A")], vec![]);
        let err = do_lookup(&fx.ctx, ROOT_INODE, "missing.txt").unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[test]
    fn test_inode_stability_across_lookups() {
        let fx = fixture(&[("a.txt", "A")], vec![]);
        let first = lookup_ino(&fx.ctx, ROOT_INODE, "a.txt");
        let second = lookup_ino(&fx.ctx, ROOT_INODE, "a.txt");
        assert_eq!(first, second);
    }

    #[test]
    fn test_readdir_lists_union_in_order_with_dots() {
        let fx = fixture(&[("b.txt", "B"), ("a.txt", "A"), ("sub/c.txt", "C")], vec![]);

        let entries = do_readdir(&fx.ctx, ROOT_INODE).unwrap();
        let names: Vec<&str> = entries.iter().map(|(_, _, n)| n.as_str()).collect();
        assert_eq!(names, vec![".", "..", "a.txt", "b.txt", "sub"]);
    }

    #[test]
    fn test_read_through_open_handle() {
        let fx = fixture(&[("a.txt", "hello")], vec![]);
        let ino = lookup_ino(&fx.ctx, ROOT_INODE, "a.txt");

        let fh = do_open(&fx.ctx, ino, libc::O_RDONLY).unwrap();
        let data = do_read(&fx.ctx, fh, 0, 16).unwrap();
        assert_eq!(data, b"hello");

        let tail = do_read(&fx.ctx, fh, 1, 2).unwrap();
        assert_eq!(tail, b"el");
        do_release(&fx.ctx, fh);
    }

    #[test]
    fn test_write_is_copy_on_write() {
        let fx = fixture(&[("a.txt", "A")], vec![]);
        let ino = lookup_ino(&fx.ctx, ROOT_INODE, "a.txt");

        let fh = do_open(&fx.ctx, ino, libc::O_RDWR).unwrap();
        do_write(&fx.ctx, fh, 0, b"Z").unwrap();
        do_release(&fx.ctx, fh);

        // The physical base file is untouched; staging holds the new bytes.
        assert_eq!(fs::read_to_string(fx.base.join("a.txt")).unwrap(), "A");
        assert_eq!(
            fs::read_to_string(fx.ctx.overwrite.staging_path("a.txt")).unwrap(),
            "Z"
        );

        // Reads through the mount now come from staging.
        let fh = do_open(&fx.ctx, ino, libc::O_RDONLY).unwrap();
        assert_eq!(do_read(&fx.ctx, fh, 0, 4).unwrap(), b"Z");
        do_release(&fx.ctx, fh);
    }

    #[test]
    fn test_write_on_readonly_handle_is_refused() {
        let fx = fixture(&[("a.txt", "A")], vec![]);
        let ino = lookup_ino(&fx.ctx, ROOT_INODE, "a.txt");

        let fh = do_open(&fx.ctx, ino, libc::O_RDONLY).unwrap();
        let err = do_write(&fx.ctx, fh, 0, b"Z").unwrap_err();
        assert_eq!(err.errno(), libc::EACCES);
    }

    #[test]
    fn test_create_places_file_in_staging() {
        let fx = fixture(&[], vec![]);

        let (ino, attr, fh) = do_create(&fx.ctx, ROOT_INODE, "new.txt", 0o644).unwrap();
        assert_eq!(attr.size, 0);
        do_write(&fx.ctx, fh, 0, b"fresh").unwrap();
        do_release(&fx.ctx, fh);

        assert!(fx.ctx.overwrite.has_staged("new.txt"));
        assert_eq!(lookup_ino(&fx.ctx, ROOT_INODE, "new.txt"), ino);

        let err = do_create(&fx.ctx, ROOT_INODE, "new.txt", 0o644).unwrap_err();
        assert_eq!(err.errno(), libc::EEXIST);
    }

    #[test]
    fn test_mkdir_and_conflict() {
        let fx = fixture(&[], vec![]);

        let (_, attr) = do_mkdir(&fx.ctx, ROOT_INODE, "newdir").unwrap();
        assert_eq!(attr.kind, FileType::Directory);
        assert!(fx.ctx.overwrite.staging_path("newdir").is_dir());

        let err = do_mkdir(&fx.ctx, ROOT_INODE, "newdir").unwrap_err();
        assert_eq!(err.errno(), libc::EEXIST);
    }

    #[test]
    fn test_unlink_base_file_writes_whiteout() {
        let fx = fixture(&[("a.txt", "A")], vec![]);

        do_unlink(&fx.ctx, ROOT_INODE, "a.txt").unwrap();

        // Hidden in-session.
        let err = do_lookup(&fx.ctx, ROOT_INODE, "a.txt").unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
        let entries = do_readdir(&fx.ctx, ROOT_INODE).unwrap();
        assert!(!entries.iter().any(|(_, _, n)| n == "a.txt"));

        // Base file untouched, deletion persisted as a sentinel.
        assert!(fx.base.join("a.txt").is_file());
        assert!(fx
            .overwrite
            .join(format!("a.txt{}", WHITEOUT_SUFFIX))
            .is_file());
    }

    #[test]
    fn test_unlink_created_file_leaves_no_whiteout() {
        let fx = fixture(&[], vec![]);

        let (_, _, fh) = do_create(&fx.ctx, ROOT_INODE, "tmp.txt", 0o644).unwrap();
        do_release(&fx.ctx, fh);
        do_unlink(&fx.ctx, ROOT_INODE, "tmp.txt").unwrap();

        assert!(!fx.ctx.overwrite.has_staged("tmp.txt"));
        assert!(!fx
            .overwrite
            .join(format!("tmp.txt{}", WHITEOUT_SUFFIX))
            .exists());
        assert!(do_lookup(&fx.ctx, ROOT_INODE, "tmp.txt").is_err());
    }

    #[test]
    fn test_create_over_whiteout_revives_path() {
        let fx = fixture(&[("a.txt", "A")], vec![]);

        do_unlink(&fx.ctx, ROOT_INODE, "a.txt").unwrap();
        let (_, _, fh) = do_create(&fx.ctx, ROOT_INODE, "a.txt", 0o644).unwrap();
        do_write(&fx.ctx, fh, 0, b"reborn").unwrap();
        do_release(&fx.ctx, fh);

        assert!(do_lookup(&fx.ctx, ROOT_INODE, "a.txt").is_ok());
        assert!(!fx
            .overwrite
            .join(format!("a.txt{}", WHITEOUT_SUFFIX))
            .exists());
    }

    #[test]
    fn test_rename_base_file_cows_and_whiteouts_old_name() {
        let fx = fixture(&[("old.txt", "DATA")], vec![]);
        let old_ino = lookup_ino(&fx.ctx, ROOT_INODE, "old.txt");

        do_rename(&fx.ctx, ROOT_INODE, "old.txt", ROOT_INODE, "new.txt").unwrap();

        assert!(do_lookup(&fx.ctx, ROOT_INODE, "old.txt").is_err());
        let new_attr = do_lookup(&fx.ctx, ROOT_INODE, "new.txt").unwrap();
        assert_eq!(new_attr.ino, old_ino);
        assert_eq!(
            fs::read_to_string(fx.ctx.overwrite.staging_path("new.txt")).unwrap(),
            "DATA"
        );
        // Physical base file survives under its original name.
        assert_eq!(fs::read_to_string(fx.base.join("old.txt")).unwrap(), "DATA");
    }

    #[test]
    fn test_rename_directory_is_refused() {
        let fx = fixture(&[("sub/a.txt", "A")], vec![]);
        let err = do_rename(&fx.ctx, ROOT_INODE, "sub", ROOT_INODE, "sub2").unwrap_err();
        assert_eq!(err.errno(), libc::EXDEV);
    }

    #[test]
    fn test_setattr_truncate_promotes_to_staging() {
        let fx = fixture(&[("a.txt", "AAAA")], vec![]);
        let ino = lookup_ino(&fx.ctx, ROOT_INODE, "a.txt");

        let attr = do_setattr(
            &fx.ctx,
            ino,
            AttrChanges {
                mode: None,
                size: Some(2),
                atime: None,
                mtime: None,
            },
        )
        .unwrap();

        assert_eq!(attr.size, 2);
        assert_eq!(fs::read_to_string(fx.base.join("a.txt")).unwrap(), "AAAA");
        assert_eq!(
            fs::read_to_string(fx.ctx.overwrite.staging_path("a.txt")).unwrap(),
            "AA"
        );
    }

    #[test]
    fn test_mod_layer_shadows_base_through_handlers() {
        let mod_dir = TempDir::new().unwrap();
        fs::write(mod_dir.path().join("a.txt"), "MOD").unwrap();
        let fx = fixture(
            &[("a.txt", "BASE")],
            vec![ModLayer::new("M1", mod_dir.path())],
        );

        let ino = lookup_ino(&fx.ctx, ROOT_INODE, "a.txt");
        let fh = do_open(&fx.ctx, ino, libc::O_RDONLY).unwrap();
        assert_eq!(do_read(&fx.ctx, fh, 0, 16).unwrap(), b"MOD");
        do_release(&fx.ctx, fh);
    }

    #[test]
    fn test_open_handle_survives_tree_swap() {
        let fx = fixture(&[("a.txt", "ORIGINAL")], vec![]);
        let ino = lookup_ino(&fx.ctx, ROOT_INODE, "a.txt");
        let fh = do_open(&fx.ctx, ino, libc::O_RDONLY).unwrap();

        // Swap in a rebuilt tree where a mod shadows the file.
        let mod_dir = TempDir::new().unwrap();
        fs::write(mod_dir.path().join("a.txt"), "SHADOW").unwrap();
        let mods = vec![ModLayer::new("M1", mod_dir.path())];
        let catalog = Arc::new(scan_base_dir(&fx.base).unwrap());
        let new_tree = build_tree(&catalog, &fx.base, &mods, &fx.overwrite, &[]);
        fx.ctx.install_tree(new_tree, mods);

        // The pre-swap handle still reads the original source to EOF.
        assert_eq!(do_read(&fx.ctx, fh, 0, 16).unwrap(), b"ORIGINAL");
        do_release(&fx.ctx, fh);

        // A fresh open sees the new tree.
        let fh = do_open(&fx.ctx, ino, libc::O_RDONLY).unwrap();
        assert_eq!(do_read(&fx.ctx, fh, 0, 16).unwrap(), b"SHADOW");
        do_release(&fx.ctx, fh);
    }

    #[test]
    fn test_dir_perm_reflects_overwrite_counterpart() {
        let fx = fixture(&[("plain/a.txt", "A")], vec![]);

        // Root has an overwrite counterpart (the overwrite dir itself).
        let root_attr = do_getattr(&fx.ctx, ROOT_INODE).unwrap();
        assert_eq!(root_attr.perm, 0o755);

        // A pure-overlay subdirectory is read-only.
        let attr = do_lookup(&fx.ctx, ROOT_INODE, "plain").unwrap();
        assert_eq!(attr.perm, 0o555);
    }
}
