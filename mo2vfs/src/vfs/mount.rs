//! Mount-point lifecycle: stale-mount detection and recovery, session
//! creation, and the crash-cleanup mount-point buffer.
//!
//! A crashed session leaves a dead FUSE mount behind: the kernel mount table
//! still lists the target, and stat on it fails with `ENOTCONN`. Both signals
//! are probed before mounting; recovery escalates from a graceful
//! `fusermount -u` through force and lazy variants.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use fuser::{BackgroundSession, MountOption};
use tracing::{debug, error, info, warn};

use super::error::{MountError, MountResult};
use super::fs::OverlayFs;

/// fsname shown in the mount table.
const FSNAME: &str = "mo2linux";

/// Bounded wait for one unmount tool invocation.
const UNMOUNT_TOOL_TIMEOUT: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Crash-cleanup buffer
// ---------------------------------------------------------------------------

const CRASH_BUF_LEN: usize = 4096;

/// NUL-terminated mount-point path for the crash handler. Written on mount,
/// cleared on unmount; a signal handler reads it byte-wise without locking
/// or allocating.
static CRASH_MOUNT_POINT: [AtomicU8; CRASH_BUF_LEN] = [const { AtomicU8::new(0) }; CRASH_BUF_LEN];

/// Publish (or clear, with `None`) the mount point for emergency cleanup.
pub fn set_crash_mount_point(path: Option<&Path>) {
    let bytes = path
        .map(|p| p.as_os_str().as_encoded_bytes())
        .unwrap_or_default();
    let len = bytes.len().min(CRASH_BUF_LEN - 1);
    for (i, slot) in CRASH_MOUNT_POINT.iter().enumerate() {
        let value = if i < len { bytes[i] } else { 0 };
        slot.store(value, Ordering::Relaxed);
    }
}

/// Copy the published mount point into `out` without allocating; returns the
/// number of bytes written (0 when no mount is active). Async-signal-safe.
pub fn crash_mount_point_raw(out: &mut [u8]) -> usize {
    let mut n = 0;
    for (i, slot) in CRASH_MOUNT_POINT.iter().enumerate() {
        if i >= out.len() {
            break;
        }
        let byte = slot.load(Ordering::Relaxed);
        if byte == 0 {
            break;
        }
        out[i] = byte;
        n += 1;
    }
    n
}

/// Convenience accessor for non-signal contexts.
pub fn crash_mount_point() -> Option<PathBuf> {
    let mut buf = [0u8; CRASH_BUF_LEN];
    let n = crash_mount_point_raw(&mut buf);
    if n == 0 {
        return None;
    }
    Some(PathBuf::from(String::from_utf8_lossy(&buf[..n]).into_owned()))
}

// ---------------------------------------------------------------------------
// Stale-mount detection
// ---------------------------------------------------------------------------

/// Decode a `/proc/mounts` field: spaces and other specials are escaped as
/// 3-digit octal sequences (`\040`).
pub fn decode_proc_mounts_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let oct = &field[i + 1..i + 4];
            if oct.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
                if let Ok(value) = u8::from_str_radix(oct, 8) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn normalize(path: &Path) -> PathBuf {
    path.components().collect()
}

/// Whether the kernel mount table lists `path` as a mount point.
pub fn is_mount_point(path: &Path) -> bool {
    let Ok(mounts) = fs::read_to_string("/proc/mounts") else {
        return false;
    };

    let target = normalize(path);
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_device), Some(mountpoint)) = (fields.next(), fields.next()) else {
            continue;
        };
        let decoded = decode_proc_mounts_field(mountpoint);
        if normalize(Path::new(&decoded)) == target {
            return true;
        }
    }
    false
}

/// Whether `path` is mounted or a dead overlay from a crashed session.
///
/// The direct stat probe catches mounts that `/proc/mounts` lists under a
/// different (canonical) path: `ENOTCONN` means the FUSE daemon is gone but
/// the mount is still installed.
pub fn is_stale_or_mounted(path: &Path) -> bool {
    if is_mount_point(path) {
        return true;
    }
    matches!(
        fs::metadata(path),
        Err(ref e) if e.raw_os_error() == Some(libc::ENOTCONN)
    )
}

fn run_unmount_tool(program: &str, args: &[&str]) -> bool {
    let mut child = match Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(_) => return false,
    };

    let deadline = Instant::now() + UNMOUNT_TOOL_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return status.success(),
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return false;
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(_) => return false,
        }
    }
}

/// Clear a stale mount from `path`, escalating from graceful to lazy.
///
/// No-op when the target is clean. Fails fast when every variant leaves the
/// target stale.
pub fn cleanup_stale_mount(path: &Path) -> MountResult<()> {
    if !is_stale_or_mounted(path) {
        return Ok(());
    }

    warn!("stale FUSE mount detected at '{}'", path.display());
    let target = path.to_string_lossy();

    if run_unmount_tool("fusermount3", &["-u", &target])
        || run_unmount_tool("fusermount", &["-u", &target])
    {
        info!("stale mount at '{}' cleaned up", path.display());
        return Ok(());
    }

    // Graceful unmount failed; try force and lazy variants in sequence.
    run_unmount_tool("umount", &[&target]);
    run_unmount_tool("umount", &["-l", &target]);
    run_unmount_tool("fusermount3", &["-uz", &target]);
    run_unmount_tool("fusermount", &["-uz", &target]);

    if is_stale_or_mounted(path) {
        error!("failed to clean up stale mount at '{}'", path.display());
        return Err(MountError::StaleMount(path.to_path_buf()));
    }

    info!("stale mount at '{}' cleaned up (lazy unmount)", path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A live FUSE session with its event loop running on a background thread.
///
/// Dropping the session unmounts; [`MountSession::unmount`] does so
/// explicitly and joins the loop thread.
pub struct MountSession {
    session: Option<BackgroundSession>,
    mountpoint: PathBuf,
}

impl MountSession {
    /// Create the session, mount at `mountpoint` and start the event loop.
    ///
    /// The fixed option set matches the profile the game runs against:
    /// `fsname=mo2linux`, `default_permissions`, `noatime`.
    pub fn mount(fs: OverlayFs, mountpoint: &Path) -> MountResult<Self> {
        let options = [
            MountOption::FSName(FSNAME.to_string()),
            MountOption::DefaultPermissions,
            MountOption::NoAtime,
        ];

        let session =
            fuser::spawn_mount2(fs, mountpoint, &options).map_err(|source| {
                MountError::MountFailed {
                    mountpoint: mountpoint.to_path_buf(),
                    source,
                }
            })?;

        set_crash_mount_point(Some(mountpoint));
        debug!("FUSE mounted on '{}'", mountpoint.display());
        Ok(MountSession {
            session: Some(session),
            mountpoint: mountpoint.to_path_buf(),
        })
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Signal the event loop to exit, unmount and join the loop thread.
    pub fn unmount(mut self) {
        if let Some(session) = self.session.take() {
            session.join();
        }
        set_crash_mount_point(None);
        debug!("FUSE unmounted from '{}'", self.mountpoint.display());
    }
}

impl Drop for MountSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            drop(session);
            set_crash_mount_point(None);
        }
    }
}
