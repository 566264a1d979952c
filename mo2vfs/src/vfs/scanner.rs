//! One-shot scan of the base game directory.
//!
//! The scan must run before the FUSE mount is established: the mount point
//! equals the data directory, so once mounted the real files are occluded.
//! The resulting catalog is immutable and cached for the lifetime of the
//! process keyed on the base path, because the base is assumed not to change
//! while the manager runs.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{debug, warn};

/// Kind of a catalogued base entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// A single entry of the base catalog.
#[derive(Debug, Clone)]
pub struct BaseEntry {
    pub kind: EntryKind,
    pub size: u64,
}

/// Immutable catalog of the base game directory.
///
/// Keys are paths relative to the base directory using `/` separators.
#[derive(Debug, Default)]
pub struct BaseCatalog {
    entries: BTreeMap<String, BaseEntry>,
}

impl BaseCatalog {
    /// Iterate over `(relative_path, entry)` pairs in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BaseEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Whether the catalog contains `relative_path`.
    pub fn contains(&self, relative_path: &str) -> bool {
        self.entries.contains_key(relative_path)
    }

    /// Number of catalogued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Recursively scan `base_dir` into a fresh catalog.
///
/// Unreadable subdirectories are skipped with a warning; a partial catalog is
/// valid. A missing base directory is fatal.
pub fn scan_base_dir(base_dir: &Path) -> io::Result<BaseCatalog> {
    if !base_dir.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("base directory does not exist: {}", base_dir.display()),
        ));
    }

    let mut catalog = BaseCatalog::default();
    scan_into(base_dir, String::new(), &mut catalog);
    debug!(
        entries = catalog.len(),
        base = %base_dir.display(),
        "base directory scanned"
    );
    Ok(catalog)
}

fn scan_into(dir: &Path, prefix: String, catalog: &mut BaseCatalog) {
    let reader = match fs::read_dir(dir) {
        Ok(r) => r,
        Err(e) => {
            warn!("skipping unreadable directory {}: {}", dir.display(), e);
            return;
        }
    };

    for entry in reader.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };

        let meta = match entry.path().symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!("skipping unreadable entry {}: {}", rel, e);
                continue;
            }
        };

        if meta.is_dir() {
            catalog.entries.insert(
                rel.clone(),
                BaseEntry {
                    kind: EntryKind::Directory,
                    size: 0,
                },
            );
            scan_into(&entry.path(), rel, catalog);
        } else if meta.file_type().is_symlink() {
            catalog.entries.insert(
                rel,
                BaseEntry {
                    kind: EntryKind::Symlink,
                    size: meta.len(),
                },
            );
        } else if meta.is_file() {
            catalog.entries.insert(
                rel,
                BaseEntry {
                    kind: EntryKind::File,
                    size: meta.len(),
                },
            );
        }
    }
}

fn catalog_cache() -> &'static Mutex<BTreeMap<PathBuf, Arc<BaseCatalog>>> {
    static CACHE: OnceLock<Mutex<BTreeMap<PathBuf, Arc<BaseCatalog>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(BTreeMap::new()))
}

/// Return the cached catalog for `base_dir`, scanning it on first use.
///
/// The cache lives for the process lifetime so remounts of the same base path
/// skip the scan; the base is occluded by the mount and cannot be rescanned
/// while a session is active anyway.
pub fn cached_catalog(base_dir: &Path) -> io::Result<Arc<BaseCatalog>> {
    let mut cache = catalog_cache().lock().unwrap();
    if let Some(catalog) = cache.get(base_dir) {
        return Ok(Arc::clone(catalog));
    }

    let catalog = Arc::new(scan_base_dir(base_dir)?);
    cache.insert(base_dir.to_path_buf(), Arc::clone(&catalog));
    Ok(catalog)
}
