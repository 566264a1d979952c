//! Stable mapping between kernel inode numbers and tree paths.
//!
//! Inodes are allocated from a monotonically increasing counter on first
//! lookup and stay alive while the kernel holds references (`lookup_count`).
//! The root reserves inode 1 and is never collected.

use std::collections::HashMap;

/// The reserved root inode.
pub const ROOT_INODE: u64 = 1;

struct InodeEntry {
    path: String,
    lookup_count: u64,
}

/// Bijection between kernel-visible inode numbers and mount-relative paths.
pub struct InodeTable {
    by_path: HashMap<String, u64>,
    by_inode: HashMap<u64, InodeEntry>,
    next_inode: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = InodeTable {
            by_path: HashMap::new(),
            by_inode: HashMap::new(),
            next_inode: ROOT_INODE + 1,
        };
        table.by_path.insert(String::new(), ROOT_INODE);
        table.by_inode.insert(
            ROOT_INODE,
            InodeEntry {
                path: String::new(),
                lookup_count: 1,
            },
        );
        table
    }

    /// Inode for `path`, allocating on first use, with the kernel reference
    /// count incremented. Called from `lookup` (and `create`/`mkdir`, which
    /// imply a lookup).
    pub fn allocate_or_reuse(&mut self, path: &str) -> u64 {
        let ino = self.inode_for(path);
        if ino != ROOT_INODE {
            if let Some(entry) = self.by_inode.get_mut(&ino) {
                entry.lookup_count += 1;
            }
        }
        ino
    }

    /// Inode for `path` without taking a kernel reference. Used by `readdir`,
    /// which reports inode numbers but does not pin entries.
    pub fn peek_or_allocate(&mut self, path: &str) -> u64 {
        self.inode_for(path)
    }

    fn inode_for(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            return ino;
        }

        let ino = self.next_inode;
        self.next_inode += 1;
        self.by_path.insert(path.to_string(), ino);
        self.by_inode.insert(
            ino,
            InodeEntry {
                path: path.to_string(),
                lookup_count: 0,
            },
        );
        ino
    }

    /// The path an inode maps to, if known.
    pub fn resolve(&self, inode: u64) -> Option<&str> {
        self.by_inode.get(&inode).map(|e| e.path.as_str())
    }

    /// Kernel forget: drop `n` references; collect the entry when this call
    /// drives a positive count to zero.
    ///
    /// Entries that were never pinned (readdir-only allocations with a zero
    /// count) are left alone: a no-op forget must not destroy them.
    pub fn forget(&mut self, inode: u64, n: u64) {
        if inode == ROOT_INODE || n == 0 {
            return;
        }
        let Some(entry) = self.by_inode.get_mut(&inode) else {
            return;
        };
        if entry.lookup_count == 0 {
            return;
        }
        entry.lookup_count = entry.lookup_count.saturating_sub(n);
        if entry.lookup_count == 0 {
            let path = entry.path.clone();
            self.by_inode.remove(&inode);
            self.by_path.remove(&path);
        }
    }

    /// Repoint an inode at a new path after a rename, keeping the number
    /// stable for open handles.
    pub fn rename(&mut self, old_path: &str, new_path: &str) {
        if old_path == new_path {
            return;
        }
        let Some(ino) = self.by_path.remove(old_path) else {
            return;
        };
        // The destination may already hold a (forgotten-about) inode; the
        // renamed entry takes the name over.
        if let Some(previous) = self.by_path.insert(new_path.to_string(), ino) {
            self.by_inode.remove(&previous);
        }
        if let Some(entry) = self.by_inode.get_mut(&ino) {
            entry.path = new_path.to_string();
        }
    }

    /// Number of live entries, root included.
    pub fn len(&self) -> usize {
        self.by_inode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_inode.is_empty()
    }
}
