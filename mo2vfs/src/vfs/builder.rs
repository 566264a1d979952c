//! Construction of a [`VfsTree`] from its four layers.
//!
//! Pure with respect to the tree: the same catalog, mod list, overwrite
//! contents and extra files always produce the same tree. Layering follows
//! last-writer-wins: base, then mods in order, then overwrite, with extra
//! files applied as the final override.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::mapping::{ExtraFile, ModLayer};

use super::scanner::{BaseCatalog, EntryKind};
use super::tree::{FileOrigin, VfsTree, WHITEOUT_SUFFIX};

/// Build a fresh tree from the base catalog, the ordered mod list, the
/// overwrite directory and the extra-file injections.
///
/// File nodes whose source does not exist at build time are never created:
/// the catalog was scanned from disk, mods and overwrite are walked live, and
/// missing extra sources are dropped with a warning.
pub fn build_tree(
    catalog: &BaseCatalog,
    base_dir: &Path,
    mods: &[ModLayer],
    overwrite_dir: &Path,
    extra_files: &[ExtraFile],
) -> VfsTree {
    let mut tree = VfsTree::new();

    for (rel, entry) in catalog.iter() {
        match entry.kind {
            EntryKind::Directory => tree.insert_dir(rel),
            EntryKind::File | EntryKind::Symlink => {
                tree.insert_file(rel, base_dir.join(rel), FileOrigin::Base)
            }
        }
    }

    for (index, layer) in mods.iter().enumerate() {
        if !layer.path.is_dir() {
            warn!(mod_name = %layer.name, path = %layer.path.display(), "mod directory missing, skipped");
            continue;
        }
        walk_layer(&layer.path, String::new(), &mut tree, FileOrigin::Mod(index));
    }

    let mut whiteouts = Vec::new();
    if overwrite_dir.is_dir() {
        walk_overwrite(overwrite_dir, String::new(), &mut tree, &mut whiteouts);
    }

    // Sentinels hide lower layers only; a real overwrite file at the same
    // path has already replaced the node and wins.
    for rel in whiteouts {
        let lower = match tree.resolve(&rel) {
            None => true,
            Some(node) => matches!(
                node,
                super::tree::VfsNode::File {
                    origin: FileOrigin::Base | FileOrigin::Mod(_),
                    ..
                }
            ),
        };
        if lower {
            tree.insert_whiteout(&rel);
        }
    }

    for extra in extra_files {
        if !extra.source.is_file() {
            warn!(
                rel = %extra.mount_rel,
                source = %extra.source.display(),
                "extra file source missing, skipped"
            );
            continue;
        }
        tree.insert_file(&extra.mount_rel, extra.source.clone(), FileOrigin::Extra);
    }

    debug!(
        mods = mods.len(),
        extras = extra_files.len(),
        "VFS tree built"
    );
    tree
}

fn walk_layer(dir: &Path, prefix: String, tree: &mut VfsTree, origin: FileOrigin) {
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

        let Ok(meta) = entry.path().symlink_metadata() else {
            continue;
        };

        if meta.is_dir() {
            tree.insert_dir(&rel);
            walk_layer(&entry.path(), rel, tree, origin);
        } else {
            tree.insert_file(&rel, entry.path(), origin);
        }
    }
}

fn walk_overwrite(dir: &Path, prefix: String, tree: &mut VfsTree, whiteouts: &mut Vec<String>) {
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
            name.clone()
        } else {
            format!("{}/{}", prefix, name)
        };

        let Ok(meta) = entry.path().symlink_metadata() else {
            continue;
        };

        if meta.is_dir() {
            tree.insert_dir(&rel);
            walk_overwrite(&entry.path(), rel, tree, whiteouts);
        } else if let Some(target) = name.strip_suffix(WHITEOUT_SUFFIX) {
            if !target.is_empty() {
                let target_rel = if prefix.is_empty() {
                    target.to_string()
                } else {
                    format!("{}/{}", prefix, target)
                };
                whiteouts.push(target_rel);
            }
        } else {
            tree.insert_file(&rel, entry.path(), FileOrigin::Overwrite);
        }
    }
}
