//! Overlay semantics exercised over real temp directories, no kernel mount.
//!
//! Covers layering precedence, readdir determinism, copy-on-write isolation,
//! flush idempotence, whiteout persistence across sessions and tree-swap
//! consistency under concurrent readers.

use std::fs::{self, File};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use tempfile::TempDir;

use mo2vfs::mapping::{ExtraFile, ModLayer};
use mo2vfs::vfs::{build_tree, scan_base_dir, OverwriteManager, VfsNode, VfsTree, WHITEOUT_SUFFIX};

fn populate(dir: &Path, files: &[(&str, &str)]) {
    for (rel, content) in files {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

fn read_source(tree: &VfsTree, path: &str) -> String {
    match tree.lookup(path).expect("path present") {
        VfsNode::File { source, .. } => fs::read_to_string(source).unwrap(),
        _ => panic!("expected a file at {path}"),
    }
}

/// For paths with no collisions the mount yields exactly the union; for
/// colliding paths the highest-precedence layer wins.
#[test]
fn layering_union_and_precedence() {
    let base = TempDir::new().unwrap();
    let mod1 = TempDir::new().unwrap();
    let mod2 = TempDir::new().unwrap();
    let profile = TempDir::new().unwrap();
    let overwrite = profile.path().join("overwrite");

    populate(base.path(), &[("a.txt", "A"), ("sub/b.txt", "B")]);
    populate(mod1.path(), &[("a.txt", "M1"), ("m1only.txt", "M1")]);
    populate(mod2.path(), &[("a.txt", "M2")]);
    populate(&overwrite, &[("sub/b.txt", "O")]);

    let catalog = scan_base_dir(base.path()).unwrap();
    let mods = vec![
        ModLayer::new("M1", mod1.path()),
        ModLayer::new("M2", mod2.path()),
    ];
    let tree = build_tree(&catalog, base.path(), &mods, &overwrite, &[]);

    // Union: every distinct name appears exactly once, ordered.
    let names: Vec<&str> = tree.list_dir("").unwrap().iter().map(|(n, _)| *n).collect();
    assert_eq!(names, vec!["a.txt", "m1only.txt", "sub"]);

    // Precedence: overwrite > later mod > earlier mod > base.
    assert_eq!(read_source(&tree, "a.txt"), "M2");
    assert_eq!(read_source(&tree, "sub/b.txt"), "O");
    assert_eq!(read_source(&tree, "m1only.txt"), "M1");
}

#[test]
fn extra_file_injection_overrides_all_layers() {
    let base = TempDir::new().unwrap();
    let inject = TempDir::new().unwrap();
    populate(base.path(), &[("plugin.esp", "BASE")]);
    populate(inject.path(), &[("replacement.esp", "EXTRA")]);

    let catalog = scan_base_dir(base.path()).unwrap();
    let extras = vec![ExtraFile::new(
        "plugin.esp",
        inject.path().join("replacement.esp"),
    )];
    let tree = build_tree(&catalog, base.path(), &[], Path::new("/nonexistent"), &extras);

    assert_eq!(read_source(&tree, "plugin.esp"), "EXTRA");
}

/// Promote(staging) followed by promote(empty staging) equals one promote.
#[test]
fn flush_is_idempotent() {
    let profile = TempDir::new().unwrap();
    let manager = OverwriteManager::new(profile.path().join("overwrite"));
    manager.init().unwrap();

    manager.resolve_new("a.txt").unwrap();
    fs::write(manager.staging_path("a.txt"), "Z").unwrap();
    manager.resolve_new("sub/b.txt").unwrap();

    manager.promote().unwrap();
    let first: Vec<_> = collect_files(manager.overwrite_dir());

    manager.reset().unwrap();
    manager.promote().unwrap();
    let second: Vec<_> = collect_files(manager.overwrite_dir());

    assert_eq!(first, second);
    assert_eq!(
        fs::read_to_string(manager.overwrite_path("a.txt")).unwrap(),
        "Z"
    );
}

fn collect_files(dir: &Path) -> Vec<String> {
    let mut out = Vec::new();
    collect_into(dir, String::new(), &mut out);
    out.sort();
    out
}

fn collect_into(dir: &Path, prefix: String, out: &mut Vec<String>) {
    for entry in fs::read_dir(dir).unwrap().flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };
        if entry.path().is_dir() {
            collect_into(&entry.path(), rel, out);
        } else {
            out.push(rel);
        }
    }
}

/// COW: writes through staging never change the lower-layer file.
#[test]
fn copy_on_write_isolates_lower_layers() {
    let base = TempDir::new().unwrap();
    let profile = TempDir::new().unwrap();
    populate(base.path(), &[("a.txt", "A")]);

    let manager = OverwriteManager::new(profile.path().join("overwrite"));
    manager.init().unwrap();

    let mut source = File::open(base.path().join("a.txt")).unwrap();
    let staged = manager.resolve_write("a.txt", Some(&mut source)).unwrap();
    fs::write(&staged, "Z").unwrap();

    assert_eq!(fs::read_to_string(base.path().join("a.txt")).unwrap(), "A");

    manager.promote().unwrap();
    assert_eq!(
        fs::read_to_string(manager.overwrite_path("a.txt")).unwrap(),
        "Z"
    );
    assert_eq!(fs::read_to_string(base.path().join("a.txt")).unwrap(), "A");
}

/// A whiteout persisted in overwrite survives an unmount/remount cycle,
/// modelled here as a second tree build over the same directories.
#[test]
fn whiteout_persists_across_sessions() {
    let base = TempDir::new().unwrap();
    let profile = TempDir::new().unwrap();
    populate(base.path(), &[("a.txt", "A"), ("b.txt", "B")]);

    let overwrite = profile.path().join("overwrite");
    let manager = OverwriteManager::new(&overwrite);
    manager.init().unwrap();
    manager.write_whiteout("a.txt").unwrap();

    let catalog = scan_base_dir(base.path()).unwrap();

    // Session 1.
    let tree = build_tree(&catalog, base.path(), &[], &overwrite, &[]);
    assert!(tree.lookup("a.txt").is_none());

    // Session 2 over the same overwrite directory: still hidden.
    let tree = build_tree(&catalog, base.path(), &[], &overwrite, &[]);
    assert!(tree.lookup("a.txt").is_none());
    assert!(tree.lookup("b.txt").is_some());

    // Sentinel never leaks into the listing.
    let names: Vec<&str> = tree.list_dir("").unwrap().iter().map(|(n, _)| *n).collect();
    assert_eq!(names, vec!["b.txt"]);
    assert!(!names
        .iter()
        .any(|n| n.ends_with(WHITEOUT_SUFFIX)));
}

/// Readers under the shared lock always observe a complete tree: either the
/// old one or the new one, never a half-applied rebuild.
#[test]
fn tree_swap_is_atomic_under_concurrent_readers() {
    let base_a = TempDir::new().unwrap();
    let base_b = TempDir::new().unwrap();
    populate(base_a.path(), &[("a1.txt", "x"), ("a2.txt", "x")]);
    populate(base_b.path(), &[("b1.txt", "x"), ("b2.txt", "x")]);

    let catalog_a = scan_base_dir(base_a.path()).unwrap();
    let catalog_b = scan_base_dir(base_b.path()).unwrap();
    let none = Path::new("/nonexistent");

    let tree_a = || build_tree(&catalog_a, base_a.path(), &[], none, &[]);
    let tree_b = || build_tree(&catalog_b, base_b.path(), &[], none, &[]);

    let shared = Arc::new(RwLock::new(tree_a()));
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let shared = Arc::clone(&shared);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let tree = shared.read().unwrap();
                    let has_a = tree.lookup("a1.txt").is_some();
                    let has_a2 = tree.lookup("a2.txt").is_some();
                    let has_b = tree.lookup("b1.txt").is_some();
                    let has_b2 = tree.lookup("b2.txt").is_some();
                    drop(tree);

                    assert_eq!(has_a, has_a2, "half-applied tree A observed");
                    assert_eq!(has_b, has_b2, "half-applied tree B observed");
                    assert!(has_a ^ has_b, "mixed trees observed");
                }
            })
        })
        .collect();

    for i in 0..200 {
        let fresh = if i % 2 == 0 { tree_b() } else { tree_a() };
        *shared.write().unwrap() = fresh;
    }

    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }
}
