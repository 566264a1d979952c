//! Value types exchanged between the GUI boundary and the VFS.
//!
//! A [`MappingSet`] is what the organiser hands over: every mod file or
//! directory with the place it should appear. [`classify_mappings`] splits it
//! into the three cases the system handles differently (§ mod layers, extra
//! file injections, external symlink deployments).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// One mod directory layered into the VFS, in mod-list order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModLayer {
    /// Stable display name (the source directory's basename).
    pub name: String,
    /// Absolute path of the mod directory.
    pub path: PathBuf,
}

impl ModLayer {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        ModLayer {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// A single-file injection into the mounted namespace.
///
/// The kernel overlay works per directory entry; a file-into-directory
/// mapping must be injected as a tree leaf instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraFile {
    /// Path relative to the mount point, `/`-separated.
    pub mount_rel: String,
    /// Real source the reads are served from.
    pub source: PathBuf,
}

impl ExtraFile {
    pub fn new(mount_rel: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        ExtraFile {
            mount_rel: mount_rel.into(),
            source: source.into(),
        }
    }
}

/// One mapping from the organiser: place `source` at `destination`.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub is_directory: bool,
}

/// The full set of mappings for one profile activation.
#[derive(Debug, Clone, Default)]
pub struct MappingSet {
    pub mappings: Vec<Mapping>,
}

impl MappingSet {
    pub fn new(mappings: Vec<Mapping>) -> Self {
        MappingSet { mappings }
    }
}

/// Result of splitting a mapping set by destination.
#[derive(Debug, Default)]
pub struct ClassifiedMappings {
    /// Directory mappings into the data dir, in mapping order.
    pub mods: Vec<ModLayer>,
    /// File mappings into the data dir.
    pub extra_files: Vec<ExtraFile>,
    /// Mappings whose destination lies outside the mount point; deployed as
    /// real symlinks by the external deployer.
    pub external: Vec<Mapping>,
}

/// Split `mappings` by destination relative to the data directory.
///
/// Directory mappings targeting the data dir (or a subdirectory) become VFS
/// mod layers; the overwrite directory itself is excluded, as are duplicate
/// sources. File mappings into the data dir become extra-file injections.
/// Everything else is handed to the external deployer.
pub fn classify_mappings(
    mappings: &MappingSet,
    data_dir: &Path,
    overwrite_dir: &Path,
) -> ClassifiedMappings {
    let mut out = ClassifiedMappings::default();
    let mut seen_sources: HashSet<PathBuf> = HashSet::new();

    for mapping in &mappings.mappings {
        let inside = mapping.destination == data_dir || mapping.destination.starts_with(data_dir);

        if !inside {
            out.external.push(mapping.clone());
            continue;
        }

        if mapping.is_directory {
            if mapping.source == overwrite_dir || mapping.source.starts_with(overwrite_dir) {
                continue;
            }
            if !seen_sources.insert(mapping.source.clone()) {
                continue;
            }

            let name = mapping
                .source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            out.mods.push(ModLayer::new(name, mapping.source.clone()));
        } else if let Ok(rel) = mapping.destination.strip_prefix(data_dir) {
            let rel = rel.to_string_lossy().replace('\\', "/");
            if !rel.is_empty() {
                out.extra_files
                    .push(ExtraFile::new(rel, mapping.source.clone()));
            }
        }
    }

    out
}
