//! Package attribution: which installed package owns a file, and how much a
//! package weighs.
//!
//! The index is built by walking every installed-package root once. Each
//! `*.dist-info/RECORD` or `*.egg-info/installed-files.txt` manifest lists the
//! files a package owns; the package's own top-level directory is globbed as
//! well for files the manifest misses. When two packages claim the same path
//! the one indexed later wins.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::indexer::filesystem::normalize_path;

static METADATA_DIR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<name>.+?)-(?P<version>[^-]+?)(?:-py\d+(?:\.\d+)*)?\.(?:dist-info|egg-info)$",
    )
    .unwrap()
});

/// Installed distribution name and version.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageId {
    pub name: String,
    pub version: String,
}

impl PackageId {
    /// `name==version`, the unit of weight attribution.
    pub fn label(&self) -> String {
        format!("{}=={}", self.name, self.version)
    }
}

#[derive(Clone, Debug)]
pub struct InstalledPackage {
    pub id: PackageId,
    /// Normalized absolute paths of every file attributed to the package.
    pub files: BTreeSet<PathBuf>,
}

// ---------------------------------------------------------------------------
// Manifest parsing
// ---------------------------------------------------------------------------

/// First CSV field of a RECORD line, honouring double-quoted paths.
fn record_path(line: &str) -> Option<String> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return None;
    }
    if let Some(rest) = line.strip_prefix('"') {
        let mut out = String::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    out.push('"');
                } else {
                    return Some(out);
                }
            } else {
                out.push(c);
            }
        }
        None
    } else {
        Some(line.split(',').next().unwrap_or(line).to_string())
    }
}

fn read_lines(path: &Path) -> Option<Vec<String>> {
    let text = fs::read_to_string(path).ok()?;
    Some(text.lines().map(str::to_string).collect())
}

/// Files listed by the package's manifest; `None` when it has none.
fn manifest_files(root: &Path, metadata_dir: &Path) -> Option<Vec<PathBuf>> {
    if let Some(lines) = read_lines(&metadata_dir.join("RECORD")) {
        return Some(
            lines
                .iter()
                .filter_map(|line| record_path(line))
                .map(|rel| normalize_path(&root.join(rel)))
                .collect(),
        );
    }
    if let Some(lines) = read_lines(&metadata_dir.join("installed-files.txt")) {
        return Some(
            lines
                .iter()
                .map(|l| l.trim())
                .filter(|l| !l.is_empty())
                .map(|rel| normalize_path(&metadata_dir.join(rel)))
                .collect(),
        );
    }
    None
}

/// `Name:` and `Version:` headers of a METADATA / PKG-INFO file.
fn metadata_headers(metadata_dir: &Path) -> (Option<String>, Option<String>) {
    let mut name = None;
    let mut version = None;
    for file in ["METADATA", "PKG-INFO"] {
        let Some(lines) = read_lines(&metadata_dir.join(file)) else {
            continue;
        };
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some(v) = line.strip_prefix("Name:") {
                name.get_or_insert_with(|| v.trim().to_string());
            } else if let Some(v) = line.strip_prefix("Version:") {
                version.get_or_insert_with(|| v.trim().to_string());
            }
        }
    }
    (name, version)
}

fn package_id(metadata_dir: &Path) -> Option<PackageId> {
    let dir_name = metadata_dir.file_name()?.to_string_lossy().into_owned();
    let (header_name, header_version) = metadata_headers(metadata_dir);
    let caps = METADATA_DIR_RE.captures(&dir_name);
    let name = header_name.or_else(|| caps.as_ref().map(|c| c["name"].to_string()))?;
    let version = header_version
        .or_else(|| caps.as_ref().map(|c| c["version"].to_string()))
        .unwrap_or_default();
    Some(PackageId { name, version })
}

/// Top-level import names a distribution installs.
fn top_level_names(metadata_dir: &Path, id: &PackageId) -> Vec<String> {
    match read_lines(&metadata_dir.join("top_level.txt")) {
        Some(lines) => lines
            .into_iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect(),
        None => vec![id.name.replace('-', "_").to_lowercase(), id.name.replace('-', "_")],
    }
}

/// The package's own directory tree (or single module file) under `root`.
fn globbed_files(root: &Path, top_levels: &[String]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for top in top_levels {
        let dir = root.join(top);
        if dir.is_dir() {
            files.extend(
                WalkDir::new(&dir)
                    .follow_links(false)
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_file())
                    .map(|e| normalize_path(e.path())),
            );
        }
        let module = root.join(format!("{top}.py"));
        if module.is_file() {
            files.push(normalize_path(&module));
        }
    }
    files
}

fn is_metadata_dir(path: &Path) -> bool {
    path.is_dir()
        && path
            .file_name()
            .map(|n| {
                let n = n.to_string_lossy();
                n.ends_with(".dist-info") || n.ends_with(".egg-info")
            })
            .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Package index
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct PackageIndex {
    packages: Vec<InstalledPackage>,
    owners: HashMap<PathBuf, usize>,
    weights: Mutex<HashMap<usize, u64>>,
}

impl PackageIndex {
    /// Walk every root and attribute the files each installed package owns.
    pub fn build(roots: &[PathBuf]) -> Self {
        let mut index = Self::default();
        for root in roots {
            let root = normalize_path(root);
            let Ok(entries) = fs::read_dir(&root) else {
                debug!("Package root {} is not readable", root.display());
                continue;
            };
            let mut metadata_dirs: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| is_metadata_dir(p))
                .collect();
            metadata_dirs.sort();

            for metadata_dir in metadata_dirs {
                let Some(id) = package_id(&metadata_dir) else {
                    debug!("Cannot name package at {}", metadata_dir.display());
                    continue;
                };
                let mut files: BTreeSet<PathBuf> = BTreeSet::new();
                match manifest_files(&root, &metadata_dir) {
                    Some(listed) => files.extend(listed),
                    None => debug!("No manifest for {} in {}", id.label(), metadata_dir.display()),
                }
                files.extend(globbed_files(&root, &top_level_names(&metadata_dir, &id)));
                index.insert(InstalledPackage { id, files });
            }
        }
        info!(
            "Indexed {} installed packages owning {} files",
            index.packages.len(),
            index.owners.len()
        );
        index
    }

    /// Register a package; its paths overwrite any earlier owner.
    pub fn insert(&mut self, package: InstalledPackage) {
        let idx = self.packages.len();
        for path in &package.files {
            self.owners.insert(path.clone(), idx);
        }
        self.packages.push(package);
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn packages(&self) -> &[InstalledPackage] {
        &self.packages
    }

    fn owner(&self, path: &Path) -> Option<usize> {
        self.owners.get(&normalize_path(path)).copied()
    }

    /// Package owning `path`, if any.
    pub fn resolve(&self, path: &Path) -> Option<&PackageId> {
        self.owner(path).map(|idx| &self.packages[idx].id)
    }

    /// Sum of the sizes of the package's owned files that still exist.
    pub fn package_weight(&self, id: &PackageId) -> u64 {
        match self.packages.iter().rposition(|p| &p.id == id) {
            Some(idx) => self.weight_of(idx),
            None => 0,
        }
    }

    fn weight_of(&self, idx: usize) -> u64 {
        if let Some(w) = self.weights.lock().get(&idx) {
            return *w;
        }
        let weight = self.packages[idx]
            .files
            .iter()
            .filter_map(|f| fs::symlink_metadata(f).ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum();
        self.weights.lock().insert(idx, weight);
        weight
    }
}

// ---------------------------------------------------------------------------
// Weight functions
// ---------------------------------------------------------------------------

/// Weight in bytes of the package a resolved module file belongs to.
pub trait WeightFunction {
    fn weight(&self, path: &Path) -> u64;
}

/// Recursive size in bytes, not following symlinks. A file weighs its length.
pub fn tree_size(path: &Path) -> u64 {
    match fs::symlink_metadata(path) {
        Ok(m) if m.is_file() => m.len(),
        Ok(m) if m.is_dir() => WalkDir::new(path)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum(),
        _ => 0,
    }
}

/// Size of the package directory a file sits in.
///
/// The package directory is the ancestor directly under a configured root,
/// or else directly under a directory named `site-packages`/`dist-packages`.
/// A file under neither weighs nothing.
#[derive(Debug, Default)]
pub struct DirectorySize {
    roots: Vec<PathBuf>,
    sizes: Mutex<HashMap<PathBuf, u64>>,
}

impl DirectorySize {
    pub fn new(roots: &[PathBuf]) -> Self {
        Self {
            roots: roots.iter().map(|r| normalize_path(r)).collect(),
            sizes: Mutex::new(HashMap::new()),
        }
    }

    pub fn package_dir(&self, path: &Path) -> Option<PathBuf> {
        let path = normalize_path(path);
        for root in &self.roots {
            if let Ok(rel) = path.strip_prefix(root) {
                if let Some(first) = rel.components().next() {
                    return Some(root.join(first));
                }
            }
        }
        let mut current = path.as_path();
        while let Some(parent) = current.parent() {
            let parent_name = parent.file_name().map(|n| n.to_string_lossy());
            if matches!(parent_name.as_deref(), Some("site-packages") | Some("dist-packages")) {
                return Some(current.to_path_buf());
            }
            current = parent;
        }
        None
    }
}

impl WeightFunction for DirectorySize {
    fn weight(&self, path: &Path) -> u64 {
        let Some(dir) = self.package_dir(path) else {
            return 0;
        };
        if let Some(size) = self.sizes.lock().get(&dir) {
            return *size;
        }
        let size = tree_size(&dir);
        self.sizes.lock().insert(dir, size);
        size
    }
}

/// Size of the files the owning package's manifest attributes to it.
#[derive(Debug)]
pub struct ManifestSize {
    index: Arc<PackageIndex>,
}

impl ManifestSize {
    pub fn new(index: Arc<PackageIndex>) -> Self {
        Self { index }
    }
}

impl WeightFunction for ManifestSize {
    fn weight(&self, path: &Path) -> u64 {
        match self.index.owner(path) {
            Some(idx) => self.index.weight_of(idx),
            None => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
