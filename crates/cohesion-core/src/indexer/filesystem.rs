//! Filesystem scanning helpers for the scan entry point.

use std::path::{Path, PathBuf};

use walkdir::{DirEntry, WalkDir};

/// Directories never descended into, on top of the configured excludes.
const IMPLICIT_IGNORED_DIRS: &[&str] = &[".git", ".hg", ".svn"];

/// True when `path` carries one of `extensions` (given without the dot).
pub fn has_source_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension() else {
        return false;
    };
    let ext = ext.to_string_lossy().to_lowercase();
    extensions
        .iter()
        .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(&ext))
}

fn is_excluded_dir(entry: &DirEntry, exclude_dirs: &[String]) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    IMPLICIT_IGNORED_DIRS.iter().any(|d| *d == name) || exclude_dirs.iter().any(|d| *d == name)
}

/// Every source file under `root`, recursively, sorted for a stable scan order.
///
/// A single file path is accepted too and returned as-is when it matches.
pub fn iter_source_files(root: &Path, extensions: &[String], exclude_dirs: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_excluded_dir(entry, exclude_dirs))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(DirEntry::into_path)
        .filter(|path| has_source_extension(path, extensions))
        .collect();
    result.sort();
    result
}

/// Absolute, lexically normalized form of `path` (no filesystem access
/// beyond the current directory).
pub fn absolute_path(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };
    normalize_path(&joined)
}

/// Resolve `.` and `..` components without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut stack: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match stack.last() {
                Some(Component::Normal(_)) => {
                    stack.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => stack.push(component),
            },
            other => stack.push(other),
        }
    }
    stack.iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exts() -> Vec<String> {
        vec!["py".to_string()]
    }

    #[test]
    fn test_has_source_extension() {
        assert!(has_source_extension(Path::new("a/b.py"), &exts()));
        assert!(has_source_extension(Path::new("a/B.PY"), &exts()));
        assert!(!has_source_extension(Path::new("a/b.pyc"), &exts()));
        assert!(!has_source_extension(Path::new("Makefile"), &exts()));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path(Path::new("/usr/lib/python3/site-packages/../../x/./y.py")),
            PathBuf::from("/usr/lib/x/y.py")
        );
        assert_eq!(normalize_path(Path::new("/../a")), PathBuf::from("/a"));
    }

    #[test]
    fn test_iter_source_files_skips_excluded_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("pkg/sub")).unwrap();
        std::fs::create_dir_all(root.join(".venv/lib")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join("pkg/a.py"), "").unwrap();
        std::fs::write(root.join("pkg/sub/b.py"), "").unwrap();
        std::fs::write(root.join("pkg/notes.txt"), "").unwrap();
        std::fs::write(root.join(".venv/lib/c.py"), "").unwrap();
        std::fs::write(root.join(".git/d.py"), "").unwrap();

        let files = iter_source_files(root, &exts(), &[".venv".to_string()]);
        let rel: Vec<String> = files
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(rel, vec!["pkg/a.py", "pkg/sub/b.py"]);
    }
}
