//! Scan orchestration with Rayon-based parallelism.
//!
//! Files are read and parsed in parallel, stored one transaction per file in
//! a stable order, and every import node that has never been executed is then
//! handed to the resolver.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::CohesionConfig;
use crate::errors::CohesionResult;
use crate::indexer::filesystem::{absolute_path, has_source_extension, iter_source_files};
use crate::indexer::imports::ImportStatement;
use crate::indexer::resolver::{DependencyResolver, ExclusionPredicate, ModuleFilter, SubprocessProbe};
use crate::indexer::scanner::{extract_import_statements, scan_source, ScanResult};
use crate::models::ResolutionOutcome;
use crate::store::database::Database;

/// Counters of one scan run.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ScanStats {
    pub files_seen: i64,
    pub files_scanned: i64,
    /// Files already recorded by an earlier run.
    pub duplicate_files: i64,
    /// Unreadable or non-UTF-8 files.
    pub failed_files: i64,
    pub definitions: i64,
    pub new_imports: i64,
    pub imports_resolved: i64,
    pub imports_failed: i64,
    pub transitive_records: i64,
    /// File path -> names imported but never referenced.
    pub unused_imports: BTreeMap<String, Vec<String>>,
    pub elapsed_ms: i64,
}

// ---------------------------------------------------------------------------
// Parallel read + parse
// ---------------------------------------------------------------------------

/// Result of reading and scanning one file on a worker thread.
pub struct FileScan {
    pub path: PathBuf,
    pub result: Result<ScanResult, String>,
}

fn read_source(path: &Path) -> Result<String, String> {
    let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
    String::from_utf8(bytes).map_err(|_| "not valid UTF-8".to_string())
}

fn scan_file_worker(path: &Path) -> FileScan {
    let result = read_source(path).and_then(|source| {
        scan_source(&source, &path.to_string_lossy()).map_err(|e| e.to_string())
    });
    FileScan {
        path: path.to_path_buf(),
        result,
    }
}

/// Read and scan `files` on up to `workers` threads, preserving input order.
pub fn parallel_scan(files: &[PathBuf], workers: usize) -> Vec<FileScan> {
    if files.is_empty() {
        return vec![];
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build();

    match pool {
        Ok(pool) => pool.install(|| files.par_iter().map(|p| scan_file_worker(p)).collect()),
        Err(e) => {
            warn!("Falling back to sequential scanning: {e}");
            files.iter().map(|p| scan_file_worker(p)).collect()
        }
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

fn persist_outcomes(
    db: &Database,
    outcomes: &[(String, ResolutionOutcome)],
    stats: &mut ScanStats,
) -> CohesionResult<()> {
    for (code, outcome) in outcomes {
        let added = db.record_resolution(code, outcome)?;
        stats.transitive_records += added as i64;
        match outcome {
            ResolutionOutcome::Resolved(_) => stats.imports_resolved += 1,
            ResolutionOutcome::Failed(_) => stats.imports_failed += 1,
        }
    }
    Ok(())
}

/// Execute every stored import node that has not been attempted yet.
pub fn resolve_pending(
    db: &Database,
    resolver: &DependencyResolver,
    stats: &mut ScanStats,
) -> CohesionResult<Vec<(String, ResolutionOutcome)>> {
    let pending = db.pending_imports()?;
    if pending.is_empty() {
        return Ok(Vec::new());
    }
    info!(
        "Resolving {} import nodes with up to {} workers",
        pending.len(),
        resolver.concurrency()
    );
    let outcomes = resolver.resolve_all(&pending);
    persist_outcomes(db, &outcomes, stats)?;
    Ok(outcomes)
}

fn is_installed_package_path(path: &Path) -> bool {
    path.components().any(|c| {
        let name = c.as_os_str();
        name == "site-packages" || name == "dist-packages"
    })
}

/// Local source file a resolved from-import's module was loaded from.
fn local_module_source(db: &Database, code: &str, extensions: &[String]) -> Option<(String, String)> {
    let statement = ImportStatement::from_canonical(code).ok()?;
    let module = statement.absolute_from_module()?;
    let path = db.path_for_module(module).ok()??;
    let file = PathBuf::from(&path);
    if is_installed_package_path(&file) || !has_source_extension(&file, extensions) {
        return None;
    }
    match read_source(&file) {
        Ok(source) => Some((path, source)),
        Err(e) => {
            debug!("Not following {module}: {path} is unreadable ({e})");
            None
        }
    }
}

/// Breadth-first walk into the absolute from-imports of local modules that
/// resolved from-import nodes loaded, registering and resolving each new
/// node at most once. Modules installed under `site-packages` are not local.
fn follow_local_imports(
    db: &Database,
    resolver: &DependencyResolver,
    config: &CohesionConfig,
    seeds: Vec<String>,
    stats: &mut ScanStats,
) -> CohesionResult<()> {
    let mut visited: HashSet<String> = seeds.iter().cloned().collect();
    let mut expanded_files: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = seeds.into();

    while !queue.is_empty() {
        let mut discovered = Vec::new();
        while let Some(code) = queue.pop_front() {
            let Some((path, source)) = local_module_source(db, &code, &config.extensions) else {
                continue;
            };
            if !expanded_files.insert(path.clone()) {
                continue;
            }
            let entries = match extract_import_statements(&source, &path) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Not following imports of {path}: {e}");
                    continue;
                }
            };
            for entry in entries {
                if entry.statement.absolute_from_module().is_none() {
                    continue;
                }
                let child = entry.code_str();
                if !visited.insert(child.clone()) {
                    continue;
                }
                if db.register_import(&child)? {
                    stats.new_imports += 1;
                    debug!("Following {child:?} from {path}");
                    discovered.push(child);
                }
            }
        }
        if discovered.is_empty() {
            break;
        }
        let outcomes = resolver.resolve_all(&discovered);
        persist_outcomes(db, &outcomes, stats)?;
        queue.extend(
            outcomes
                .into_iter()
                .filter(|(_, outcome)| matches!(outcome, ResolutionOutcome::Resolved(_)))
                .map(|(code, _)| code),
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Scan every source file under `root`, store the structure and resolve
/// newly discovered import nodes.
pub fn scan_directory(
    db: &Database,
    root: &Path,
    resolver: &DependencyResolver,
    config: &CohesionConfig,
) -> CohesionResult<ScanStats> {
    let started = Instant::now();
    let root = absolute_path(root);
    let files = iter_source_files(&root, &config.extensions, &config.exclude_dirs);
    let mut stats = ScanStats {
        files_seen: files.len() as i64,
        ..ScanStats::default()
    };

    for scan in parallel_scan(&files, config.concurrency) {
        let result = match scan.result {
            Ok(result) => result,
            Err(e) => {
                warn!("Skipping {}: {e}", scan.path.display());
                stats.failed_files += 1;
                continue;
            }
        };
        if result.has_syntax_errors {
            debug!("{} has syntax errors; scanning what parsed", result.file_path);
        }
        match db.record_file_scan(&result) {
            Ok(ingest) => {
                stats.files_scanned += 1;
                stats.definitions += ingest.definition_ids.len() as i64;
                stats.new_imports += ingest.new_imports.len() as i64;
                if !result.unused_imports.is_empty() {
                    stats
                        .unused_imports
                        .insert(result.file_path.clone(), result.unused_imports.clone());
                }
            }
            Err(e) if e.is_duplicate() => {
                debug!("Skipping {}: already scanned", result.file_path);
                stats.duplicate_files += 1;
            }
            Err(e) => return Err(e),
        }
    }

    let outcomes = resolve_pending(db, resolver, &mut stats)?;

    if config.follow_local_imports {
        let seeds = outcomes
            .into_iter()
            .filter(|(_, outcome)| matches!(outcome, ResolutionOutcome::Resolved(_)))
            .map(|(code, _)| code)
            .collect();
        follow_local_imports(db, resolver, config, seeds, &mut stats)?;
    }

    stats.elapsed_ms = started.elapsed().as_millis() as i64;
    info!(
        "Scanned {} of {} files under {}: {} definitions, {} new import nodes \
         ({} resolved, {} failed) in {}ms",
        stats.files_scanned,
        stats.files_seen,
        root.display(),
        stats.definitions,
        stats.new_imports,
        stats.imports_resolved,
        stats.imports_failed,
        stats.elapsed_ms
    );
    Ok(stats)
}

/// [`scan_directory`] with a subprocess resolver whose workers run in `root`.
pub fn scan_path(
    db: &Database,
    root: &Path,
    config: &CohesionConfig,
    predicate: Option<Arc<ExclusionPredicate>>,
) -> CohesionResult<ScanStats> {
    let root = absolute_path(root);
    let cwd = if root.is_dir() {
        root.clone()
    } else {
        root.parent().map(Path::to_path_buf).unwrap_or_else(|| root.clone())
    };
    let mut filter = ModuleFilter::from_config(config);
    if let Some(predicate) = predicate {
        filter = filter.with_predicate(predicate);
    }
    let resolver = DependencyResolver::new(
        Box::new(SubprocessProbe::from_config(config, Some(cwd))),
        filter,
        config.concurrency,
    );
    scan_directory(db, &root, &resolver, config)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::resolver::tests::FakeProbe;
    use crate::models::ResolutionStatus;

    fn fake_resolver(probe: FakeProbe) -> DependencyResolver {
        DependencyResolver::new(Box::new(probe), ModuleFilter::new(Vec::new()), 2)
    }

    fn write(root: &Path, rel: &str, text: &str) -> String {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, text).unwrap();
        absolute_path(&path).to_string_lossy().into_owned()
    }

    fn setup() -> (tempfile::TempDir, PathBuf, Database) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("project");
        std::fs::create_dir_all(&root).unwrap();
        let db = Database::open(dir.path().join("graph.db")).unwrap();
        (dir, root, db)
    }

    #[test]
    fn test_scan_directory_stores_and_resolves() {
        let (_dir, root, db) = setup();
        let a = write(
            &root,
            "pkg/a.py",
            "import numpy\nimport broken\n\ndef f():\n    return numpy.ones(2)\n\ndef g():\n    return 0\n",
        );
        write(&root, "pkg/b.py", "import numpy\n");
        write(&root, "pkg/readme.txt", "import nothing\n");

        let resolver = fake_resolver(FakeProbe::new(&[(
            "import numpy",
            &[("numpy", Some("/sp/numpy/__init__.py"), Some("1.26.0"))],
        )]));
        let stats = scan_directory(&db, &root, &resolver, &CohesionConfig::default()).unwrap();

        assert_eq!(stats.files_seen, 2);
        assert_eq!(stats.files_scanned, 2);
        assert_eq!(stats.definitions, 2);
        assert_eq!(stats.new_imports, 2);
        assert_eq!(stats.imports_resolved, 1);
        assert_eq!(stats.imports_failed, 1);
        assert_eq!(stats.transitive_records, 1);
        assert_eq!(stats.unused_imports.get(&a), Some(&vec!["broken".to_string()]));

        assert_eq!(db.imports().unwrap(), vec!["import numpy", "import broken"]);
        assert_eq!(db.file_import_edges().unwrap().len(), 3);
        assert_eq!(
            db.import_status("import broken").unwrap(),
            Some(ResolutionStatus::Failed)
        );
        assert!(db.pending_imports().unwrap().is_empty());
    }

    #[test]
    fn test_rescan_skips_known_files_and_nodes() {
        let (_dir, root, db) = setup();
        write(&root, "a.py", "import numpy\n");
        let resolver = fake_resolver(FakeProbe::new(&[("import numpy", &[("numpy", None, None)])]));
        scan_directory(&db, &root, &resolver, &CohesionConfig::default()).unwrap();

        write(&root, "b.py", "import numpy\nimport json\n");
        let again = fake_resolver(FakeProbe::new(&[("import json", &[])]));
        let stats = scan_directory(&db, &root, &again, &CohesionConfig::default()).unwrap();
        assert_eq!(stats.duplicate_files, 1);
        assert_eq!(stats.files_scanned, 1);
        assert_eq!(stats.new_imports, 1);
        // Only the new node was executed.
        assert_eq!(stats.imports_resolved, 1);
        assert_eq!(stats.imports_failed, 0);
    }

    #[test]
    fn test_non_utf8_file_is_skipped() {
        let (_dir, root, db) = setup();
        std::fs::write(root.join("latin.py"), [0x69, 0x6d, 0xff, 0xfe, 0x0a]).unwrap();
        write(&root, "ok.py", "def f():\n    pass\n");
        let resolver = fake_resolver(FakeProbe::new(&[]));
        let stats = scan_directory(&db, &root, &resolver, &CohesionConfig::default()).unwrap();
        assert_eq!(stats.failed_files, 1);
        assert_eq!(stats.files_scanned, 1);
    }

    #[test]
    fn test_follow_local_imports_walks_absolute_from_imports() {
        let (_dir, root, db) = setup();
        let helpers = write(
            &root,
            "lib/helpers.py",
            "from lib.deep import thing\nfrom . import sibling\nimport os\n",
        );
        let app = root.join("app");
        write(&app, "main.py", "from lib.helpers import tool\n");

        let probe = FakeProbe::new(&[
            (
                "from lib.helpers import tool",
                &[
                    ("lib", None, None),
                    ("lib.helpers", Some(helpers.as_str()), None),
                ],
            ),
            ("from lib.deep import thing", &[("lib.deep", None, None)]),
        ]);
        let resolver = fake_resolver(probe);
        let config = CohesionConfig {
            follow_local_imports: true,
            ..CohesionConfig::default()
        };
        let stats = scan_directory(&db, &app, &resolver, &config).unwrap();

        assert_eq!(
            db.imports().unwrap(),
            vec!["from lib.helpers import tool", "from lib.deep import thing"]
        );
        assert_eq!(stats.new_imports, 2);
        assert_eq!(stats.imports_resolved, 2);
        assert_eq!(db.records_for_import("from lib.deep import thing").unwrap().len(), 1);
        // The followed node belongs to no scanned file.
        assert_eq!(db.file_import_edges().unwrap().len(), 1);
    }
}
