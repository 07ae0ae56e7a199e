//! Transitive module discovery for import nodes.
//!
//! An import node's statement is executed on its own inside a fresh worker
//! process. The worker snapshots `sys.modules` before and after and reports
//! both; every module that appeared in between, minus the excluded ones,
//! becomes a [`TransitiveImportRecord`] of that node.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::CohesionConfig;
use crate::errors::{CohesionError, CohesionResult};
use crate::indexer::worker::{marked_payload, run_python};
use crate::models::{root_label, ResolutionOutcome, TransitiveImportRecord};

// ---------------------------------------------------------------------------
// Registry snapshots
// ---------------------------------------------------------------------------

/// A module present in the worker's registry after execution.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct LoadedModule {
    pub name: String,
    pub file: Option<String>,
    pub version: Option<String>,
}

/// Before/after view of the module registry around one isolated statement.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RegistryDiff {
    pub before: HashSet<String>,
    pub after: Vec<LoadedModule>,
    #[serde(default)]
    pub builtin_names: HashSet<String>,
    #[serde(default)]
    pub stdlib_names: HashSet<String>,
}

impl RegistryDiff {
    /// Modules present after execution but not before.
    pub fn new_modules(&self) -> impl Iterator<Item = &LoadedModule> {
        self.after
            .iter()
            .filter(move |m| !self.before.contains(&m.name))
    }
}

/// Capability to run one import statement in isolation and diff the registry.
pub trait ModuleProbe: Send + Sync {
    /// Errors with [`CohesionError::Execution`] when the statement raises and
    /// [`CohesionError::Timeout`] when the worker had to be killed.
    fn execute_and_diff(&self, statement: &str) -> CohesionResult<RegistryDiff>;
}

// ---------------------------------------------------------------------------
// Subprocess probe
// ---------------------------------------------------------------------------

const PROBE_MARKER: &str = "@@cohesion-probe@@";

const PROBE_SCRIPT: &str = r#"
import json
import os
import sys

_marker = sys.argv[1]
_statement = sys.argv[2]
_out = sys.__stdout__
_before = sorted(sys.modules)
_error = None
try:
    exec(_statement, {"__name__": "__cohesion_probe__"})
except BaseException as exc:
    _error = "%s: %s" % (type(exc).__name__, exc)

_after = []
for _name, _module in list(sys.modules.items()):
    try:
        _file = getattr(_module, "__file__", None)
    except Exception:
        _file = None
    try:
        _version = getattr(_module, "__version__", None)
        _version = None if _version is None else str(_version)
    except Exception:
        _version = None
    _after.append({
        "name": _name,
        "file": _file if isinstance(_file, str) else None,
        "version": _version,
    })

def _stdlib_names():
    names = getattr(sys, "stdlib_module_names", None)
    if names is not None:
        return sorted(names)
    # Before 3.10: top-level modules installed in the stdlib directories.
    import pkgutil
    import sysconfig
    dirs = []
    for key in ("stdlib", "platstdlib"):
        path = sysconfig.get_paths().get(key)
        if path and path not in dirs:
            dirs.extend([path, os.path.join(path, "lib-dynload")])
    return sorted({info.name for info in pkgutil.iter_modules(dirs)})

_out.write("\n" + _marker + json.dumps({
    "before": _before,
    "after": _after,
    "error": _error,
    "builtin_names": sorted(sys.builtin_module_names),
    "stdlib_names": _stdlib_names(),
}) + "\n")
_out.flush()
sys.stderr.flush()
# Threads the statement started must not hold the worker open.
os._exit(0)
"#;

#[derive(Deserialize)]
struct ProbeReport {
    #[serde(flatten)]
    diff: RegistryDiff,
    error: Option<String>,
}

/// Runs each statement in a new `python -c` process.
#[derive(Clone, Debug)]
pub struct SubprocessProbe {
    pub python: String,
    /// Working directory of the worker, so project-local modules import.
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl SubprocessProbe {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
            cwd: None,
            timeout: None,
        }
    }

    pub fn from_config(config: &CohesionConfig, cwd: Option<PathBuf>) -> Self {
        Self {
            python: config.python.clone(),
            cwd,
            timeout: (config.worker_timeout_secs > 0)
                .then(|| Duration::from_secs(config.worker_timeout_secs)),
        }
    }
}

impl ModuleProbe for SubprocessProbe {
    fn execute_and_diff(&self, statement: &str) -> CohesionResult<RegistryDiff> {
        let output = run_python(
            &self.python,
            PROBE_SCRIPT,
            &[PROBE_MARKER, statement],
            self.cwd.as_deref(),
            self.timeout,
            statement,
        )?;
        let Some(payload) = marked_payload(&output.stdout, PROBE_MARKER) else {
            return Err(CohesionError::Execution {
                statement: statement.to_string(),
                message: format!(
                    "worker exited with {} before reporting: {}",
                    output.status,
                    output.stderr_tail(5)
                ),
            });
        };
        let report: ProbeReport = serde_json::from_str(payload)?;
        match report.error {
            Some(message) => Err(CohesionError::Execution {
                statement: statement.to_string(),
                message,
            }),
            None => Ok(report.diff),
        }
    }
}

// ---------------------------------------------------------------------------
// Exclusion policy
// ---------------------------------------------------------------------------

/// Caller-supplied exclusion: `(module, names present before) -> exclude?`.
pub type ExclusionPredicate = dyn Fn(&LoadedModule, &HashSet<String>) -> bool + Send + Sync;

/// Decides which newly loaded modules are recorded.
#[derive(Clone, Default)]
pub struct ModuleFilter {
    deny_list: Vec<String>,
    stdlib_override: Option<HashSet<String>>,
    predicate: Option<Arc<ExclusionPredicate>>,
}

impl std::fmt::Debug for ModuleFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleFilter")
            .field("deny_list", &self.deny_list)
            .field("stdlib_override", &self.stdlib_override.as_ref().map(|s| s.len()))
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl ModuleFilter {
    pub fn new(deny_list: Vec<String>) -> Self {
        Self {
            deny_list,
            ..Self::default()
        }
    }

    pub fn from_config(config: &CohesionConfig) -> Self {
        Self {
            deny_list: config.deny_list.clone(),
            stdlib_override: config
                .stdlib_modules
                .as_ref()
                .map(|names| names.iter().cloned().collect()),
            predicate: None,
        }
    }

    /// Use this standard-library list instead of the interpreter's.
    pub fn with_stdlib(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.stdlib_override = Some(names.into_iter().collect());
        self
    }

    pub fn with_predicate(mut self, predicate: Arc<ExclusionPredicate>) -> Self {
        self.predicate = Some(predicate);
        self
    }

    fn is_stdlib(name: &str, stdlib: &HashSet<String>) -> bool {
        let top = name.split('.').next().unwrap_or(name);
        stdlib.contains(name) || stdlib.contains(top)
    }

    /// Exclusion rules, in order: private name, deny-list, builtin,
    /// standard library, caller predicate.
    pub fn excludes(&self, module: &LoadedModule, diff: &RegistryDiff) -> bool {
        let name = module.name.as_str();
        if name.starts_with('_') {
            return true;
        }
        if self.deny_list.iter().any(|prefix| name.starts_with(prefix.as_str())) {
            return true;
        }
        if diff.builtin_names.contains(name) {
            return true;
        }
        let stdlib = self.stdlib_override.as_ref().unwrap_or(&diff.stdlib_names);
        if Self::is_stdlib(name, stdlib) {
            return true;
        }
        match &self.predicate {
            Some(predicate) => predicate(module, &diff.before),
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Resolves import nodes to their transitive module records, at most once
/// per node text.
pub struct DependencyResolver {
    probe: Box<dyn ModuleProbe>,
    filter: ModuleFilter,
    concurrency: usize,
    /// One cell per node text; concurrent callers block on the same cell.
    cache: Mutex<HashMap<String, Arc<OnceLock<ResolutionOutcome>>>>,
}

impl DependencyResolver {
    pub fn new(probe: Box<dyn ModuleProbe>, filter: ModuleFilter, concurrency: usize) -> Self {
        Self {
            probe,
            filter,
            concurrency: concurrency.max(1),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Subprocess-backed resolver configured from `config`; workers run in `cwd`.
    pub fn from_config(config: &CohesionConfig, cwd: Option<PathBuf>) -> Self {
        Self::new(
            Box::new(SubprocessProbe::from_config(config, cwd)),
            ModuleFilter::from_config(config),
            config.concurrency,
        )
    }

    pub fn filter(&self) -> &ModuleFilter {
        &self.filter
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    fn slot(&self, code_str: &str) -> Arc<OnceLock<ResolutionOutcome>> {
        self.cache.lock().entry(code_str.to_string()).or_default().clone()
    }

    /// Seed the cache with an outcome recorded earlier (e.g. persisted).
    /// A node already resolved here keeps its outcome.
    pub fn remember(&self, code_str: &str, outcome: ResolutionOutcome) {
        let _ = self.slot(code_str).set(outcome);
    }

    pub fn cached(&self, code_str: &str) -> Option<ResolutionOutcome> {
        self.cache.lock().get(code_str).and_then(|cell| cell.get().cloned())
    }

    /// Turn a registry diff into records owned by `code_str`.
    pub fn records_from_diff(&self, code_str: &str, diff: &RegistryDiff) -> Vec<TransitiveImportRecord> {
        let mut records: Vec<TransitiveImportRecord> = diff
            .new_modules()
            .filter(|module| !self.filter.excludes(module, diff))
            .map(|module| TransitiveImportRecord {
                root: root_label(&module.name),
                module: module.name.clone(),
                path: module.file.clone(),
                version: module.version.clone(),
                code_str: code_str.to_string(),
            })
            .collect();
        records.sort_by(|a, b| a.module.cmp(&b.module));
        records
    }

    fn execute(&self, code_str: &str) -> ResolutionOutcome {
        debug!("Resolving {code_str:?}");
        match self.probe.execute_and_diff(code_str) {
            Ok(diff) => {
                let records = self.records_from_diff(code_str, &diff);
                debug!("Resolved {code_str:?} to {} modules", records.len());
                ResolutionOutcome::Resolved(records)
            }
            Err(e) => {
                warn!("Skipping {code_str:?}: {e}");
                ResolutionOutcome::Failed(e.to_string())
            }
        }
    }

    /// Resolve one node; a node already attempted returns its cached outcome.
    pub fn resolve(&self, code_str: &str) -> ResolutionOutcome {
        self.slot(code_str)
            .get_or_init(|| self.execute(code_str))
            .clone()
    }

    /// Records of one node; empty when its execution failed.
    pub fn records(&self, code_str: &str) -> Vec<TransitiveImportRecord> {
        self.resolve(code_str).records().to_vec()
    }

    /// Resolve many nodes with up to `concurrency` workers alive at once.
    ///
    /// Output order follows the first occurrence of each distinct node.
    pub fn resolve_all(&self, code_strs: &[String]) -> Vec<(String, ResolutionOutcome)> {
        let mut seen = HashSet::new();
        let unique: Vec<&String> = code_strs.iter().filter(|c| seen.insert(*c)).collect();
        if unique.is_empty() {
            return Vec::new();
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.concurrency)
            .build();

        match pool {
            Ok(pool) => pool.install(|| {
                unique
                    .par_iter()
                    .map(|code| ((*code).clone(), self.resolve(code)))
                    .collect()
            }),
            Err(e) => {
                warn!("Falling back to sequential resolution: {e}");
                unique
                    .iter()
                    .map(|code| ((*code).clone(), self.resolve(code)))
                    .collect()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
