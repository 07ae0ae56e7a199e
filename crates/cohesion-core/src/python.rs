//! PyO3 bindings. Reports cross the boundary as plain dicts and lists.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use pyo3::prelude::*;
use serde::Serialize;
use tracing::warn;

use crate::config::CohesionConfig;
use crate::errors::{CohesionError, CohesionResult};
use crate::graph::arena::DependencyGraph;
use crate::graph::scoring::Scorer;
use crate::indexer::pipeline::scan_path;
use crate::indexer::resolver::{ExclusionPredicate, LoadedModule};
use crate::indexer::scanner::scan_source;
use crate::models::DefinitionKind;
use crate::store::database::Database;

/// Optional JSON config layered under `COHESION_*` overrides.
fn load_config(config_json: Option<&str>) -> CohesionResult<CohesionConfig> {
    let mut config = match config_json {
        Some(text) => CohesionConfig::from_json_str(text)?,
        None => CohesionConfig::default(),
    };
    config.apply_env()?;
    Ok(config)
}

fn to_py<T: Serialize>(py: Python<'_>, value: &T) -> PyResult<PyObject> {
    let text = serde_json::to_string(value).map_err(CohesionError::from)?;
    let json_module = py.import("json")?;
    Ok(json_module.call_method1("loads", (text,))?.unbind())
}

/// Wrap `blacklist(name, file, modules_before) -> bool` as an exclusion
/// predicate. A raising callable excludes nothing.
fn python_predicate(callable: PyObject) -> Arc<ExclusionPredicate> {
    Arc::new(move |module: &LoadedModule, before: &HashSet<String>| {
        Python::with_gil(|py| {
            let mut before: Vec<String> = before.iter().cloned().collect();
            before.sort();
            let result = callable
                .call1(py, (module.name.as_str(), module.file.as_deref(), before))
                .and_then(|value| value.bind(py).is_truthy());
            match result {
                Ok(exclude) => exclude,
                Err(e) => {
                    warn!("Blacklist callable failed for {}: {e}", module.name);
                    false
                }
            }
        })
    })
}

#[pyclass(name = "Database")]
pub struct PyDatabase {
    inner: Database,
}

#[pymethods]
impl PyDatabase {
    #[new]
    fn new(db_path: PathBuf) -> PyResult<Self> {
        Ok(Self {
            inner: Database::new(db_path)?,
        })
    }

    #[getter]
    fn db_path(&self) -> String {
        self.inner.db_path().to_string_lossy().into_owned()
    }

    fn init_schema(&self) -> PyResult<()> {
        Ok(self.inner.init_schema()?)
    }

    /// Scan `root`, resolve new import nodes and return the scan statistics.
    #[pyo3(signature = (root, config_json=None, blacklist=None))]
    fn scan(
        &self,
        py: Python<'_>,
        root: PathBuf,
        config_json: Option<&str>,
        blacklist: Option<PyObject>,
    ) -> PyResult<PyObject> {
        let config = load_config(config_json)?;
        let predicate = blacklist.map(python_predicate);
        let db = &self.inner;
        // Resolver threads call back into Python for the blacklist.
        let stats = py.allow_threads(|| scan_path(db, &root, &config, predicate))?;
        to_py(py, &stats)
    }

    #[pyo3(signature = (config_json=None))]
    fn score(&self, py: Python<'_>, config_json: Option<&str>) -> PyResult<PyObject> {
        let config = load_config(config_json)?;
        let graph = DependencyGraph::load(&self.inner)?;
        let report = Scorer::from_config(&config)?.score(&graph);
        to_py(py, &report)
    }

    /// Score the graph as if the definition lived in `to_file`.
    #[pyo3(signature = (kind, from_file, name, to_file, config_json=None))]
    fn simulate_move_definition(
        &self,
        py: Python<'_>,
        kind: &str,
        from_file: &str,
        name: &str,
        to_file: &str,
        config_json: Option<&str>,
    ) -> PyResult<PyObject> {
        let config = load_config(config_json)?;
        let kind: DefinitionKind = kind.parse()?;
        let graph = DependencyGraph::load(&self.inner)?;
        let view = graph.move_definition(kind, from_file, name, to_file)?;
        let report = Scorer::from_config(&config)?.score(&view);
        to_py(py, &report)
    }

    /// Score the graph as if the import lived in `to_file`.
    #[pyo3(signature = (code_str, from_file, to_file, config_json=None))]
    fn simulate_move_import(
        &self,
        py: Python<'_>,
        code_str: &str,
        from_file: &str,
        to_file: &str,
        config_json: Option<&str>,
    ) -> PyResult<PyObject> {
        let config = load_config(config_json)?;
        let graph = DependencyGraph::load(&self.inner)?;
        let view = graph.move_import(code_str, from_file, to_file)?;
        let report = Scorer::from_config(&config)?.score(&view);
        to_py(py, &report)
    }
}

/// Canonical import nodes of a source text, in first-seen order.
#[pyfunction]
pub fn canonical_imports(source: &str) -> PyResult<Vec<String>> {
    Ok(scan_source(source, "<string>")?.import_nodes())
}
