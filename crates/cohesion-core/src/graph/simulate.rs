//! Counterfactual moves over a loaded graph.
//!
//! A [`GraphView`] borrows the base graph and records only what a move
//! changes: reassigned owning files, rewritten file import lists, and files
//! that do not exist in the base. The base graph and the store are never
//! touched, and views can be stacked by moving again from a view.

use std::collections::HashMap;

use crate::errors::{CohesionError, CohesionResult};
use crate::graph::arena::{DependencyGraph, GraphSource};
use crate::models::{DefinitionKind, DefinitionRecord, TransitiveImportRecord};

#[derive(Clone, Debug)]
pub struct GraphView<'g> {
    base: &'g DependencyGraph,
    extra_files: Vec<String>,
    extra_index: HashMap<String, usize>,
    definition_files: HashMap<usize, usize>,
    file_imports: HashMap<usize, Vec<usize>>,
}

impl<'g> GraphView<'g> {
    /// A view identical to `base`.
    pub fn new(base: &'g DependencyGraph) -> Self {
        Self {
            base,
            extra_files: Vec::new(),
            extra_index: HashMap::new(),
            definition_files: HashMap::new(),
            file_imports: HashMap::new(),
        }
    }

    pub fn base(&self) -> &'g DependencyGraph {
        self.base
    }

    fn existing_file(&self, path: &str) -> CohesionResult<usize> {
        self.find_file(path)
            .ok_or_else(|| CohesionError::NotFound(format!("file {path:?}")))
    }

    /// Index of `path`, adding an empty file when it does not exist yet.
    fn file_or_insert(&mut self, path: &str) -> usize {
        if let Some(idx) = self.find_file(path) {
            return idx;
        }
        let idx = self.base.file_count() + self.extra_files.len();
        self.extra_files.push(path.to_string());
        self.extra_index.insert(path.to_string(), idx);
        idx
    }

    /// Move the File→Import edge of `code_str` from `from_file` to `to_file`.
    pub fn move_import(&self, code_str: &str, from_file: &str, to_file: &str) -> CohesionResult<Self> {
        let from = self.existing_file(from_file)?;
        let missing = || CohesionError::NotFound(format!("import {code_str:?} in {from_file:?}"));
        let import = self.find_import(code_str).ok_or_else(missing)?;
        let position = self
            .file_imports(from)
            .iter()
            .position(|&i| i == import)
            .ok_or_else(missing)?;

        let mut view = self.clone();
        let to = view.file_or_insert(to_file);
        if to == from {
            return Ok(view);
        }
        let mut from_list = view.file_imports(from).to_vec();
        from_list.remove(position);
        let mut to_list = view.file_imports(to).to_vec();
        if !to_list.contains(&import) {
            to_list.push(import);
        }
        view.file_imports.insert(from, from_list);
        view.file_imports.insert(to, to_list);
        Ok(view)
    }

    /// Move the first `kind` definition named `name` in `from_file` to `to_file`.
    ///
    /// The definition keeps its used-import edges; the imports of both files
    /// are unchanged.
    pub fn move_definition(
        &self,
        kind: DefinitionKind,
        from_file: &str,
        name: &str,
        to_file: &str,
    ) -> CohesionResult<Self> {
        let from = self.existing_file(from_file)?;
        let idx = (0..self.definition_count())
            .find(|&i| {
                let def = self.definition(i);
                def.kind == kind && def.name == name && self.definition_file(i) == from
            })
            .ok_or_else(|| {
                CohesionError::NotFound(format!("{kind} {name:?} in {from_file:?}"))
            })?;

        let mut view = self.clone();
        let to = view.file_or_insert(to_file);
        view.definition_files.insert(idx, to);
        Ok(view)
    }
}

impl GraphSource for GraphView<'_> {
    fn file_count(&self) -> usize {
        self.base.file_count() + self.extra_files.len()
    }

    fn file_path(&self, file: usize) -> &str {
        let base_count = self.base.file_count();
        if file < base_count {
            self.base.file_path(file)
        } else {
            &self.extra_files[file - base_count]
        }
    }

    fn find_file(&self, path: &str) -> Option<usize> {
        self.base
            .find_file(path)
            .or_else(|| self.extra_index.get(path).copied())
    }

    fn file_imports(&self, file: usize) -> &[usize] {
        if let Some(list) = self.file_imports.get(&file) {
            return list;
        }
        if file < self.base.file_count() {
            self.base.file_imports(file)
        } else {
            &[]
        }
    }

    fn definition_count(&self) -> usize {
        self.base.definition_count()
    }

    fn definition(&self, idx: usize) -> &DefinitionRecord {
        self.base.definition(idx)
    }

    fn definition_file(&self, idx: usize) -> usize {
        self.definition_files
            .get(&idx)
            .copied()
            .unwrap_or_else(|| self.base.definition_file(idx))
    }

    fn definition_imports(&self, idx: usize) -> &[usize] {
        self.base.definition_imports(idx)
    }

    fn import_code(&self, import: usize) -> &str {
        self.base.import_code(import)
    }

    fn find_import(&self, code_str: &str) -> Option<usize> {
        self.base.find_import(code_str)
    }

    fn import_records(&self, import: usize) -> &[TransitiveImportRecord] {
        self.base.import_records(import)
    }
}

impl DependencyGraph {
    pub fn view(&self) -> GraphView<'_> {
        GraphView::new(self)
    }

    pub fn move_import(&self, code_str: &str, from_file: &str, to_file: &str) -> CohesionResult<GraphView<'_>> {
        self.view().move_import(code_str, from_file, to_file)
    }

    pub fn move_definition(
        &self,
        kind: DefinitionKind,
        from_file: &str,
        name: &str,
        to_file: &str,
    ) -> CohesionResult<GraphView<'_>> {
        self.view().move_definition(kind, from_file, name, to_file)
    }
}
