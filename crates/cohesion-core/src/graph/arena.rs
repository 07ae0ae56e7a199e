//! Immutable in-memory dependency graph.
//!
//! Files, import nodes and definitions live in flat vectors and refer to each
//! other by index. The scorer reads the graph only through [`GraphSource`], so
//! a counterfactual view that overlays a few reassigned indices can stand in
//! for the loaded graph.

use std::collections::HashMap;

use crate::errors::CohesionResult;
use crate::models::{DefinitionKind, DefinitionRecord, TransitiveImportRecord};
use crate::store::database::Database;

/// Read access the scorer needs, shared by the loaded graph and its views.
pub trait GraphSource {
    fn file_count(&self) -> usize;
    fn file_path(&self, file: usize) -> &str;
    fn find_file(&self, path: &str) -> Option<usize>;
    /// Import nodes attached to a file's top level.
    fn file_imports(&self, file: usize) -> &[usize];

    fn definition_count(&self) -> usize;
    fn definition(&self, idx: usize) -> &DefinitionRecord;
    /// Current owning file of a definition.
    fn definition_file(&self, idx: usize) -> usize;
    /// Import nodes a definition's body references.
    fn definition_imports(&self, idx: usize) -> &[usize];

    fn import_code(&self, import: usize) -> &str;
    fn find_import(&self, code_str: &str) -> Option<usize>;
    fn import_records(&self, import: usize) -> &[TransitiveImportRecord];
}

#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    files: Vec<String>,
    file_index: HashMap<String, usize>,
    imports: Vec<String>,
    import_index: HashMap<String, usize>,
    definitions: Vec<DefinitionRecord>,
    definition_files: Vec<usize>,
    file_imports: Vec<Vec<usize>>,
    definition_imports: Vec<Vec<usize>>,
    import_records: Vec<Vec<TransitiveImportRecord>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything the store holds.
    pub fn load(db: &Database) -> CohesionResult<Self> {
        let mut graph = Self::new();
        for path in db.files()? {
            graph.add_file(&path);
        }
        for code in db.imports()? {
            graph.add_import(&code);
        }
        for record in db.import_data()? {
            let import = graph.add_import(&record.code_str);
            graph.import_records[import].push(record);
        }
        for (path, code) in db.file_import_edges()? {
            graph.add_file_import(&path, &code);
        }
        let mut by_id = HashMap::new();
        for record in db.definitions()? {
            let id = record.id;
            by_id.insert(id, graph.push_definition(record));
        }
        for (definition_id, code) in db.definition_import_edges()? {
            if let Some(&idx) = by_id.get(&definition_id) {
                graph.add_definition_import(idx, &code);
            }
        }
        Ok(graph)
    }

    /// Intern a file path.
    pub fn add_file(&mut self, path: &str) -> usize {
        if let Some(&idx) = self.file_index.get(path) {
            return idx;
        }
        let idx = self.files.len();
        self.files.push(path.to_string());
        self.file_index.insert(path.to_string(), idx);
        self.file_imports.push(Vec::new());
        idx
    }

    /// Intern an import node.
    pub fn add_import(&mut self, code_str: &str) -> usize {
        if let Some(&idx) = self.import_index.get(code_str) {
            return idx;
        }
        let idx = self.imports.len();
        self.imports.push(code_str.to_string());
        self.import_index.insert(code_str.to_string(), idx);
        self.import_records.push(Vec::new());
        idx
    }

    /// Attach transitive records to an import node.
    pub fn add_records(&mut self, code_str: &str, records: impl IntoIterator<Item = TransitiveImportRecord>) {
        let import = self.add_import(code_str);
        self.import_records[import].extend(records);
    }

    pub fn add_file_import(&mut self, path: &str, code_str: &str) {
        let file = self.add_file(path);
        let import = self.add_import(code_str);
        if !self.file_imports[file].contains(&import) {
            self.file_imports[file].push(import);
        }
    }

    fn push_definition(&mut self, record: DefinitionRecord) -> usize {
        let file = self.add_file(&record.file_path);
        let idx = self.definitions.len();
        self.definitions.push(record);
        self.definition_files.push(file);
        self.definition_imports.push(Vec::new());
        idx
    }

    /// Add a definition with an id following the largest one present.
    pub fn add_definition(
        &mut self,
        kind: DefinitionKind,
        name: &str,
        start_line: i64,
        end_line: i64,
        file_path: &str,
    ) -> usize {
        let id = self.definitions.iter().map(|d| d.id).max().unwrap_or(0) + 1;
        self.push_definition(DefinitionRecord {
            id,
            kind,
            name: name.to_string(),
            start_line,
            end_line,
            file_path: file_path.to_string(),
        })
    }

    pub fn add_definition_import(&mut self, definition: usize, code_str: &str) {
        let import = self.add_import(code_str);
        if !self.definition_imports[definition].contains(&import) {
            self.definition_imports[definition].push(import);
        }
    }

    pub fn import_count(&self) -> usize {
        self.imports.len()
    }
}

impl GraphSource for DependencyGraph {
    fn file_count(&self) -> usize {
        self.files.len()
    }

    fn file_path(&self, file: usize) -> &str {
        &self.files[file]
    }

    fn find_file(&self, path: &str) -> Option<usize> {
        self.file_index.get(path).copied()
    }

    fn file_imports(&self, file: usize) -> &[usize] {
        &self.file_imports[file]
    }

    fn definition_count(&self) -> usize {
        self.definitions.len()
    }

    fn definition(&self, idx: usize) -> &DefinitionRecord {
        &self.definitions[idx]
    }

    fn definition_file(&self, idx: usize) -> usize {
        self.definition_files[idx]
    }

    fn definition_imports(&self, idx: usize) -> &[usize] {
        &self.definition_imports[idx]
    }

    fn import_code(&self, import: usize) -> &str {
        &self.imports[import]
    }

    fn find_import(&self, code_str: &str) -> Option<usize> {
        self.import_index.get(code_str).copied()
    }

    fn import_records(&self, import: usize) -> &[TransitiveImportRecord] {
        &self.import_records[import]
    }
}
