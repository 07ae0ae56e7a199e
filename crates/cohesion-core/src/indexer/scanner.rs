//! Definition and import extraction from Python source.
//!
//! One tree-sitter parse per file. A single module-scope traversal collects
//! every import statement (split into single-name statements) and every
//! top-level function or class; a second, definition-scoped traversal decides
//! which imported names each definition actually references.

use std::collections::{BTreeSet, HashSet};

use indexmap::IndexMap;
use tree_sitter::{Node, Parser, Tree};

use crate::errors::{CohesionError, CohesionResult};
use crate::indexer::imports::{ImportEntry, ImportStatement};
use crate::models::DefinitionKind;

// ---------------------------------------------------------------------------
// Extracted types
// ---------------------------------------------------------------------------

/// A top-level definition found by the scanner, before it has a stored id.
#[derive(Clone, Debug, PartialEq)]
pub struct ScannedDefinition {
    pub kind: DefinitionKind,
    pub name: String,
    pub start_line: i64,
    pub end_line: i64,
    /// Canonical import nodes referenced inside the definition, sorted.
    pub used_imports: Vec<String>,
}

/// Everything the scanner learns about one file.
#[derive(Clone, Debug, Default)]
pub struct ScanResult {
    pub file_path: String,
    /// Every module-scope single-name import statement, in file order.
    pub statements: Vec<ImportEntry>,
    /// Bound name -> the statement that binds it last.
    pub imports: IndexMap<String, ImportEntry>,
    pub definitions: Vec<ScannedDefinition>,
    /// Bound names never referenced after their import anywhere in the file.
    pub unused_imports: Vec<String>,
    pub has_syntax_errors: bool,
}

impl ScanResult {
    /// Distinct canonical import nodes of this file, in first-seen order.
    pub fn import_nodes(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.statements
            .iter()
            .map(ImportEntry::code_str)
            .filter(|code| seen.insert(code.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn parse_python(source: &str, file_path: &str) -> CohesionResult<Tree> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| CohesionError::Parse(format!("Failed to set Python language: {e}")))?;
    parser
        .parse(source, None)
        .ok_or_else(|| CohesionError::Parse(format!("Failed to parse {file_path}")))
}

fn node_text<'a>(node: Node<'_>, source: &'a [u8]) -> &'a str {
    node.utf8_text(source).unwrap_or_default()
}

fn line_of(node: Node<'_>) -> i64 {
    node.start_position().row as i64 + 1
}

/// `a . b` -> `a.b`, whatever whitespace the source used.
fn dotted_text(node: Node<'_>, source: &[u8]) -> String {
    if node.kind() != "dotted_name" {
        return node_text(node, source).to_string();
    }
    let mut cursor = node.walk();
    node.named_children(&mut cursor)
        .map(|part| node_text(part, source))
        .collect::<Vec<_>>()
        .join(".")
}

/// Split an imported-name node (`dotted_name` or `aliased_import`).
fn name_and_alias(node: Node<'_>, source: &[u8]) -> Option<(String, Option<String>)> {
    match node.kind() {
        "dotted_name" => Some((dotted_text(node, source), None)),
        "aliased_import" => {
            let name = node.child_by_field_name("name")?;
            let alias = node
                .child_by_field_name("alias")
                .map(|a| node_text(a, source).to_string());
            Some((dotted_text(name, source), alias))
        }
        _ => None,
    }
}

fn split_import_statement(node: Node<'_>, source: &[u8]) -> Vec<ImportEntry> {
    let line_number = line_of(node);
    let mut cursor = node.walk();
    let names: Vec<Node<'_>> = node.children_by_field_name("name", &mut cursor).collect();

    let (module, level) = match node.kind() {
        "import_statement" => {
            return names
                .into_iter()
                .filter_map(|n| name_and_alias(n, source))
                .map(|(name, alias)| ImportEntry {
                    statement: ImportStatement::Import { name, alias },
                    line_number,
                })
                .collect();
        }
        "future_import_statement" => (Some("__future__".to_string()), 0),
        _ => match node.child_by_field_name("module_name") {
            Some(module) if module.kind() == "relative_import" => {
                let mut inner = module.walk();
                let mut level = 0;
                let mut dotted = None;
                for part in module.children(&mut inner) {
                    match part.kind() {
                        "import_prefix" => {
                            level = node_text(part, source).chars().filter(|&c| c == '.').count()
                        }
                        "dotted_name" => dotted = Some(dotted_text(part, source)),
                        _ => {}
                    }
                }
                (dotted, level)
            }
            Some(module) => (Some(dotted_text(module, source)), 0),
            None => return Vec::new(),
        },
    };

    let mut wildcard_cursor = node.walk();
    let wildcard = node
        .children(&mut wildcard_cursor)
        .any(|c| c.kind() == "wildcard_import");
    if wildcard {
        return vec![ImportEntry {
            statement: ImportStatement::ImportFrom {
                module,
                level,
                name: "*".to_string(),
                alias: None,
            },
            line_number,
        }];
    }

    names
        .into_iter()
        .filter_map(|n| name_and_alias(n, source))
        .map(|(name, alias)| ImportEntry {
            statement: ImportStatement::ImportFrom {
                module: module.clone(),
                level,
                name,
                alias,
            },
            line_number,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Module-scope traversal
// ---------------------------------------------------------------------------

struct DefinitionSite<'tree> {
    kind: DefinitionKind,
    name: String,
    definition: Node<'tree>,
    /// The decorated wrapper when present, so decorators count as uses.
    span: Node<'tree>,
}

#[derive(Default)]
struct ModuleCollector<'tree> {
    statements: Vec<ImportEntry>,
    definitions: Vec<DefinitionSite<'tree>>,
}

impl<'tree> ModuleCollector<'tree> {
    fn visit(&mut self, node: Node<'tree>, source: &[u8]) {
        match node.kind() {
            "import_statement" | "import_from_statement" | "future_import_statement" => {
                self.statements.extend(split_import_statement(node, source));
            }
            "function_definition" | "class_definition" => self.push_definition(node, node, source),
            "decorated_definition" => {
                if let Some(definition) = node.child_by_field_name("definition") {
                    self.push_definition(definition, node, source);
                }
            }
            _ => {
                let mut cursor = node.walk();
                for child in node.named_children(&mut cursor) {
                    self.visit(child, source);
                }
            }
        }
    }

    fn push_definition(&mut self, definition: Node<'tree>, span: Node<'tree>, source: &[u8]) {
        let kind = match definition.kind() {
            "class_definition" => DefinitionKind::Class,
            _ => DefinitionKind::Function,
        };
        let Some(name) = definition.child_by_field_name("name") else {
            return;
        };
        self.definitions.push(DefinitionSite {
            kind,
            name: node_text(name, source).to_string(),
            definition,
            span,
        });
    }
}

// ---------------------------------------------------------------------------
// Name references
// ---------------------------------------------------------------------------

fn is_field(parent: Node<'_>, field: &str, node: Node<'_>) -> bool {
    parent.child_by_field_name(field) == Some(node)
}

/// True when an `identifier` node reads or binds a variable, as opposed to
/// naming an attribute, parameter, keyword or definition.
fn is_name_reference(node: Node<'_>) -> bool {
    let Some(parent) = node.parent() else {
        return true;
    };
    match parent.kind() {
        "dotted_name" | "aliased_import" | "relative_import" | "global_statement"
        | "nonlocal_statement" | "parameters" | "lambda_parameters" | "typed_parameter" => false,
        "attribute" => !is_field(parent, "attribute", node),
        "keyword_argument" => !is_field(parent, "name", node),
        "function_definition" | "class_definition" | "default_parameter"
        | "typed_default_parameter" => !is_field(parent, "name", node),
        "list_splat_pattern" | "dictionary_splat_pattern" => !matches!(
            parent.parent().map(|g| g.kind()),
            Some("parameters" | "lambda_parameters" | "typed_parameter")
        ),
        _ => true,
    }
}

fn collect_references(node: Node<'_>, source: &[u8], out: &mut Vec<(String, i64)>) {
    if node.kind() == "identifier" {
        if is_name_reference(node) {
            out.push((node_text(node, source).to_string(), line_of(node)));
        }
        return;
    }
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        collect_references(child, source, out);
    }
}

/// Bound names referenced strictly after the line that imported them.
fn used_names(
    references: &[(String, i64)],
    imports: &IndexMap<String, ImportEntry>,
) -> BTreeSet<String> {
    references
        .iter()
        .filter(|(name, line)| {
            imports
                .get(name)
                .is_some_and(|entry| *line > entry.line_number)
        })
        .map(|(name, _)| name.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------------

/// Scan one Python source file into its import table and definitions.
pub fn scan_source(source: &str, file_path: &str) -> CohesionResult<ScanResult> {
    let tree = parse_python(source, file_path)?;
    let root = tree.root_node();
    let bytes = source.as_bytes();

    let mut collector = ModuleCollector::default();
    collector.visit(root, bytes);

    // Later imports of the same name shadow earlier ones.
    let mut imports: IndexMap<String, ImportEntry> = IndexMap::new();
    for entry in &collector.statements {
        if let Some(bound) = entry.statement.bound_name() {
            imports.insert(bound.to_string(), entry.clone());
        }
    }

    let definitions = collector
        .definitions
        .iter()
        .map(|site| {
            let mut references = Vec::new();
            collect_references(site.span, bytes, &mut references);
            let used_imports: BTreeSet<String> = used_names(&references, &imports)
                .iter()
                .filter_map(|name| imports.get(name))
                .map(ImportEntry::code_str)
                .collect();
            ScannedDefinition {
                kind: site.kind,
                name: site.name.clone(),
                start_line: line_of(site.definition),
                end_line: site.definition.end_position().row as i64 + 1,
                used_imports: used_imports.into_iter().collect(),
            }
        })
        .collect();

    let mut file_references = Vec::new();
    collect_references(root, bytes, &mut file_references);
    let used_anywhere = used_names(&file_references, &imports);
    let unused_imports = imports
        .keys()
        .filter(|name| !used_anywhere.contains(*name))
        .cloned()
        .collect();

    Ok(ScanResult {
        file_path: file_path.to_string(),
        statements: collector.statements,
        imports,
        definitions,
        unused_imports,
        has_syntax_errors: root.has_error(),
    })
}

/// Module-scope import statements of a source file, without definitions.
pub fn extract_import_statements(source: &str, file_path: &str) -> CohesionResult<Vec<ImportEntry>> {
    let tree = parse_python(source, file_path)?;
    let mut collector = ModuleCollector::default();
    collector.visit(tree.root_node(), source.as_bytes());
    Ok(collector.statements)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn definition<'a>(result: &'a ScanResult, name: &str) -> &'a ScannedDefinition {
        result
            .definitions
            .iter()
            .find(|d| d.name == name)
            .unwrap_or_else(|| panic!("definition {name} not found"))
    }

    #[test]
    fn test_multi_name_imports_are_split() {
        let src = "\
import os, numpy as np
from pkg.sub import a, b as c
from . import sibling
from ..parent.mod import *
";
        let result = scan_source(src, "m.py").unwrap();
        let codes: Vec<String> = result.statements.iter().map(|e| e.code_str()).collect();
        assert_eq!(
            codes,
            vec![
                "import os",
                "import numpy as np",
                "from pkg.sub import a",
                "from pkg.sub import b as c",
                "from . import sibling",
                "from ..parent.mod import *",
            ]
        );
        assert_eq!(result.statements[2].line_number, 2);
        let bound: Vec<&str> = result.imports.keys().map(|k| k.as_str()).collect();
        assert_eq!(bound, vec!["os", "np", "a", "c", "sibling"]);
    }

    #[test]
    fn test_used_imports_per_definition() {
        let src = "\
import numpy as np
import pandas

def f(x):
    return np.array(x)

def g():
    return 1

class Frame:
    def load(self):
        return pandas.DataFrame()
";
        let result = scan_source(src, "m.py").unwrap();
        assert_eq!(result.definitions.len(), 3);
        assert_eq!(definition(&result, "f").used_imports, vec!["import numpy as np"]);
        assert!(definition(&result, "g").used_imports.is_empty());
        let frame = definition(&result, "Frame");
        assert_eq!(frame.kind, DefinitionKind::Class);
        assert_eq!(frame.used_imports, vec!["import pandas"]);
        assert_eq!(frame.start_line, 10);
        assert_eq!(frame.end_line, 12);
    }

    #[test]
    fn test_forward_references_are_not_used() {
        let src = "\
def early():
    return requests.get('x')

import requests

def late():
    return requests.get('y')
";
        let result = scan_source(src, "m.py").unwrap();
        assert!(definition(&result, "early").used_imports.is_empty());
        assert_eq!(definition(&result, "late").used_imports, vec!["import requests"]);
    }

    #[test]
    fn test_later_alias_shadows_earlier_one() {
        let src = "\
import json as codec
import pickle as codec

def dump(x):
    return codec.dumps(x)
";
        let result = scan_source(src, "m.py").unwrap();
        assert_eq!(result.statements.len(), 2);
        assert_eq!(
            definition(&result, "dump").used_imports,
            vec!["import pickle as codec"]
        );
    }

    #[test]
    fn test_attribute_parameter_and_keyword_names_do_not_count() {
        let src = "\
import np
import scipy
import torch

def f(np, *scipy, torch=None):
    return obj.np(key=1)

def g(x):
    return call(torch=x)
";
        let result = scan_source(src, "m.py").unwrap();
        assert!(definition(&result, "f").used_imports.is_empty());
        assert!(definition(&result, "g").used_imports.is_empty());
    }

    #[test]
    fn test_decorators_and_annotations_count_as_uses() {
        let src = "\
import functools
from typing import Optional

@functools.lru_cache(maxsize=None)
def cached(x: Optional[int]) -> int:
    return x
";
        let result = scan_source(src, "m.py").unwrap();
        let cached = definition(&result, "cached");
        assert_eq!(
            cached.used_imports,
            vec!["from typing import Optional", "import functools"]
        );
        assert_eq!(cached.start_line, 5);
    }

    #[test]
    fn test_nested_definitions_are_not_first_class() {
        let src = "\
import os

def outer():
    import json
    def inner():
        return os.getcwd()
    return inner
";
        let result = scan_source(src, "m.py").unwrap();
        assert_eq!(result.definitions.len(), 1);
        assert_eq!(result.statements.len(), 1);
        assert_eq!(definition(&result, "outer").used_imports, vec!["import os"]);
    }

    #[test]
    fn test_guarded_module_imports_are_collected() {
        let src = "\
try:
    import ujson as json
except ImportError:
    import json

if True:
    def helper():
        return json.loads('1')
";
        let result = scan_source(src, "m.py").unwrap();
        assert_eq!(result.statements.len(), 2);
        assert_eq!(definition(&result, "helper").used_imports, vec!["import json"]);
    }

    #[test]
    fn test_builtin_name_shadowed_by_import_counts() {
        let src = "\
from mylib import open

def read(path):
    return open(path)
";
        let result = scan_source(src, "m.py").unwrap();
        assert_eq!(definition(&result, "read").used_imports, vec!["from mylib import open"]);
    }

    #[test]
    fn test_unused_imports_partition() {
        let src = "\
import os
import sys
import numpy

print(sys.argv)

def f():
    return os.sep
";
        let result = scan_source(src, "m.py").unwrap();
        assert_eq!(result.unused_imports, vec!["numpy"]);
    }

    #[test]
    fn test_dotted_import_binds_first_component() {
        let src = "\
import os.path

def join(a, b):
    return os.path.join(a, b)
";
        let result = scan_source(src, "m.py").unwrap();
        assert_eq!(definition(&result, "join").used_imports, vec!["import os.path"]);
    }

    #[test]
    fn test_import_nodes_are_distinct() {
        let src = "import os\nimport os\n";
        let result = scan_source(src, "m.py").unwrap();
        assert_eq!(result.statements.len(), 2);
        assert_eq!(result.import_nodes(), vec!["import os"]);
    }

    #[test]
    fn test_extract_import_statements_skips_definitions() {
        let src = "from a import b\n\ndef f():\n    from c import d\n";
        let entries = extract_import_statements(src, "m.py").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].code_str(), "from a import b");
    }
}
