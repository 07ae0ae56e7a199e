//! Single-name import statements and their canonical text.
//!
//! Every `import a, b` or `from m import x, y` in a source file is split into
//! one statement per bound name. The canonical text of that single-name
//! statement is the identity of an import node: two statements with the same
//! text are the same node wherever they appear.

use std::fmt;

use crate::errors::{CohesionError, CohesionResult};

/// A single-name `import` or `from ... import` statement.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ImportStatement {
    /// `import name [as alias]`
    Import { name: String, alias: Option<String> },
    /// `from [.]*module import name [as alias]`; `name` is `*` for wildcards.
    ImportFrom {
        module: Option<String>,
        level: usize,
        name: String,
        alias: Option<String>,
    },
}

impl ImportStatement {
    /// Canonical statement text, e.g. `from ..pkg import thing as other`.
    pub fn canonical(&self) -> String {
        match self {
            ImportStatement::Import { name, alias } => match alias {
                Some(alias) => format!("import {name} as {alias}"),
                None => format!("import {name}"),
            },
            ImportStatement::ImportFrom {
                module,
                level,
                name,
                alias,
            } => {
                let dots = ".".repeat(*level);
                let module = module.as_deref().unwrap_or("");
                match alias {
                    Some(alias) => format!("from {dots}{module} import {name} as {alias}"),
                    None => format!("from {dots}{module} import {name}"),
                }
            }
        }
    }

    /// Name this statement binds in the importing namespace.
    ///
    /// `import os.path` binds `os`; a wildcard binds nothing we can track.
    pub fn bound_name(&self) -> Option<&str> {
        match self {
            ImportStatement::Import { name, alias } => match alias {
                Some(alias) => Some(alias.as_str()),
                None => name.split('.').next(),
            },
            ImportStatement::ImportFrom { name, alias, .. } => match alias {
                Some(alias) => Some(alias.as_str()),
                None if name == "*" => None,
                None => Some(name.as_str()),
            },
        }
    }

    /// Module named by an absolute from-import; `None` for relative ones and
    /// for plain imports.
    pub fn absolute_from_module(&self) -> Option<&str> {
        match self {
            ImportStatement::ImportFrom {
                module: Some(module),
                level: 0,
                ..
            } => Some(module.as_str()),
            _ => None,
        }
    }

    /// Parse a canonical single-name statement back into its parts.
    pub fn from_canonical(code: &str) -> CohesionResult<Self> {
        let tokens: Vec<&str> = code.split_whitespace().collect();
        let bad = || CohesionError::Parse(format!("not a canonical import statement: {code:?}"));
        match tokens.as_slice() {
            ["import", name] => Ok(ImportStatement::Import {
                name: name.to_string(),
                alias: None,
            }),
            ["import", name, "as", alias] => Ok(ImportStatement::Import {
                name: name.to_string(),
                alias: Some(alias.to_string()),
            }),
            ["from", module, "import", rest @ ..] => {
                let level = module.chars().take_while(|&c| c == '.').count();
                let stripped = &module[level..];
                let module = if stripped.is_empty() {
                    None
                } else {
                    Some(stripped.to_string())
                };
                let (name, alias) = match rest {
                    [name] => (name.to_string(), None),
                    [name, "as", alias] => (name.to_string(), Some(alias.to_string())),
                    _ => return Err(bad()),
                };
                if module.is_none() && level == 0 {
                    return Err(bad());
                }
                Ok(ImportStatement::ImportFrom {
                    module,
                    level,
                    name,
                    alias,
                })
            }
            _ => Err(bad()),
        }
    }
}

impl fmt::Display for ImportStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// An import statement as observed in one file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportEntry {
    pub statement: ImportStatement,
    /// 1-based line of the statement that introduced the name.
    pub line_number: i64,
}

impl ImportEntry {
    pub fn code_str(&self) -> String {
        self.statement.canonical()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from(module: Option<&str>, level: usize, name: &str, alias: Option<&str>) -> ImportStatement {
        ImportStatement::ImportFrom {
            module: module.map(str::to_string),
            level,
            name: name.to_string(),
            alias: alias.map(str::to_string),
        }
    }

    #[test]
    fn test_canonical_plain_and_aliased() {
        let plain = ImportStatement::Import {
            name: "os.path".to_string(),
            alias: None,
        };
        assert_eq!(plain.canonical(), "import os.path");
        let aliased = ImportStatement::Import {
            name: "numpy".to_string(),
            alias: Some("np".to_string()),
        };
        assert_eq!(aliased.canonical(), "import numpy as np");
    }

    #[test]
    fn test_canonical_relative_from_import() {
        assert_eq!(from(None, 1, "x", None).canonical(), "from . import x");
        assert_eq!(
            from(Some("pkg.mod"), 2, "thing", Some("other")).canonical(),
            "from ..pkg.mod import thing as other"
        );
    }

    #[test]
    fn test_bound_name_rules() {
        let dotted = ImportStatement::Import {
            name: "os.path".to_string(),
            alias: None,
        };
        assert_eq!(dotted.bound_name(), Some("os"));
        assert_eq!(from(Some("m"), 0, "*", None).bound_name(), None);
        assert_eq!(from(Some("m"), 0, "a", Some("b")).bound_name(), Some("b"));
    }

    #[test]
    fn test_from_canonical_parses_every_shape() {
        for statement in [
            ImportStatement::Import {
                name: "a.b".to_string(),
                alias: Some("c".to_string()),
            },
            from(Some("pkg"), 0, "name", None),
            from(None, 2, "sibling", Some("s")),
            from(Some("pkg.sub"), 1, "*", None),
        ] {
            let parsed = ImportStatement::from_canonical(&statement.canonical()).unwrap();
            assert_eq!(parsed, statement);
        }
    }

    #[test]
    fn test_from_canonical_rejects_garbage() {
        assert!(ImportStatement::from_canonical("print(1)").is_err());
        assert!(ImportStatement::from_canonical("from import x").is_err());
    }

    #[test]
    fn test_absolute_from_module() {
        assert_eq!(from(Some("pkg"), 0, "x", None).absolute_from_module(), Some("pkg"));
        assert_eq!(from(Some("pkg"), 1, "x", None).absolute_from_module(), None);
    }
}
