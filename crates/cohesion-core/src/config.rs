//! Analysis configuration: defaults, optional JSON file, `COHESION_*` env overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{CohesionError, CohesionResult};

/// How a package's weight is measured.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightStrategy {
    /// Recursive byte size of the package directory under the install root.
    #[default]
    PackageDirectory,
    /// Byte size of the files listed in the package's install manifest.
    Manifest,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CohesionConfig {
    /// Interpreter used for isolated import execution.
    pub python: String,
    /// Installed-package roots. Empty means ask the interpreter.
    pub site_packages: Vec<PathBuf>,
    /// Module-name prefixes never recorded as transitive imports.
    pub deny_list: Vec<String>,
    /// Explicit standard-library module list; `None` uses the interpreter's.
    pub stdlib_modules: Option<Vec<String>>,
    /// Maximum number of concurrently running import workers.
    pub concurrency: usize,
    /// Seconds before a hung worker is killed; 0 waits forever.
    pub worker_timeout_secs: u64,
    pub epsilon: f64,
    pub weight_strategy: WeightStrategy,
    /// Source file extensions, without the dot.
    pub extensions: Vec<String>,
    pub exclude_dirs: Vec<String>,
    /// Recurse into the from-imports of locally resolved modules.
    pub follow_local_imports: bool,
}

impl Default for CohesionConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            site_packages: Vec::new(),
            deny_list: vec!["ipywidgets".to_string()],
            stdlib_modules: None,
            concurrency: 4,
            worker_timeout_secs: 120,
            epsilon: 1e-4,
            weight_strategy: WeightStrategy::PackageDirectory,
            extensions: vec!["py".to_string()],
            exclude_dirs: [
                "__pycache__",
                ".venv",
                "venv",
                ".tox",
                "site-packages",
                "node_modules",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            follow_local_imports: false,
        }
    }
}

fn env_flag(value: &str) -> bool {
    let v = value.trim().to_lowercase();
    !matches!(v.as_str(), "0" | "false" | "no" | "off" | "")
}

impl CohesionConfig {
    /// Load a JSON config file; missing keys keep their defaults.
    pub fn from_json_file(path: &Path) -> CohesionResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> CohesionResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `COHESION_*` environment variables.
    pub fn from_env() -> CohesionResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `COHESION_*` environment overrides in place.
    pub fn apply_env(&mut self) -> CohesionResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> CohesionResult<()> {
        if let Some(python) = lookup("COHESION_PYTHON") {
            self.python = python;
        }
        if let Some(paths) = lookup("COHESION_SITE_PACKAGES") {
            self.site_packages = std::env::split_paths(&paths)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
        }
        if let Some(raw) = lookup("COHESION_CONCURRENCY") {
            self.concurrency = raw.trim().parse().map_err(|_| {
                CohesionError::Config(format!("COHESION_CONCURRENCY is not a number: {raw:?}"))
            })?;
        }
        if let Some(raw) = lookup("COHESION_WORKER_TIMEOUT_SECS") {
            self.worker_timeout_secs = raw.trim().parse().map_err(|_| {
                CohesionError::Config(format!(
                    "COHESION_WORKER_TIMEOUT_SECS is not a number: {raw:?}"
                ))
            })?;
        }
        if let Some(raw) = lookup("COHESION_FOLLOW_LOCAL_IMPORTS") {
            self.follow_local_imports = env_flag(&raw);
        }
        self.validate()
    }

    pub fn validate(&self) -> CohesionResult<()> {
        if self.concurrency == 0 {
            return Err(CohesionError::Config("concurrency must be at least 1".into()));
        }
        if self.epsilon.is_nan() || self.epsilon < 0.0 {
            return Err(CohesionError::Config(format!(
                "epsilon must be a non-negative number, got {}",
                self.epsilon
            )));
        }
        if self.extensions.is_empty() {
            return Err(CohesionError::Config("at least one source extension is required".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CohesionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.weight_strategy, WeightStrategy::PackageDirectory);
        assert_eq!(config.deny_list, vec!["ipywidgets"]);
    }

    #[test]
    fn test_json_keeps_defaults_for_missing_keys() {
        let config =
            CohesionConfig::from_json_str(r#"{"concurrency": 2, "weight_strategy": "manifest"}"#)
                .unwrap();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.weight_strategy, WeightStrategy::Manifest);
        assert_eq!(config.python, "python3");
    }

    #[test]
    fn test_json_rejects_zero_concurrency() {
        let err = CohesionConfig::from_json_str(r#"{"concurrency": 0}"#).unwrap_err();
        assert!(matches!(err, CohesionError::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("COHESION_PYTHON", "/opt/py/bin/python"),
            ("COHESION_CONCURRENCY", "8"),
            ("COHESION_FOLLOW_LOCAL_IMPORTS", "yes"),
        ]
        .into_iter()
        .collect();
        let mut config = CohesionConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.python, "/opt/py/bin/python");
        assert_eq!(config.concurrency, 8);
        assert!(config.follow_local_imports);
    }

    #[test]
    fn test_env_rejects_bad_number() {
        let mut config = CohesionConfig::default();
        let err = config
            .apply_overrides(|key| (key == "COHESION_CONCURRENCY").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, CohesionError::Config(_)));
    }
}
