//! Facts about the target Python interpreter.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::errors::{CohesionError, CohesionResult};
use crate::indexer::worker::{marked_payload, run_python};

const INFO_MARKER: &str = "@@cohesion-interpreter@@";

const INFO_SCRIPT: &str = r#"
import json
import site
import sys

roots = []
try:
    roots.extend(site.getsitepackages())
except Exception:
    pass
try:
    roots.append(site.getusersitepackages())
except Exception:
    pass
sys.stdout.write("\n" + sys.argv[1] + json.dumps({
    "version": "%d.%d.%d" % sys.version_info[:3],
    "site_packages": roots,
}) + "\n")
"#;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct InterpreterInfo {
    pub version: String,
    pub site_packages: Vec<PathBuf>,
}

impl InterpreterInfo {
    /// Ask `python` about itself in a short-lived worker.
    pub fn query(python: &str) -> CohesionResult<Self> {
        let output = run_python(
            python,
            INFO_SCRIPT,
            &[INFO_MARKER],
            None,
            Some(Duration::from_secs(60)),
            "interpreter info",
        )?;
        let payload = marked_payload(&output.stdout, INFO_MARKER).ok_or_else(|| {
            CohesionError::Config(format!(
                "{python} did not report interpreter info: {}",
                output.stderr_tail(5)
            ))
        })?;
        let info: Self = serde_json::from_str(payload)?;
        debug!(
            "Interpreter {python} is Python {} with {} site-packages roots",
            info.version,
            info.site_packages.len()
        );
        Ok(info)
    }

    /// Installed-package roots that exist on disk.
    pub fn existing_site_packages(&self) -> Vec<PathBuf> {
        self.site_packages.iter().filter(|p| p.is_dir()).cloned().collect()
    }
}
