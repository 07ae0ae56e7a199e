//! Error types for the cohesion core library.

/// Top-level error enum for the cohesion core library.
#[derive(Debug, thiserror::Error)]
pub enum CohesionError {
    /// Re-inserting an entity whose identity is already recorded.
    #[error("Duplicate {kind}: {identity}")]
    Duplicate { kind: &'static str, identity: String },

    /// The isolated import statement raised inside its worker.
    #[error("Execution of {statement:?} failed: {message}")]
    Execution { statement: String, message: String },

    #[error("Worker for {statement:?} timed out after {seconds}s")]
    Timeout { statement: String, seconds: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CohesionError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, CohesionError::Duplicate { .. })
    }
}

#[cfg(feature = "python")]
impl From<CohesionError> for pyo3::PyErr {
    fn from(err: CohesionError) -> pyo3::PyErr {
        use pyo3::exceptions::{PyIOError, PyKeyError, PyRuntimeError, PyValueError};
        match &err {
            CohesionError::Sqlite(_)
            | CohesionError::Execution { .. }
            | CohesionError::Timeout { .. } => PyRuntimeError::new_err(err.to_string()),
            CohesionError::NotFound(_) => PyKeyError::new_err(err.to_string()),
            CohesionError::Duplicate { .. }
            | CohesionError::Parse(_)
            | CohesionError::Config(_)
            | CohesionError::Json(_) => PyValueError::new_err(err.to_string()),
            CohesionError::Io(_) => PyIOError::new_err(err.to_string()),
        }
    }
}

pub type CohesionResult<T> = Result<T, CohesionError>;
