//! Cohesion core library: import-weight cohesion scoring for Python codebases.
//!
//! Source files are scanned for top-level definitions and the imports they
//! use, every distinct import statement is executed in an isolated
//! interpreter to learn which modules it drags in, and each definition is
//! scored by how much of its file's dependency weight it actually needs.
//! With the `python` feature the crate also builds as the `_cohesion_core`
//! extension module.

pub mod config;
pub mod errors;
pub mod graph;
pub mod indexer;
pub mod models;
pub mod store;

#[cfg(feature = "python")]
mod python;

#[cfg(feature = "python")]
use pyo3::prelude::*;

// ---------------------------------------------------------------------------
// Top-level Python module: _cohesion_core
// ---------------------------------------------------------------------------

#[cfg(feature = "python")]
#[pymodule]
fn _cohesion_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    // -- Store + analysis ----------------------------------------------------
    m.add_class::<python::PyDatabase>()?;

    // -- Scanner -------------------------------------------------------------
    m.add_function(wrap_pyfunction!(python::canonical_imports, m)?)?;

    m.add("SCHEMA_VERSION", store::schema::SCHEMA_VERSION)?;
    Ok(())
}
