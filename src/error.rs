use thiserror::Error;

#[derive(Debug, Error)]
pub enum CouplingError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("equilibrium solve failed: {0}")]
    Equilibrium(String),
    #[error("integration failed: {0}")]
    Integration(String),
}

#[cfg(feature = "python")]
impl From<CouplingError> for pyo3::PyErr {
    fn from(err: CouplingError) -> Self {
        use pyo3::exceptions::{PyRuntimeError, PyValueError};
        match err {
            CouplingError::Config(_) => PyValueError::new_err(err.to_string()),
            CouplingError::Equilibrium(_) | CouplingError::Integration(_) => {
                PyRuntimeError::new_err(err.to_string())
            }
        }
    }
}

pub(crate) fn check_shape(
    name: &str,
    rows: usize,
    cols: usize,
    expected_rows: usize,
    expected_cols: usize,
) -> Result<(), CouplingError> {
    if rows != expected_rows || cols != expected_cols {
        return Err(CouplingError::Config(format!(
            "{name} has shape {rows}x{cols}, expected {expected_rows}x{expected_cols}"
        )));
    }
    Ok(())
}
