use nalgebra::{DMatrix, DVector};
use numpy::ndarray::{Array2, Array3};
use numpy::{
    IntoPyArray, PyArray1, PyReadonlyArray1, PyReadonlyArray2, PyReadonlyArrayDyn,
    PyUntypedArrayMethods,
};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::binding::{EquilibriumOptions, MassActionBindingNetwork};
use crate::catalysis::CatalysisNetwork;
use crate::coupling::{
    BindingCatalysisCoupling, CatalysisTotals, CatalysisTrajectory, CouplingConfig,
};
use crate::error::CouplingError;

fn read_matrix(array: PyReadonlyArray2<f64>, name: &str) -> Result<DMatrix<f64>, CouplingError> {
    let shape = array.shape();
    let (rows, cols) = (shape[0], shape[1]);
    let data = array
        .as_slice()
        .map_err(|_| CouplingError::Config(format!("{name} must be contiguous")))?;
    Ok(DMatrix::from_row_slice(rows, cols, data))
}

fn read_vector(array: PyReadonlyArray1<f64>, name: &str) -> Result<DVector<f64>, CouplingError> {
    let slice = array
        .as_slice()
        .map_err(|_| CouplingError::Config(format!("{name} array must be contiguous")))?;
    Ok(DVector::from_column_slice(slice))
}

/// A 1-D kcat holds one rate constant per reaction, each driven by its own active species.
fn read_kcat(array: PyReadonlyArrayDyn<f64>) -> Result<DMatrix<f64>, CouplingError> {
    let shape = array.shape().to_vec();
    let data = array
        .as_slice()
        .map_err(|_| CouplingError::Config("kcat must be contiguous".into()))?;
    match shape.as_slice() {
        [n] => Ok(DMatrix::from_diagonal(&DVector::from_column_slice(&data[..*n]))),
        [rows, cols] => Ok(DMatrix::from_row_slice(*rows, *cols, data)),
        _ => Err(CouplingError::Config("kcat must be 1- or 2-dimensional".into())),
    }
}

fn row_major(matrix: &DMatrix<f64>) -> Vec<f64> {
    (0..matrix.nrows())
        .flat_map(|i| (0..matrix.ncols()).map(move |j| matrix[(i, j)]))
        .collect()
}

fn trajectory_into_py(py: Python<'_>, traj: CatalysisTrajectory) -> PyResult<Py<PyAny>> {
    let dict = PyDict::new(py);
    let npts = traj.len();
    let shape_err = |e: numpy::ndarray::ShapeError| CouplingError::Config(e.to_string());

    dict.set_item("t", PyArray1::from_vec(py, traj.t.clone()))?;
    let logxcat = Array2::from_shape_vec(
        (npts, traj.logxcat.ncols()),
        row_major(&traj.logxcat),
    )
    .map_err(shape_err)?;
    dict.set_item("logxcat", logxcat.into_pyarray(py))?;
    if let Some(binding) = traj.binding {
        let dim_n = binding.logxbind.ncols();
        let logxbind = Array2::from_shape_vec((npts, dim_n), row_major(&binding.logxbind))
            .map_err(shape_err)?;
        let logder_flat: Vec<f64> = binding.logder.iter().flat_map(row_major).collect();
        let logder =
            Array3::from_shape_vec((npts, dim_n, dim_n), logder_flat).map_err(shape_err)?;
        dict.set_item("logxbind", logxbind.into_pyarray(py))?;
        dict.set_item("logder", logder.into_pyarray(py))?;
    }
    dict.set_item("depleted_at", traj.depleted_at)?;
    Ok(dict.into_any().unbind())
}

#[pyfunction(signature = (
    n_mat,
    l_mat,
    s_mat,
    kbind,
    kcat,
    total_const,
    total_const_idx,
    xcat_in_total_idx,
    cat_active_in_xbind_idx,
    logxcat_init,
    t_init,
    t_end,
    npts,
    a_mat=None,
    get_logder_xbind=true,
    n_threads=None
))]
#[allow(clippy::too_many_arguments)]
pub fn simulate_binding_catalysis(
    py: Python<'_>,
    n_mat: PyReadonlyArray2<f64>,
    l_mat: PyReadonlyArray2<f64>,
    s_mat: PyReadonlyArray2<f64>,
    kbind: PyReadonlyArray1<f64>,
    kcat: PyReadonlyArrayDyn<f64>,
    total_const: PyReadonlyArray1<f64>,
    total_const_idx: Vec<usize>,
    xcat_in_total_idx: Vec<usize>,
    cat_active_in_xbind_idx: Vec<usize>,
    logxcat_init: PyReadonlyArray1<f64>,
    t_init: f64,
    t_end: f64,
    npts: usize,
    a_mat: Option<PyReadonlyArray2<f64>>,
    get_logder_xbind: bool,
    n_threads: Option<usize>,
) -> PyResult<Py<PyAny>> {
    let n_mat = read_matrix(n_mat, "n_mat")?;
    let l_mat = read_matrix(l_mat, "l_mat")?;
    let s_mat = read_matrix(s_mat, "s_mat")?;
    let a_mat = a_mat.map(|arr| read_matrix(arr, "a_mat")).transpose()?;
    let config = CouplingConfig {
        kbind: read_vector(kbind, "kbind")?,
        kcat: read_kcat(kcat)?,
        total_const: read_vector(total_const, "total_const")?,
        total_const_idx,
        xcat_in_total: CatalysisTotals::prefix(xcat_in_total_idx),
        cat_active_in_xbind_idx,
    };
    let logxcat_init = read_vector(logxcat_init, "logxcat_init")?;
    let options = EquilibriumOptions {
        n_threads,
        ..EquilibriumOptions::default()
    };

    let traj = py.detach(move || -> Result<CatalysisTrajectory, CouplingError> {
        let bn = MassActionBindingNetwork::with_options(n_mat, l_mat, options)?;
        let cn = CatalysisNetwork::new(s_mat)?;
        let coupling = BindingCatalysisCoupling::new(&bn, &cn, config)?;
        coupling.trajectory(
            &logxcat_init,
            t_init,
            t_end,
            npts,
            a_mat.as_ref(),
            get_logder_xbind,
        )
    })?;
    trajectory_into_py(py, traj)
}

#[pymodule]
fn bcn(_py: Python<'_>, module: &Bound<'_, PyModule>) -> PyResult<()> {
    module.add_function(wrap_pyfunction!(simulate_binding_catalysis, module)?)?;
    Ok(())
}
