use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;

use crate::error::{CouplingError, check_shape};

const CONSERVATION_TOLERANCE: f64 = 1e-9;
const RESTART_SPREAD: f64 = 2.0;

/// Which coordinates the rows handed to [`BindingNetwork::logder`] are in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Chart {
    /// log10 totals followed by log10 binding constants; solved before differentiating.
    Totals,
    /// log10 equilibrium concentrations of every binding species.
    Species,
}

/// Fast binding equilibrium seen by the catalysis coupling.
///
/// The combined log vector (`logtk`) has `dim_n` entries: the `dim_d`
/// conserved totals first, then the `dim_n - dim_d` binding constants.
pub trait BindingNetwork: Sync {
    fn dim_d(&self) -> usize;

    fn dim_n(&self) -> usize;

    /// Canonical conservation matrix, `dim_d x dim_n`.
    fn l_mat(&self) -> &DMatrix<f64>;

    /// log10 equilibrium concentrations for one totals/constants vector.
    fn tk2x(&self, logtk: &DVector<f64>, a_mat: &DMatrix<f64>)
    -> Result<DVector<f64>, CouplingError>;

    /// Row-wise equilibrium and logarithmic sensitivity `d log x / d log(t, k)`.
    ///
    /// Returns one `dim_n x dim_n` sensitivity per row and the time-major
    /// log10 equilibrium trajectory.
    fn logder(
        &self,
        logvar_traj: &DMatrix<f64>,
        chart: Chart,
        a_mat: &DMatrix<f64>,
    ) -> Result<(Vec<DMatrix<f64>>, DMatrix<f64>), CouplingError>;
}

#[derive(Clone, Debug)]
pub struct EquilibriumOptions {
    /// Residual max-norm at which Newton stops, in log10 units.
    pub tol: f64,
    pub max_iter: usize,
    /// Largest Newton step allowed in any coordinate (log10 units).
    pub max_step: f64,
    pub restarts: u32,
    pub seed: u64,
    /// Worker count for batched solves; `None` uses the global rayon pool.
    pub n_threads: Option<usize>,
}

impl EquilibriumOptions {
    /// Seed for the random stream of restart `attempt`, mixed with SplitMix64.
    pub(crate) fn restart_seed(&self, attempt: u32) -> u64 {
        let mut z = self
            .seed
            .wrapping_add(u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

impl Default for EquilibriumOptions {
    fn default() -> Self {
        Self {
            tol: 1e-10,
            max_iter: 200,
            max_step: 1.0,
            restarts: 8,
            seed: 0x5EED,
            n_threads: None,
        }
    }
}

/// Mass-action binding network solved by damped Newton iteration in log space.
///
/// `n_mat` (r x n) holds the binding reactions, so `log k = n_mat * log x`,
/// and `l_mat` (d x n) the conserved totals, `t = l_mat * x`.
#[derive(Clone, Debug)]
pub struct MassActionBindingNetwork {
    n_mat: DMatrix<f64>,
    l_mat: DMatrix<f64>,
    options: EquilibriumOptions,
}

impl MassActionBindingNetwork {
    pub fn new(n_mat: DMatrix<f64>, l_mat: DMatrix<f64>) -> Result<Self, CouplingError> {
        Self::with_options(n_mat, l_mat, EquilibriumOptions::default())
    }

    pub fn with_options(
        n_mat: DMatrix<f64>,
        l_mat: DMatrix<f64>,
        options: EquilibriumOptions,
    ) -> Result<Self, CouplingError> {
        let dim_n = l_mat.ncols();
        let dim_d = l_mat.nrows();
        if dim_d == 0 || dim_n == 0 {
            return Err(CouplingError::Config(
                "conservation matrix must have at least one total and one species".into(),
            ));
        }
        if n_mat.ncols() != dim_n {
            return Err(CouplingError::Config(format!(
                "binding stoichiometry has {} species columns, conservation matrix has {}",
                n_mat.ncols(),
                dim_n
            )));
        }
        if dim_d + n_mat.nrows() != dim_n {
            return Err(CouplingError::Config(format!(
                "{} totals and {} binding reactions do not span {} species",
                dim_d,
                n_mat.nrows(),
                dim_n
            )));
        }
        if n_mat.iter().chain(l_mat.iter()).any(|v| !v.is_finite()) {
            return Err(CouplingError::Config(
                "binding network matrices must be finite".into(),
            ));
        }
        let leak = (&l_mat * n_mat.transpose()).amax();
        if leak > CONSERVATION_TOLERANCE {
            return Err(CouplingError::Config(format!(
                "conservation matrix is not conserved by the binding reactions (|L N^T| = {leak:e})"
            )));
        }
        if options.tol <= 0.0 || options.max_step <= 0.0 || options.max_iter == 0 {
            return Err(CouplingError::Config(
                "equilibrium tolerance, step cap and iteration budget must be positive".into(),
            ));
        }
        Ok(Self {
            n_mat,
            l_mat,
            options,
        })
    }

    pub fn n_mat(&self) -> &DMatrix<f64> {
        &self.n_mat
    }

    pub fn options(&self) -> &EquilibriumOptions {
        &self.options
    }

    fn check_a_mat(&self, a_mat: &DMatrix<f64>) -> Result<(), CouplingError> {
        check_shape(
            "conservation matrix",
            a_mat.nrows(),
            a_mat.ncols(),
            self.dim_d(),
            self.dim_n(),
        )
    }

    /// Residual of the equilibrium equations and their Jacobian with respect to log x.
    ///
    /// `None` when some total is not strictly positive at `logx`.
    fn residual_and_jacobian(
        &self,
        logx: &DVector<f64>,
        logtk: &DVector<f64>,
        a_mat: &DMatrix<f64>,
    ) -> Option<(DVector<f64>, DMatrix<f64>)> {
        let dim_d = self.dim_d();
        let x = logx.map(|v| 10f64.powf(v));
        let totals = a_mat * &x;
        if totals.iter().any(|&t| t <= 0.0 || !t.is_finite()) {
            return None;
        }
        let binding = &self.n_mat * logx;
        let residual = DVector::from_fn(self.dim_n(), |i, _| {
            if i < dim_d {
                totals[i].log10() - logtk[i]
            } else {
                binding[i - dim_d] - logtk[i]
            }
        });
        Some((residual, self.jacobian_at(&x, &totals, a_mat)))
    }

    fn jacobian_at(
        &self,
        x: &DVector<f64>,
        totals: &DVector<f64>,
        a_mat: &DMatrix<f64>,
    ) -> DMatrix<f64> {
        let dim_d = self.dim_d();
        DMatrix::from_fn(self.dim_n(), self.dim_n(), |i, j| {
            if i < dim_d {
                a_mat[(i, j)] * x[j] / totals[i]
            } else {
                self.n_mat[(i - dim_d, j)]
            }
        })
    }

    fn sensitivity(
        &self,
        logx: &DVector<f64>,
        a_mat: &DMatrix<f64>,
    ) -> Result<DMatrix<f64>, CouplingError> {
        let x = logx.map(|v| 10f64.powf(v));
        let totals = a_mat * &x;
        if totals.iter().any(|&t| t <= 0.0 || !t.is_finite()) {
            return Err(CouplingError::Equilibrium(
                "conserved totals are not positive at the given concentrations".into(),
            ));
        }
        self.jacobian_at(&x, &totals, a_mat)
            .try_inverse()
            .ok_or_else(|| {
                CouplingError::Equilibrium("equilibrium Jacobian is singular".into())
            })
    }

    fn initial_guess(&self, logtk: &DVector<f64>, a_mat: &DMatrix<f64>) -> DVector<f64> {
        DVector::from_fn(self.dim_n(), |j, _| {
            let bound = (0..self.dim_d())
                .filter(|&i| a_mat[(i, j)] > 0.0)
                .map(|i| logtk[i] - a_mat[(i, j)].log10())
                .fold(f64::INFINITY, f64::min);
            if bound.is_finite() { bound } else { 0.0 }
        })
    }

    fn newton(
        &self,
        mut logx: DVector<f64>,
        logtk: &DVector<f64>,
        a_mat: &DMatrix<f64>,
    ) -> Option<DVector<f64>> {
        let opts = &self.options;
        for _ in 0..opts.max_iter {
            let (residual, jacobian) = self.residual_and_jacobian(&logx, logtk, a_mat)?;
            if !residual.iter().all(|r| r.is_finite()) {
                return None;
            }
            if residual.amax() < opts.tol {
                return Some(logx);
            }
            let mut step = jacobian.lu().solve(&(-residual))?;
            if !step.iter().all(|s| s.is_finite()) {
                return None;
            }
            let largest = step.amax();
            if largest > opts.max_step {
                step *= opts.max_step / largest;
            }
            logx += step;
        }
        let (residual, _) = self.residual_and_jacobian(&logx, logtk, a_mat)?;
        (residual.amax() < opts.tol).then_some(logx)
    }

    fn solve(
        &self,
        logtk: &DVector<f64>,
        a_mat: &DMatrix<f64>,
    ) -> Result<DVector<f64>, CouplingError> {
        if logtk.len() != self.dim_n() {
            return Err(CouplingError::Config(format!(
                "totals/constants vector length {} does not match dim_n {}",
                logtk.len(),
                self.dim_n()
            )));
        }
        if logtk.iter().any(|v| !v.is_finite()) {
            return Err(CouplingError::Equilibrium(
                "totals/constants vector contains non-finite entries".into(),
            ));
        }
        let guess = self.initial_guess(logtk, a_mat);
        if let Some(logx) = self.newton(guess.clone(), logtk, a_mat) {
            return Ok(logx);
        }
        for attempt in 1..=self.options.restarts {
            let mut rng = ChaCha8Rng::seed_from_u64(self.options.restart_seed(attempt));
            let start = guess.map(|v| v + rng.gen_range(-RESTART_SPREAD..RESTART_SPREAD));
            debug!("equilibrium restart {attempt} from perturbed initial guess");
            if let Some(logx) = self.newton(start, logtk, a_mat) {
                warn!("equilibrium solve converged only after {attempt} restart(s)");
                return Ok(logx);
            }
        }
        Err(CouplingError::Equilibrium(format!(
            "Newton iteration did not converge after {} restart(s)",
            self.options.restarts
        )))
    }

    fn logder_row(
        &self,
        row: DVector<f64>,
        chart: Chart,
        a_mat: &DMatrix<f64>,
    ) -> Result<(DMatrix<f64>, DVector<f64>), CouplingError> {
        let logx = match chart {
            Chart::Totals => self.solve(&row, a_mat)?,
            Chart::Species => row,
        };
        let logder = self.sensitivity(&logx, a_mat)?;
        Ok((logder, logx))
    }
}

impl BindingNetwork for MassActionBindingNetwork {
    fn dim_d(&self) -> usize {
        self.l_mat.nrows()
    }

    fn dim_n(&self) -> usize {
        self.l_mat.ncols()
    }

    fn l_mat(&self) -> &DMatrix<f64> {
        &self.l_mat
    }

    fn tk2x(
        &self,
        logtk: &DVector<f64>,
        a_mat: &DMatrix<f64>,
    ) -> Result<DVector<f64>, CouplingError> {
        self.check_a_mat(a_mat)?;
        self.solve(logtk, a_mat)
    }

    fn logder(
        &self,
        logvar_traj: &DMatrix<f64>,
        chart: Chart,
        a_mat: &DMatrix<f64>,
    ) -> Result<(Vec<DMatrix<f64>>, DMatrix<f64>), CouplingError> {
        self.check_a_mat(a_mat)?;
        if logvar_traj.ncols() != self.dim_n() {
            return Err(CouplingError::Config(format!(
                "trajectory has {} columns, expected dim_n {}",
                logvar_traj.ncols(),
                self.dim_n()
            )));
        }
        let npts = logvar_traj.nrows();
        let solve_rows = || -> Result<Vec<(DMatrix<f64>, DVector<f64>)>, CouplingError> {
            (0..npts)
                .into_par_iter()
                .map(|k| self.logder_row(logvar_traj.row(k).transpose(), chart, a_mat))
                .collect()
        };
        let rows = match self.options.n_threads {
            Some(n) => ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .map_err(|e| CouplingError::Config(format!("thread pool error: {e}")))?
                .install(solve_rows)?,
            None => solve_rows()?,
        };

        let mut logx_traj = DMatrix::zeros(npts, self.dim_n());
        let mut logder = Vec::with_capacity(npts);
        for (k, (sens, logx)) in rows.into_iter().enumerate() {
            logx_traj.set_row(k, &logx.transpose());
            logder.push(sens);
        }
        Ok((logder, logx_traj))
    }
}
