use std::f64::consts::LN_10;

use log::{debug, info};
use nalgebra::{DMatrix, DVector};

use crate::binding::{BindingNetwork, Chart};
use crate::catalysis::CatalysisNetwork;
use crate::error::{CouplingError, check_shape};
use crate::integrator::{
    IntegrationStats, IntegratorOptions, OdeSystem, Rosenbrock23, StiffIntegrator,
};

/// log10 concentration below which the first catalysis species counts as depleted.
pub const LOG_DEPLETION_FLOOR: f64 = -10.0;

/// Catalysis species that are themselves conserved totals of the binding network.
///
/// They always occupy the leading positions of the catalysis state: species
/// `i < prefix_len()` is the binding total at `total_index(i)`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CatalysisTotals {
    total_idx: Vec<usize>,
}

impl CatalysisTotals {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn prefix(total_idx: Vec<usize>) -> Self {
        Self { total_idx }
    }

    /// Builds the mapping from `(catalysis index, total index)` pairs.
    ///
    /// The catalysis indices must be exactly `0, 1, .., k-1` in that order.
    pub fn from_pairs(pairs: &[(usize, usize)]) -> Result<Self, CouplingError> {
        for (position, &(xcat_idx, _)) in pairs.iter().enumerate() {
            if xcat_idx != position {
                return Err(CouplingError::Config(format!(
                    "catalysis species {xcat_idx} is mapped to a total at position {position}; \
                     totals must be the leading catalysis species in order"
                )));
            }
        }
        Ok(Self {
            total_idx: pairs.iter().map(|&(_, total)| total).collect(),
        })
    }

    pub fn prefix_len(&self) -> usize {
        self.total_idx.len()
    }

    pub fn total_index(&self, xcat_idx: usize) -> Option<usize> {
        self.total_idx.get(xcat_idx).copied()
    }

    pub fn total_indices(&self) -> &[usize] {
        &self.total_idx
    }

    fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.total_idx.iter().copied().enumerate()
    }
}

/// Everything that ties a catalysis network to a binding network.
#[derive(Clone, Debug)]
pub struct CouplingConfig {
    /// Binding constants, fixed on the catalysis timescale; length `dim_n - dim_d`.
    pub kbind: DVector<f64>,
    /// Rate constants, one row per active species and one column per reaction.
    pub kcat: DMatrix<f64>,
    /// Totals held constant during the simulation.
    pub total_const: DVector<f64>,
    pub total_const_idx: Vec<usize>,
    pub xcat_in_total: CatalysisTotals,
    /// Binding species driving each catalysis reaction; length `m_cat`.
    pub cat_active_in_xbind_idx: Vec<usize>,
}

#[derive(Clone, Debug)]
pub struct BindingTrajectory {
    /// `d log x / d log(t, k)` at every sample, each `dim_n x dim_n`.
    pub logder: Vec<DMatrix<f64>>,
    /// log10 binding species concentrations, one row per sample.
    pub logxbind: DMatrix<f64>,
}

#[derive(Clone, Debug)]
pub struct CatalysisTrajectory {
    pub t: Vec<f64>,
    /// log10 catalysis state, one row per sample.
    pub logxcat: DMatrix<f64>,
    pub binding: Option<BindingTrajectory>,
    /// Set when the first catalysis species hit the depletion floor.
    pub depleted_at: Option<f64>,
    pub stats: IntegrationStats,
}

impl CatalysisTrajectory {
    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    pub fn depleted(&self) -> bool {
        self.depleted_at.is_some()
    }
}

/// A binding network regulating a catalysis network.
///
/// Immutable after construction; every operation is a pure function of its
/// arguments and the stored constants.
pub struct BindingCatalysisCoupling<'a, B: BindingNetwork + ?Sized> {
    bn: &'a B,
    cn: &'a CatalysisNetwork,
    kbind: DVector<f64>,
    kcat: DMatrix<f64>,
    total_const: DVector<f64>,
    total_const_idx: Vec<usize>,
    xcat_in_total: CatalysisTotals,
    cat_active_in_xbind_idx: Vec<usize>,
    logkbind: DVector<f64>,
    logtotal_const: DVector<f64>,
}

impl<'a, B: BindingNetwork + ?Sized> BindingCatalysisCoupling<'a, B> {
    pub fn new(
        bn: &'a B,
        cn: &'a CatalysisNetwork,
        config: CouplingConfig,
    ) -> Result<Self, CouplingError> {
        let dim_d = bn.dim_d();
        let dim_n = bn.dim_n();
        if dim_d > dim_n {
            return Err(CouplingError::Config(format!(
                "binding network reports {dim_d} totals but only {dim_n} dimensions"
            )));
        }
        check_shape(
            "canonical conservation matrix",
            bn.l_mat().nrows(),
            bn.l_mat().ncols(),
            dim_d,
            dim_n,
        )?;

        let CouplingConfig {
            kbind,
            kcat,
            total_const,
            total_const_idx,
            xcat_in_total,
            cat_active_in_xbind_idx,
        } = config;

        if kbind.len() != dim_n - dim_d {
            return Err(CouplingError::Config(format!(
                "kbind length {} does not match {} binding constants",
                kbind.len(),
                dim_n - dim_d
            )));
        }
        if kbind.iter().any(|&k| k <= 0.0 || !k.is_finite()) {
            return Err(CouplingError::Config(
                "binding constants must be finite and strictly positive".into(),
            ));
        }
        if total_const.len() != total_const_idx.len() {
            return Err(CouplingError::Config(format!(
                "total_const length {} does not match total_const_idx length {}",
                total_const.len(),
                total_const_idx.len()
            )));
        }
        if total_const.iter().any(|&t| t <= 0.0 || !t.is_finite()) {
            return Err(CouplingError::Config(
                "constant totals must be finite and strictly positive".into(),
            ));
        }
        if xcat_in_total.prefix_len() > cn.n_cat() {
            return Err(CouplingError::Config(format!(
                "{} catalysis totals declared for {} catalysis species",
                xcat_in_total.prefix_len(),
                cn.n_cat()
            )));
        }

        let mut coverage = vec![0usize; dim_n];
        for &idx in xcat_in_total
            .total_indices()
            .iter()
            .chain(total_const_idx.iter())
        {
            if idx >= dim_d {
                return Err(CouplingError::Config(format!(
                    "total index {idx} lies outside the totals block 0..{dim_d}"
                )));
            }
            coverage[idx] += 1;
        }
        for slot in &mut coverage[dim_d..] {
            *slot += 1;
        }
        let uncovered: Vec<usize> = (0..dim_n).filter(|&i| coverage[i] == 0).collect();
        let repeated: Vec<usize> = (0..dim_n).filter(|&i| coverage[i] > 1).collect();
        if !uncovered.is_empty() || !repeated.is_empty() {
            return Err(CouplingError::Config(format!(
                "totals/constants partition is not exact: unassigned {uncovered:?}, assigned more than once {repeated:?}"
            )));
        }

        if cat_active_in_xbind_idx.len() != cn.m_cat() {
            return Err(CouplingError::Config(format!(
                "cat_active_in_xbind_idx length {} does not match reaction count {}",
                cat_active_in_xbind_idx.len(),
                cn.m_cat()
            )));
        }
        if let Some(&bad) = cat_active_in_xbind_idx.iter().find(|&&i| i >= dim_n) {
            return Err(CouplingError::Config(format!(
                "active species index {bad} exceeds number of binding species {dim_n}"
            )));
        }
        check_shape(
            "kcat",
            kcat.nrows(),
            kcat.ncols(),
            cat_active_in_xbind_idx.len(),
            cn.m_cat(),
        )?;
        if kcat.iter().any(|k| !k.is_finite()) {
            return Err(CouplingError::Config("kcat entries must be finite".into()));
        }

        let logkbind = kbind.map(f64::log10);
        let logtotal_const = total_const.map(f64::log10);
        Ok(Self {
            bn,
            cn,
            kbind,
            kcat,
            total_const,
            total_const_idx,
            xcat_in_total,
            cat_active_in_xbind_idx,
            logkbind,
            logtotal_const,
        })
    }

    pub fn binding_network(&self) -> &'a B {
        self.bn
    }

    pub fn catalysis_network(&self) -> &'a CatalysisNetwork {
        self.cn
    }

    pub fn kbind(&self) -> &DVector<f64> {
        &self.kbind
    }

    pub fn kcat(&self) -> &DMatrix<f64> {
        &self.kcat
    }

    pub fn total_const(&self) -> &DVector<f64> {
        &self.total_const
    }

    pub fn total_const_idx(&self) -> &[usize] {
        &self.total_const_idx
    }

    pub fn xcat_in_total(&self) -> &CatalysisTotals {
        &self.xcat_in_total
    }

    pub fn cat_active_in_xbind_idx(&self) -> &[usize] {
        &self.cat_active_in_xbind_idx
    }

    fn check_state(&self, logxcat: &DVector<f64>) -> Result<(), CouplingError> {
        if logxcat.len() != self.cn.n_cat() {
            return Err(CouplingError::Config(format!(
                "catalysis state length {} does not match {} catalysis species",
                logxcat.len(),
                self.cn.n_cat()
            )));
        }
        Ok(())
    }

    fn resolve_a_mat<'s>(
        &'s self,
        a_mat: Option<&'s DMatrix<f64>>,
    ) -> Result<&'s DMatrix<f64>, CouplingError> {
        let a_mat = a_mat.unwrap_or_else(|| self.bn.l_mat());
        check_shape(
            "conservation matrix",
            a_mat.nrows(),
            a_mat.ncols(),
            self.bn.dim_d(),
            self.bn.dim_n(),
        )?;
        Ok(a_mat)
    }

    fn logtk_from(&self, logxcat: &[f64]) -> DVector<f64> {
        let dim_d = self.bn.dim_d();
        let mut logtk = DVector::zeros(self.bn.dim_n());
        for (xcat_idx, total_idx) in self.xcat_in_total.iter() {
            logtk[total_idx] = logxcat[xcat_idx];
        }
        for (&total_idx, &value) in self.total_const_idx.iter().zip(self.logtotal_const.iter()) {
            logtk[total_idx] = value;
        }
        for (k, &value) in self.logkbind.iter().enumerate() {
            logtk[dim_d + k] = value;
        }
        logtk
    }

    /// log10 totals and binding constants seen by the binding network at `logxcat`.
    pub fn assemble_logtk(&self, logxcat: &DVector<f64>) -> Result<DVector<f64>, CouplingError> {
        self.check_state(logxcat)?;
        Ok(self.logtk_from(logxcat.as_slice()))
    }

    /// Row-wise [`assemble_logtk`](Self::assemble_logtk) over a time-major trajectory.
    pub fn assemble_logtk_traj(
        &self,
        logxcat_traj: &DMatrix<f64>,
    ) -> Result<DMatrix<f64>, CouplingError> {
        if logxcat_traj.ncols() != self.cn.n_cat() {
            return Err(CouplingError::Config(format!(
                "trajectory has {} columns, expected {} catalysis species",
                logxcat_traj.ncols(),
                self.cn.n_cat()
            )));
        }
        let mut logtk_traj = DMatrix::zeros(logxcat_traj.nrows(), self.bn.dim_n());
        for k in 0..logxcat_traj.nrows() {
            let row: DVector<f64> = logxcat_traj.row(k).transpose();
            logtk_traj.set_row(k, &self.logtk_from(row.as_slice()).transpose());
        }
        Ok(logtk_traj)
    }

    fn fluxes_from(&self, logxbind: &DVector<f64>) -> Result<DVector<f64>, CouplingError> {
        if logxbind.len() != self.bn.dim_n() {
            return Err(CouplingError::Equilibrium(format!(
                "equilibrium solve returned {} species, expected {}",
                logxbind.len(),
                self.bn.dim_n()
            )));
        }
        let active = DVector::from_iterator(
            self.cat_active_in_xbind_idx.len(),
            self.cat_active_in_xbind_idx
                .iter()
                .map(|&i| 10f64.powf(logxbind[i])),
        );
        Ok(self.kcat.tr_mul(&active))
    }

    /// Catalysis fluxes `kcat^T * x_active` at the equilibrium for `logxcat`.
    pub fn fluxes(
        &self,
        logxcat: &DVector<f64>,
        a_mat: &DMatrix<f64>,
    ) -> Result<DVector<f64>, CouplingError> {
        let logtk = self.assemble_logtk(logxcat)?;
        let a_mat = self.resolve_a_mat(Some(a_mat))?;
        let logxbind = self.bn.tk2x(&logtk, a_mat)?;
        self.fluxes_from(&logxbind)
    }

    /// Time derivative of the log10 catalysis state.
    ///
    /// `a_mat` is usually the binding network's `l_mat`; other matrices
    /// describe restricted or asymptotic regimes of the binding network.
    pub fn dlogxcat_dt(
        &self,
        logxcat: &DVector<f64>,
        a_mat: &DMatrix<f64>,
    ) -> Result<DVector<f64>, CouplingError> {
        let vcat = self.fluxes(logxcat, a_mat)?;
        let dxcat_dt = self.cn.s_mat() * vcat;
        Ok(DVector::from_fn(logxcat.len(), |i, _| {
            dxcat_dt[i] / 10f64.powf(logxcat[i]) / LN_10
        }))
    }

    /// Integrates the catalysis dynamics with [`Rosenbrock23`] at default
    /// tolerances, never stepping across more than one sample interval.
    ///
    /// `a_mat = None` uses the canonical conservation matrix. Integration
    /// stops early, successfully, once the first catalysis species falls to
    /// [`LOG_DEPLETION_FLOOR`]; the crossing is then the last sample.
    pub fn trajectory(
        &self,
        logxcat_init: &DVector<f64>,
        t_init: f64,
        t_end: f64,
        npts: usize,
        a_mat: Option<&DMatrix<f64>>,
        get_logder_xbind: bool,
    ) -> Result<CatalysisTrajectory, CouplingError> {
        let sample_interval = (t_end - t_init) / npts.saturating_sub(1).max(1) as f64;
        let integrator = Rosenbrock23::new(IntegratorOptions {
            h_max: (sample_interval > 0.0).then_some(sample_interval),
            ..IntegratorOptions::default()
        });
        self.trajectory_with(
            &integrator,
            logxcat_init,
            t_init,
            t_end,
            npts,
            a_mat,
            get_logder_xbind,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn trajectory_with<I: StiffIntegrator>(
        &self,
        integrator: &I,
        logxcat_init: &DVector<f64>,
        t_init: f64,
        t_end: f64,
        npts: usize,
        a_mat: Option<&DMatrix<f64>>,
        get_logder_xbind: bool,
    ) -> Result<CatalysisTrajectory, CouplingError> {
        if npts < 2 {
            return Err(CouplingError::Config(format!(
                "at least 2 sample points are required, got {npts}"
            )));
        }
        if !t_init.is_finite() || !t_end.is_finite() || t_end <= t_init {
            return Err(CouplingError::Config(format!(
                "time span [{t_init}, {t_end}] must be finite and ascending"
            )));
        }
        self.check_state(logxcat_init)?;
        if logxcat_init.iter().any(|v| !v.is_finite()) {
            return Err(CouplingError::Config(
                "initial catalysis state must be finite".into(),
            ));
        }
        let a_mat = self.resolve_a_mat(a_mat)?;

        let t_eval = linspace(t_init, t_end, npts);
        let system = CatalysisSystem {
            coupling: self,
            a_mat,
        };
        let solution = integrator.integrate(&system, logxcat_init, &t_eval)?;
        if let Some(t_event) = solution.event_time {
            info!(
                "first catalysis species depleted at t = {t_event}; stopping after {} of {npts} samples",
                solution.t.len()
            );
        }
        debug!(
            "catalysis trajectory: {} samples, {} steps, {} rejected",
            solution.t.len(),
            solution.stats.n_steps,
            solution.stats.n_rejected
        );

        let n_cat = self.cn.n_cat();
        let logxcat = DMatrix::from_fn(solution.y.len(), n_cat, |i, j| solution.y[i][j]);
        let binding = if get_logder_xbind {
            Some(self.expand(&logxcat, a_mat)?)
        } else {
            None
        };
        Ok(CatalysisTrajectory {
            t: solution.t,
            logxcat,
            binding,
            depleted_at: solution.event_time,
            stats: solution.stats,
        })
    }

    /// Binding-level equilibria and sensitivities along a catalysis trajectory.
    pub fn binding_trajectory(
        &self,
        logxcat_traj: &DMatrix<f64>,
        a_mat: Option<&DMatrix<f64>>,
    ) -> Result<BindingTrajectory, CouplingError> {
        let a_mat = self.resolve_a_mat(a_mat)?;
        self.expand(logxcat_traj, a_mat)
    }

    fn expand(
        &self,
        logxcat_traj: &DMatrix<f64>,
        a_mat: &DMatrix<f64>,
    ) -> Result<BindingTrajectory, CouplingError> {
        let logtk_traj = self.assemble_logtk_traj(logxcat_traj)?;
        let (logder, logxbind) = self.bn.logder(&logtk_traj, Chart::Totals, a_mat)?;
        if logder.len() != logtk_traj.nrows() || logxbind.nrows() != logtk_traj.nrows() {
            return Err(CouplingError::Equilibrium(format!(
                "batched equilibrium returned {} sensitivities and {} rows for {} samples",
                logder.len(),
                logxbind.nrows(),
                logtk_traj.nrows()
            )));
        }
        Ok(BindingTrajectory { logder, logxbind })
    }
}

struct CatalysisSystem<'c, 'a, B: BindingNetwork + ?Sized> {
    coupling: &'c BindingCatalysisCoupling<'a, B>,
    a_mat: &'c DMatrix<f64>,
}

impl<B: BindingNetwork + ?Sized> OdeSystem for CatalysisSystem<'_, '_, B> {
    fn dim(&self) -> usize {
        self.coupling.cn.n_cat()
    }

    fn rhs(&self, _t: f64, y: &DVector<f64>) -> Result<DVector<f64>, CouplingError> {
        self.coupling.dlogxcat_dt(y, self.a_mat)
    }

    fn terminal_event(&self, _t: f64, y: &DVector<f64>) -> Option<f64> {
        Some(y[0] - LOG_DEPLETION_FLOOR)
    }
}

fn linspace(start: f64, end: f64, npts: usize) -> Vec<f64> {
    let last = npts - 1;
    (0..npts)
        .map(|k| {
            if k == last {
                end
            } else {
                start + (end - start) * k as f64 / last as f64
            }
        })
        .collect()
}
