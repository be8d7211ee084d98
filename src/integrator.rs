use std::f64::consts::SQRT_2;

use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::error::CouplingError;

// Shampine & Reichelt Rosenbrock 2(3) coefficients.
const GAMMA: f64 = 1.0 / (2.0 + SQRT_2);
const E32: f64 = 6.0 + SQRT_2;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 5.0;
const SAFETY: f64 = 0.8;
const EVENT_BISECTIONS: usize = 60;
const TIME_EPSILON: f64 = 1e-12;

/// Right-hand side of `dy/dt = f(t, y)` plus an optional terminal event.
pub trait OdeSystem {
    fn dim(&self) -> usize;

    fn rhs(&self, t: f64, y: &DVector<f64>) -> Result<DVector<f64>, CouplingError>;

    /// Integration stops the first time this value falls from positive to
    /// non-positive between two accepted steps.
    fn terminal_event(&self, _t: f64, _y: &DVector<f64>) -> Option<f64> {
        None
    }
}

pub trait StiffIntegrator {
    /// Integrates from `t_eval[0]` and reports the state at every `t_eval`
    /// point reached before the terminal event, if any.
    fn integrate<S: OdeSystem + ?Sized>(
        &self,
        system: &S,
        y0: &DVector<f64>,
        t_eval: &[f64],
    ) -> Result<OdeSolution, CouplingError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IntegrationStats {
    pub n_steps: usize,
    pub n_rejected: usize,
    pub n_rhs: usize,
    pub n_jac: usize,
}

#[derive(Clone, Debug)]
pub struct OdeSolution {
    pub t: Vec<f64>,
    pub y: Vec<DVector<f64>>,
    /// Time at which the terminal event fired; the last sample sits there.
    pub event_time: Option<f64>,
    pub stats: IntegrationStats,
}

#[derive(Clone, Debug)]
pub struct IntegratorOptions {
    pub rtol: f64,
    pub atol: f64,
    pub h_init: Option<f64>,
    /// Largest step the controller may take.
    pub h_max: Option<f64>,
    /// Smallest step relative to `max(|t|, 1)`.
    pub h_min: f64,
    /// Budget of attempted steps, accepted and rejected.
    pub max_steps: usize,
}

impl Default for IntegratorOptions {
    fn default() -> Self {
        Self {
            rtol: 1e-6,
            atol: 1e-9,
            h_init: None,
            h_max: None,
            h_min: 1e-12,
            max_steps: 100_000,
        }
    }
}

/// Linearly implicit, L-stable Rosenbrock method of order 2 with an
/// embedded order 3 error estimate.
#[derive(Clone, Debug, Default)]
pub struct Rosenbrock23 {
    options: IntegratorOptions,
}

impl Rosenbrock23 {
    pub fn new(options: IntegratorOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &IntegratorOptions {
        &self.options
    }

    fn eval<S: OdeSystem + ?Sized>(
        &self,
        system: &S,
        t: f64,
        y: &DVector<f64>,
        stats: &mut IntegrationStats,
    ) -> Result<DVector<f64>, CouplingError> {
        stats.n_rhs += 1;
        let dy = system.rhs(t, y)?;
        if dy.len() != y.len() {
            return Err(CouplingError::Integration(format!(
                "right-hand side returned {} values for a state of length {}",
                dy.len(),
                y.len()
            )));
        }
        Ok(dy)
    }

    fn jacobian<S: OdeSystem + ?Sized>(
        &self,
        system: &S,
        t: f64,
        y: &DVector<f64>,
        f0: &DVector<f64>,
        stats: &mut IntegrationStats,
    ) -> Result<DMatrix<f64>, CouplingError> {
        let n = y.len();
        let mut jac = DMatrix::zeros(n, n);
        for j in 0..n {
            let delta = f64::EPSILON.sqrt() * y[j].abs().max(1.0);
            let mut shifted = y.clone();
            shifted[j] += delta;
            let f = self.eval(system, t, &shifted, stats)?;
            jac.set_column(j, &((f - f0) / delta));
        }
        stats.n_jac += 1;
        Ok(jac)
    }

    fn cap_step(&self, h: f64) -> f64 {
        self.options.h_max.map_or(h, |h_max| h.min(h_max))
    }

    fn initial_step(&self, y: &DVector<f64>, f: &DVector<f64>, span: f64) -> f64 {
        if let Some(h) = self.options.h_init {
            return self.cap_step(h.min(span));
        }
        let opts = &self.options;
        let weighted = |v: &DVector<f64>| {
            v.iter()
                .zip(y.iter())
                .map(|(a, b)| (a / (opts.atol + opts.rtol * b.abs())).abs())
                .fold(0.0, f64::max)
        };
        let d0 = weighted(y);
        let d1 = weighted(f);
        let h = if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            0.01 * d0 / d1
        };
        self.cap_step(h.min(span))
    }

    fn error_norm(&self, err: &DVector<f64>, y: &DVector<f64>, y_new: &DVector<f64>) -> f64 {
        let opts = &self.options;
        err.iter()
            .zip(y.iter().zip(y_new.iter()))
            .map(|(e, (a, b))| e.abs() / (opts.atol + opts.rtol * a.abs().max(b.abs())))
            .fold(0.0, |acc: f64, v| {
                if acc.is_nan() || v.is_nan() {
                    f64::NAN
                } else {
                    acc.max(v)
                }
            })
    }

    fn check_inputs(
        &self,
        dim: usize,
        y0: &DVector<f64>,
        t_eval: &[f64],
    ) -> Result<(), CouplingError> {
        let opts = &self.options;
        if !(opts.rtol > 0.0 && opts.atol > 0.0 && opts.h_min > 0.0) || opts.max_steps == 0 {
            return Err(CouplingError::Config(
                "integrator tolerances, minimum step and step budget must be positive".into(),
            ));
        }
        if let Some(h) = opts.h_init {
            if !(h > 0.0 && h.is_finite()) {
                return Err(CouplingError::Config("initial step must be positive".into()));
            }
        }
        if let Some(h) = opts.h_max {
            if !(h > 0.0) {
                return Err(CouplingError::Config("maximum step must be positive".into()));
            }
        }
        if t_eval.len() < 2 {
            return Err(CouplingError::Config(
                "at least two evaluation times are required".into(),
            ));
        }
        if t_eval.iter().any(|t| !t.is_finite()) || t_eval.windows(2).any(|w| w[1] <= w[0]) {
            return Err(CouplingError::Config(
                "evaluation times must be finite and strictly ascending".into(),
            ));
        }
        if y0.len() != dim {
            return Err(CouplingError::Config(format!(
                "initial state length {} does not match system dimension {}",
                y0.len(),
                dim
            )));
        }
        if y0.iter().any(|v| !v.is_finite()) {
            return Err(CouplingError::Config("initial state must be finite".into()));
        }
        Ok(())
    }
}

/// Cubic Hermite interpolant over one accepted step.
struct HermiteSegment<'a> {
    t0: f64,
    h: f64,
    y0: &'a DVector<f64>,
    f0: &'a DVector<f64>,
    y1: &'a DVector<f64>,
    f1: &'a DVector<f64>,
}

impl HermiteSegment<'_> {
    fn at(&self, t: f64) -> DVector<f64> {
        let s = (t - self.t0) / self.h;
        let s2 = s * s;
        let s3 = s2 * s;
        let h00 = 2.0 * s3 - 3.0 * s2 + 1.0;
        let h10 = s3 - 2.0 * s2 + s;
        let h01 = -2.0 * s3 + 3.0 * s2;
        let h11 = s3 - s2;
        self.y0 * h00 + self.f0 * (self.h * h10) + self.y1 * h01 + self.f1 * (self.h * h11)
    }

    /// First time in `(t0, t0 + h]` where the event value is non-positive.
    fn locate<S: OdeSystem + ?Sized>(&self, system: &S) -> f64 {
        let mut lo = self.t0;
        let mut hi = self.t0 + self.h;
        for _ in 0..EVENT_BISECTIONS {
            let mid = 0.5 * (lo + hi);
            if mid <= lo || mid >= hi {
                break;
            }
            match system.terminal_event(mid, &self.at(mid)) {
                Some(g) if g > 0.0 => lo = mid,
                _ => hi = mid,
            }
        }
        hi
    }
}

impl StiffIntegrator for Rosenbrock23 {
    fn integrate<S: OdeSystem + ?Sized>(
        &self,
        system: &S,
        y0: &DVector<f64>,
        t_eval: &[f64],
    ) -> Result<OdeSolution, CouplingError> {
        self.check_inputs(system.dim(), y0, t_eval)?;
        let opts = &self.options;
        let n = y0.len();
        let t_start = t_eval[0];
        let t_end = t_eval[t_eval.len() - 1];
        let mut stats = IntegrationStats::default();

        let mut t = t_start;
        let mut y = y0.clone();
        let mut f = self.eval(system, t, &y, &mut stats)?;
        let mut g = system.terminal_event(t, &y);
        let mut h = self.initial_step(&y, &f, t_end - t_start);

        let mut out_t = Vec::with_capacity(t_eval.len());
        let mut out_y = Vec::with_capacity(t_eval.len());
        out_t.push(t_start);
        out_y.push(y.clone());
        let mut next = 1usize;

        debug!("rosenbrock23: integrating {n} states over [{t_start}, {t_end}]");

        while t < t_end {
            let jac = self.jacobian(system, t, &y, &f, &mut stats)?;
            let identity = DMatrix::<f64>::identity(n, n);
            let (t_new, y_new, f_new, err) = loop {
                if stats.n_steps + stats.n_rejected >= opts.max_steps {
                    return Err(CouplingError::Integration(format!(
                        "step budget of {} exhausted at t = {t}",
                        opts.max_steps
                    )));
                }
                let h_floor = opts.h_min * t.abs().max(1.0);
                if h < h_floor {
                    return Err(CouplingError::Integration(format!(
                        "step size {h:e} fell below the minimum at t = {t}"
                    )));
                }
                let t_new = if t + h >= t_end - h_floor {
                    h = t_end - t;
                    t_end
                } else {
                    t + h
                };

                let lu = (&identity - &jac * (h * GAMMA)).lu();
                let Some(k1) = lu.solve(&f) else {
                    stats.n_rejected += 1;
                    h *= 0.5;
                    continue;
                };
                let f1 = self.eval(system, t + 0.5 * h, &(&y + &k1 * (0.5 * h)), &mut stats)?;
                let Some(k2) = lu.solve(&(&f1 - &k1)).map(|k| k + &k1) else {
                    stats.n_rejected += 1;
                    h *= 0.5;
                    continue;
                };
                let y_new = &y + &k2 * h;
                if y_new.iter().any(|v| !v.is_finite()) {
                    stats.n_rejected += 1;
                    h *= 0.25;
                    continue;
                }
                let f_new = self.eval(system, t_new, &y_new, &mut stats)?;
                let rhs3 = &f_new - (&k2 - &f1) * E32 - (&k1 - &f) * 2.0;
                let Some(k3) = lu.solve(&rhs3) else {
                    stats.n_rejected += 1;
                    h *= 0.5;
                    continue;
                };
                let local_err = (&k1 - &k2 * 2.0 + &k3) * (h / 6.0);
                let err = self.error_norm(&local_err, &y, &y_new);
                if !err.is_finite() {
                    stats.n_rejected += 1;
                    h *= 0.25;
                    continue;
                }
                if err > 1.0 {
                    stats.n_rejected += 1;
                    h *= (SAFETY * err.powf(-1.0 / 3.0)).max(MIN_FACTOR);
                    continue;
                }
                break (t_new, y_new, f_new, err);
            };
            stats.n_steps += 1;

            let segment = HermiteSegment {
                t0: t,
                h: t_new - t,
                y0: &y,
                f0: &f,
                y1: &y_new,
                f1: &f_new,
            };
            let g_new = system.terminal_event(t_new, &y_new);
            if let (Some(g0), Some(g1)) = (g, g_new) {
                if g0 > 0.0 && g1 <= 0.0 {
                    let t_event = segment.locate(system);
                    let t_cut = t_event - TIME_EPSILON * t_event.abs().max(1.0);
                    while next < t_eval.len() && t_eval[next] < t_cut {
                        out_t.push(t_eval[next]);
                        out_y.push(segment.at(t_eval[next]));
                        next += 1;
                    }
                    out_t.push(t_event);
                    out_y.push(segment.at(t_event));
                    debug!(
                        "rosenbrock23: terminal event at t = {t_event} after {} steps",
                        stats.n_steps
                    );
                    return Ok(OdeSolution {
                        t: out_t,
                        y: out_y,
                        event_time: Some(t_event),
                        stats,
                    });
                }
            }
            while next < t_eval.len() && t_eval[next] <= t_new {
                out_t.push(t_eval[next]);
                out_y.push(if t_eval[next] == t_new {
                    y_new.clone()
                } else {
                    segment.at(t_eval[next])
                });
                next += 1;
            }

            let factor = if err == 0.0 {
                MAX_FACTOR
            } else {
                (SAFETY * err.powf(-1.0 / 3.0)).clamp(MIN_FACTOR, MAX_FACTOR)
            };
            t = t_new;
            y = y_new;
            f = f_new;
            g = g_new;
            h = self.cap_step(h * factor);
        }

        debug!(
            "rosenbrock23: reached t = {t_end} in {} steps ({} rejected, {} rhs evaluations)",
            stats.n_steps, stats.n_rejected, stats.n_rhs
        );
        Ok(OdeSolution {
            t: out_t,
            y: out_y,
            event_time: None,
            stats,
        })
    }
}
