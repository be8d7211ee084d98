//! Catalysis dynamics regulated by a fast binding equilibrium.
//!
//! A [`CatalysisNetwork`] evolves on the slow timescale with fluxes set by
//! catalytically active species, whose concentrations come from the
//! equilibrium of a [`BindingNetwork`] recomputed at every derivative
//! evaluation. [`BindingCatalysisCoupling`] ties the two together, drives a
//! stiff integrator and rebuilds binding-level trajectories afterwards.

pub mod binding;
pub mod catalysis;
pub mod coupling;
pub mod error;
pub mod integrator;

#[cfg(feature = "python")]
mod python;

pub use binding::{BindingNetwork, Chart, EquilibriumOptions, MassActionBindingNetwork};
pub use catalysis::CatalysisNetwork;
pub use coupling::{
    BindingCatalysisCoupling, BindingTrajectory, CatalysisTotals, CatalysisTrajectory,
    CouplingConfig, LOG_DEPLETION_FLOOR,
};
pub use error::CouplingError;
pub use integrator::{
    IntegrationStats, IntegratorOptions, OdeSolution, OdeSystem, Rosenbrock23, StiffIntegrator,
};
