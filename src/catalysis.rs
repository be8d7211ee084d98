use nalgebra::DMatrix;

use crate::error::CouplingError;

/// Stoichiometry of the slow catalysis reactions.
///
/// Rows are catalysis species (the state variables of the slow dynamics),
/// columns are catalysis reactions. The matrix need not be full rank.
#[derive(Clone, Debug)]
pub struct CatalysisNetwork {
    s_mat: DMatrix<f64>,
    species_labels: Option<Vec<String>>,
    flux_labels: Option<Vec<String>>,
}

impl CatalysisNetwork {
    pub fn new(s_mat: DMatrix<f64>) -> Result<Self, CouplingError> {
        if s_mat.nrows() == 0 || s_mat.ncols() == 0 {
            return Err(CouplingError::Config(
                "catalysis stoichiometry must contain at least one species and one reaction".into(),
            ));
        }
        if s_mat.iter().any(|v| !v.is_finite()) {
            return Err(CouplingError::Config(
                "catalysis stoichiometry entries must be finite".into(),
            ));
        }
        Ok(Self {
            s_mat,
            species_labels: None,
            flux_labels: None,
        })
    }

    /// Attaches display names. Labels are never read by the dynamics.
    pub fn with_labels(
        mut self,
        species: Vec<String>,
        fluxes: Vec<String>,
    ) -> Result<Self, CouplingError> {
        if species.len() != self.n_cat() {
            return Err(CouplingError::Config(format!(
                "{} species labels for {} catalysis species",
                species.len(),
                self.n_cat()
            )));
        }
        if fluxes.len() != self.m_cat() {
            return Err(CouplingError::Config(format!(
                "{} flux labels for {} catalysis reactions",
                fluxes.len(),
                self.m_cat()
            )));
        }
        self.species_labels = Some(species);
        self.flux_labels = Some(fluxes);
        Ok(self)
    }

    pub fn s_mat(&self) -> &DMatrix<f64> {
        &self.s_mat
    }

    pub fn n_cat(&self) -> usize {
        self.s_mat.nrows()
    }

    pub fn m_cat(&self) -> usize {
        self.s_mat.ncols()
    }

    pub fn species_labels(&self) -> Option<&[String]> {
        self.species_labels.as_deref()
    }

    pub fn flux_labels(&self) -> Option<&[String]> {
        self.flux_labels.as_deref()
    }
}
