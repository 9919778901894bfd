//! Forward sensitivity analysis: strategies, options, and per-sensitivity
//! bookkeeping shared by the DAE and ODE integrators (spec §4.4).

use ndarray::*;

use crate::error::SolverError;

/// Coupling strategy between the state and sensitivity corrector solves
/// (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// One stacked system over `(y, s_1, ..., s_Ns)`.
    Simultaneous,
    /// State solved to convergence first, then one Newton over the whole
    /// `Ns`-vector of sensitivities.
    Staggered,
    /// State solved first, then each `s_i` iterated independently.
    Staggered1,
}

/// Whether the user's analytic sensitivity RHS is supplied in batch
/// (`ALLSENS`) or one parameter at a time (`ONESENS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RhsMode {
    AllSens,
    OneSens,
}

/// Where the sensitivity RHS comes from. Fixed once at `sens_malloc` time
/// (spec.md §9, open question 2: this replaces the source's separately
/// mutable `iresS`/`resSDQ` flags with one enum set at construction).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensRhsSource {
    Analytic(RhsMode),
    Dq,
}

/// How sensitivity error contributes to the local error test (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorControl {
    /// Sensitivity norms enter the error test via `max`-combine.
    Full,
    /// Sensitivity norms enter only the convergence test.
    Partial,
}

/// One parameter's entry in `plist`: which parameter, and whether it only
/// affects the initial condition (negative entries in spec §3) rather than
/// the RHS.
#[derive(Debug, Clone, Copy)]
pub struct ParamRef {
    pub index: usize,
    pub affects_rhs: bool,
}

impl ParamRef {
    pub fn from_signed(entry: i64) -> Self {
        ParamRef {
            index: (entry.unsigned_abs() as usize).saturating_sub(1),
            affects_rhs: entry > 0,
        }
    }
}

/// Per-sensitivity convergence-failure counters for STAGGERED1 (spec §3,
/// §9 design note on `{ncfnS1, nniS1, netfS1}`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SensitivityCounters {
    pub nni_s1: u64,
    pub ncfn_s1: u64,
    pub netf_s1: u64,
}

/// Sensitivity substate configuration (spec §3).
pub struct SensitivityOptions<T> {
    pub ns: usize,
    pub strategy: Strategy,
    pub rhs: SensRhsSource,
    pub p: Array1<T>,
    pub pbar: Array1<T>,
    pub plist: Vec<ParamRef>,
    pub rho_max: T,
    pub err_con: ErrorControl,
}

impl<T: num_traits::Float> SensitivityOptions<T> {
    /// Validate the `STAGGERED1` / `ALLSENS` mutual-exclusion rule (spec
    /// §4.4, tested in spec §8).
    pub fn validate(&self) -> Result<(), SolverError> {
        if self.strategy == Strategy::Staggered1 {
            if let SensRhsSource::Analytic(RhsMode::AllSens) = self.rhs {
                return Err(SolverError::Staggered1RequiresOneSens {});
            }
        }
        if self.plist.len() != self.ns || self.pbar.len() != self.ns {
            return Err(SolverError::IllegalInput {
                reason: "plist/pbar length must equal Ns".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dq;
    use crate::exponential_decay::exact_sensitivity;

    #[test]
    fn staggered1_rejects_allsens() {
        let opts = SensitivityOptions {
            ns: 1,
            strategy: Strategy::Staggered1,
            rhs: SensRhsSource::Analytic(RhsMode::AllSens),
            p: array![1.0],
            pbar: array![1.0],
            plist: vec![ParamRef::from_signed(1)],
            rho_max: 0.0,
            err_con: ErrorControl::Full,
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn staggered1_accepts_onesens() {
        let opts = SensitivityOptions {
            ns: 1,
            strategy: Strategy::Staggered1,
            rhs: SensRhsSource::Analytic(RhsMode::OneSens),
            p: array![1.0],
            pbar: array![1.0],
            plist: vec![ParamRef::from_signed(1)],
            rho_max: 0.0,
            err_con: ErrorControl::Full,
        };
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn negative_plist_entry_is_ic_only() {
        let p = ParamRef::from_signed(-2);
        assert_eq!(p.index, 1);
        assert!(!p.affects_rhs);
    }

    /// Scenario 6 (spec §8): exponential decay, `p = lambda`, default
    /// `pbar`; the DQ scheme picked for the sensitivity RHS must actually
    /// change when `rho_max` moves away from `0`, using the analytic
    /// sensitivity `exact_sensitivity` as the `||s_i||_wrms` stand-in a real
    /// DQ setup would compute from the live sensitivity state.
    #[test]
    fn dq_scheme_switches_with_rho_max_for_exponential_decay() {
        let lambda = -1.0_f64;
        let y0 = 1.0_f64;
        let t = 0.5_f64;
        let pbar = 1.0_f64;

        let s_i = exact_sensitivity(lambda, y0, t);
        let delta = dq::base_perturbation(1e-6, f64::EPSILON);
        let delta_p = dq::delta_p(pbar, delta);
        let delta_y = dq::delta_y(s_i.abs(), pbar, delta);

        let at_zero = dq::select_scheme(delta_y, delta_p, 0.0_f64);
        assert_eq!(at_zero, dq::DqScheme::Simultaneous(dq::Difference::Centered));

        let at_negative = dq::select_scheme(delta_y, delta_p, -1.0_f64);
        assert_eq!(at_negative, dq::DqScheme::Separate(dq::Difference::Forward));

        assert_ne!(at_zero, at_negative);
    }
}
