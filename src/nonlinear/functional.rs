//! Fixed-point (functional) iteration corrector, used for the non-stiff
//! Adams/functional combination (spec §4.3):
//!
//! ```text
//! y^{m+1} = y_pred + (h / l1) * (f(t_n, y^m) - z_pred)
//! ```
//!
//! No linear solve is involved, so this does not fit the `NLProblem`/
//! `NLSolver` shape used by [`crate::nonlinear::newton`] — it is a plain
//! iterate-to-convergence loop driven directly by the owning integrator.

use ndarray::*;

use crate::nonlinear::traits::Error;
use crate::traits::NormRms;

pub struct FunctionalStats {
    pub niters: u64,
    pub nconvfails: u64,
}

impl FunctionalStats {
    pub fn new() -> Self {
        FunctionalStats {
            niters: 0,
            nconvfails: 0,
        }
    }
}

impl Default for FunctionalStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the fixed-point iteration to convergence (or gives up with a
/// recoverable `ConvergenceRecover` error after `maxiters`).
///
/// `eval_rhs(y, out)` should fill `out` with `f(t_n, y)` (a recoverable
/// residual failure should be propagated as `Err`).
/// `y` starts as the predictor and is updated in place.
pub fn solve<T, F>(
    stats: &mut FunctionalStats,
    maxiters: usize,
    y: &mut Array1<T>,
    z_pred: &Array1<T>,
    h_over_l1: T,
    ewt: &Array1<T>,
    tol: T,
    mut eval_rhs: F,
) -> Result<(), failure::Error>
where
    T: num_traits::Float + std::ops::AddAssign + std::ops::SubAssign + std::fmt::Debug,
    F: FnMut(&Array1<T>, &mut Array1<T>) -> Result<(), failure::Error>,
{
    let n = y.len();
    let mut f = Array1::<T>::zeros(n);
    let mut delta = Array1::<T>::zeros(n);
    let mut crate_rate = T::one();
    let mut del_prev_norm: Option<T> = None;

    let y_pred = y.clone();

    for _ in 0..maxiters {
        stats.niters += 1;
        eval_rhs(y, &mut f)?;

        // delta = y_pred + (h/l1) * (f - z_pred) - y
        delta.assign(&f);
        delta -= z_pred;
        delta.mapv_inplace(|v| v * h_over_l1);
        delta += &y_pred;
        delta -= &*y;

        *y += &delta;

        let del_norm = delta.norm_wrms(ewt);
        if let Some(prev) = del_prev_norm {
            if prev > T::zero() {
                crate_rate = (crate_rate * T::from(0.3).unwrap()).max(del_norm / prev);
            }
        }
        del_prev_norm = Some(del_norm);

        let denom = T::one() - crate_rate.min(T::from(0.9).unwrap());
        if denom > T::zero() && (crate_rate * del_norm / denom) < tol {
            return Ok(());
        }
    }

    stats.nconvfails += 1;
    Err(failure::Error::from(Error::ConvergenceRecover {}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converges_on_linear_decay() {
        // y' = -y, functional corrector with l1 = 1, h small enough to be
        // non-stiff.
        let h = 0.01_f64;
        let y_pred = array![1.0];
        let z_pred = array![0.0];
        let ewt = array![1.0e6];
        let mut stats = FunctionalStats::new();
        let mut y = y_pred.clone();

        solve(&mut stats, 10, &mut y, &z_pred, h, &ewt, 1e-4, |y, f| {
            f.assign(&(-y));
            Ok(())
        })
        .unwrap();

        let expected = 1.0 / (1.0 + h);
        assert!((y[0] - expected).abs() < 1e-6);
    }
}
