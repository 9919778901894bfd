//! Error-weight vector management (spec §3): `ewt_i = 1 / (reltol*|y_i| +
//! abstol_i)`, with the invariant `ewt_i > 0` checked at every entry point
//! that recomputes it.

use ndarray::*;

use crate::error::SolverError;

/// The two supported tolerance shapes (spec §3 `tol_kind`).
#[derive(Debug, Clone)]
pub enum Tolerances<T> {
    /// Scalar relative, scalar absolute.
    ScalarScalar { reltol: T, abstol: T },
    /// Scalar relative, per-component absolute.
    ScalarVector { reltol: T, abstol: Array1<T> },
}

impl<T: num_traits::Float> Tolerances<T> {
    pub fn reltol(&self) -> T {
        match self {
            Tolerances::ScalarScalar { reltol, .. } => *reltol,
            Tolerances::ScalarVector { reltol, .. } => *reltol,
        }
    }

    /// Fill `ewt` from `y` and these tolerances; returns `BadErrorWeight` if
    /// any resulting component is non-positive.
    pub fn set_ewt<S>(&self, y: &ArrayBase<S, Ix1>, ewt: &mut Array1<T>) -> Result<(), SolverError>
    where
        S: Data<Elem = T>,
    {
        match self {
            Tolerances::ScalarScalar { reltol, abstol } => {
                Zip::from(ewt).and(y).apply(|w, &yi| {
                    *w = T::one() / (*reltol * yi.abs() + *abstol);
                });
            }
            Tolerances::ScalarVector { reltol, abstol } => {
                Zip::from(ewt).and(y).and(abstol).apply(|w, &yi, &ai| {
                    *w = T::one() / (*reltol * yi.abs() + ai);
                });
            }
        }
        if ewt.iter().any(|&w| w <= T::zero() || !w.is_finite()) {
            return Err(SolverError::BadErrorWeight {});
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_scalar_weight() {
        let tol = Tolerances::ScalarScalar {
            reltol: 1e-4,
            abstol: 1e-6,
        };
        let y = array![1.0, 2.0];
        let mut ewt = Array1::zeros(2);
        tol.set_ewt(&y, &mut ewt).unwrap();
        assert!((ewt[0] - 1.0 / (1e-4 + 1e-6)).abs() < 1e-10);
    }

    #[test]
    fn rejects_non_positive_weight() {
        let tol = Tolerances::ScalarScalar {
            reltol: 0.0,
            abstol: 0.0,
        };
        let y = array![0.0];
        let mut ewt = Array1::zeros(1);
        assert!(tol.set_ewt(&y, &mut ewt).is_err());
    }
}
