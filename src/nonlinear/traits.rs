use failure::Fail;
use ndarray::*;

use crate::traits::ModelSpec;

#[derive(Debug, Fail, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// not converged, keep iterating
    #[fail(display = "iteration has not yet converged")]
    Continue {},

    /// convergence failure, recoverable: caller should retry with a smaller
    /// step and/or a refreshed Jacobian.
    #[fail(display = "nonlinear iteration failed to converge")]
    ConvergenceRecover {},

    /// illegal function input, unrecoverable
    #[fail(display = "illegal input to nonlinear solver")]
    IllegalInput {},
}

/// A nonlinear corrector equation, `F(y) = 0` (Newton-form). Implemented by
/// the owning integrator (`DaeIntegrator`/`OdeIntegrator`), which has the
/// history arrays needed to build the residual and to drive the linear
/// solver's setup/solve hooks.
pub trait NLProblem: ModelSpec {
    /// Evaluate the corrector residual at `y`.
    fn sys<S1, S2>(
        &self,
        y: &ArrayBase<S1, Ix1>,
        f: &mut ArrayBase<S2, Ix1>,
    ) -> Result<(), failure::Error>
    where
        S1: Data<Elem = <Self as ModelSpec>::Scalar>,
        S2: DataMut<Elem = <Self as ModelSpec>::Scalar>;

    /// Ask the linear solver to (re)factor `P` if needed.
    ///
    /// Returns whether the Jacobian-related data is now current.
    fn lsetup<S1>(
        &mut self,
        _y: &ArrayBase<S1, Ix1>,
        _f: &ArrayView<<Self as ModelSpec>::Scalar, Ix1>,
        _jbad: bool,
    ) -> Result<bool, failure::Error>
    where
        S1: Data<Elem = <Self as ModelSpec>::Scalar>,
    {
        Ok(false)
    }

    /// Solve `P x = b` in place.
    fn lsolve<S1, S2>(
        &self,
        y: &ArrayBase<S1, Ix1>,
        b: &mut ArrayBase<S2, Ix1>,
    ) -> Result<(), failure::Error>
    where
        S1: Data<Elem = <Self as ModelSpec>::Scalar>,
        S2: DataMut<Elem = <Self as ModelSpec>::Scalar>;

    /// Convergence test (spec §4.3): estimate a convergence rate from
    /// successive increment norms and compare against `tol`.
    fn ctest<S1, S2, S3>(
        &self,
        y: &ArrayBase<S1, Ix1>,
        del: &ArrayBase<S2, Ix1>,
        tol: <Self as ModelSpec>::Scalar,
        ewt: &ArrayBase<S3, Ix1>,
    ) -> Result<bool, failure::Error>
    where
        S1: Data<Elem = <Self as ModelSpec>::Scalar>,
        S2: Data<Elem = <Self as ModelSpec>::Scalar>,
        S3: Data<Elem = <Self as ModelSpec>::Scalar>;
}

pub trait NLSolver<P: NLProblem> {
    /// Solve the nonlinear corrector equation, starting from predictor `y0`.
    ///
    /// `call_lsetup` signals that the integrator recommends a fresh
    /// linear-solver setup before iterating (e.g. `force_setup` was set, or
    /// the step size/order changed enough that the cached Jacobian is
    /// suspect).
    fn solve<S1, S2>(
        &mut self,
        problem: &mut P,
        y0: &ArrayBase<S1, Ix1>,
        y: &mut ArrayBase<S2, Ix1>,
        w: &ArrayBase<S1, Ix1>,
        tol: P::Scalar,
        call_lsetup: bool,
    ) -> Result<(), failure::Error>
    where
        S1: Data<Elem = P::Scalar>,
        S2: DataMut<Elem = P::Scalar>;
}
