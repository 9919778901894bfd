//! Linear-solver plug-in capability interface (spec.md §6).
//!
//! The Sundials source expresses this as a table of four function pointers
//! hung off the integrator memory. The idiomatic replacement is a small
//! capability trait: polymorphism over `{DirectDense, DirectBanded,
//! Iterative+Preconditioner}` is expressed with `dyn LinearSolver`, not a
//! reconstructed vtable.

pub mod dense;

use ndarray::*;

/// Three-valued annotation passed from the corrector to `setup`, describing
/// the immediately prior failure context (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvFailHint {
    /// First attempt at this step, or the previous step failed only the
    /// error test (Jacobian data is presumably still good).
    NoFailure,
    /// The previous step's Newton iteration did not converge and the stored
    /// Jacobian data is believed stale.
    BadJacobian,
    /// The previous step's Newton iteration failed even with freshly
    /// computed Jacobian data.
    Other,
}

/// Outcome of a linear-solver hook call: success, a recoverable failure (the
/// corrector may retry with a smaller step), or an unrecoverable failure
/// (the integrator transitions to `Fatal`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverOutcome {
    Success,
    Recoverable,
    Unrecoverable,
}

/// The four linear-solver hooks of spec.md §6, generic over scalar type.
///
/// `P` is whatever the caller uses to identify "the problem" (state vector,
/// current Jacobian-affecting scalar, etc.) — implementations are expected
/// to cache their own factorization/preconditioner state internally.
pub trait LinearSolver<T: num_traits::Float> {
    /// One-time initialization; may allocate. Called once, from the
    /// integrator's `malloc`/`sens_malloc` equivalent.
    fn init(&mut self) -> Result<(), failure::Error>;

    /// Recompute Jacobian-derived data if needed. Must report whether it
    /// did so via `j_current`, to let the corrector avoid infinite
    /// "Jacobian is stale" loops.
    fn setup<S1, S2>(
        &mut self,
        convfail: ConvFailHint,
        y_pred: &ArrayBase<S1, Ix1>,
        f_pred: &ArrayBase<S2, Ix1>,
        cj: T,
    ) -> Result<(LinearSolverOutcome, bool), failure::Error>
    where
        S1: Data<Elem = T>,
        S2: Data<Elem = T>;

    /// Solve `P x = b` in place (`b` holds the rhs on input, the solution on
    /// output).
    fn solve<S1, S2>(
        &mut self,
        b: &mut ArrayBase<S1, Ix1>,
        y_cur: &ArrayBase<S2, Ix1>,
    ) -> Result<LinearSolverOutcome, failure::Error>
    where
        S1: DataMut<Elem = T>,
        S2: Data<Elem = T>;

    /// Per-sensitivity solve for the STAGGERED/STAGGERED1 strategies. The
    /// default forwards to `solve`, which is correct whenever the cached
    /// factorization does not depend on which sensitivity index is being
    /// solved (true for direct dense/banded solvers; iterative solvers with
    /// per-sensitivity preconditioners would override this).
    fn solve_s<S1, S2>(
        &mut self,
        b: &mut ArrayBase<S1, Ix1>,
        y_cur: &ArrayBase<S2, Ix1>,
        _is: usize,
    ) -> Result<LinearSolverOutcome, failure::Error>
    where
        S1: DataMut<Elem = T>,
        S2: Data<Elem = T>,
    {
        self.solve(b, y_cur)
    }

    /// Release any resources held. Implementations that only own `Drop`-able
    /// Rust data structures can leave this a no-op.
    fn free(&mut self) {}
}
