//! Error and return-code model (spec.md §6, §7).
//!
//! Three kinds of error cross the public boundary: invalid-input (detected
//! synchronously, no state mutated), recoverable runtime (retried
//! internally, only escalated after exceeding a cap), and fatal runtime
//! (returned immediately, state left consistent for post-mortem `dky`
//! queries). `SolverError` models all three as one `failure::Fail` enum in
//! the teacher's style; `ReturnFlag` is the numeric wire encoding a thin
//! driver shell would hand back to a caller.

use failure::Fail;

/// The fixed numeric return-code enumeration from spec.md §6.
///
/// `0` is success, positive values are informational, negative values are
/// errors. This is the "thin wrapper" surface; the engine itself works in
/// terms of [`SolverError`] and only encodes to `ReturnFlag` at the public
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ReturnFlag {
    Success = 0,
    TstopReturn = 1,
    Warning = 99,

    MemNull = -1,
    IllInput = -2,
    TooMuchWork = -3,
    TooMuchAcc = -4,
    ErrFailure = -5,
    ConvFailure = -6,
    LinInitFail = -7,
    LsetupFail = -8,
    LsolveFail = -9,
    ResFail = -10,
    RepResErr = -11,
    RtfuncFail = -12,
    ConstrFail = -13,

    BadK = -20,
    BadT = -21,
    BadDky = -22,

    NoSensi = -30,
    SrhsFail = -31,
    RepSrhsErr = -32,

    NoQuad = -40,
    QrhsFail = -41,
    RepQrhsErr = -42,
}

impl ReturnFlag {
    pub fn is_success(self) -> bool {
        (self as i32) >= 0
    }
}

/// Convergence-failure / error-test-failure severity classification used by
/// the failure handler state machine (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The caller may retry with a reduced step / order.
    Recoverable,
    /// No retry is possible; the solver state machine transitions to
    /// `Fatal`.
    Fatal,
}

#[derive(Debug, Fail)]
pub enum SolverError {
    /// IDA_ILL_INPUT / CV_ILL_INPUT
    #[fail(display = "One of the input arguments was illegal: {}", reason)]
    IllegalInput { reason: String },

    /// IDA_MEM_NULL / CV_MEM_NULL
    #[fail(display = "The integrator memory was never allocated or already freed")]
    MemoryNull {},

    /// CV_TOO_MUCH_WORK / IDA_TOO_MUCH_WORK
    #[fail(
        display = "At t = {}, mxstep steps ({}) taken before reaching tout",
        t, mxstep
    )]
    TooMuchWork { t: f64, mxstep: u64 },

    /// CV_TOO_MUCH_ACC
    #[fail(
        display = "At t = {}, too much accuracy requested for the precision available",
        t
    )]
    TooMuchAccuracy { t: f64 },

    /// IDA_ERR_FAIL / CV_ERR_FAILURE
    #[fail(
        display = "At t = {}, {} local error test failures, current step too small",
        t, n
    )]
    ErrorTestFailure { t: f64, n: u32 },

    /// IDA_CONV_FAIL / CV_CONV_FAILURE
    #[fail(
        display = "At t = {}, {} convergence test failures, current step too small",
        t, n
    )]
    ConvergenceFailure { t: f64, n: u32 },

    /// IDA_REP_RES_ERR / CV_REPTD_RHSFUNC_ERR
    #[fail(
        display = "The residual/rhs function repeatedly returned a recoverable error flag, but the solver was unable to recover"
    )]
    RepeatedRecoverableResidual {},

    /// IDA_RES_FAIL / CV_RHSFUNC_FAIL
    #[fail(display = "The user's residual/rhs routine returned a non-recoverable error flag")]
    ResidualFail {},

    /// recoverable flavor of the above, used internally by the corrector
    #[fail(display = "The user's residual/rhs routine returned a recoverable error flag")]
    RecoverableResidual {},

    /// IDA_LINIT_FAIL / CV_LINIT_FAIL
    #[fail(display = "The linear solver's init routine failed")]
    LinearInitFail {},

    /// IDA_LSETUP_FAIL / CV_LSETUP_FAIL
    #[fail(display = "The linear solver's setup routine had a non-recoverable error")]
    LinearSetupFail {},

    /// IDA_LSOLVE_FAIL / CV_LSOLVE_FAIL
    #[fail(display = "The linear solver's solve routine had a non-recoverable error")]
    LinearSolveFail {},

    /// IDA_CONSTR_FAIL
    #[fail(
        display = "At t = {}, the inequality constraints were violated and the solver was unable to recover",
        t
    )]
    ConstraintFail { t: f64 },

    /// component of ewt went non-positive: IDA_BAD_EWT / CV_BAD_EWT
    #[fail(display = "Some component of the error weight vector became non-positive")]
    BadErrorWeight {},

    /// MSG_BAD_K
    #[fail(display = "Illegal value for k = {}; must be in [0, {}]", k, kmax)]
    BadK { k: usize, kmax: usize },

    /// MSG_BAD_T
    #[fail(
        display = "Illegal value for t: t = {} is not between tcur - hu = {} and tcur = {}",
        t, tlo, tcurr
    )]
    BadTimeValue { t: f64, tlo: f64, tcurr: f64 },

    /// sensitivity/quadrature extractor called before the substate exists
    #[fail(display = "{} was never initialized for this integrator", what)]
    NeverInitialized { what: &'static str },

    /// STAGGERED1 requires ifS = ONESENS (spec §8)
    #[fail(display = "STAGGERED1 sensitivity solution requires a one-at-a-time sensitivity RHS (ifS = ONESENS)")]
    Staggered1RequiresOneSens {},
}

impl SolverError {
    pub fn severity(&self) -> Severity {
        use SolverError::*;
        match self {
            RecoverableResidual {} => Severity::Recoverable,
            _ => Severity::Fatal,
        }
    }

    pub fn to_return_flag(&self) -> ReturnFlag {
        use SolverError::*;
        match self {
            IllegalInput { .. } => ReturnFlag::IllInput,
            MemoryNull {} => ReturnFlag::MemNull,
            TooMuchWork { .. } => ReturnFlag::TooMuchWork,
            TooMuchAccuracy { .. } => ReturnFlag::TooMuchAcc,
            ErrorTestFailure { .. } => ReturnFlag::ErrFailure,
            ConvergenceFailure { .. } => ReturnFlag::ConvFailure,
            RepeatedRecoverableResidual {} => ReturnFlag::RepResErr,
            ResidualFail {} | RecoverableResidual {} => ReturnFlag::ResFail,
            LinearInitFail {} => ReturnFlag::LinInitFail,
            LinearSetupFail {} => ReturnFlag::LsetupFail,
            LinearSolveFail {} => ReturnFlag::LsolveFail,
            ConstraintFail { .. } => ReturnFlag::ConstrFail,
            BadErrorWeight {} => ReturnFlag::IllInput,
            BadK { .. } => ReturnFlag::BadK,
            BadTimeValue { .. } => ReturnFlag::BadT,
            NeverInitialized { .. } => ReturnFlag::NoSensi,
            Staggered1RequiresOneSens {} => ReturnFlag::IllInput,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_much_work_maps_to_negative_three() {
        let err = SolverError::TooMuchWork { t: 1.0, mxstep: 500 };
        assert_eq!(err.to_return_flag(), ReturnFlag::TooMuchWork);
        assert_eq!(ReturnFlag::TooMuchWork as i32, -3);
        assert_eq!(err.severity(), Severity::Fatal);
    }

    #[test]
    fn recoverable_residual_is_the_only_recoverable_variant() {
        assert_eq!(
            SolverError::RecoverableResidual {}.severity(),
            Severity::Recoverable
        );
        assert_eq!(SolverError::ResidualFail {}.severity(), Severity::Fatal);
    }
}
