//! Variable-step variable-order integrator for the explicit ODE form
//! `y' = f(t, y)` (spec §4.1, §4.7): Adams-Moulton (functional iteration,
//! non-stiff) or BDF (Newton, stiff), sharing one Nordsieck history array
//! `zn[j] = h^j y^(j)(t) / j!`.
//!
//! Grounded on the divided-difference/history-rescaling structure of the
//! teacher pack's CVODE-style reference (`diff`/`R`/`U` matrices), expressed
//! here as `zn`/`r_matrix` over `ndarray`, and sharing the corrector/
//! error-test/step-and-order-control shape of [`crate::dae`].

use log::{debug, trace, warn};
use ndarray::*;

use crate::driver::StepEngine;
use crate::error::SolverError;
use crate::ewt::Tolerances;
use crate::linear_solver::{ConvFailHint, LinearSolver, LinearSolverOutcome};
use crate::nonlinear::functional::{self, FunctionalStats};
use crate::traits::{NormRms, OdeModel};

/// Which linear multistep family drives the corrector (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Adams-Moulton, solved by functional (fixed-point) iteration.
    AdamsMoulton,
    /// BDF, solved by Newton iteration.
    Bdf,
}

const MAXORD_ADAMS: usize = 12;
const MAXORD_BDF: usize = 5;
const MXORDP1: usize = MAXORD_ADAMS + 1;

const MXNCF: u32 = 10;
const MXNEF: u32 = 7;
const MAX_HNIL_DEFAULT: u32 = 10;
const MAXCOR_DEFAULT: usize = 3;

/// Fixed Adams-Moulton coefficients `l[j]`, used to rebuild `alpha`/`gamma`
/// style scalars without a divided-difference array; BDF uses the `kappa`
/// table (spec §4.2) for its fixed-step error constants.
const BDF_KAPPA: [f64; 6] = [0.0, -37.0 / 200.0, -1.0 / 9.0, -0.0823, -0.0415, 0.0];

pub struct OdeIntegrator<F: OdeModel, LS: LinearSolver<F::Scalar>> {
    f: F,
    ls: LS,
    method: Method,

    /// Nordsieck history: row `j` holds `h^j y^(j)(t_n) / j!`, for
    /// `j = 0..=q`.
    zn: Array2<F::Scalar>,

    tolerances: Tolerances<F::Scalar>,
    ewt: Array1<F::Scalar>,

    tn: F::Scalar,
    h: F::Scalar,
    hscale: F::Scalar,
    hmin: F::Scalar,
    hmax_inv: F::Scalar,
    eta: F::Scalar,

    q: usize,
    qwait: i32,
    qmax: usize,

    l: Array1<F::Scalar>,
    tq: Array1<F::Scalar>,
    tau: Array1<F::Scalar>,

    acor: Array1<F::Scalar>,
    y_pred: Array1<F::Scalar>,

    tstop: Option<F::Scalar>,

    maxncf: u32,
    maxnef: u32,
    mxstep: u64,
    max_hnil: u32,
    hnil_count: u32,

    nst: u64,
    nfe: u64,
    ncfn: u64,
    netf: u64,
    nni: u64,
    nsetups: u64,

    functional_stats: FunctionalStats,
    jcur: bool,
    max_corrector_iters: usize,
}

impl<F, LS> OdeIntegrator<F, LS>
where
    F: OdeModel<
        Scalar = impl num_traits::Float
                     + num_traits::NumRef
                     + num_traits::NumAssignRef
                     + ScalarOperand
                     + std::fmt::Debug,
    >,
    LS: LinearSolver<F::Scalar>,
{
    pub fn new(
        f: F,
        ls: LS,
        method: Method,
        y0: Array1<F::Scalar>,
        h0: F::Scalar,
        tolerances: Tolerances<F::Scalar>,
    ) -> Self {
        let n = y0.len();
        let qmax = match method {
            Method::AdamsMoulton => MAXORD_ADAMS,
            Method::Bdf => MAXORD_BDF,
        };
        let mut zn = Array2::zeros((MXORDP1, n));
        zn.index_axis_mut(Axis(0), 0).assign(&y0);

        OdeIntegrator {
            f,
            ls,
            method,
            zn,
            tolerances,
            ewt: Array::zeros(n),
            tn: F::Scalar::zero(),
            h: h0,
            hscale: h0,
            hmin: F::Scalar::zero(),
            hmax_inv: F::Scalar::zero(),
            eta: F::Scalar::one(),
            q: 1,
            qwait: 1,
            qmax,
            l: Array::zeros(MXORDP1),
            tq: Array::zeros(5),
            tau: Array::zeros(MXORDP1 + 1),
            acor: Array::zeros(n),
            y_pred: Array::zeros(n),
            tstop: None,
            maxncf: MXNCF,
            maxnef: MXNEF,
            mxstep: crate::driver::MXSTEP_DEFAULT,
            max_hnil: MAX_HNIL_DEFAULT,
            hnil_count: 0,
            nst: 0,
            nfe: 0,
            ncfn: 0,
            netf: 0,
            nni: 0,
            nsetups: 0,
            functional_stats: FunctionalStats::new(),
            jcur: false,
            max_corrector_iters: MAXCOR_DEFAULT,
        }
    }

    pub fn set_tstop(&mut self, t: F::Scalar) {
        self.tstop = Some(t);
    }

    /// Cap on corrector iterations per attempt before the solver forces a
    /// Jacobian refresh and retries (spec §4.3, default 3).
    pub fn set_max_corrector_iters(&mut self, n: usize) {
        self.max_corrector_iters = n;
    }

    pub fn tn(&self) -> F::Scalar {
        self.tn
    }

    pub fn y(&self) -> ArrayView1<F::Scalar> {
        self.zn.index_axis(Axis(0), 0)
    }

    pub fn counters(&self) -> (u64, u64, u64, u64, u64, u64) {
        (self.nst, self.nfe, self.ncfn, self.netf, self.nni, self.nsetups)
    }

    /// `l[j]` coefficients and the error-test constant `tq[2]` for the
    /// current order `q` (spec §4.2): Adams from the Adams-Moulton
    /// generating polynomial, BDF from the fixed-leading-coefficient
    /// `kappa` table.
    fn set_coeffs(&mut self) {
        match self.method {
            Method::AdamsMoulton => {
                // l(x) = integral_0^x prod_{i=1}^{q-1} (x+i) dx / (q-1)!,
                // implemented via the standard recurrence on coefficient
                // arrays (Adams-Moulton corrector polynomial).
                let q = self.q;
                let mut l = vec![F::Scalar::zero(); q + 1];
                l[0] = F::Scalar::one();
                l[1] = F::Scalar::one();
                for j in 2..=q {
                    let jf = F::Scalar::from(j).unwrap();
                    for i in (1..j).rev() {
                        l[i] = l[i] + l[i - 1] / jf;
                    }
                    l[0] = l[0] / jf;
                }
                for (i, &v) in l.iter().enumerate() {
                    self.l[i] = v;
                }
                self.tq[2] = F::Scalar::one() / F::Scalar::from(q + 1).unwrap();
            }
            Method::Bdf => {
                self.l.fill(F::Scalar::zero());
                self.l[0] = F::Scalar::one();
                self.l[1] = F::Scalar::one();
                for i in 1..self.q {
                    self.l[i + 1] = F::Scalar::zero();
                    for j in (1..=i).rev() {
                        let c = F::Scalar::from(j + 1).unwrap() / F::Scalar::from(i + 1).unwrap();
                        self.l[j] = self.l[j] + self.l[j - 1] * c;
                    }
                }
                let kappa = F::Scalar::from(BDF_KAPPA[self.q.min(5)]).unwrap();
                let gamma_q: F::Scalar = (1..=self.q)
                    .map(|i| F::Scalar::one() / F::Scalar::from(i).unwrap())
                    .fold(F::Scalar::zero(), |a, b| a + b);
                self.tq[2] = (kappa * gamma_q + F::Scalar::one() / F::Scalar::from(self.q + 1).unwrap()).abs();
            }
        }
    }

    /// Advance the Nordsieck history by the predictor step: `zn[j] += sum_{k>j}
    /// zn[k]` (Pascal's-triangle update, equivalent to the teacher pack's
    /// `diff` row-summation).
    fn predict(&mut self) {
        for j in (0..self.q).rev() {
            let upper = self.zn.index_axis(Axis(0), j + 1).to_owned();
            let mut row = self.zn.index_axis_mut(Axis(0), j);
            row += &upper;
        }
        self.y_pred.assign(&self.zn.index_axis(Axis(0), 0));
    }

    /// `IDAHandleNFlag`-equivalent: rescale `zn` for a new `h`/`eta` without
    /// recomputing the whole history, using the teacher's `R`-matrix
    /// approach generalized to Adams/BDF orders.
    fn rescale_history(&mut self, eta: F::Scalar) {
        let mut factor = F::Scalar::one();
        for j in 1..=self.q {
            factor = factor * eta;
            let mut row = self.zn.index_axis_mut(Axis(0), j);
            row.mapv_inplace(|v| v * factor);
        }
        self.h = self.h * eta;
        self.hscale = self.h;
    }

    /// One internal step (spec §4.1/§4.7). Corresponds to `IDAStep`/CVODE's
    /// `cvStep`.
    pub fn step(&mut self) -> Result<(), SolverError> {
        let y_cur = self.zn.index_axis(Axis(0), 0).to_owned();
        self.tolerances.set_ewt(&y_cur, &mut self.ewt)?;

        if self.tn + self.h == self.tn {
            self.hnil_count += 1;
            if self.hnil_count <= self.max_hnil {
                warn!(
                    "internal t = {:?} and step size h = {:?} are such that t + h = t on the next step",
                    self.tn, self.h
                );
            }
        }

        let saved_zn = self.zn.clone();
        let saved_tn = self.tn;
        let mut nef = 0u32;
        let mut ncf = 0u32;

        let err_k = loop {
            self.set_coeffs();
            self.predict();
            self.tn = saved_tn + self.h;

            trace!("attempting step at tn = {:?}, q = {}, h = {:?}", self.tn, self.q, self.h);
            match self.correct() {
                Ok(()) => {
                    let enorm = self.acor.norm_wrms(&self.ewt).to_f64().unwrap_or(1.0);
                    let err_k = enorm * self.tq[2].to_f64().unwrap_or(1.0);
                    if err_k <= 1.0 {
                        break err_k;
                    }
                    nef += 1;
                    self.netf += 1;
                    self.zn.assign(&saved_zn);
                    self.tn = saved_tn;
                    self.handle_error_test_fail(nef, err_k)?;
                    continue;
                }
                Err(err) => {
                    ncf += 1;
                    self.ncfn += 1;
                    self.zn.assign(&saved_zn);
                    self.tn = saved_tn;
                    if ncf >= self.maxncf {
                        return Err(err);
                    }
                    let eta = F::Scalar::from(0.25).unwrap();
                    self.rescale_history(eta);
                    continue;
                }
            }
        };

        self.complete_step(err_k);
        debug!(
            "step {} accepted: tn = {:?}, q = {}, h = {:?}",
            self.nst, self.tn, self.q, self.h
        );
        Ok(())
    }

    /// Differentiated 1st/2nd/3rd error-test-failure escalation (spec §4.8),
    /// mirroring [`crate::dae::DaeIntegrator::handle_error_test_fail`]: the
    /// step-size cut and, from the 2nd failure on, the order cut both get
    /// more aggressive the longer the error test keeps failing.
    fn handle_error_test_fail(&mut self, nef: u32, err_k: f64) -> Result<(), SolverError> {
        if nef >= self.maxnef {
            return Err(SolverError::ErrorTestFailure {
                t: self.tn.to_f64().unwrap_or(0.0),
                n: nef,
            });
        }

        let eta = if nef == 1 {
            let safety = 0.9_f64;
            let base = safety * (2.0 * err_k + 0.0001).recip().powf(1.0 / (self.q as f64 + 1.0));
            base.clamp(0.25, 0.9)
        } else if nef == 2 {
            if self.q > 1 {
                self.q -= 1;
            }
            0.25
        } else {
            self.q = 1;
            0.25
        };

        let eta_t = F::Scalar::from(eta).unwrap();
        self.rescale_history(eta_t);
        Ok(())
    }

    /// Nonlinear corrector for the current predicted step: functional
    /// iteration for Adams, Newton for BDF (spec §4.3).
    fn correct(&mut self) -> Result<(), SolverError> {
        let h_over_l1 = self.h / self.l[1];
        let z_pred = self.zn.index_axis(Axis(0), 1).to_owned();
        let mut y = self.y_pred.clone();
        let tol = F::Scalar::from(0.33).unwrap();

        match self.method {
            Method::AdamsMoulton => {
                let f = &mut self.f;
                let tn = self.tn;
                let ewt = self.ewt.clone();
                functional::solve(
                    &mut self.functional_stats,
                    10,
                    &mut y,
                    &z_pred,
                    h_over_l1,
                    &ewt,
                    tol,
                    |y, out| {
                        f.rhs(tn, y, out)?;
                        Ok(())
                    },
                )
                .map_err(|_| SolverError::ConvergenceFailure {
                    t: self.tn.to_f64().unwrap_or(0.0),
                    n: 1,
                })?;
                self.nfe += self.functional_stats.niters;
            }
            Method::Bdf => {
                self.newton_correct(&mut y, &z_pred, h_over_l1, tol)?;
            }
        }

        self.acor.assign(&y);
        self.acor -= &self.y_pred;
        for j in 0..=self.q {
            let lj = self.l[j];
            let mut row = self.zn.index_axis_mut(Axis(0), j);
            row.scaled_add(lj, &self.acor);
        }
        Ok(())
    }

    /// Newton iteration for the BDF corrector: `P = I - (h/l1) J`, solved
    /// via the configured [`LinearSolver`] (spec §4.3).
    fn newton_correct(
        &mut self,
        y: &mut Array1<F::Scalar>,
        z_pred: &Array1<F::Scalar>,
        h_over_l1: F::Scalar,
        tol: F::Scalar,
    ) -> Result<(), SolverError> {
        let mut f_pred = Array1::zeros(y.len());
        self.f
            .rhs(self.tn, y, &mut f_pred)
            .map_err(|_| SolverError::ResidualFail {})?;
        self.nfe += 1;

        let mut call_setup = self.nst == 0 || !self.jcur;
        let mut convfail = ConvFailHint::NoFailure;
        let mut crate_rate = F::Scalar::one();
        let mut del_prev_norm: Option<F::Scalar> = None;

        'outer: loop {
            if call_setup {
                let (outcome, jcur) = self
                    .ls
                    .setup(convfail, y, &f_pred, F::Scalar::one() / h_over_l1)
                    .map_err(|_| SolverError::LinearSetupFail {})?;
                self.nsetups += 1;
                self.jcur = jcur;
                match outcome {
                    LinearSolverOutcome::Success => {}
                    LinearSolverOutcome::Recoverable => {
                        return Err(SolverError::ConvergenceFailure {
                            t: self.tn.to_f64().unwrap_or(0.0),
                            n: 1,
                        });
                    }
                    LinearSolverOutcome::Unrecoverable => return Err(SolverError::LinearSetupFail {}),
                }
            }

            crate_rate = F::Scalar::one();
            del_prev_norm = None;
            y.assign(&self.y_pred);

            let mut iter = 0usize;
            loop {
                self.nni += 1;
                let mut res = y.clone();
                res -= z_pred;
                res.mapv_inplace(|v| v / h_over_l1);
                let mut f_y = Array1::zeros(y.len());
                self.f
                    .rhs(self.tn, y, &mut f_y)
                    .map_err(|_| SolverError::ResidualFail {})?;
                self.nfe += 1;
                res -= &f_y;

                let outcome = self
                    .ls
                    .solve(&mut res, y)
                    .map_err(|_| SolverError::LinearSolveFail {})?;
                match outcome {
                    LinearSolverOutcome::Success => {}
                    LinearSolverOutcome::Recoverable => {
                        convfail = ConvFailHint::BadJacobian;
                        call_setup = true;
                        continue 'outer;
                    }
                    LinearSolverOutcome::Unrecoverable => return Err(SolverError::LinearSolveFail {}),
                }

                *y -= &res;

                let del_norm = res.norm_wrms(&self.ewt);
                if let Some(prev) = del_prev_norm {
                    if prev > F::Scalar::zero() {
                        crate_rate = (crate_rate * F::Scalar::from(0.3).unwrap()).max(del_norm / prev);
                    }
                }
                del_prev_norm = Some(del_norm);

                let denom = F::Scalar::one() - crate_rate.min(F::Scalar::from(0.9).unwrap());
                if denom > F::Scalar::zero() && (crate_rate * del_norm / denom) < tol {
                    return Ok(());
                }

                iter += 1;
                if iter >= self.max_corrector_iters {
                    convfail = ConvFailHint::Other;
                    call_setup = true;
                    continue 'outer;
                }
            }
        }
    }

    /// Increment `nst`, and choose `q`/`h` for the next step via the usual
    /// three-order (`q-1`, `q`, `q+1`) local-truncation-error comparison
    /// (spec §4.7), CVODE's `cvSetEta`/`cvChooseEta` pattern: predict an
    /// `eta` for each candidate order and move to whichever predicts the
    /// largest step, biased against raising/lowering via `BIAS1..3` so a
    /// wash doesn't thrash the order every step.
    ///
    /// Lacking a stored divided-difference (`phi`) array, the `q-1`/`q+1`
    /// error estimates are proxied by the WRMS norm of the corresponding
    /// `zn` Nordsieck row, the same history array the predictor/rescale use.
    fn complete_step(&mut self, err_k: f64) {
        self.nst += 1;
        self.qwait -= 1;

        const BIAS1: f64 = 6.0;
        const BIAS2: f64 = 10.0;
        const BIAS3: f64 = 10.0;
        const ADDON: f64 = 1e-6;
        const SAFETY: f64 = 0.9;

        let eta_q = SAFETY / (BIAS2 * err_k.max(1e-10).powf(1.0 / (self.q as f64 + 1.0)) + ADDON);

        let eta = if self.qwait > 0 {
            eta_q
        } else {
            let eta_qm1 = if self.q > 1 {
                let err_km1 = self
                    .zn
                    .index_axis(Axis(0), self.q)
                    .norm_wrms(&self.ewt)
                    .to_f64()
                    .unwrap_or(1.0);
                SAFETY / (BIAS1 * err_km1.max(1e-10).powf(1.0 / self.q as f64) + ADDON)
            } else {
                0.0
            };

            let eta_qp1 = if self.q < self.qmax {
                let err_kp1 = self
                    .zn
                    .index_axis(Axis(0), self.q + 1)
                    .norm_wrms(&self.ewt)
                    .to_f64()
                    .unwrap_or(1.0);
                SAFETY / (BIAS3 * err_kp1.max(1e-10).powf(1.0 / (self.q as f64 + 2.0)) + ADDON)
            } else {
                0.0
            };

            if eta_qm1 > eta_q && eta_qm1 >= eta_qp1 {
                self.q -= 1;
                eta_qm1
            } else if eta_qp1 > eta_q && eta_qp1 > eta_qm1 {
                self.q += 1;
                eta_qp1
            } else {
                eta_q
            }
        };

        if self.qwait <= 0 {
            self.qwait = self.q as i32 + 1;
        }

        let eta_t = F::Scalar::from(eta.clamp(0.1, 10.0)).unwrap();
        self.rescale_history(eta_t);
        self.eta = eta_t;
    }

    /// `Dky` dense-output equivalent: evaluate the Nordsieck polynomial and
    /// its derivative of order `k` at time `t` (spec §4.10).
    pub fn dky(&self, t: F::Scalar, k: usize, out: &mut Array1<F::Scalar>) -> Result<(), SolverError> {
        if k > self.q {
            return Err(SolverError::BadK { k, kmax: self.q });
        }
        let s = (t - self.tn) / self.h;
        out.fill(F::Scalar::zero());
        let mut c = F::Scalar::one();
        for j in k..=self.q {
            if j > k {
                c = c * s / F::Scalar::from(j - k).unwrap();
            }
            let row = self.zn.index_axis(Axis(0), j);
            Zip::from(&mut *out).and(&row).apply(|o, &r| *o = *o + c * r);
        }
        let mut fact = F::Scalar::one();
        for i in 1..=k {
            fact = fact * F::Scalar::from(i).unwrap();
        }
        out.mapv_inplace(|v| v * fact / self.h.powi(k as i32));
        Ok(())
    }
}

impl<F, LS> StepEngine<F::Scalar> for OdeIntegrator<F, LS>
where
    F: OdeModel<
        Scalar = impl num_traits::Float
                     + num_traits::NumRef
                     + num_traits::NumAssignRef
                     + ScalarOperand
                     + std::fmt::Debug,
    >,
    LS: LinearSolver<F::Scalar>,
{
    fn tn(&self) -> F::Scalar {
        self.tn
    }

    fn hh(&self) -> F::Scalar {
        self.h
    }

    fn nst(&self) -> u64 {
        self.nst
    }

    fn take_step(&mut self) -> Result<(), SolverError> {
        self.step()
    }

    fn clip_step_to_tstop(&mut self, tstop: F::Scalar) {
        if (self.tn + self.h - tstop) * self.h > F::Scalar::zero() {
            self.h = tstop - self.tn;
        }
    }

    fn within_tstop_fuzz(&self, t: F::Scalar, tstop: F::Scalar) -> bool {
        let tfuzz = crate::driver::tstop_fuzz(self.tn, self.h, F::Scalar::epsilon());
        (t - tstop).abs() <= tfuzz
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exponential_decay::ExponentialDecay;
    use crate::linear_solver::dense::DirectDense;

    #[test]
    fn adams_predictor_sums_nordsieck_rows() {
        let f = ExponentialDecay::new(-1.0);
        let ls: DirectDense<f64> = DirectDense::new(1, Box::new(|_cj, _y, _yp, j| {
            j[[0, 0]] = 1.0;
            Ok(())
        }));
        let mut ode = OdeIntegrator::new(
            f,
            ls,
            Method::AdamsMoulton,
            array![1.0],
            0.01,
            Tolerances::ScalarScalar { reltol: 1e-6, abstol: 1e-10 },
        );
        ode.q = 2;
        ode.zn.index_axis_mut(Axis(0), 1).fill(-0.01);
        ode.zn.index_axis_mut(Axis(0), 2).fill(0.00005);
        let before = ode.zn.index_axis(Axis(0), 0)[0];
        ode.predict();
        let after = ode.zn.index_axis(Axis(0), 0)[0];
        assert!((after - (before - 0.01 + 0.00005)).abs() < 1e-12);
    }

    #[test]
    fn bdf_coeffs_first_order_match_backward_euler() {
        let f = ExponentialDecay::new(-1.0);
        let ls: DirectDense<f64> = DirectDense::new(1, Box::new(|_cj, _y, _yp, j| {
            j[[0, 0]] = 1.0;
            Ok(())
        }));
        let mut ode = OdeIntegrator::new(
            f,
            ls,
            Method::Bdf,
            array![1.0],
            0.01,
            Tolerances::ScalarScalar { reltol: 1e-6, abstol: 1e-10 },
        );
        ode.q = 1;
        ode.set_coeffs();
        assert_eq!(ode.l[0], 1.0);
        assert_eq!(ode.l[1], 1.0);
    }
}
