use ndarray::*;

use crate::nonlinear::traits::*;
use crate::traits::ModelSpec;

/// Newton corrector (spec §4.3).
///
/// Tracks the convergence-rate estimate across iterations within one solve
/// attempt (`R = max(R_prev * 0.3, ||Δm|| / ||Δm-1||)`), and reports back
/// whether the cached Jacobian was current so the integrator can decide
/// whether a convergence failure is "bad Jacobian" or "other" for the next
/// `convfail` hint.
#[derive(Debug)]
pub struct Newton<P: NLProblem> {
    delta: Array1<P::Scalar>,
    /// Jacobian status, current = `true` / stale = `false`.
    pub jcur: bool,
    pub curiter: usize,
    pub maxiters: usize,
    pub niters: u64,
    pub nconvfails: u64,
}

impl<P: NLProblem> Newton<P> {
    pub fn new(size: usize, maxiters: usize) -> Self {
        Newton {
            delta: Array::zeros(size),
            jcur: false,
            curiter: 0,
            maxiters,
            niters: 0,
            nconvfails: 0,
        }
    }
}

impl<P> NLSolver<P> for Newton<P>
where
    P: NLProblem,
    P::Scalar: num_traits::Float + num_traits::NumRef + num_traits::NumAssignRef + std::fmt::Debug,
{
    fn solve<S1, S2>(
        &mut self,
        problem: &mut P,
        y0: &ArrayBase<S1, Ix1>,
        y: &mut ArrayBase<S2, Ix1>,
        w: &ArrayBase<S1, Ix1>,
        tol: P::Scalar,
        mut call_lsetup: bool,
    ) -> Result<(), failure::Error>
    where
        S1: Data<Elem = P::Scalar>,
        S2: DataMut<Elem = P::Scalar>,
    {
        use crate::traits::NormRms;

        let mut jbad = false;
        // convergence-rate estimate ("crate" in spec.md's glossary)
        let mut crate_rate = P::Scalar::one();
        let mut del_prev_norm: Option<P::Scalar> = None;

        'outer: loop {
            let retval: Result<(), failure::Error> = problem
                .sys(y0, &mut self.delta)
                .and_then(|_| {
                    if call_lsetup {
                        problem
                            .lsetup(y0, &self.delta.view(), jbad)
                            .map(|jcur| self.jcur = jcur)
                    } else {
                        Ok(())
                    }
                })
                .and_then(|_| {
                    self.curiter = 0;
                    crate_rate = P::Scalar::one();
                    del_prev_norm = None;
                    y.assign(&y0);
                    loop {
                        self.niters += 1;
                        self.delta.mapv_inplace(P::Scalar::neg);
                        let step = NLProblem::lsolve(problem, y, &mut self.delta).and_then(|_| {
                            *y += &self.delta;

                            let del_norm = self.delta.norm_wrms(w);
                            if let Some(prev) = del_prev_norm {
                                if prev > P::Scalar::zero() {
                                    let ratio = del_norm / prev;
                                    crate_rate =
                                        (crate_rate * P::Scalar::from(0.3).unwrap()).max(ratio);
                                }
                            }
                            del_prev_norm = Some(del_norm);

                            let denom = P::Scalar::one()
                                - crate_rate.min(P::Scalar::from(0.9).unwrap());
                            let converged = denom > P::Scalar::zero()
                                && (crate_rate * del_norm / denom) < tol;

                            NLProblem::ctest(problem, y, &self.delta.view(), tol, w).and_then(
                                |user_converged| {
                                    if converged || user_converged {
                                        self.jcur = false;
                                        Ok(true)
                                    } else {
                                        self.curiter += 1;
                                        if self.curiter >= self.maxiters {
                                            Err(failure::Error::from(Error::ConvergenceRecover {}))
                                        } else {
                                            problem.sys(y, &mut self.delta).and(Ok(false))
                                        }
                                    }
                                },
                            )
                        });

                        match step {
                            Ok(false) => continue,
                            other => break other.and(Ok(())),
                        }
                    }
                });

            match &retval {
                Ok(_) => return retval,
                Err(error) => {
                    if let Some(Error::ConvergenceRecover {}) = error.downcast_ref::<Error>() {
                        if !self.jcur {
                            self.nconvfails += 1;
                            call_lsetup = true;
                            jbad = true;
                            continue 'outer;
                        }
                    }
                    self.nconvfails += 1;
                    return retval;
                }
            }
        }
    }
}
