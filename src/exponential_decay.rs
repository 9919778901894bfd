//! `y' = lambda * y`, the textbook non-stiff-or-stiff-depending-on-lambda
//! scalar test problem. Used for sensitivity DQ comparisons against the
//! known analytic sensitivity `ds/dlambda = t * y`.

use ndarray::*;

use crate::traits::{ModelSpec, OdeModel};

#[derive(Clone, Copy, Debug)]
pub struct ExponentialDecay {
    pub lambda: f64,
}

impl ExponentialDecay {
    pub fn new(lambda: f64) -> Self {
        ExponentialDecay { lambda }
    }
}

impl Default for ExponentialDecay {
    fn default() -> Self {
        ExponentialDecay { lambda: -1.0 }
    }
}

impl ModelSpec for ExponentialDecay {
    type Scalar = f64;
    type Dim = Ix1;

    fn model_size(&self) -> usize {
        1
    }
}

impl OdeModel for ExponentialDecay {
    fn rhs<S1, S2>(
        &mut self,
        _t: f64,
        y: &ArrayBase<S1, Ix1>,
        yp: &mut ArrayBase<S2, Ix1>,
    ) -> Result<(), failure::Error>
    where
        S1: Data<Elem = f64>,
        S2: DataMut<Elem = f64>,
    {
        yp[0] = self.lambda * y[0];
        Ok(())
    }

    fn jacobian<S1, S2>(
        &mut self,
        _t: f64,
        _y: &ArrayBase<S1, Ix1>,
        j: &mut ArrayBase<S2, Ix2>,
    ) -> Result<(), failure::Error>
    where
        S1: Data<Elem = f64>,
        S2: DataMut<Elem = f64>,
    {
        j[[0, 0]] = self.lambda;
        Ok(())
    }
}

/// Analytic solution, used in tests as the integration reference.
pub fn exact(lambda: f64, y0: f64, t: f64) -> f64 {
    y0 * (lambda * t).exp()
}

/// Analytic sensitivity `d y / d lambda = t * y(t)`, used to check the DQ
/// approximation against a known closed form (spec §4.11).
pub fn exact_sensitivity(lambda: f64, y0: f64, t: f64) -> f64 {
    t * exact(lambda, y0, t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dq;
    use crate::ewt::Tolerances;
    use crate::linear_solver::dense::DirectDense;
    use crate::ode::{Method, OdeIntegrator};

    #[test]
    fn rhs_matches_linear_decay() {
        let mut model = ExponentialDecay::new(-2.0);
        let y = array![3.0];
        let mut yp = array![0.0];
        model.rhs(0.0, &y, &mut yp).unwrap();
        assert_eq!(yp[0], -6.0);
    }

    /// Integration against the closed form (spec §4.11 DQ consistency
    /// check, half one): a converged run should land within a small
    /// multiple of `reltol` of `exact`.
    #[test]
    fn integration_matches_exact_solution() {
        let lambda = -2.0_f64;
        let ls: DirectDense<f64> = DirectDense::new(
            1,
            Box::new(move |cj, _y, _yp, j| {
                j[[0, 0]] = 1.0 - lambda / cj;
                Ok(())
            }),
        );
        let mut ode = OdeIntegrator::new(
            ExponentialDecay::new(lambda),
            ls,
            Method::Bdf,
            array![1.0],
            1e-3,
            Tolerances::ScalarScalar {
                reltol: 1e-8,
                abstol: 1e-12,
            },
        );

        let tout = 1.0_f64;
        while ode.tn() < tout {
            ode.step().unwrap();
        }

        let expected = exact(lambda, 1.0, ode.tn());
        assert!((ode.y()[0] - expected).abs() < 1e-4);
    }

    /// Central-difference consistency check against `exact_sensitivity`
    /// (spec §4.11 DQ consistency check, half two): perturbing `lambda` by
    /// `±delta` and differencing `exact` should match the closed-form
    /// `ds/dlambda` the same way a DQ sensitivity RHS would be validated
    /// against an analytic one.
    #[test]
    fn central_difference_matches_exact_sensitivity() {
        let lambda = -1.5_f64;
        let y0 = 1.0_f64;
        let t = 2.0_f64;

        let delta = dq::base_perturbation(1e-6, f64::EPSILON) * lambda.abs().max(1.0);
        let plus = exact(lambda + delta, y0, t);
        let minus = exact(lambda - delta, y0, t);
        let dq_sensitivity = (plus - minus) / (2.0 * delta);

        let analytic = exact_sensitivity(lambda, y0, t);
        assert!((dq_sensitivity - analytic).abs() < 1e-4);
    }
}
