//! Van der Pol oscillator in first-order form, stiff for large `mu`:
//!
//! ```text
//! y0' = y1
//! y1' = mu * (1 - y0^2) * y1 - y0
//! ```
//!
//! Provided in both explicit-ODE and implicit-DAE form; with `mu = 1000`
//! this is the canonical stress test for the BDF/Newton corrector path.

use ndarray::*;

use crate::traits::{DaeModel, ModelSpec, OdeModel};

#[derive(Clone, Copy, Debug)]
pub struct VanDerPolOde {
    pub mu: f64,
}

impl VanDerPolOde {
    pub fn new(mu: f64) -> Self {
        VanDerPolOde { mu }
    }
}

impl Default for VanDerPolOde {
    fn default() -> Self {
        VanDerPolOde { mu: 1000.0 }
    }
}

impl ModelSpec for VanDerPolOde {
    type Scalar = f64;
    type Dim = Ix1;

    fn model_size(&self) -> usize {
        2
    }
}

impl OdeModel for VanDerPolOde {
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
        yp[0] = y[1];
        yp[1] = self.mu * (1.0 - y[0] * y[0]) * y[1] - y[0];
        Ok(())
    }

    fn jacobian<S1, S2>(
        &mut self,
        _t: f64,
        y: &ArrayBase<S1, Ix1>,
        j: &mut ArrayBase<S2, Ix2>,
    ) -> Result<(), failure::Error>
    where
        S1: Data<Elem = f64>,
        S2: DataMut<Elem = f64>,
    {
        j[[0, 0]] = 0.0;
        j[[0, 1]] = 1.0;
        j[[1, 0]] = -2.0 * self.mu * y[0] * y[1] - 1.0;
        j[[1, 1]] = self.mu * (1.0 - y[0] * y[0]);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct VanDerPolDae {
    pub mu: f64,
}

impl Default for VanDerPolDae {
    fn default() -> Self {
        VanDerPolDae { mu: 1000.0 }
    }
}

impl ModelSpec for VanDerPolDae {
    type Scalar = f64;
    type Dim = Ix1;

    fn model_size(&self) -> usize {
        2
    }
}

impl DaeModel for VanDerPolDae {
    fn residual<'a, S1, S2, S3>(
        &mut self,
        _t: f64,
        y: &ArrayBase<S1, Ix1>,
        yp: &ArrayBase<S2, Ix1>,
        res: &'a mut ArrayBase<S3, Ix1>,
    ) -> Result<(), failure::Error>
    where
        S1: Data<Elem = f64>,
        S2: Data<Elem = f64>,
        S3: DataMut<Elem = f64>,
    {
        res[0] = yp[0] - y[1];
        res[1] = yp[1] - (self.mu * (1.0 - y[0] * y[0]) * y[1] - y[0]);
        Ok(())
    }

    fn jacobian<S1, S2, S3>(
        &mut self,
        cj: f64,
        y: &ArrayBase<S1, Ix1>,
        _yp: &ArrayBase<S2, Ix1>,
        j: &mut ArrayBase<S3, Ix2>,
    ) -> Result<(), failure::Error>
    where
        S1: Data<Elem = f64>,
        S2: Data<Elem = f64>,
        S3: DataMut<Elem = f64>,
    {
        j[[0, 0]] = cj;
        j[[0, 1]] = -1.0;
        j[[1, 0]] = 2.0 * self.mu * y[0] * y[1] + 1.0;
        j[[1, 1]] = cj - self.mu * (1.0 - y[0] * y[0]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ode_rhs_at_origin_velocity() {
        let mut model = VanDerPolOde::new(1.0);
        let y = array![0.0, 1.0];
        let mut yp = array![0.0, 0.0];
        model.rhs(0.0, &y, &mut yp).unwrap();
        assert_eq!(yp[0], 1.0);
        assert_eq!(yp[1], 1.0);
    }

    #[test]
    fn dae_residual_matches_ode_form_when_consistent() {
        let mut ode = VanDerPolOde::new(5.0);
        let mut dae = VanDerPolDae { mu: 5.0 };
        let y = array![0.3, -0.2];
        let mut yp = array![0.0, 0.0];
        ode.rhs(0.0, &y, &mut yp).unwrap();

        let mut res = array![0.0, 0.0];
        dae.residual(0.0, &y, &yp, &mut res).unwrap();
        assert!(res.iter().all(|&r| r.abs() < 1e-12));
    }
}
