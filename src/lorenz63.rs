//! Lorenz three-variable system
//! https://en.wikipedia.org/wiki/Lorenz_system
//!
//! Provided in both the explicit-ODE (`y' = f(t,y)`) and implicit-DAE
//! (`F(t,y,y') = 0`) forms so each integrator engine has a shared,
//! well-understood chaotic test problem.

use ndarray::*;

use crate::traits::{DaeModel, ModelSpec, OdeModel};

#[derive(Clone, Copy, Debug)]
pub struct LorenzParams {
    pub p: f64,
    pub r: f64,
    pub b: f64,
}

impl Default for LorenzParams {
    fn default() -> Self {
        LorenzParams {
            p: 10.0,
            r: 28.0,
            b: 8.0 / 3.0,
        }
    }
}

fn rhs(params: &LorenzParams, y: &ArrayView1<f64>, out: &mut ArrayViewMut1<f64>) {
    let x = y[0];
    let yy = y[1];
    let z = y[2];
    out[0] = params.p * (yy - x);
    out[1] = x * (params.r - z) - yy;
    out[2] = x * yy - params.b * z;
}

fn jac(params: &LorenzParams, y: &ArrayView1<f64>, out: &mut Array2<f64>) {
    let x = y[0];
    let z = y[2];
    out.fill(0.0);
    out[[0, 0]] = -params.p;
    out[[0, 1]] = params.p;
    out[[1, 0]] = params.r - z;
    out[[1, 1]] = -1.0;
    out[[1, 2]] = -x;
    out[[2, 0]] = y[1];
    out[[2, 1]] = x;
    out[[2, 2]] = -params.b;
}

/// Explicit-ODE form, for [`crate::ode::OdeIntegrator`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Lorenz63Ode {
    pub params: LorenzParams,
}

impl ModelSpec for Lorenz63Ode {
    type Scalar = f64;
    type Dim = Ix1;

    fn model_size(&self) -> usize {
        3
    }
}

impl OdeModel for Lorenz63Ode {
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
        let y = y.view();
        let mut yp = yp.view_mut();
        rhs(&self.params, &y, &mut yp);
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
        let y = y.view();
        let mut full = Array2::zeros((3, 3));
        jac(&self.params, &y, &mut full);
        j.assign(&full);
        Ok(())
    }
}

/// Implicit-DAE form, for [`crate::dae::DaeIntegrator`]: `F(t,y,y') = y' -
/// f(y)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Lorenz63Dae {
    pub params: LorenzParams,
}

impl ModelSpec for Lorenz63Dae {
    type Scalar = f64;
    type Dim = Ix1;

    fn model_size(&self) -> usize {
        3
    }
}

impl DaeModel for Lorenz63Dae {
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
        let y = y.view();
        let mut f = Array1::zeros(3);
        {
            let mut fview = f.view_mut();
            rhs(&self.params, &y, &mut fview);
        }
        res.assign(&(yp.to_owned() - &f));
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
        let y = y.view();
        let mut df_dy = Array2::zeros((3, 3));
        jac(&self.params, &y, &mut df_dy);
        let eye = Array2::eye(3);
        j.assign(&(&eye * cj - &df_dy));
        Ok(())
    }
}
