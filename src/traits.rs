//! Basic traits for problem specification
//!
//! A "problem" is the user-supplied right-hand-side / residual together with
//! whatever the linear solver needs from it. The engine is generic over
//! these traits; it never assumes a concrete vector or matrix type beyond
//! `ndarray`, which plays the role of the "N-vector" abstraction that
//! `spec.md` §6 treats as an external collaborator.

use ndarray::*;

/// Model specification: size and scalar type of the problem.
pub trait ModelSpec: Clone {
    type Scalar: num_traits::Float;
    type Dim: Dimension;
    fn model_size(&self) -> <Ix1 as Dimension>::Pattern;
}

/// Explicit ODE form: `y' = f(t, y)`. Used by the Adams/BDF (explicit)
/// integrator in [`crate::ode`].
pub trait OdeModel: ModelSpec {
    /// Evaluate `f(t, y)`, storing the result in `yp`.
    fn rhs<S1, S2>(
        &mut self,
        t: Self::Scalar,
        y: &ArrayBase<S1, Ix1>,
        yp: &mut ArrayBase<S2, Ix1>,
    ) -> Result<(), failure::Error>
    where
        S1: Data<Elem = Self::Scalar>,
        S2: DataMut<Elem = Self::Scalar>;

    /// Evaluate (or refresh a cached) Jacobian `J = df/dy` at `(t, y)`.
    fn jacobian<S1, S2>(
        &mut self,
        t: Self::Scalar,
        y: &ArrayBase<S1, Ix1>,
        j: &mut ArrayBase<S2, Ix2>,
    ) -> Result<(), failure::Error>
    where
        S1: Data<Elem = Self::Scalar>,
        S2: DataMut<Elem = Self::Scalar>;
}

/// Implicit DAE form: `F(t, y, y') = 0`. Used by the fixed-leading-coefficient
/// BDF integrator in [`crate::dae`].
pub trait DaeModel: ModelSpec {
    /// Evaluate the residual `F(t, y, y')`, storing the result in `res`.
    ///
    /// Returning `Ok(())` means success. A recoverable failure (the caller
    /// asked for an out-of-domain evaluation and can retry with a smaller
    /// step) is signaled with [`crate::error::SolverError::RecoverableResidual`];
    /// anything else is treated as fatal.
    fn residual<'a, S1, S2, S3>(
        &mut self,
        t: Self::Scalar,
        y: &ArrayBase<S1, Ix1>,
        yp: &ArrayBase<S2, Ix1>,
        res: &'a mut ArrayBase<S3, Ix1>,
    ) -> Result<(), failure::Error>
    where
        S1: Data<Elem = Self::Scalar>,
        S2: Data<Elem = Self::Scalar>,
        S3: DataMut<Elem = Self::Scalar>;

    /// Evaluate (or refresh a cached) Jacobian `J = dF/dy + cj * dF/dy'`, the
    /// `P` matrix used by Newton (spec §4.3).
    fn jacobian<S1, S2, S3>(
        &mut self,
        cj: Self::Scalar,
        y: &ArrayBase<S1, Ix1>,
        yp: &ArrayBase<S2, Ix1>,
        j: &mut ArrayBase<S3, Ix2>,
    ) -> Result<(), failure::Error>
    where
        S1: Data<Elem = Self::Scalar>,
        S2: Data<Elem = Self::Scalar>,
        S3: DataMut<Elem = Self::Scalar>;
}

/// Mathematical constants used throughout the controller/coefficient engine,
/// generic over the scalar type. Mirrors the teacher's `IdaConst`.
pub trait IdaConst {
    type Scalar: num_traits::Float;
    fn half() -> Self::Scalar;
    fn quarter() -> Self::Scalar;
    fn twothirds() -> Self::Scalar;
    fn onept5() -> Self::Scalar;
    fn two() -> Self::Scalar;
    fn four() -> Self::Scalar;
    fn five() -> Self::Scalar;
    fn ten() -> Self::Scalar;
    fn twelve() -> Self::Scalar;
    fn twenty() -> Self::Scalar;
    fn hundred() -> Self::Scalar;
    fn pt9() -> Self::Scalar;
    fn pt99() -> Self::Scalar;
    fn pt1() -> Self::Scalar;
    fn pt01() -> Self::Scalar;
    fn pt001() -> Self::Scalar;
    fn pt0001() -> Self::Scalar;
}

impl IdaConst for f64 {
    type Scalar = Self;
    fn half() -> Self {
        0.5
    }
    fn quarter() -> Self {
        0.25
    }
    fn twothirds() -> Self {
        0.667
    }
    fn onept5() -> Self {
        1.5
    }
    fn two() -> Self {
        2.0
    }
    fn four() -> Self {
        4.0
    }
    fn five() -> Self {
        5.0
    }
    fn ten() -> Self {
        10.0
    }
    fn twelve() -> Self {
        12.0
    }
    fn twenty() -> Self {
        20.0
    }
    fn hundred() -> Self {
        100.
    }
    fn pt9() -> Self {
        0.9
    }
    fn pt99() -> Self {
        0.99
    }
    fn pt1() -> Self {
        0.1
    }
    fn pt01() -> Self {
        0.01
    }
    fn pt001() -> Self {
        0.001
    }
    fn pt0001() -> Self {
        0.0001
    }
}

/// Weighted root-mean-square norm: `sqrt((1/N) sum((v_i * w_i)^2))`.
pub trait NormRms<A, S, D>
where
    A: num_traits::float::Float,
    S: Data<Elem = A>,
    D: Dimension,
{
    fn norm_wrms(&self, w: &ArrayBase<S, D>) -> A;
}

/// WRMS norm with a boolean mask applied to the weight vector first, used
/// when `suppressalg`/`errconS=PARTIAL`-style masking excludes components
/// from the error test (spec §4.6).
pub trait NormRmsMasked<A, S, D, B>
where
    A: num_traits::float::Float,
    S: Data<Elem = A>,
    D: Dimension,
    B: Data<Elem = bool>,
{
    fn norm_wrms_masked(&self, w: &ArrayBase<S, D>, id: &ArrayBase<B, D>) -> A;
}

impl<A, S, D> NormRms<A, S, D> for ArrayBase<S, D>
where
    A: num_traits::float::Float,
    S: Data<Elem = A>,
    D: Dimension,
{
    fn norm_wrms(&self, w: &ArrayBase<S, D>) -> A {
        ((self * w)
            .iter()
            .map(|x| x.powi(2))
            .fold(A::zero(), |acc, x| acc + x)
            / A::from(self.len()).unwrap())
        .sqrt()
    }
}

impl<A, S, D, B> NormRmsMasked<A, S, D, B> for ArrayBase<S, D>
where
    A: num_traits::float::Float,
    S: Data<Elem = A>,
    D: Dimension,
    B: Data<Elem = bool>,
{
    fn norm_wrms_masked(&self, w: &ArrayBase<S, D>, id: &ArrayBase<B, D>) -> A {
        let mask = id.map(|x| if *x { A::one() } else { A::zero() });
        ((self * w * mask)
            .iter()
            .map(|x| x.powi(2))
            .fold(A::zero(), |acc, x| acc + x)
            / A::from(self.len()).unwrap())
        .sqrt()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_norm_wrms() {
        const LENGTH: usize = 32;
        let x = Array::from_elem(LENGTH, -0.5);
        let w = Array::from_elem(LENGTH, 0.5);
        assert_eq!(x.norm_wrms(&w), 0.25);
    }

    #[test]
    fn test_norm_wrms_masked() {
        const LENGTH: usize = 32;
        let fac = (((LENGTH - 1) as f64) / (LENGTH as f64)).sqrt();

        let x = Array::from_elem(LENGTH, -0.5);
        let w = Array::from_elem(LENGTH, 0.5);
        let mut id = Array::from_elem(LENGTH, true);
        id[LENGTH - 1] = false;

        assert_eq!(x.norm_wrms_masked(&w, &id), fac * 0.5 * 0.5);
    }
}
