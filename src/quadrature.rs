//! Quadrature variables `q' = f_Q(t, y)` integrated alongside the state
//! (spec §4.5). Quadratures never drive the nonlinear system; they are
//! advanced once per accepted step using the step's own `ℓ`-coefficients.

use ndarray::*;

use crate::sensitivity::ErrorControl;

pub struct QuadratureOptions<T> {
    pub tolerances: crate::ewt::Tolerances<T>,
    pub err_con: ErrorControl,
}

/// `acorQ = (h / l1) * (f_Q - znQ[1])` (spec §4.5).
pub fn correction<T>(f_q: &Array1<T>, zn_q1: &Array1<T>, h_over_l1: T) -> Array1<T>
where
    T: num_traits::Float,
{
    (f_q - zn_q1).mapv(|v| v * h_over_l1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correction_matches_formula() {
        let f_q = array![1.0, 2.0];
        let zn_q1 = array![0.5, 0.5];
        let c = correction(&f_q, &zn_q1, 2.0);
        assert_eq!(c, array![1.0, 3.0]);
    }
}
