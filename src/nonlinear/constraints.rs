//! Optional component-wise inequality constraint check (spec §9 design
//! note), applied after each Newton convergence.
//!
//! `constraints[i]` encodes, via its sign and magnitude:
//! - `0`   — no constraint on `y[i]`
//! - `1`   — `y[i] >= 0`
//! - `-1`  — `y[i] <= 0`
//! - `2`   — `y[i] > 0` (strict)
//! - `-2`  — `y[i] < 0` (strict)

use ndarray::*;

/// Returns `Ok(())` if all constraints are satisfied, or `Err(mask)` where
/// `mask[i]` is `true` for every violated component.
pub fn check<T, S>(
    y: &ArrayBase<S, Ix1>,
    constraints: &Array1<T>,
) -> Result<(), Array1<bool>>
where
    T: num_traits::Float,
    S: Data<Elem = T>,
{
    let mut any = false;
    let mask = Array1::from_iter(y.iter().zip(constraints.iter()).map(|(&yi, &ci)| {
        let violated = if ci == T::from(1.0).unwrap() {
            yi < T::zero()
        } else if ci == T::from(-1.0).unwrap() {
            yi > T::zero()
        } else if ci == T::from(2.0).unwrap() {
            yi <= T::zero()
        } else if ci == T::from(-2.0).unwrap() {
            yi >= T::zero()
        } else {
            false
        };
        any |= violated;
        violated
    }));

    if any {
        Err(mask)
    } else {
        Ok(())
    }
}

/// The step-size reduction applied on a recoverable constraint violation
/// (spec §4.8 preserves the source's retry formula: halve the step and
/// retry, same as a first error-test failure).
pub fn retry_factor<T: num_traits::Float>() -> T {
    T::from(0.25).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_sign_violation() {
        let y = array![1.0, -1.0, 0.0];
        let c = array![1.0, 1.0, 2.0];
        let mask = check(&y, &c).unwrap_err();
        assert_eq!(mask, array![false, true, true]);
    }

    #[test]
    fn passes_when_satisfied() {
        let y = array![1.0, -1.0, 0.0];
        let c = array![1.0, -1.0, 0.0];
        assert!(check(&y, &c).is_ok());
    }
}
