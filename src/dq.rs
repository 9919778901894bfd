//! Finite-difference (DQ) approximation of the sensitivity right-hand-side
//! when the user supplies no analytic `f_S` (spec §4.11).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Difference {
    Forward,
    Centered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DqScheme {
    /// Perturb `y` and `p` together, by `min(Δy, Δp)`.
    Simultaneous(Difference),
    /// Perturb `y` and `p` separately, each by its own Δ.
    Separate(Difference),
}

/// Choose the DQ perturbation scheme for one sensitivity parameter (spec
/// §4.11).
///
/// `rho_max` is the `ρ_max` dial: `0` forces simultaneous/forward; positive
/// values bias toward simultaneous+centered; the sign and magnitude of
/// `rho_max` otherwise gate the simultaneous-vs-separate decision via
/// `ratio = Δy / Δp`.
pub fn select_scheme<T: num_traits::Float>(delta_y: T, delta_p: T, rho_max: T) -> DqScheme {
    let ratio = delta_y / delta_p;
    let spread = ratio.max(T::one() / ratio);

    if spread <= rho_max.abs() || rho_max == T::zero() {
        let diff = if rho_max >= T::zero() {
            Difference::Centered
        } else {
            Difference::Forward
        };
        DqScheme::Simultaneous(diff)
    } else {
        let diff = if rho_max > T::zero() {
            Difference::Centered
        } else {
            Difference::Forward
        };
        DqScheme::Separate(diff)
    }
}

/// Base perturbation magnitude `δ = sqrt(max(reltol, uround))`.
pub fn base_perturbation<T: num_traits::Float>(reltol: T, uround: T) -> T {
    reltol.max(uround).sqrt()
}

/// `Δp = pbar_i * δ`.
pub fn delta_p<T: num_traits::Float>(pbar: T, delta: T) -> T {
    pbar * delta
}

/// `Δy = max(||s_i||_wrms * pbar_i, δ/pbar_i) / pbar_i * pbar_i` (spec
/// §4.11, kept in the literal form the spec gives rather than algebraically
/// simplified, so the per-factor provenance stays visible at call sites).
pub fn delta_y<T: num_traits::Float>(s_i_wrms_norm: T, pbar: T, delta: T) -> T {
    let a = s_i_wrms_norm * pbar;
    let b = delta / pbar;
    (a.max(b) / pbar) * pbar
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn centered_when_rho_max_zero() {
        assert_eq!(
            select_scheme(1.0, 1.0, 0.0_f64),
            DqScheme::Simultaneous(Difference::Centered)
        );
    }

    #[test]
    fn centered_when_rho_max_positive_and_close() {
        assert_eq!(
            select_scheme(1.0, 1.1, 2.0_f64),
            DqScheme::Simultaneous(Difference::Centered)
        );
    }

    #[test]
    fn separate_forward_when_rho_max_negative_and_spread() {
        assert_eq!(
            select_scheme(10.0, 1.0, -2.0_f64),
            DqScheme::Separate(Difference::Forward)
        );
    }

    #[test]
    fn separate_centered_when_rho_max_positive_and_spread() {
        assert_eq!(
            select_scheme(10.0, 1.0, 2.0_f64),
            DqScheme::Separate(Difference::Centered)
        );
    }
}
