//! A pure Rust core integrator engine for variable-step, variable-order
//! multistep ODE/DAE solvers with forward sensitivity and quadrature.
//!
//! Two integrator engines share the ambient machinery (nonlinear solvers,
//! error weighting, DQ sensitivity, quadrature, the driver loop):
//!
//! - [`ode`] — explicit `y' = f(t, y)`, Adams-Moulton or BDF, Nordsieck
//!   history.
//! - [`dae`] — implicit `F(t, y, y') = 0`, fixed-leading-coefficient BDF,
//!   divided-difference history.
//!
//! Both plug into a [`linear_solver::LinearSolver`] implementation and are
//! driven to a requested output time by [`driver::drive`].

pub mod dae;
pub mod driver;
pub mod dq;
pub mod error;
pub mod ewt;
pub mod linear_solver;
pub mod nonlinear;
pub mod ode;
pub mod quadrature;
pub mod sensitivity;
pub mod traits;

pub mod exponential_decay;
pub mod lorenz63;
pub mod van_der_pol;

pub use dae::DaeIntegrator;
pub use error::{ReturnFlag, SolverError};
pub use ode::OdeIntegrator;
pub use traits::{DaeModel, ModelSpec, OdeModel};
