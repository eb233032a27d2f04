//! # Nonlinear programming
//!
//! Interface between problems of the form
//!
//! ```text
//! minimise    f(z)
//! subject to  g(z) = 0
//!             lower <= z <= upper
//! ```
//!
//! and the solvers which minimise them. Problems provide the cost, the equality constraints, and
//! their derivatives. Solvers only ever see the problem through [`NlpProblem`], which allows the
//! horizon optimisation to be tested against solvers which fail on purpose.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

pub mod sqp;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use nalgebra::{DMatrix, DVector};
use serde::Serialize;

pub use sqp::{SqpSettings, SqpSolver};

// ---------------------------------------------------------------------------
// TRAITS
// ---------------------------------------------------------------------------

/// A smooth nonlinear program with equality constraints and variable bounds.
pub trait NlpProblem {
    /// Number of decision variables
    fn num_vars(&self) -> usize;

    /// Number of equality constraints
    fn num_constraints(&self) -> usize;

    fn cost(&self, z: &[f64]) -> f64;

    fn cost_gradient(&self, z: &[f64]) -> DVector<f64>;

    /// Hessian of the cost, `num_vars x num_vars` and symmetric.
    fn cost_hessian(&self, z: &[f64]) -> DMatrix<f64>;

    /// Residuals of the equality constraints, zero when satisfied.
    fn constraints(&self, z: &[f64]) -> DVector<f64>;

    /// Jacobian of the constraints, `num_constraints x num_vars`.
    fn constraint_jacobian(&self, z: &[f64]) -> DMatrix<f64>;
}

/// A solver for [`NlpProblem`]s.
pub trait NlpSolver: Send {
    /// Minimise the problem within the bounds starting from the initial guess.
    fn solve(
        &self,
        problem: &dyn NlpProblem,
        bounds: &VarBounds,
        initial_guess: &[f64],
    ) -> Result<NlpSolution, NlpError>;
}

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Bounds on the decision variables. Unbounded variables use infinite limits.
#[derive(Debug, Clone)]
pub struct VarBounds {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

/// The result of a solve.
#[derive(Debug, Clone)]
pub struct NlpSolution {
    /// Final iterate
    pub x: Vec<f64>,

    /// Why the solver stopped
    pub status: Convergence,

    pub iterations: usize,

    /// Cost at the final iterate
    pub cost: f64,

    /// Largest absolute constraint residual at the final iterate
    pub constraint_violation: f64,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Reason a solver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Convergence {
    /// The convergence tolerances were met
    Converged,

    /// The iteration limit was reached first
    MaxIterations,

    /// The wall clock budget ran out first
    TimeBudget,
}

/// Errors which stop a solve.
#[derive(Debug, thiserror::Error)]
pub enum NlpError {
    #[error("Expected {expected} {what} but found {found}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Lower bound of variable {0} is above its upper bound")]
    InvalidBounds(usize),

    #[error("Could not set up the QP subproblem: {0}")]
    QpSetup(String),

    #[error("The QP subproblem could not be solved: {0}")]
    QpFailed(&'static str),

    #[error("A non-finite value was produced in the {0}")]
    NonFinite(&'static str),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl VarBounds {
    /// Bounds which leave all `n` variables free.
    pub fn unbounded(n: usize) -> Self {
        Self {
            lower: vec![f64::NEG_INFINITY; n],
            upper: vec![f64::INFINITY; n],
        }
    }

    pub fn len(&self) -> usize {
        self.lower.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }

    /// Project a point into the bounds.
    pub fn project(&self, z: &mut [f64]) {
        for (i, v) in z.iter_mut().enumerate() {
            *v = util::maths::clamp(v, &self.lower[i], &self.upper[i]);
        }
    }
}
