//! # Sequential quadratic programming solver
//!
//! Each iteration linearises the equality constraints at the current iterate and solves the
//! quadratic subproblem
//!
//! ```text
//! minimise    1/2 p' H p + grad(f)' p
//! subject to  g(z) + J(z) p = 0
//!             lower - z <= p <= upper - z
//! ```
//!
//! for the step `p` with OSQP. `H` is the cost Hessian. The step is then globalised by a
//! backtracking line search on the L1 merit function `f(z) + mu |g(z)|_1`.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::trace;
use nalgebra::{DMatrix, DVector};
use osqp::{CscMatrix, Problem, Settings, Status};
use std::borrow::Cow;
use std::time::{Duration, Instant};

// Internal
use super::*;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Absolute and relative tolerance of the QP subproblems
const QP_EPS: f64 = 1e-6;

/// Initial penalty of the constraint violation in the merit function
const INITIAL_PENALTY: f64 = 1.0;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Settings of the [`SqpSolver`].
#[derive(Debug, Clone)]
pub struct SqpSettings {
    /// Maximum number of major iterations
    pub max_iters: usize,

    /// Wall clock budget of one solve. Includes the QP subproblems.
    pub time_budget: Duration,

    /// Maximum number of ADMM iterations in each QP subproblem
    pub qp_max_iters: u32,

    /// Largest absolute constraint residual accepted at convergence
    pub constraint_tol: f64,

    /// Largest step accepted at convergence, relative to `1 + |z|_inf`
    pub step_tol: f64,

    /// Smallest change in merit, relative to `1 + |merit|`, below which a feasible iterate is
    /// considered converged.
    pub merit_tol: f64,

    /// Sufficient decrease parameter of the line search
    pub armijo: f64,

    /// Factor the step length is reduced by on each backtrack
    pub backtrack: f64,

    /// Shortest step length, taken if no step satisfies the sufficient decrease condition
    pub min_step: f64,
}

/// SQP solver using OSQP for the subproblems.
#[derive(Debug, Clone, Default)]
pub struct SqpSolver {
    settings: SqpSettings,
}

/// How a QP subproblem solve ended.
#[derive(Debug, Clone, Copy, PartialEq)]
enum QpExit {
    /// Solved to tolerance
    Solved,

    /// Stopped at the ADMM iteration limit, the step is only approximate
    Truncated,

    /// Stopped by the remaining time budget
    TimeLimit,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Default for SqpSettings {
    fn default() -> Self {
        Self {
            max_iters: 25,
            time_budget: Duration::from_millis(50),
            qp_max_iters: 4000,
            constraint_tol: 1e-3,
            step_tol: 1e-4,
            merit_tol: 1e-10,
            armijo: 1e-4,
            backtrack: 0.5,
            min_step: 1.0 / 64.0,
        }
    }
}

impl SqpSolver {
    pub fn new(settings: SqpSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SqpSettings {
        &self.settings
    }

    /// Solve the QP subproblem at `z`, returning the step, the multipliers of the equality
    /// constraints and how the solve ended.
    #[allow(clippy::too_many_arguments)]
    fn solve_qp(
        &self,
        hess: &DMatrix<f64>,
        grad: &DVector<f64>,
        jac: &DMatrix<f64>,
        g: &DVector<f64>,
        z: &[f64],
        bounds: &VarBounds,
        bounded: &[usize],
        time_limit: Duration,
    ) -> Result<(DVector<f64>, DVector<f64>, QpExit), NlpError> {
        let n = z.len();
        let m = g.len();

        // Equality rows first, followed by one row per bounded variable
        let mut a = DMatrix::zeros(m + bounded.len(), n);
        a.rows_mut(0, m).copy_from(jac);

        let mut l = Vec::with_capacity(m + bounded.len());
        let mut u = Vec::with_capacity(m + bounded.len());
        for r in g.iter() {
            l.push(-r);
            u.push(-r);
        }
        for (row, &i) in bounded.iter().enumerate() {
            a[(m + row, i)] = 1.0;
            l.push(bounds.lower[i] - z[i]);
            u.push(bounds.upper[i] - z[i]);
        }

        let settings = Settings::default()
            .verbose(false)
            .polish(true)
            .eps_abs(QP_EPS)
            .eps_rel(QP_EPS)
            .max_iter(self.settings.qp_max_iters)
            .time_limit(Some(time_limit));

        let mut qp = Problem::new(
            dense_to_csc(hess, true),
            grad.as_slice(),
            dense_to_csc(&a, false),
            &l,
            &u,
            &settings,
        )
        .map_err(|e| NlpError::QpSetup(e.to_string()))?;

        let (sol, exit) = match qp.solve() {
            Status::Solved(s) | Status::SolvedInaccurate(s) => (s, QpExit::Solved),
            Status::MaxIterationsReached(s) => (s, QpExit::Truncated),
            Status::TimeLimitReached(s) => (s, QpExit::TimeLimit),
            Status::PrimalInfeasible(_) | Status::PrimalInfeasibleInaccurate(_) => {
                return Err(NlpError::QpFailed("primal infeasible"))
            }
            Status::DualInfeasible(_) | Status::DualInfeasibleInaccurate(_) => {
                return Err(NlpError::QpFailed("dual infeasible"))
            }
            _ => return Err(NlpError::QpFailed("solver failure")),
        };

        Ok((
            DVector::from_column_slice(sol.x()),
            DVector::from_column_slice(&sol.y()[..m]),
            exit,
        ))
    }
}

impl NlpSolver for SqpSolver {
    fn solve(
        &self,
        problem: &dyn NlpProblem,
        bounds: &VarBounds,
        initial_guess: &[f64],
    ) -> Result<NlpSolution, NlpError> {
        let start = Instant::now();
        let n = problem.num_vars();
        let m = problem.num_constraints();
        let s = &self.settings;

        check_dim("initial guess values", n, initial_guess.len())?;
        check_dim("lower bounds", n, bounds.lower.len())?;
        check_dim("upper bounds", n, bounds.upper.len())?;
        if let Some(i) = (0..n).find(|&i| bounds.lower[i] > bounds.upper[i]) {
            return Err(NlpError::InvalidBounds(i));
        }
        check_finite(initial_guess, "initial guess")?;

        let bounded: Vec<usize> = (0..n)
            .filter(|&i| bounds.lower[i].is_finite() || bounds.upper[i].is_finite())
            .collect();

        let mut z = initial_guess.to_vec();
        bounds.project(&mut z);

        let mut penalty = INITIAL_PENALTY;
        let mut status = Convergence::MaxIterations;
        let mut iterations = 0;

        while iterations < s.max_iters {
            let elapsed = start.elapsed();
            if elapsed >= s.time_budget {
                status = Convergence::TimeBudget;
                break;
            }

            let g = problem.constraints(&z);
            let grad = problem.cost_gradient(&z);
            let hess = problem.cost_hessian(&z);
            let jac = problem.constraint_jacobian(&z);

            check_dim("constraint residuals", m, g.len())?;
            check_dim("gradient elements", n, grad.len())?;
            check_dim("Hessian elements", n * n, hess.nrows() * hess.ncols())?;
            check_dim("Jacobian elements", m * n, jac.nrows() * jac.ncols())?;
            check_finite(g.as_slice(), "constraints")?;
            check_finite(grad.as_slice(), "cost gradient")?;
            check_finite(hess.as_slice(), "cost Hessian")?;
            check_finite(jac.as_slice(), "constraint Jacobian")?;

            let (step, multipliers, exit) = self.solve_qp(
                &hess,
                &grad,
                &jac,
                &g,
                &z,
                bounds,
                &bounded,
                s.time_budget - elapsed,
            )?;
            check_finite(step.as_slice(), "QP step")?;

            iterations += 1;

            // A step cut short by the clock is not trusted, the solve ends here
            if exit == QpExit::TimeLimit {
                status = Convergence::TimeBudget;
                break;
            }

            // Convergence may only be judged on a step from a solved subproblem
            let exact = exit == QpExit::Solved;

            let violation = inf_norm(g.as_slice());
            let step_norm = inf_norm(step.as_slice());

            if exact
                && step_norm <= s.step_tol * (1.0 + inf_norm(&z))
                && violation <= s.constraint_tol
            {
                z = advance(&z, &step, 1.0, bounds);
                status = Convergence::Converged;
                break;
            }

            // The exact penalty must exceed the largest multiplier for the step to descend
            penalty = penalty.max(2.0 * inf_norm(multipliers.as_slice()) + 1.0);

            let g_l1 = l1_norm(g.as_slice());
            let merit_0 = problem.cost(&z) + penalty * g_l1;
            let slope = (grad.dot(&step) - penalty * g_l1).min(0.0);

            let mut alpha = 1.0;
            let (z_next, merit_next) = loop {
                let candidate = advance(&z, &step, alpha, bounds);
                let candidate_merit = merit(problem, &candidate, penalty);

                if candidate_merit <= merit_0 + s.armijo * alpha * slope || alpha <= s.min_step {
                    break (candidate, candidate_merit);
                }

                alpha = (alpha * s.backtrack).max(s.min_step);
            };

            trace!(
                "SQP iter {}: |p| = {:.3e}, |g| = {:.3e}, merit = {:.6e}, alpha = {}",
                iterations,
                step_norm,
                violation,
                merit_next,
                alpha
            );

            let merit_change = (merit_0 - merit_next).abs();
            z = z_next;

            if exact
                && merit_change <= s.merit_tol * (1.0 + merit_0.abs())
                && inf_norm(problem.constraints(&z).as_slice()) <= s.constraint_tol
            {
                status = Convergence::Converged;
                break;
            }
        }

        check_finite(&z, "solution")?;

        let cost = problem.cost(&z);
        let constraint_violation = inf_norm(problem.constraints(&z).as_slice());

        if !cost.is_finite() || !constraint_violation.is_finite() {
            return Err(NlpError::NonFinite("solution"));
        }

        Ok(NlpSolution {
            x: z,
            status,
            iterations,
            cost,
            constraint_violation,
        })
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

/// Convert a dense matrix into compressed sparse column form, dropping zeros. If `upper_tri` is
/// set only the upper triangle is kept.
fn dense_to_csc(mat: &DMatrix<f64>, upper_tri: bool) -> CscMatrix<'static> {
    let mut indptr = Vec::with_capacity(mat.ncols() + 1);
    let mut indices = Vec::new();
    let mut data = Vec::new();

    indptr.push(0);
    for j in 0..mat.ncols() {
        let num_rows = match upper_tri {
            true => (j + 1).min(mat.nrows()),
            false => mat.nrows(),
        };

        for i in 0..num_rows {
            let v = mat[(i, j)];
            if v != 0.0 {
                indices.push(i);
                data.push(v);
            }
        }

        indptr.push(indices.len());
    }

    CscMatrix {
        nrows: mat.nrows(),
        ncols: mat.ncols(),
        indptr: Cow::Owned(indptr),
        indices: Cow::Owned(indices),
        data: Cow::Owned(data),
    }
}

/// `z + alpha p`, projected into the bounds.
fn advance(z: &[f64], step: &DVector<f64>, alpha: f64, bounds: &VarBounds) -> Vec<f64> {
    let mut next: Vec<f64> = z.iter().zip(step.iter()).map(|(z, p)| z + alpha * p).collect();
    bounds.project(&mut next);
    next
}

fn merit(problem: &dyn NlpProblem, z: &[f64], penalty: f64) -> f64 {
    problem.cost(z) + penalty * l1_norm(problem.constraints(z).as_slice())
}

fn inf_norm(v: &[f64]) -> f64 {
    v.iter().fold(0.0, |acc, x| acc.max(x.abs()))
}

fn l1_norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x.abs()).sum()
}

fn check_dim(what: &'static str, expected: usize, found: usize) -> Result<(), NlpError> {
    match expected == found {
        true => Ok(()),
        false => Err(NlpError::DimensionMismatch {
            what,
            expected,
            found,
        }),
    }
}

fn check_finite(v: &[f64], what: &'static str) -> Result<(), NlpError> {
    match v.iter().all(|x| x.is_finite()) {
        true => Ok(()),
        false => Err(NlpError::NonFinite(what)),
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    /// Minimise `|z - target|^2` subject to `z0^2 + z1^2 = radius^2` (if `on_circle`) or
    /// `z0 + z1 = 1`.
    struct TestProblem {
        target: [f64; 2],
        on_circle: bool,
    }

    impl NlpProblem for TestProblem {
        fn num_vars(&self) -> usize {
            2
        }

        fn num_constraints(&self) -> usize {
            1
        }

        fn cost(&self, z: &[f64]) -> f64 {
            (z[0] - self.target[0]).powi(2) + (z[1] - self.target[1]).powi(2)
        }

        fn cost_gradient(&self, z: &[f64]) -> DVector<f64> {
            DVector::from_vec(vec![
                2.0 * (z[0] - self.target[0]),
                2.0 * (z[1] - self.target[1]),
            ])
        }

        fn cost_hessian(&self, _z: &[f64]) -> DMatrix<f64> {
            DMatrix::identity(2, 2) * 2.0
        }

        fn constraints(&self, z: &[f64]) -> DVector<f64> {
            match self.on_circle {
                true => DVector::from_vec(vec![z[0] * z[0] + z[1] * z[1] - 1.0]),
                false => DVector::from_vec(vec![z[0] + z[1] - 1.0]),
            }
        }

        fn constraint_jacobian(&self, z: &[f64]) -> DMatrix<f64> {
            match self.on_circle {
                true => DMatrix::from_row_slice(1, 2, &[2.0 * z[0], 2.0 * z[1]]),
                false => DMatrix::from_row_slice(1, 2, &[1.0, 1.0]),
            }
        }
    }

    fn test_solver() -> SqpSolver {
        SqpSolver::new(SqpSettings {
            max_iters: 200,
            time_budget: Duration::from_secs(5),
            constraint_tol: 1e-5,
            step_tol: 1e-5,
            ..Default::default()
        })
    }

    #[test]
    fn test_linear_constraint() {
        let problem = TestProblem {
            target: [0.0, 0.0],
            on_circle: false,
        };

        let sol = test_solver()
            .solve(&problem, &VarBounds::unbounded(2), &[3.0, -1.0])
            .unwrap();

        assert_eq!(sol.status, Convergence::Converged);
        assert!((sol.x[0] - 0.5).abs() < 1e-4);
        assert!((sol.x[1] - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_nonlinear_constraint() {
        let problem = TestProblem {
            target: [2.0, 2.0],
            on_circle: true,
        };

        let sol = test_solver()
            .solve(&problem, &VarBounds::unbounded(2), &[1.0, 0.0])
            .unwrap();

        let expected = std::f64::consts::FRAC_1_SQRT_2;
        assert_eq!(sol.status, Convergence::Converged);
        assert!((sol.x[0] - expected).abs() < 1e-3);
        assert!((sol.x[1] - expected).abs() < 1e-3);
        assert!(sol.constraint_violation < 1e-4);
    }

    #[test]
    fn test_bounds() {
        // The unconstrained optimum on the line is (0.5, 0.5), z1 is held below 0.2
        let problem = TestProblem {
            target: [0.0, 0.0],
            on_circle: false,
        };
        let bounds = VarBounds {
            lower: vec![f64::NEG_INFINITY, -0.2],
            upper: vec![f64::INFINITY, 0.2],
        };

        let sol = test_solver().solve(&problem, &bounds, &[0.0, 0.0]).unwrap();

        assert_eq!(sol.status, Convergence::Converged);
        assert!(sol.x[1] <= 0.2 + 1e-9);
        assert!((sol.x[0] - 0.8).abs() < 1e-4);
    }

    #[test]
    fn test_budgets() {
        let problem = TestProblem {
            target: [2.0, 2.0],
            on_circle: true,
        };

        let no_time = SqpSolver::new(SqpSettings {
            time_budget: Duration::from_secs(0),
            ..Default::default()
        });
        let sol = no_time
            .solve(&problem, &VarBounds::unbounded(2), &[1.0, 0.0])
            .unwrap();
        assert_eq!(sol.status, Convergence::TimeBudget);
        assert_eq!(sol.iterations, 0);
        assert_eq!(sol.x, vec![1.0, 0.0]);

        let one_iter = SqpSolver::new(SqpSettings {
            max_iters: 1,
            time_budget: Duration::from_secs(5),
            ..Default::default()
        });
        let sol = one_iter
            .solve(&problem, &VarBounds::unbounded(2), &[1.0, 0.0])
            .unwrap();
        assert_eq!(sol.status, Convergence::MaxIterations);
        assert_eq!(sol.iterations, 1);

        // Subproblems cut short never count towards convergence, even from a feasible start
        let truncated_qp = SqpSolver::new(SqpSettings {
            qp_max_iters: 1,
            time_budget: Duration::from_secs(5),
            ..Default::default()
        });
        let sol = truncated_qp
            .solve(&problem, &VarBounds::unbounded(2), &[1.0, 0.0])
            .unwrap();
        assert_ne!(sol.status, Convergence::Converged);
        assert!(sol.x.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_invalid_input() {
        let problem = TestProblem {
            target: [0.0, 0.0],
            on_circle: false,
        };

        assert!(matches!(
            test_solver().solve(&problem, &VarBounds::unbounded(2), &[0.0]),
            Err(NlpError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            test_solver().solve(&problem, &VarBounds::unbounded(2), &[f64::NAN, 0.0]),
            Err(NlpError::NonFinite(_))
        ));
        assert!(matches!(
            test_solver().solve(
                &problem,
                &VarBounds {
                    lower: vec![1.0, 0.0],
                    upper: vec![0.0, 0.0]
                },
                &[0.0, 0.0]
            ),
            Err(NlpError::InvalidBounds(0))
        ));
    }

    #[test]
    fn test_dense_to_csc() {
        let mat = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 0.0]);

        let full = dense_to_csc(&mat, false);
        assert_eq!(full.indptr.as_ref(), &[0, 2, 3]);
        assert_eq!(full.indices.as_ref(), &[0, 1, 0]);
        assert_eq!(full.data.as_ref(), &[1.0, 2.0, 2.0]);

        let upper = dense_to_csc(&mat, true);
        assert_eq!(upper.indptr.as_ref(), &[0, 1, 2]);
        assert_eq!(upper.indices.as_ref(), &[0, 0]);
        assert_eq!(upper.data.as_ref(), &[1.0, 2.0]);
    }
}
