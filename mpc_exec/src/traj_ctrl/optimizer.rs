//! # Horizon optimisation
//!
//! The receding horizon problem is posed as a nonlinear program over the stacked decision vector
//!
//! ```text
//! z = [x_0..x_N-1, y_.., psi_.., v_.., cte_.., epsi_.., delta_0..delta_N-2, a_0..a_N-2]
//! ```
//!
//! with the model dynamics as equality constraints and the actuator limits as bounds. Only the
//! actuators are bounded. The first state is pinned to the latency compensated seed state by the
//! first block of equality constraints.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::debug;
use nalgebra::{DMatrix, DVector};
use std::time::Instant;

// Internal
use super::*;
use crate::nlp::{Convergence, NlpProblem, NlpSolver, VarBounds};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Position of each variable in the decision vector.
#[derive(Debug, Clone, Copy)]
struct Layout {
    num_steps: usize,
}

/// The horizon optimisation problem of one control cycle.
pub struct MpcProblem<'a> {
    params: &'a Params,
    poly: &'a Polynomial,
    model: KinematicBicycle,
    seed: VehicleState,
    layout: Layout,
}

/// Optimal trajectory over the horizon.
#[derive(Debug, Clone)]
pub struct OptimizerSolution {
    /// Predicted states, the first being the seed state
    pub states: Vec<VehicleState>,

    /// Actuator demands between the states
    pub actuators: Vec<Actuators>,

    pub iterations: usize,

    pub cost: f64,

    pub solve_time_s: f64,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Layout {
    fn state(&self, k: usize, t: usize) -> usize {
        k * self.num_steps + t
    }

    fn actuator(&self, k: usize, t: usize) -> usize {
        NUM_STATES * self.num_steps + k * (self.num_steps - 1) + t
    }

    fn num_vars(&self) -> usize {
        NUM_STATES * self.num_steps + NUM_ACTUATORS * (self.num_steps - 1)
    }
}

impl<'a> MpcProblem<'a> {
    /// Create the problem. The horizon must have at least two steps.
    pub fn new(
        params: &'a Params,
        poly: &'a Polynomial,
        seed: VehicleState,
    ) -> Result<Self, SolverError> {
        if params.horizon_num_steps < 2 {
            return Err(SolverError::InvalidHorizon(params.horizon_num_steps));
        }

        Ok(Self {
            params,
            poly,
            model: KinematicBicycle::new(params.wheelbase_m),
            seed,
            layout: Layout {
                num_steps: params.horizon_num_steps,
            },
        })
    }

    /// Zero actuation, with the states propagated from the seed by the model.
    ///
    /// The guess satisfies all constraints.
    pub fn initial_guess(&self) -> Vec<f64> {
        let mut z = vec![0.0; self.layout.num_vars()];
        let neutral = Actuators::neutral();

        let mut state = self.seed;
        for t in 0..self.layout.num_steps {
            if t > 0 {
                state = self
                    .model
                    .step(&state, &neutral, self.poly, self.params.step_duration_s);
            }
            self.set_state(&mut z, t, &state);
        }

        z
    }

    pub fn bounds(&self) -> VarBounds {
        let mut bounds = VarBounds::unbounded(self.layout.num_vars());

        for t in 0..self.layout.num_steps - 1 {
            let steer = self.layout.actuator(0, t);
            let accel = self.layout.actuator(1, t);

            bounds.lower[steer] = -self.params.max_steer_rad;
            bounds.upper[steer] = self.params.max_steer_rad;
            bounds.lower[accel] = -self.params.max_accel;
            bounds.upper[accel] = self.params.max_accel;
        }

        bounds
    }

    pub fn state_at(&self, z: &[f64], t: usize) -> VehicleState {
        let mut s = [0.0; NUM_STATES];
        for (k, v) in s.iter_mut().enumerate() {
            *v = z[self.layout.state(k, t)];
        }
        VehicleState::from_array(s)
    }

    pub fn actuators_at(&self, z: &[f64], t: usize) -> Actuators {
        Actuators {
            steer_rad: z[self.layout.actuator(0, t)],
            accel: z[self.layout.actuator(1, t)],
        }
    }

    fn set_state(&self, z: &mut [f64], t: usize, state: &VehicleState) {
        for (k, v) in state.to_array().iter().enumerate() {
            z[self.layout.state(k, t)] = *v;
        }
    }

    /// Add `w (z[i] - z[j])^2` to the Hessian.
    fn add_rate_hessian(hess: &mut DMatrix<f64>, i: usize, j: usize, w: f64) {
        hess[(i, i)] += 2.0 * w;
        hess[(j, j)] += 2.0 * w;
        hess[(i, j)] -= 2.0 * w;
        hess[(j, i)] -= 2.0 * w;
    }
}

impl NlpProblem for MpcProblem<'_> {
    fn num_vars(&self) -> usize {
        self.layout.num_vars()
    }

    fn num_constraints(&self) -> usize {
        NUM_STATES * self.layout.num_steps
    }

    fn cost(&self, z: &[f64]) -> f64 {
        let p = self.params;
        let n = self.layout.num_steps;
        let mut cost = 0.0;

        for t in 0..n {
            let s = self.state_at(z, t);
            cost += p.weight_cte * s.cte_m.powi(2)
                + p.weight_epsi * s.epsi_rad.powi(2)
                + p.weight_speed * (s.speed - p.ref_speed).powi(2);
        }

        for t in 0..n - 1 {
            let a = self.actuators_at(z, t);
            cost += p.weight_steer * a.steer_rad.powi(2) + p.weight_accel * a.accel.powi(2);
        }

        for t in 0..n.saturating_sub(2) {
            let a0 = self.actuators_at(z, t);
            let a1 = self.actuators_at(z, t + 1);
            cost += p.weight_steer_rate * (a1.steer_rad - a0.steer_rad).powi(2)
                + p.weight_accel_rate * (a1.accel - a0.accel).powi(2);
        }

        cost
    }

    fn cost_gradient(&self, z: &[f64]) -> DVector<f64> {
        let p = self.params;
        let l = self.layout;
        let n = l.num_steps;
        let mut grad = DVector::zeros(l.num_vars());

        for t in 0..n {
            let (cte, epsi, v) = (l.state(4, t), l.state(5, t), l.state(3, t));
            grad[cte] += 2.0 * p.weight_cte * z[cte];
            grad[epsi] += 2.0 * p.weight_epsi * z[epsi];
            grad[v] += 2.0 * p.weight_speed * (z[v] - p.ref_speed);
        }

        for t in 0..n - 1 {
            let (steer, accel) = (l.actuator(0, t), l.actuator(1, t));
            grad[steer] += 2.0 * p.weight_steer * z[steer];
            grad[accel] += 2.0 * p.weight_accel * z[accel];
        }

        for t in 0..n.saturating_sub(2) {
            for (k, w) in [(0, p.weight_steer_rate), (1, p.weight_accel_rate)].iter() {
                let (i, j) = (l.actuator(*k, t), l.actuator(*k, t + 1));
                let d = 2.0 * w * (z[j] - z[i]);
                grad[j] += d;
                grad[i] -= d;
            }
        }

        grad
    }

    fn cost_hessian(&self, _z: &[f64]) -> DMatrix<f64> {
        let p = self.params;
        let l = self.layout;
        let n = l.num_steps;
        let mut hess = DMatrix::zeros(l.num_vars(), l.num_vars());

        for t in 0..n {
            hess[(l.state(4, t), l.state(4, t))] += 2.0 * p.weight_cte;
            hess[(l.state(5, t), l.state(5, t))] += 2.0 * p.weight_epsi;
            hess[(l.state(3, t), l.state(3, t))] += 2.0 * p.weight_speed;
        }

        for t in 0..n - 1 {
            hess[(l.actuator(0, t), l.actuator(0, t))] += 2.0 * p.weight_steer;
            hess[(l.actuator(1, t), l.actuator(1, t))] += 2.0 * p.weight_accel;
        }

        for t in 0..n.saturating_sub(2) {
            Self::add_rate_hessian(
                &mut hess,
                l.actuator(0, t),
                l.actuator(0, t + 1),
                p.weight_steer_rate,
            );
            Self::add_rate_hessian(
                &mut hess,
                l.actuator(1, t),
                l.actuator(1, t + 1),
                p.weight_accel_rate,
            );
        }

        hess
    }

    fn constraints(&self, z: &[f64]) -> DVector<f64> {
        let l = self.layout;
        let mut g = DVector::zeros(self.num_constraints());

        // Rows are ordered the same as the state variables
        let seed = self.seed.to_array();
        for k in 0..NUM_STATES {
            let i = l.state(k, 0);
            g[i] = z[i] - seed[k];
        }

        for t in 1..l.num_steps {
            let next = self
                .model
                .step(
                    &self.state_at(z, t - 1),
                    &self.actuators_at(z, t - 1),
                    self.poly,
                    self.params.step_duration_s,
                )
                .to_array();

            for k in 0..NUM_STATES {
                let i = l.state(k, t);
                g[i] = z[i] - next[k];
            }
        }

        g
    }

    fn constraint_jacobian(&self, z: &[f64]) -> DMatrix<f64> {
        let l = self.layout;
        let mut jac = DMatrix::zeros(self.num_constraints(), l.num_vars());

        for k in 0..NUM_STATES {
            let i = l.state(k, 0);
            jac[(i, i)] = 1.0;
        }

        for t in 1..l.num_steps {
            let (a, b) = self.model.linearise(
                &self.state_at(z, t - 1),
                &self.actuators_at(z, t - 1),
                self.poly,
                self.params.step_duration_s,
            );

            for i in 0..NUM_STATES {
                let row = l.state(i, t);
                jac[(row, row)] = 1.0;

                for j in 0..NUM_STATES {
                    jac[(row, l.state(j, t - 1))] -= a[(i, j)];
                }
                for j in 0..NUM_ACTUATORS {
                    jac[(row, l.actuator(j, t - 1))] -= b[(i, j)];
                }
            }
        }

        jac
    }
}

impl OptimizerSolution {
    /// The actuator demands to apply now.
    pub fn first_actuators(&self) -> Actuators {
        self.actuators.first().copied().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Optimise the horizon starting from `seed`.
///
/// Fails with a `SolverError` if the solver does not converge or produces any non-finite value.
pub fn optimise(
    params: &Params,
    seed: &VehicleState,
    poly: &Polynomial,
    solver: &dyn NlpSolver,
) -> Result<OptimizerSolution, SolverError> {
    if !seed.is_finite() {
        return Err(SolverError::NonFinite);
    }

    let problem = MpcProblem::new(params, poly, *seed)?;
    let initial = problem.initial_guess();
    let bounds = problem.bounds();

    let start = Instant::now();
    let sol = solver
        .solve(&problem, &bounds, &initial)
        .map_err(SolverError::Nlp)?;
    let solve_time_s = start.elapsed().as_secs_f64();

    debug!(
        "Horizon solve: {:?} after {} iterations in {:.2} ms (cost {:.3})",
        sol.status,
        sol.iterations,
        solve_time_s * 1e3,
        sol.cost
    );

    if sol.status != Convergence::Converged {
        return Err(SolverError::NotConverged(sol.status, sol.iterations));
    }
    if sol.x.len() != problem.num_vars() || !sol.x.iter().all(|v| v.is_finite()) {
        return Err(SolverError::NonFinite);
    }

    let num_steps = params.horizon_num_steps;

    Ok(OptimizerSolution {
        states: (0..num_steps).map(|t| problem.state_at(&sol.x, t)).collect(),
        actuators: (0..num_steps - 1)
            .map(|t| problem.actuators_at(&sol.x, t))
            .collect(),
        iterations: sol.iterations,
        cost: sol.cost,
        solve_time_s,
    })
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::nlp::SqpSolver;

    fn test_params() -> Params {
        let mut params = Params::default();
        params.solver_time_budget_s = 2.0;
        params
    }

    fn curved_poly() -> Polynomial {
        Polynomial::new(vec![0.5, 0.05, 0.01, -0.0002])
    }

    fn test_seed(poly: &Polynomial) -> VehicleState {
        predictor::seed_state(15.0, poly)
    }

    /// A point off the feasible manifold for derivative checks
    fn perturbed_point(problem: &MpcProblem) -> Vec<f64> {
        problem
            .initial_guess()
            .iter()
            .enumerate()
            .map(|(i, v)| v + 0.01 * ((i * 7 % 11) as f64 - 5.0))
            .collect()
    }

    #[test]
    fn test_initial_guess_feasible() {
        let params = test_params();
        let poly = curved_poly();
        let problem = MpcProblem::new(&params, &poly, test_seed(&poly)).unwrap();

        let z = problem.initial_guess();
        let g = problem.constraints(&z);

        assert_eq!(z.len(), params.num_vars());
        assert!(g.iter().all(|r| r.abs() < 1e-12));
        assert_eq!(problem.state_at(&z, 0), test_seed(&poly));
    }

    #[test]
    fn test_derivatives() {
        let params = test_params();
        let poly = curved_poly();
        let problem = MpcProblem::new(&params, &poly, test_seed(&poly)).unwrap();
        let z = perturbed_point(&problem);
        let h = 1e-6;

        let grad = problem.cost_gradient(&z);
        let hess = problem.cost_hessian(&z);
        let jac = problem.constraint_jacobian(&z);
        let g = problem.constraints(&z);

        for j in 0..z.len() {
            let mut plus = z.clone();
            let mut minus = z.clone();
            plus[j] += h;
            minus[j] -= h;

            let fd_cost = (problem.cost(&plus) - problem.cost(&minus)) / (2.0 * h);
            assert!(
                (grad[j] - fd_cost).abs() < 1e-3 * (1.0 + fd_cost.abs()),
                "gradient {}: {} vs {}",
                j,
                grad[j],
                fd_cost
            );

            let fd_grad = (problem.cost_gradient(&plus) - problem.cost_gradient(&minus)) / (2.0 * h);
            for i in 0..z.len() {
                assert!((hess[(i, j)] - fd_grad[i]).abs() < 1e-3 * (1.0 + fd_grad[i].abs()));
            }

            let fd_g = (problem.constraints(&plus) - problem.constraints(&minus)) / (2.0 * h);
            for i in 0..g.len() {
                assert!(
                    (jac[(i, j)] - fd_g[i]).abs() < 1e-5,
                    "Jacobian ({}, {}): {} vs {}",
                    i,
                    j,
                    jac[(i, j)],
                    fd_g[i]
                );
            }
        }
    }

    #[test]
    fn test_bounds() {
        let params = test_params();
        let poly = curved_poly();
        let problem = MpcProblem::new(&params, &poly, test_seed(&poly)).unwrap();
        let bounds = problem.bounds();

        let num_bounded = bounds.lower.iter().filter(|v| v.is_finite()).count();
        assert_eq!(num_bounded, NUM_ACTUATORS * (params.horizon_num_steps - 1));
    }

    #[test]
    fn test_optimise_straight() {
        let params = test_params();
        let poly = Polynomial::new(vec![0.0; 4]);
        let seed = predictor::seed_state(10.0, &poly);
        let solver = SqpSolver::new(params.solver_settings());

        let sol = optimise(&params, &seed, &poly, &solver).unwrap();

        assert_eq!(sol.states.len(), params.horizon_num_steps);
        assert_eq!(sol.actuators.len(), params.horizon_num_steps - 1);

        // The first predicted state is the seed
        let first = sol.states[0];
        assert!((first.x_m - seed.x_m).abs() < 1e-3);
        assert!((first.y_m - seed.y_m).abs() < 1e-3);
        assert!((first.speed - seed.speed).abs() < 1e-3);

        let cmd = sol.first_actuators();
        assert!(cmd.steer_rad.abs() < 1e-3);
        assert!(cmd.accel > 0.0);

        for a in sol.actuators.iter() {
            assert!(a.steer_rad.abs() <= params.max_steer_rad + 1e-6);
            assert!(a.accel.abs() <= params.max_accel + 1e-6);
        }
    }

    #[test]
    fn test_truncated_subproblems() {
        // The zero actuation guess is feasible, so a step from a barely started QP is small
        let mut params = test_params();
        params.solver_qp_max_iters = 1;
        let poly = Polynomial::new(vec![0.0; 4]);
        let seed = predictor::seed_state(10.0, &poly);
        let solver = SqpSolver::new(params.solver_settings());

        assert!(optimise(&params, &seed, &poly, &solver).is_err());
    }

    #[test]
    fn test_short_horizon() {
        let mut params = test_params();
        params.horizon_num_steps = 1;
        let poly = Polynomial::new(vec![0.0; 4]);
        let seed = predictor::seed_state(10.0, &poly);
        let solver = SqpSolver::new(params.solver_settings());

        assert!(matches!(
            optimise(&params, &seed, &poly, &solver),
            Err(SolverError::InvalidHorizon(1))
        ));
    }
}
