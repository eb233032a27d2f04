//! Trajectory control module state

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::{debug, warn};
use serde::Serialize;

// Internal
use super::*;
use crate::nlp::{NlpSolver, SqpSolver};
use util::{archive::Archiver, module::State, params, session::Session};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Controller context of one vehicle connection.
pub struct TrajCtrl {
    params: Params,

    solver: Box<dyn NlpSolver>,

    /// The last command emitted, in the model's convention
    prev_cmd: Option<Actuators>,

    /// The last polynomial successfully fitted
    prev_poly: Option<Polynomial>,

    report: StatusReport,
    arch_report: Archiver,
}

/// Input data to trajectory control, one telemetry message.
#[derive(Debug, Clone, Default)]
pub struct InputData {
    /// Reference waypoints in the world frame
    pub ptsx: Vec<f64>,
    pub ptsy: Vec<f64>,

    pub pose: Pose,

    pub speed: f64,

    /// Steering currently applied, in radians using the simulator's sign
    pub steering_angle_rad: f64,

    /// Throttle currently applied
    pub throttle: f64,
}

/// The outcome of one cycle, before it is committed.
#[derive(Debug, Clone)]
pub struct Cycle {
    pub output: OutputData,
    pub report: StatusReport,

    /// The polynomial fitted this cycle, if the fit succeeded
    pub poly: Option<Polynomial>,
}

/// The status report containing various error flags and monitoring quantities.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct StatusReport {
    pub outcome: CycleOutcome,

    /// Cross track error of the latency compensated state
    pub cte_m: f64,

    /// Heading error of the latency compensated state
    pub epsi_rad: f64,

    /// Emitted steering, model convention
    pub steer_rad: f64,

    /// Emitted acceleration
    pub accel: f64,

    pub solver_iterations: usize,

    pub solve_time_s: f64,

    /// True if the command is a fallback rather than a fresh optimisation
    pub degraded: bool,

    /// Number of bound violations corrected before emission
    pub num_clamped: usize,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// How the emitted command was produced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum CycleOutcome {
    /// Freshly optimised
    Nominal,

    /// Optimised against the previous cycle's polynomial after the fit failed
    FitReused,

    /// The input was rejected, the neutral command was emitted
    InputRejected,

    /// The optimisation failed, the previous command was held
    SolverFallback,
}

impl Default for CycleOutcome {
    fn default() -> Self {
        CycleOutcome::Nominal
    }
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl State for TrajCtrl {
    type InitData = String;
    type InitError = TrajCtrlError;

    type InputData = InputData;
    type OutputData = OutputData;
    type StatusReport = StatusReport;
    type ProcError = TrajCtrlError;

    /// Initialise the TrajCtrl module.
    ///
    /// Expected init data is the path to the parameter file.
    fn init(&mut self, init_data: Self::InitData, session: &Session) -> Result<(), Self::InitError> {
        let params: Params = params::load(&init_data).map_err(TrajCtrlError::ParamLoadError)?;
        params.validate().map_err(TrajCtrlError::InvalidParams)?;

        self.solver = Box::new(SqpSolver::new(params.solver_settings()));
        self.params = params;
        self.prev_cmd = None;
        self.prev_poly = None;

        self.arch_report = Archiver::from_path(session, "traj_ctrl/status_report.csv")
            .map_err(TrajCtrlError::ArchiveError)?;

        Ok(())
    }

    /// Process one telemetry message, committing the result.
    ///
    /// Bad cycles are recovered from within the cycle, so this only fails if the archive can't
    /// be written.
    fn proc(
        &mut self,
        input_data: &Self::InputData,
    ) -> Result<(Self::OutputData, Self::StatusReport), Self::ProcError> {
        let cycle = self.compute(input_data);
        self.commit(&cycle)?;

        Ok((cycle.output, cycle.report))
    }
}

impl TrajCtrl {
    /// Create a controller using the SQP solver.
    pub fn new(params: Params) -> Result<Self, TrajCtrlError> {
        let solver = Box::new(SqpSolver::new(params.solver_settings()));
        Self::with_solver(params, solver)
    }

    /// Create a controller using the given solver.
    pub fn with_solver(params: Params, solver: Box<dyn NlpSolver>) -> Result<Self, TrajCtrlError> {
        params.validate().map_err(TrajCtrlError::InvalidParams)?;

        Ok(Self {
            params,
            solver,
            prev_cmd: None,
            prev_poly: None,
            report: StatusReport::default(),
            arch_report: Archiver::default(),
        })
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// The last committed command in the model's convention.
    pub fn prev_cmd(&self) -> Option<Actuators> {
        self.prev_cmd
    }

    /// The report of the last committed cycle.
    pub fn report(&self) -> StatusReport {
        self.report
    }

    /// Compute the outcome of a cycle without changing the controller.
    ///
    /// Errors are recovered from here:
    /// - Rejected input gives the neutral command.
    /// - A failed fit reuses the previous polynomial, or rejects the input if there isn't one.
    /// - A failed optimisation holds the previous command, or gives the neutral command if there
    ///   isn't one.
    pub fn compute(&self, input: &InputData) -> Cycle {
        // Before any command has been emitted the simulator's current actuation is the best
        // estimate of what is held over the latency.
        let held = self.prev_cmd.unwrap_or_else(|| self.telemetry_actuators(input));

        let local = match to_local((&input.ptsx, &input.ptsy), &input.pose, input.speed) {
            Ok(l) => l,
            Err(e) => return self.input_rejected(e.into()),
        };

        let (poly, outcome) = match path_fit::fit(&local.0, &local.1, FIT_ORDER) {
            Ok(p) => (p, CycleOutcome::Nominal),
            Err(TrajCtrlError::Fit(e)) => match &self.prev_poly {
                Some(p) => {
                    warn!("Fit failed ({}), reusing the previous polynomial", e);
                    (p.clone(), CycleOutcome::FitReused)
                }
                None => return self.input_rejected(InputError::Unfittable(e).into()),
            },
            Err(e) => return self.input_rejected(e),
        };

        let fitted = match outcome {
            CycleOutcome::Nominal => Some(poly.clone()),
            _ => None,
        };

        match compute_with_poly(
            &self.params,
            self.solver.as_ref(),
            (&local.0, &local.1),
            poly,
            input.speed,
            &held,
        ) {
            Ok(c) => Cycle {
                report: StatusReport {
                    outcome,
                    cte_m: c.seed.cte_m,
                    epsi_rad: c.seed.epsi_rad,
                    steer_rad: c.output.applied.steer_rad,
                    accel: c.output.applied.accel,
                    solver_iterations: c.solution.iterations,
                    solve_time_s: c.solution.solve_time_s,
                    degraded: outcome != CycleOutcome::Nominal,
                    num_clamped: c.num_clamped,
                },
                output: c.output,
                poly: fitted,
            },
            Err(e) => {
                warn!("{}, holding the previous command", e);
                let hold = self.prev_cmd.unwrap_or_else(Actuators::neutral);
                let reference = (local.0, local.1);
                let (output, num_clamped) = emit(&self.params, &hold, reference, &[]);

                Cycle {
                    report: StatusReport {
                        outcome: CycleOutcome::SolverFallback,
                        steer_rad: output.applied.steer_rad,
                        accel: output.applied.accel,
                        degraded: true,
                        num_clamped,
                        ..Default::default()
                    },
                    output,
                    poly: fitted,
                }
            }
        }
    }

    /// Accept a computed cycle as the one that was emitted.
    pub fn commit(&mut self, cycle: &Cycle) -> Result<(), TrajCtrlError> {
        self.prev_cmd = Some(cycle.output.applied);
        if let Some(ref p) = cycle.poly {
            self.prev_poly = Some(p.clone());
        }
        self.report = cycle.report;

        if cycle.report.num_clamped > 0 {
            warn!(
                "{} bound violation(s) corrected this cycle",
                cycle.report.num_clamped
            );
        }

        debug!(
            "TrajCtrl: {:?}, steer {:.4} rad, accel {:.3}, cte {:.3} m, epsi {:.4} rad",
            cycle.report.outcome,
            cycle.report.steer_rad,
            cycle.report.accel,
            cycle.report.cte_m,
            cycle.report.epsi_rad
        );

        self.arch_report
            .serialise(&cycle.report)
            .map_err(TrajCtrlError::ArchiveError)
    }

    fn telemetry_actuators(&self, input: &InputData) -> Actuators {
        let wire = WireConvention::from_params(&self.params);
        let act = Actuators {
            steer_rad: wire.steer_from_telemetry(input.steering_angle_rad),
            accel: input.throttle,
        };

        match act.is_finite() {
            true => act,
            false => Actuators::neutral(),
        }
    }

    fn input_rejected(&self, e: TrajCtrlError) -> Cycle {
        warn!("Input rejected: {}", e);

        let (output, num_clamped) =
            emit(&self.params, &Actuators::neutral(), (vec![], vec![]), &[]);

        Cycle {
            report: StatusReport {
                outcome: CycleOutcome::InputRejected,
                degraded: true,
                num_clamped,
                ..Default::default()
            },
            output,
            poly: None,
        }
    }
}

impl Default for TrajCtrl {
    fn default() -> Self {
        let params = Params::default();

        Self {
            solver: Box::new(SqpSolver::new(params.solver_settings())),
            params,
            prev_cmd: None,
            prev_poly: None,
            report: StatusReport::default(),
            arch_report: Archiver::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::nlp::{Convergence, NlpError, NlpProblem, NlpSolution, VarBounds};
    use std::f64::consts::FRAC_PI_2;

    /// Solver which always fails
    struct FailingSolver;

    impl NlpSolver for FailingSolver {
        fn solve(
            &self,
            _problem: &dyn NlpProblem,
            _bounds: &VarBounds,
            _initial_guess: &[f64],
        ) -> Result<NlpSolution, NlpError> {
            Err(NlpError::QpFailed("injected failure"))
        }
    }

    /// Solver which claims convergence to a non-finite point
    struct NanSolver;

    impl NlpSolver for NanSolver {
        fn solve(
            &self,
            problem: &dyn NlpProblem,
            _bounds: &VarBounds,
            _initial_guess: &[f64],
        ) -> Result<NlpSolution, NlpError> {
            Ok(NlpSolution {
                x: vec![f64::NAN; problem.num_vars()],
                status: Convergence::Converged,
                iterations: 1,
                cost: f64::NAN,
                constraint_violation: 0.0,
            })
        }
    }

    fn test_params() -> Params {
        let mut params = Params::default();
        params.solver_time_budget_s = 2.0;
        params
    }

    fn input_from_fn<F: Fn(f64) -> f64>(f: F, speed: f64) -> InputData {
        let ptsx: Vec<f64> = (0..6).map(|i| i as f64 * 10.0).collect();
        let ptsy = ptsx.iter().map(|&x| f(x)).collect();

        InputData {
            ptsx,
            ptsy,
            pose: Pose::default(),
            speed,
            steering_angle_rad: 0.0,
            throttle: 0.0,
        }
    }

    fn assert_within_bounds(output: &OutputData, params: &Params) {
        assert!(output.steering.is_finite() && output.throttle.is_finite());
        assert!(output.steering.abs() <= 1.0 + 1e-9);
        assert!(output.throttle.abs() <= params.max_accel + 1e-9);
        assert!(output.applied.steer_rad.abs() <= params.max_steer_rad + 1e-9);
    }

    #[test]
    fn test_straight_track() {
        let params = test_params();
        let mut ctrl = TrajCtrl::new(params.clone()).unwrap();

        let (output, report) = ctrl.proc(&input_from_fn(|_| 0.0, 10.0)).unwrap();

        assert_eq!(report.outcome, CycleOutcome::Nominal);
        assert!(!report.degraded);
        assert!(output.steering.abs() < 1e-2);
        assert!(output.throttle > 0.0);
        assert_within_bounds(&output, &params);

        // The vehicle is on the line
        assert!(report.cte_m.abs() < 1e-6);

        // Predicted trajectory runs ahead along the line
        assert_eq!(output.mpc_x.len(), params.horizon_num_steps);
        assert!(output.mpc_x.windows(2).all(|w| w[1] > w[0]));
        assert!(output.mpc_y.iter().all(|y| y.abs() < 1e-2));
    }

    #[test]
    fn test_curve() {
        let params = test_params();
        let mut ctrl = TrajCtrl::new(params.clone()).unwrap();

        // A left hand curve ahead of a vehicle at (100, 50) facing along world +Y
        let local_x: Vec<f64> = (0..6).map(|i| i as f64 * 10.0).collect();
        let input = InputData {
            ptsx: local_x.iter().map(|&x| 100.0 - 0.02 * x * x).collect(),
            ptsy: local_x.iter().map(|&x| 50.0 + x).collect(),
            pose: Pose {
                x_m: 100.0,
                y_m: 50.0,
                psi_rad: FRAC_PI_2,
            },
            speed: 15.0,
            steering_angle_rad: 0.0,
            throttle: 0.0,
        };

        let (output, report) = ctrl.proc(&input).unwrap();

        assert_eq!(report.outcome, CycleOutcome::Nominal);
        assert!(output.applied.steer_rad > 0.0);
        assert!(output.steering < 0.0);
        assert_within_bounds(&output, &params);

        // The reference line is displayed in the vehicle frame
        for (x, y) in output.ref_x.iter().zip(output.ref_y.iter()) {
            assert!((y - 0.02 * x * x).abs() < 1e-9);
        }

        assert_eq!(ctrl.prev_cmd(), Some(output.applied));
    }

    #[test]
    fn test_right_curve() {
        let params = test_params();
        let mut ctrl = TrajCtrl::new(params.clone()).unwrap();

        // The mirror image of the left hand curve, bending right from the same pose
        let local_x: Vec<f64> = (0..6).map(|i| i as f64 * 10.0).collect();
        let input = InputData {
            ptsx: local_x.iter().map(|&x| 100.0 + 0.02 * x * x).collect(),
            ptsy: local_x.iter().map(|&x| 50.0 + x).collect(),
            pose: Pose {
                x_m: 100.0,
                y_m: 50.0,
                psi_rad: FRAC_PI_2,
            },
            speed: 15.0,
            steering_angle_rad: 0.0,
            throttle: 0.0,
        };

        let (output, report) = ctrl.proc(&input).unwrap();

        assert_eq!(report.outcome, CycleOutcome::Nominal);
        assert!(output.applied.steer_rad < 0.0);

        // Right is positive to the simulator
        assert!(output.steering > 0.0);
        assert_within_bounds(&output, &params);

        for (x, y) in output.ref_x.iter().zip(output.ref_y.iter()) {
            assert!((y + 0.02 * x * x).abs() < 1e-9);
        }
    }

    #[test]
    fn test_degenerate_input() {
        let params = test_params();
        let mut ctrl = TrajCtrl::new(params.clone()).unwrap();

        let mut input = input_from_fn(|x| x, 10.0);
        input.ptsx = vec![5.0; input.ptsy.len()];

        let (output, report) = ctrl.proc(&input).unwrap();
        assert_eq!(report.outcome, CycleOutcome::InputRejected);
        assert!(report.degraded);
        assert_eq!(output.steering, 0.0);
        assert_eq!(output.throttle, 0.0);

        // Too few points
        let mut input = input_from_fn(|x| x, 10.0);
        input.ptsx.truncate(3);
        input.ptsy.truncate(3);
        let (output, report) = ctrl.proc(&input).unwrap();
        assert_eq!(report.outcome, CycleOutcome::InputRejected);
        assert_eq!(output.applied, Actuators::neutral());

        // Non-finite measurements
        let mut input = input_from_fn(|x| x, f64::NAN);
        let (_, report) = ctrl.proc(&input).unwrap();
        assert_eq!(report.outcome, CycleOutcome::InputRejected);
        input.speed = 10.0;
        input.pose.psi_rad = f64::INFINITY;
        let (_, report) = ctrl.proc(&input).unwrap();
        assert_eq!(report.outcome, CycleOutcome::InputRejected);
    }

    #[test]
    fn test_solver_failure() {
        let params = test_params();
        let mut ctrl = TrajCtrl::with_solver(params.clone(), Box::new(FailingSolver)).unwrap();

        // No previous command, so zero actuation
        let cycle = ctrl.compute(&input_from_fn(|_| 1.0, 10.0));
        assert_eq!(cycle.report.outcome, CycleOutcome::SolverFallback);
        assert!(cycle.report.degraded);
        assert_eq!(cycle.output.applied, Actuators::neutral());

        // Previous command held
        let prev = Actuators {
            steer_rad: 0.1,
            accel: 0.3,
        };
        ctrl.prev_cmd = Some(prev);
        let cycle = ctrl.compute(&input_from_fn(|_| 1.0, 10.0));
        assert_eq!(cycle.output.applied, prev);
        assert!(cycle.output.mpc_x.is_empty());
        assert_within_bounds(&cycle.output, &params);

        // Non-finite solutions never leave the controller
        let mut ctrl = TrajCtrl::with_solver(params.clone(), Box::new(NanSolver)).unwrap();
        let (output, report) = ctrl.proc(&input_from_fn(|_| 1.0, 10.0)).unwrap();
        assert_eq!(report.outcome, CycleOutcome::SolverFallback);
        assert_within_bounds(&output, &params);
        assert!(output.mpc_x.iter().chain(output.mpc_y.iter()).all(|v| v.is_finite()));
    }

    #[test]
    fn test_fit_failure() {
        let params = test_params();
        let mut ctrl = TrajCtrl::new(params).unwrap();

        let mut clustered = input_from_fn(|_| 0.0, 10.0);
        clustered.ptsx = vec![1.0, 1.0 + 1e-8, 1.0 + 2e-8, 1.0 + 3e-8];
        clustered.ptsy = vec![0.0, 1.0, 0.0, 1.0];

        // Nothing to reuse
        let (_, report) = ctrl.proc(&clustered).unwrap();
        assert_eq!(report.outcome, CycleOutcome::InputRejected);

        // Reuses the last good fit
        ctrl.proc(&input_from_fn(|_| 0.0, 10.0)).unwrap();
        let cycle = ctrl.compute(&clustered);
        assert_eq!(cycle.report.outcome, CycleOutcome::FitReused);
        assert!(cycle.report.degraded);
        assert!(cycle.poly.is_none());
        assert!(cycle.output.steering.abs() < 1e-2);
    }

    #[test]
    fn test_compute_is_pure() {
        let mut ctrl = TrajCtrl::new(test_params()).unwrap();
        let input = input_from_fn(|_| 0.0, 10.0);

        let first = ctrl.compute(&input);
        assert!(ctrl.prev_cmd().is_none());

        let second = ctrl.compute(&input);
        assert_eq!(first.output.applied, second.output.applied);

        ctrl.commit(&first).unwrap();
        assert_eq!(ctrl.prev_cmd(), Some(first.output.applied));
        assert_eq!(ctrl.report().outcome, CycleOutcome::Nominal);
    }

    #[test]
    fn test_compute_command() {
        let params = test_params();
        let solver = SqpSolver::new(params.solver_settings());
        let xs = [0.0, 10.0, 20.0, 30.0];
        let ys = [2.0, 2.0, 2.0, 2.0];

        let computed = compute_command(
            &params,
            &solver,
            (&xs, &ys),
            &Pose::default(),
            10.0,
            &Actuators::neutral(),
        )
        .unwrap();

        // Cross track error is the constant term of the fit
        assert!((computed.poly.coeffs()[0] - 2.0).abs() < 1e-9);
        assert!((computed.poly.eval(0.0) - 2.0).abs() < 1e-9);

        // The first predicted point is the latency compensated seed
        let first = computed.solution.states[0];
        assert!((first.x_m - computed.seed.x_m).abs() < 1e-3);
        assert!((first.y_m - computed.seed.y_m).abs() < 1e-3);

        // The reference is to the left, so steer left
        assert!(computed.output.applied.steer_rad > 0.0);
    }

    #[test]
    fn test_invalid_params() {
        let mut params = Params::default();
        params.horizon_num_steps = 1;
        assert!(matches!(
            TrajCtrl::new(params),
            Err(TrajCtrlError::InvalidParams(_))
        ));
    }
}
