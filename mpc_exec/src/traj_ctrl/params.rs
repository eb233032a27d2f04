//! Trajectory control parameters

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use serde::{Deserialize, Serialize};
use std::time::Duration;

// Internal
use super::model::{NUM_ACTUATORS, NUM_STATES};
use crate::nlp::SqpSettings;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Parameters for trajectory control
///
/// Units of speed and acceleration are those of the simulator.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Params {
    /// Number of predicted states in the horizon. There are one fewer
    /// actuator steps than states.
    pub horizon_num_steps: usize,

    /// Duration of one horizon step
    pub step_duration_s: f64,

    /// Time between the telemetry being measured and the command being
    /// actuated.
    pub latency_s: f64,

    /// Distance between the front axle and the centre of gravity
    pub wheelbase_m: f64,

    /// Speed the controller attempts to hold
    pub ref_speed: f64,

    /// Cost weight on the squared cross track error
    pub weight_cte: f64,

    /// Cost weight on the squared heading error
    pub weight_epsi: f64,

    /// Cost weight on the squared speed error
    pub weight_speed: f64,

    /// Cost weight on the squared steering demand
    pub weight_steer: f64,

    /// Cost weight on the squared acceleration demand
    pub weight_accel: f64,

    /// Cost weight on the squared change in steering between steps
    pub weight_steer_rate: f64,

    /// Cost weight on the squared change in acceleration between steps
    pub weight_accel_rate: f64,

    /// Symmetric steering limit
    pub max_steer_rad: f64,

    /// Symmetric acceleration (throttle) limit
    pub max_accel: f64,

    /// Maximum number of SQP iterations per solve
    pub solver_max_iters: usize,

    /// Wall clock budget of one solve
    pub solver_time_budget_s: f64,

    /// Maximum number of ADMM iterations in each QP subproblem
    pub solver_qp_max_iters: u32,

    /// Largest constraint residual accepted at convergence
    pub solver_constraint_tol: f64,

    /// Largest step, relative to the iterate, accepted at convergence
    pub solver_step_tol: f64,

    /// Sign applied to the steering angle when converting between the
    /// controller (positive left) and the simulator.
    pub steer_sign: f64,

    /// If true the steering sent to the simulator is normalised by
    /// `max_steer_rad` into [-1, 1], otherwise it is in radians.
    pub normalise_steering: bool,

    /// Which points are sent back as the reference line
    pub ref_display: RefDisplay,

    /// Spacing of the reference line samples in `RefDisplay::Polynomial` mode
    pub ref_display_spacing_m: f64,

    /// Number of reference line samples in `RefDisplay::Polynomial` mode
    pub ref_display_num_points: usize,
}

/// Source of the reference line displayed by the simulator
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum RefDisplay {
    /// The waypoints transformed into the vehicle frame
    Waypoints,

    /// Samples of the fitted polynomial
    Polynomial,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Default for Params {
    fn default() -> Self {
        Self {
            horizon_num_steps: 10,
            step_duration_s: 0.1,
            latency_s: 0.1,
            wheelbase_m: 2.67,
            ref_speed: 40.0,
            weight_cte: 2000.0,
            weight_epsi: 2000.0,
            weight_speed: 1.0,
            weight_steer: 5.0,
            weight_accel: 5.0,
            weight_steer_rate: 200.0,
            weight_accel_rate: 10.0,
            max_steer_rad: 0.436332,
            max_accel: 1.0,
            solver_max_iters: 25,
            solver_time_budget_s: 0.05,
            solver_qp_max_iters: 4000,
            solver_constraint_tol: 1e-3,
            solver_step_tol: 1e-4,
            steer_sign: -1.0,
            normalise_steering: true,
            ref_display: RefDisplay::Waypoints,
            ref_display_spacing_m: 5.0,
            ref_display_num_points: 15,
        }
    }
}

impl Params {
    /// Total number of decision variables in the horizon.
    pub fn num_vars(&self) -> usize {
        NUM_STATES * self.horizon_num_steps
            + NUM_ACTUATORS * self.horizon_num_steps.saturating_sub(1)
    }

    /// Settings of the SQP solver used for the horizon.
    pub fn solver_settings(&self) -> SqpSettings {
        SqpSettings {
            max_iters: self.solver_max_iters,
            time_budget: Duration::from_secs_f64(self.solver_time_budget_s.max(0.0).min(3600.0)),
            qp_max_iters: self.solver_qp_max_iters,
            constraint_tol: self.solver_constraint_tol,
            step_tol: self.solver_step_tol,
            ..Default::default()
        }
    }

    /// Check the parameters are usable, returning a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        let checks = [
            (self.horizon_num_steps >= 2, "horizon_num_steps must be at least 2"),
            (self.step_duration_s > 0.0, "step_duration_s must be positive"),
            (self.latency_s >= 0.0, "latency_s must not be negative"),
            (self.wheelbase_m > 0.0, "wheelbase_m must be positive"),
            (self.max_steer_rad > 0.0, "max_steer_rad must be positive"),
            (
                self.max_accel > 0.0 && self.max_accel <= 1.0,
                "max_accel must be in (0, 1]",
            ),
            (self.steer_sign.abs() == 1.0, "steer_sign must be 1 or -1"),
            (
                self.solver_time_budget_s > 0.0 && self.solver_time_budget_s.is_finite(),
                "solver_time_budget_s must be positive",
            ),
            (
                self.ref_display_spacing_m > 0.0,
                "ref_display_spacing_m must be positive",
            ),
        ];

        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, msg)) => Err(msg.to_string()),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_shipped_params() {
        let params: Params =
            util::params::from_str(include_str!("../../../params/traj_ctrl.toml")).unwrap();

        assert!(params.validate().is_ok());
        assert_eq!(params.horizon_num_steps, 10);
        assert_eq!(params.ref_display, RefDisplay::Waypoints);
        assert_eq!(params.num_vars(), 6 * 10 + 2 * 9);
    }

    #[test]
    fn test_missing_fields_default() {
        let params: Params = util::params::from_str("horizon_num_steps = 5").unwrap();

        assert_eq!(params.horizon_num_steps, 5);
        assert_eq!(params.wheelbase_m, Params::default().wheelbase_m);
    }

    #[test]
    fn test_validate() {
        assert!(Params::default().validate().is_ok());

        let mut params = Params::default();
        params.horizon_num_steps = 1;
        assert!(params.validate().is_err());

        let mut params = Params::default();
        params.steer_sign = 0.5;
        assert!(params.validate().is_err());

        let mut params = Params::default();
        params.max_accel = 2.0;
        assert!(params.validate().is_err());
    }
}
