//! # Command emission
//!
//! Bounds the actuator demands, converts them into the simulator's convention and packages them
//! with the reference line and predicted trajectory for display.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::warn;
use serde::Serialize;

// Internal
use super::*;
use util::maths::{clamp, lin_map};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Conversion of steering between the model and the simulator.
///
/// The model steers in radians with positive turning left. The simulator's sign is
/// `steer_sign` times the model's, and its steering demand is optionally normalised by the
/// steering limit.
#[derive(Debug, Clone, Copy)]
pub struct WireConvention {
    pub steer_sign: f64,
    pub normalise: bool,
    pub max_steer_rad: f64,
}

/// The command emitted by a control cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutputData {
    /// Steering demand in the simulator's convention
    pub steering: f64,

    /// Throttle demand in [-1, 1]
    pub throttle: f64,

    /// The emitted command in the model's convention
    pub applied: Actuators,

    /// Reference line in the vehicle frame
    pub ref_x: Vec<f64>,
    pub ref_y: Vec<f64>,

    /// Predicted trajectory in the vehicle frame
    pub mpc_x: Vec<f64>,
    pub mpc_y: Vec<f64>,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl WireConvention {
    pub fn from_params(params: &Params) -> Self {
        Self {
            steer_sign: params.steer_sign,
            normalise: params.normalise_steering,
            max_steer_rad: params.max_steer_rad,
        }
    }

    /// Convert a model steering angle into the simulator's steering demand.
    pub fn steer_to_wire(&self, steer_rad: f64) -> f64 {
        let steer = self.steer_sign * steer_rad;

        match self.normalise {
            true => lin_map(
                (-self.max_steer_rad, self.max_steer_rad),
                (-1.0, 1.0),
                steer,
            ),
            false => steer,
        }
    }

    /// Convert a steering angle reported in telemetry into the model's convention.
    ///
    /// Telemetry always reports radians.
    pub fn steer_from_telemetry(&self, steering_angle_rad: f64) -> f64 {
        self.steer_sign * steering_angle_rad
    }
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Clamp the actuators into their bounds.
///
/// Non-finite demands are replaced by the neutral demand. Returns the bounded actuators and the
/// number of demands which had to be changed.
pub fn clamp_actuators(act: &Actuators, params: &Params) -> (Actuators, usize) {
    let mut num_violations = 0;

    let mut bound = |name: &str, value: f64, limit: f64| -> f64 {
        if !value.is_finite() {
            warn!("Non-finite {} demand replaced by zero", name);
            num_violations += 1;
            0.0
        } else if value.abs() > limit {
            warn!("{} demand {:.6} exceeds limit {:.6}, clamped", name, value, limit);
            num_violations += 1;
            clamp(&value, &-limit, &limit)
        } else {
            value
        }
    };

    let bounded = Actuators {
        steer_rad: bound("Steering", act.steer_rad, params.max_steer_rad),
        accel: bound("Acceleration", act.accel, params.max_accel),
    };

    (bounded, num_violations)
}

/// Points of the reference line to display.
pub fn reference_points(
    params: &Params,
    local_xs: &[f64],
    local_ys: &[f64],
    poly: &Polynomial,
) -> (Vec<f64>, Vec<f64>) {
    match params.ref_display {
        RefDisplay::Waypoints => (local_xs.to_vec(), local_ys.to_vec()),
        RefDisplay::Polynomial => (1..params.ref_display_num_points)
            .map(|i| {
                let x = params.ref_display_spacing_m * i as f64;
                (x, poly.eval(x))
            })
            .unzip(),
    }
}

/// Bound and package a command.
///
/// Returns the output and the number of bound violations which were corrected.
pub fn emit(
    params: &Params,
    act: &Actuators,
    reference: (Vec<f64>, Vec<f64>),
    predicted: &[VehicleState],
) -> (OutputData, usize) {
    let (applied, num_violations) = clamp_actuators(act, params);
    let wire = WireConvention::from_params(params);

    let (mpc_x, mpc_y) = predicted
        .iter()
        .filter(|s| s.x_m.is_finite() && s.y_m.is_finite())
        .map(|s| (s.x_m, s.y_m))
        .unzip();

    let output = OutputData {
        steering: wire.steer_to_wire(applied.steer_rad),
        throttle: applied.accel,
        applied,
        ref_x: reference.0,
        ref_y: reference.1,
        mpc_x,
        mpc_y,
    };

    (output, num_violations)
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------
