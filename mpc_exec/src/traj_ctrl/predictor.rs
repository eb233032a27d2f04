//! # Latency compensation
//!
//! A command computed from a measurement is only actuated `latency_s` later. The measured state is
//! therefore projected forward over the latency, assuming the previously applied command is held,
//! and the horizon is optimised from the projected state.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use super::{Actuators, KinematicBicycle, Polynomial, VehicleState};

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// State of the vehicle at measurement time, in the vehicle frame.
///
/// The vehicle is at the origin facing along the X axis, so the cross track error is the
/// polynomial's constant term and the heading error is minus the reference heading at the origin.
pub fn seed_state(speed: f64, poly: &Polynomial) -> VehicleState {
    VehicleState {
        x_m: 0.0,
        y_m: 0.0,
        psi_rad: 0.0,
        speed,
        cte_m: poly.eval(0.0),
        epsi_rad: -poly.desired_heading(0.0),
    }
}

/// Project the measured state forward by the actuation latency.
pub fn predict(
    speed: f64,
    poly: &Polynomial,
    prev_cmd: &Actuators,
    model: &KinematicBicycle,
    latency_s: f64,
) -> VehicleState {
    let seed = seed_state(speed, poly);

    if latency_s > 0.0 {
        model.step(&seed, prev_cmd, poly, latency_s)
    } else {
        seed
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------
