//! # Simulator Interface
//!
//! Messages exchanged with the vehicle simulator. The simulator emits a
//! [`Telemetry`] message every control period and expects a [`SteerCmd`] in
//! return. Field names match the simulator's JSON keys exactly.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

mod frame;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

pub use frame::*;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Telemetry emitted by the simulator.
///
/// All positions are in the simulator's world frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Telemetry {
    /// X coordinates of the reference waypoints
    pub ptsx: Vec<f64>,

    /// Y coordinates of the reference waypoints
    pub ptsy: Vec<f64>,

    /// Vehicle X position
    pub x: f64,

    /// Vehicle Y position
    pub y: f64,

    /// Vehicle heading in radians, counter-clockwise from the world X axis
    pub psi: f64,

    /// Vehicle speed
    pub speed: f64,

    /// Steering angle currently applied by the simulator, in radians using the simulator's sign
    /// convention
    pub steering_angle: f64,

    /// Throttle currently applied by the simulator, in [-1, 1]
    pub throttle: f64,
}

/// Command sent back to the simulator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct SteerCmd {
    /// Steering demand in the simulator's convention
    pub steering_angle: f64,

    /// Throttle demand in [-1, 1], positive accelerates and negative brakes
    pub throttle: f64,

    /// Reference line X coordinates in the vehicle frame, for display
    pub next_x: Vec<f64>,

    /// Reference line Y coordinates in the vehicle frame, for display
    pub next_y: Vec<f64>,

    /// Predicted trajectory X coordinates in the vehicle frame, for display
    pub mpc_x: Vec<f64>,

    /// Predicted trajectory Y coordinates in the vehicle frame, for display
    pub mpc_y: Vec<f64>,
}
