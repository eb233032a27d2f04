//! # Vehicle model
//!
//! Discrete time kinematic bicycle model extended with the cross track and heading errors to a
//! reference polynomial. The model is used both to project the measured state over the actuation
//! latency and as the dynamics constraints of the horizon optimisation.
//!
//! Steering is in radians, positive turning left (counter-clockwise).

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use nalgebra::{Matrix6, Matrix6x2};
use serde::{Deserialize, Serialize};

// Internal
use super::Polynomial;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Number of elements in the vehicle state
pub const NUM_STATES: usize = 6;

/// Number of actuators
pub const NUM_ACTUATORS: usize = 2;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// State of the vehicle in the vehicle frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub x_m: f64,
    pub y_m: f64,
    pub psi_rad: f64,
    pub speed: f64,

    /// Cross track error, the reference's y value minus the vehicle's y.
    pub cte_m: f64,

    /// Heading error, the vehicle's heading minus the reference heading.
    pub epsi_rad: f64,
}

/// Actuator demands in the model convention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Actuators {
    /// Steering angle, positive left
    pub steer_rad: f64,

    /// Acceleration demand, equal to the throttle demand
    pub accel: f64,
}

/// Kinematic bicycle model.
#[derive(Debug, Clone, Copy)]
pub struct KinematicBicycle {
    /// Distance between the front axle and the centre of gravity
    pub wheelbase_m: f64,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl VehicleState {
    /// Build a state from `[x, y, psi, v, cte, epsi]`.
    pub fn from_array(s: [f64; NUM_STATES]) -> Self {
        Self {
            x_m: s[0],
            y_m: s[1],
            psi_rad: s[2],
            speed: s[3],
            cte_m: s[4],
            epsi_rad: s[5],
        }
    }

    /// The state as `[x, y, psi, v, cte, epsi]`.
    pub fn to_array(&self) -> [f64; NUM_STATES] {
        [
            self.x_m,
            self.y_m,
            self.psi_rad,
            self.speed,
            self.cte_m,
            self.epsi_rad,
        ]
    }

    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }
}

impl Actuators {
    /// The neutral command, no steering and no acceleration.
    pub fn neutral() -> Self {
        Self::default()
    }

    pub fn is_finite(&self) -> bool {
        self.steer_rad.is_finite() && self.accel.is_finite()
    }
}

impl KinematicBicycle {
    pub fn new(wheelbase_m: f64) -> Self {
        Self { wheelbase_m }
    }

    /// Advance the state by `dt_s` holding the actuators constant.
    pub fn step(
        &self,
        state: &VehicleState,
        act: &Actuators,
        poly: &Polynomial,
        dt_s: f64,
    ) -> VehicleState {
        let (sin_psi, cos_psi) = state.psi_rad.sin_cos();
        let yaw_rate = state.speed / self.wheelbase_m * act.steer_rad;

        VehicleState {
            x_m: state.x_m + state.speed * cos_psi * dt_s,
            y_m: state.y_m + state.speed * sin_psi * dt_s,
            psi_rad: state.psi_rad + yaw_rate * dt_s,
            speed: state.speed + act.accel * dt_s,
            cte_m: (poly.eval(state.x_m) - state.y_m) + state.speed * state.epsi_rad.sin() * dt_s,
            epsi_rad: (state.psi_rad - poly.desired_heading(state.x_m)) + yaw_rate * dt_s,
        }
    }

    /// Jacobians of [`step`](Self::step) with respect to the state (A) and the actuators (B).
    pub fn linearise(
        &self,
        state: &VehicleState,
        act: &Actuators,
        poly: &Polynomial,
        dt_s: f64,
    ) -> (Matrix6<f64>, Matrix6x2<f64>) {
        let (sin_psi, cos_psi) = state.psi_rad.sin_cos();
        let (sin_epsi, cos_epsi) = state.epsi_rad.sin_cos();
        let v = state.speed;
        let inv_lf = 1.0 / self.wheelbase_m;

        // d/dx atan(f'(x)) = f''(x) / (1 + f'(x)^2)
        let slope = poly.deriv(state.x_m);
        let d_head_x = poly.deriv2(state.x_m) / (1.0 + slope * slope);

        #[rustfmt::skip]
        let a = Matrix6::new(
            1.0,       0.0,  -v * sin_psi * dt_s, cos_psi * dt_s,                   0.0, 0.0,
            0.0,       1.0,  v * cos_psi * dt_s,  sin_psi * dt_s,                   0.0, 0.0,
            0.0,       0.0,  1.0,                 act.steer_rad * inv_lf * dt_s,    0.0, 0.0,
            0.0,       0.0,  0.0,                 1.0,                              0.0, 0.0,
            slope,     -1.0, 0.0,                 sin_epsi * dt_s,                  0.0, v * cos_epsi * dt_s,
            -d_head_x, 0.0,  1.0,                 act.steer_rad * inv_lf * dt_s,    0.0, 0.0,
        );

        #[rustfmt::skip]
        let b = Matrix6x2::new(
            0.0,                 0.0,
            0.0,                 0.0,
            v * inv_lf * dt_s,   0.0,
            0.0,                 dt_s,
            0.0,                 0.0,
            v * inv_lf * dt_s,   0.0,
        );

        (a, b)
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    fn curved_poly() -> Polynomial {
        Polynomial::new(vec![0.3, -0.1, 0.02, 0.001])
    }

    /// Check the analytic Jacobians against central differences
    #[test]
    fn test_linearise() {
        let model = KinematicBicycle::new(2.67);
        let poly = curved_poly();
        let state = VehicleState {
            x_m: 1.5,
            y_m: -0.4,
            psi_rad: 0.2,
            speed: 12.0,
            cte_m: 0.3,
            epsi_rad: -0.1,
        };
        let act = Actuators {
            steer_rad: 0.1,
            accel: 0.4,
        };
        let dt = 0.1;
        let h = 1e-6;

        let (a, b) = model.linearise(&state, &act, &poly, dt);

        for j in 0..NUM_STATES {
            let mut plus = state.to_array();
            let mut minus = state.to_array();
            plus[j] += h;
            minus[j] -= h;
            let fp = model.step(&VehicleState::from_array(plus), &act, &poly, dt).to_array();
            let fm = model.step(&VehicleState::from_array(minus), &act, &poly, dt).to_array();

            for i in 0..NUM_STATES {
                let fd = (fp[i] - fm[i]) / (2.0 * h);
                assert!(
                    (a[(i, j)] - fd).abs() < 1e-6,
                    "A[{}, {}] = {}, finite difference {}",
                    i, j, a[(i, j)], fd
                );
            }
        }

        for j in 0..NUM_ACTUATORS {
            let mut plus = act;
            let mut minus = act;
            match j {
                0 => {
                    plus.steer_rad += h;
                    minus.steer_rad -= h;
                }
                _ => {
                    plus.accel += h;
                    minus.accel -= h;
                }
            }
            let fp = model.step(&state, &plus, &poly, dt).to_array();
            let fm = model.step(&state, &minus, &poly, dt).to_array();

            for i in 0..NUM_STATES {
                let fd = (fp[i] - fm[i]) / (2.0 * h);
                assert!((b[(i, j)] - fd).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_step_straight() {
        let model = KinematicBicycle::new(2.67);
        let poly = Polynomial::new(vec![0.0, 0.0, 0.0, 0.0]);
        let state = VehicleState {
            speed: 10.0,
            ..Default::default()
        };

        let next = model.step(&state, &Actuators::neutral(), &poly, 0.1);

        assert!((next.x_m - 1.0).abs() < 1e-12);
        assert_eq!(next.y_m, 0.0);
        assert_eq!(next.psi_rad, 0.0);
        assert_eq!(next.speed, 10.0);
        assert_eq!(next.cte_m, 0.0);
        assert_eq!(next.epsi_rad, 0.0);

        // Positive steering turns left
        let left = model.step(
            &state,
            &Actuators {
                steer_rad: 0.1,
                accel: 0.0,
            },
            &poly,
            0.1,
        );
        assert!(left.psi_rad > 0.0);
    }
}
