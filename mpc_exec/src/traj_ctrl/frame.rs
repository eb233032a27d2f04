//! # Vehicle frame transformation
//!
//! The vehicle frame has its origin at the vehicle's position with the X axis pointing along the
//! vehicle's heading and the Y axis to its left.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use nalgebra::{Isometry2, Point2, Vector2};
use serde::{Deserialize, Serialize};

// Internal
use super::InputError;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Pose of the vehicle in the world frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x_m: f64,
    pub y_m: f64,

    /// Heading, counter-clockwise from the world X axis
    pub psi_rad: f64,
}

/// Transformation between the world frame and the vehicle frame.
#[derive(Debug, Clone, Copy)]
pub struct VehicleFrame {
    /// Pose of the vehicle frame in the world frame
    world_from_vehicle: Isometry2<f64>,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl VehicleFrame {
    /// Create the frame of a vehicle at the given pose.
    pub fn new(pose: &Pose) -> Result<Self, InputError> {
        if !(pose.x_m.is_finite() && pose.y_m.is_finite() && pose.psi_rad.is_finite()) {
            return Err(InputError::NonFinite("pose"));
        }

        Ok(Self {
            world_from_vehicle: Isometry2::new(Vector2::new(pose.x_m, pose.y_m), pose.psi_rad),
        })
    }

    /// Transform world frame points into the vehicle frame.
    ///
    /// The points are given as parallel coordinate slices, which must be of equal length.
    pub fn to_local(&self, xs: &[f64], ys: &[f64]) -> Result<(Vec<f64>, Vec<f64>), InputError> {
        self.map(xs, ys, |p| self.world_from_vehicle.inverse_transform_point(p))
    }

    /// Transform vehicle frame points into the world frame.
    pub fn to_world(&self, xs: &[f64], ys: &[f64]) -> Result<(Vec<f64>, Vec<f64>), InputError> {
        self.map(xs, ys, |p| self.world_from_vehicle.transform_point(p))
    }

    fn map<F>(&self, xs: &[f64], ys: &[f64], f: F) -> Result<(Vec<f64>, Vec<f64>), InputError>
    where
        F: Fn(&Point2<f64>) -> Point2<f64>,
    {
        if xs.len() != ys.len() {
            return Err(InputError::LengthMismatch(xs.len(), ys.len()));
        }

        Ok(xs
            .iter()
            .zip(ys)
            .map(|(&x, &y)| {
                let p = f(&Point2::new(x, y));
                (p.x, p.y)
            })
            .unzip())
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_to_local() {
        // Facing along world +Y, a point ahead of the vehicle is on the local X axis and a point
        // to the world -X is on the left.
        let frame = VehicleFrame::new(&Pose {
            x_m: 10.0,
            y_m: 5.0,
            psi_rad: FRAC_PI_2,
        })
        .unwrap();

        let (lx, ly) = frame.to_local(&[10.0, 8.0], &[7.0, 5.0]).unwrap();

        assert!((lx[0] - 2.0).abs() < 1e-12);
        assert!(ly[0].abs() < 1e-12);
        assert!(lx[1].abs() < 1e-12);
        assert!((ly[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_invertible() {
        let frame = VehicleFrame::new(&Pose {
            x_m: -40.62,
            y_m: 108.73,
            psi_rad: 3.733651,
        })
        .unwrap();
        let xs = [-32.16173, -43.49173, -61.09, -78.29172];
        let ys = [113.361, 105.941, 92.88499, 78.73102];

        let (lx, ly) = frame.to_local(&xs, &ys).unwrap();
        let (wx, wy) = frame.to_world(&lx, &ly).unwrap();

        for i in 0..xs.len() {
            assert!((wx[i] - xs[i]).abs() < 1e-9);
            assert!((wy[i] - ys[i]).abs() < 1e-9);
        }
    }

    #[test]
    fn test_invalid_input() {
        let frame = VehicleFrame::new(&Pose::default()).unwrap();
        assert!(matches!(
            frame.to_local(&[1.0, 2.0], &[1.0]),
            Err(InputError::LengthMismatch(2, 1))
        ));

        assert!(VehicleFrame::new(&Pose {
            x_m: f64::NAN,
            ..Default::default()
        })
        .is_err());
    }
}
