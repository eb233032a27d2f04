//! # Reference path fitting
//!
//! The reference waypoints, once in the vehicle frame, are approximated by a least squares
//! polynomial `y = f(x)`. The fit is computed from the Householder QR decomposition of the
//! Vandermonde matrix rather than the normal equations, which would square its condition number.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use nalgebra::{DMatrix, DVector};
use serde::Serialize;

// Internal
use super::{FitError, InputError, TrajCtrlError};
use util::maths::{poly_deriv, poly_val};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Order of the reference polynomial used by the controller
pub const FIT_ORDER: usize = 3;

/// Smallest accepted ratio between the smallest and largest diagonal elements of the triangular
/// factor.
const MIN_DIAG_RATIO: f64 = 1e-12;

/// Two abscissae closer than this are not considered distinct.
const DISTINCT_X_TOL_M: f64 = 1e-9;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A polynomial `y = c[0] + c[1] x + c[2] x^2 + ...`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Polynomial {
    coeffs: Vec<f64>,
    d1_coeffs: Vec<f64>,
    d2_coeffs: Vec<f64>,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Polynomial {
    /// Create a polynomial from coefficients in ascending power order.
    pub fn new(coeffs: Vec<f64>) -> Self {
        let d1_coeffs = poly_deriv(&coeffs);
        let d2_coeffs = poly_deriv(&d1_coeffs);

        Self {
            coeffs,
            d1_coeffs,
            d2_coeffs,
        }
    }

    /// Coefficients in ascending power order.
    pub fn coeffs(&self) -> &[f64] {
        &self.coeffs
    }

    pub fn eval(&self, x: f64) -> f64 {
        poly_val(x, &self.coeffs)
    }

    /// First derivative at `x`
    pub fn deriv(&self, x: f64) -> f64 {
        poly_val(x, &self.d1_coeffs)
    }

    /// Second derivative at `x`
    pub fn deriv2(&self, x: f64) -> f64 {
        poly_val(x, &self.d2_coeffs)
    }

    /// Heading of the tangent to the curve at `x`.
    pub fn desired_heading(&self, x: f64) -> f64 {
        self.deriv(x).atan()
    }
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Fit a polynomial of the given order to the points in the least squares sense.
///
/// Returns an `InputError` if there are not enough points or distinct abscissae to determine the
/// coefficients, and a `FitError` if the decomposition is numerically singular.
pub fn fit(xs: &[f64], ys: &[f64], order: usize) -> Result<Polynomial, TrajCtrlError> {
    let num_coeffs = order + 1;

    if xs.len() != ys.len() {
        return Err(InputError::LengthMismatch(xs.len(), ys.len()).into());
    }
    if xs.len() < num_coeffs {
        return Err(InputError::TooFewPoints(xs.len(), num_coeffs).into());
    }
    if !xs.iter().chain(ys).all(|v| v.is_finite()) {
        return Err(InputError::NonFinite("waypoints").into());
    }

    let distinct = num_distinct(xs);
    if distinct < num_coeffs {
        return Err(InputError::TooFewDistinctX(distinct, num_coeffs).into());
    }

    let vander = DMatrix::from_fn(xs.len(), num_coeffs, |i, j| xs[i].powi(j as i32));
    let b = DVector::from_column_slice(ys);

    let qr = vander.qr();
    let q = qr.q();
    let r = qr.r();

    let (diag_min, diag_max) = r
        .diagonal()
        .iter()
        .map(|d| d.abs())
        .fold((f64::INFINITY, 0.0f64), |(lo, hi), d| (lo.min(d), hi.max(d)));

    if !(diag_max > 0.0) || diag_min / diag_max < MIN_DIAG_RATIO {
        return Err(FitError::IllConditioned(diag_min / diag_max).into());
    }

    let coeffs = r
        .solve_upper_triangular(&(q.transpose() * b))
        .ok_or(FitError::Singular)?;

    if !coeffs.iter().all(|c| c.is_finite()) {
        return Err(FitError::NonFinite.into());
    }

    Ok(Polynomial::new(coeffs.iter().cloned().collect()))
}

/// Count the distinct values in the slice.
fn num_distinct(xs: &[f64]) -> usize {
    let mut sorted = xs.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mut count = 0;
    let mut last: Option<f64> = None;
    for x in sorted {
        match last {
            Some(l) if (x - l).abs() <= DISTINCT_X_TOL_M => (),
            _ => {
                count += 1;
                last = Some(x);
            }
        }
    }

    count
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fit_round_trip() {
        let truth = Polynomial::new(vec![1.5, -0.3, 0.02, -0.001]);
        let xs: Vec<f64> = (0..8).map(|i| i as f64 * 7.0 - 10.0).collect();
        let ys: Vec<f64> = xs.iter().map(|&x| truth.eval(x)).collect();

        let poly = fit(&xs, &ys, FIT_ORDER).unwrap();

        for x in xs.iter() {
            assert!((poly.eval(*x) - truth.eval(*x)).abs() < 1e-6);
        }
        for (c, t) in poly.coeffs().iter().zip(truth.coeffs()) {
            assert!((c - t).abs() < 1e-6);
        }
    }

    #[test]
    fn test_least_squares() {
        // Symmetric noise around a line leaves the line unchanged
        let xs = [0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0];
        let ys: Vec<f64> = xs
            .iter()
            .enumerate()
            .map(|(i, x)| 2.0 * x + if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect();

        let poly = fit(&xs, &ys, 1).unwrap();
        assert!((poly.coeffs()[0]).abs() < 1e-9);
        assert!((poly.coeffs()[1] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_derivatives() {
        let poly = Polynomial::new(vec![1.0, 2.0, 3.0, 4.0]);

        // f' = 2 + 6x + 12x^2, f'' = 6 + 24x
        assert_eq!(poly.deriv(2.0), 2.0 + 12.0 + 48.0);
        assert_eq!(poly.deriv2(2.0), 6.0 + 48.0);
        assert_eq!(poly.desired_heading(0.0), 2.0f64.atan());
    }

    #[test]
    fn test_input_errors() {
        let few = fit(&[0.0, 1.0, 2.0], &[0.0, 1.0, 2.0], FIT_ORDER);
        assert!(matches!(
            few,
            Err(TrajCtrlError::Input(InputError::TooFewPoints(3, 4)))
        ));

        let mismatch = fit(&[0.0, 1.0, 2.0, 3.0], &[0.0, 1.0, 2.0], FIT_ORDER);
        assert!(matches!(
            mismatch,
            Err(TrajCtrlError::Input(InputError::LengthMismatch(4, 3)))
        ));

        let repeated = fit(&[1.0, 1.0, 2.0, 2.0, 3.0], &[0.0, 1.0, 2.0, 3.0, 4.0], FIT_ORDER);
        assert!(matches!(
            repeated,
            Err(TrajCtrlError::Input(InputError::TooFewDistinctX(3, 4)))
        ));

        let nan = fit(&[0.0, 1.0, 2.0, f64::NAN], &[0.0; 4], FIT_ORDER);
        assert!(matches!(nan, Err(TrajCtrlError::Input(InputError::NonFinite(_)))));
    }

    #[test]
    fn test_ill_conditioned() {
        // Distinct but so tightly clustered that the cubic is not determined
        let xs = [1.0, 1.0 + 1e-8, 1.0 + 2e-8, 1.0 + 3e-8];
        let ys = [0.0, 1.0, 0.0, 1.0];

        assert!(matches!(
            fit(&xs, &ys, FIT_ORDER),
            Err(TrajCtrlError::Fit(_))
        ));
    }
}
