//! # Trajectory control module
//!
//! Trajectory control keeps the vehicle on the reference path using receding horizon model
//! predictive control. Every cycle:
//!
//!  1. The reference waypoints are transformed into the vehicle frame.
//!  1. A cubic is fitted to them, giving the reference line `y = f(x)`.
//!  1. The measured state is projected forward by the actuation latency.
//!  1. The actuator demands over a fixed horizon are optimised to minimise the cross track,
//!     heading and speed errors plus the actuator effort and its rate of change, subject to the
//!     vehicle model and the actuator limits.
//!  1. The first demand of the horizon is bounded, converted and emitted.
//!
//! Only the emitted command, and the last fitted polynomial, persist between cycles. Both are
//! owned by [`TrajCtrl`].

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

pub mod emitter;
pub mod frame;
pub mod model;
pub mod optimizer;
pub mod params;
pub mod path_fit;
pub mod predictor;
pub mod state;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// Internal
pub use emitter::*;
pub use frame::*;
pub use model::*;
pub use optimizer::*;
pub use params::*;
pub use path_fit::*;
pub use state::*;

use crate::nlp::{Convergence, NlpError, NlpSolver};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Result of the control pipeline for one cycle.
#[derive(Debug, Clone)]
pub struct Computed {
    pub output: OutputData,

    /// The polynomial fitted this cycle
    pub poly: Polynomial,

    /// The latency compensated state the horizon started from
    pub seed: VehicleState,

    pub solution: OptimizerSolution,

    /// Number of bound violations corrected while emitting
    pub num_clamped: usize,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Potential errors that can occur during processing of the module.
#[derive(Debug, thiserror::Error)]
pub enum TrajCtrlError {
    #[error("Could not load parameters: {0}")]
    ParamLoadError(util::params::LoadError),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Could not create the archive: {0}")]
    ArchiveError(util::archive::ArchiveError),

    #[error("Invalid input: {0}")]
    Input(InputError),

    #[error("Could not fit the reference: {0}")]
    Fit(FitError),

    #[error("Could not optimise the horizon: {0}")]
    Solver(SolverError),
}

/// The telemetry can't be used this cycle.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InputError {
    #[error("{0} waypoints given but {1} are required")]
    TooFewPoints(usize, usize),

    #[error("{0} x coordinates but {1} y coordinates")]
    LengthMismatch(usize, usize),

    #[error("Waypoints only have {0} distinct x coordinates but {1} are required")]
    TooFewDistinctX(usize, usize),

    #[error("The {0} contains non-finite values")]
    NonFinite(&'static str),

    #[error("The waypoints could not be fitted and there is no previous fit to reuse ({0})")]
    Unfittable(FitError),
}

/// The least squares problem is numerically singular.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FitError {
    #[error("Triangular factor is ill-conditioned (diagonal ratio {0:e})")]
    IllConditioned(f64),

    #[error("Triangular factor is singular")]
    Singular,

    #[error("Fit produced non-finite coefficients")]
    NonFinite,
}

/// The horizon optimisation failed.
#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    #[error("The horizon must have at least 2 steps, found {0}")]
    InvalidHorizon(usize),

    #[error("{0}")]
    Nlp(NlpError),

    #[error("Solver stopped without converging ({0:?} after {1} iterations)")]
    NotConverged(Convergence, usize),

    #[error("Solution contains non-finite values")]
    NonFinite,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl From<InputError> for TrajCtrlError {
    fn from(e: InputError) -> Self {
        TrajCtrlError::Input(e)
    }
}

impl From<FitError> for TrajCtrlError {
    fn from(e: FitError) -> Self {
        TrajCtrlError::Fit(e)
    }
}

impl From<SolverError> for TrajCtrlError {
    fn from(e: SolverError) -> Self {
        TrajCtrlError::Solver(e)
    }
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Compute the command for one cycle.
///
/// `prev_cmd` is the command applied on the previous cycle, in the model's convention, which is
/// assumed to be held over the actuation latency. No recovery is attempted, the first error in
/// the pipeline is returned.
pub fn compute_command(
    params: &Params,
    solver: &dyn NlpSolver,
    waypoints: (&[f64], &[f64]),
    pose: &Pose,
    speed: f64,
    prev_cmd: &Actuators,
) -> Result<Computed, TrajCtrlError> {
    let (local_xs, local_ys) = to_local(waypoints, pose, speed)?;
    let poly = path_fit::fit(&local_xs, &local_ys, FIT_ORDER)?;

    compute_with_poly(params, solver, (&local_xs, &local_ys), poly, speed, prev_cmd)
}

/// Validate the measurements and transform the waypoints into the vehicle frame.
pub(crate) fn to_local(
    waypoints: (&[f64], &[f64]),
    pose: &Pose,
    speed: f64,
) -> Result<(Vec<f64>, Vec<f64>), InputError> {
    if !speed.is_finite() {
        return Err(InputError::NonFinite("speed"));
    }

    VehicleFrame::new(pose)?.to_local(waypoints.0, waypoints.1)
}

/// The part of the pipeline following the fit.
pub(crate) fn compute_with_poly(
    params: &Params,
    solver: &dyn NlpSolver,
    local: (&[f64], &[f64]),
    poly: Polynomial,
    speed: f64,
    prev_cmd: &Actuators,
) -> Result<Computed, TrajCtrlError> {
    let model = KinematicBicycle::new(params.wheelbase_m);
    let seed = predictor::predict(speed, &poly, prev_cmd, &model, params.latency_s);

    let solution = optimizer::optimise(params, &seed, &poly, solver)?;

    let reference = emitter::reference_points(params, local.0, local.1, &poly);
    let (output, num_clamped) = emitter::emit(
        params,
        &solution.first_actuators(),
        reference,
        &solution.states,
    );

    Ok(Computed {
        output,
        poly,
        seed,
        solution,
        num_clamped,
    })
}
