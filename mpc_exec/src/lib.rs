//! # MPC Executable Library
//!
//! Items used by the MPC executable: the trajectory controller, the nonlinear solver it uses,
//! the worker thread it runs on, and the server which bridges it to the simulator.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

pub mod nlp;
pub mod params;
pub mod sim_server;
pub mod traj_ctrl;
pub mod worker;
