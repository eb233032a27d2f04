//! # Communications interface crate.
//!
//! Provides all common communications interfaces for the software: the
//! messages exchanged with the vehicle simulator, their text framing, and the
//! network sockets used to carry them.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Simulator messages and their event framing
pub mod sim;

/// Network module
pub mod net;
