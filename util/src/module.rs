//! Cyclic module interface
//!
//! A cyclic module is initialised once from a parameter file and then processes one input per
//! control cycle. Recoverable problems within a cycle are reported through the status report,
//! only failures which leave the module unusable are returned as errors.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use crate::session::Session;

// ---------------------------------------------------------------------------
// TRAITS
// ---------------------------------------------------------------------------

/// A cyclic processing module.
pub trait State {
    /// Data needed to initialise the module, usually the name of its parameter file
    type InitData;
    type InitError;

    /// One cycle's input
    type InputData;
    /// One cycle's output
    type OutputData;
    /// Monitoring quantities of one cycle, archived by the module
    type StatusReport;
    type ProcError;

    /// Load parameters and open the module's archives in the session.
    ///
    /// May be called again to reinitialise the module, which clears any state carried between
    /// cycles.
    fn init(&mut self, init_data: Self::InitData, session: &Session)
        -> Result<(), Self::InitError>;

    /// Process one cycle, returning its output and status report.
    fn proc(&mut self, input_data: &Self::InputData)
        -> Result<(Self::OutputData, Self::StatusReport), Self::ProcError>;
}
