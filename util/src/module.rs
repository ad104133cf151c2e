//! Cyclic module interface
//!
//! A cyclic module is initialised once from its parameters and then stepped by
//! the executable's main loop, taking a snapshot of its inputs and producing
//! one output and one status report per step.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// Internal imports
use crate::session::Session;

// ---------------------------------------------------------------------------
// MODULE STATE
// ---------------------------------------------------------------------------

/// The internal state of a cyclic module.
pub trait State {
    /// Parameters or other data needed to set the module up
    type InitData;
    type InitError;

    /// Snapshot of the inputs for a single step
    type InputData;
    /// Result of a single step
    type OutputData;
    /// Diagnostics produced alongside the output of each step
    type StatusReport;
    type ProcError;

    /// Initialise the module.
    ///
    /// If a session is given the module opens its archives inside it,
    /// otherwise it runs without archiving.
    fn init(&mut self, init_data: Self::InitData, session: Option<&Session>)
        -> Result<(), Self::InitError>;

    /// Run one step of the module.
    ///
    /// Errors are reserved for misuse of the module (such as stepping it
    /// before `init`), conditions the module can handle itself are reported
    /// through the status report.
    fn proc(&mut self, input_data: &Self::InputData)
        -> Result<(Self::OutputData, Self::StatusReport), Self::ProcError>;
}
