//! # Communications interface crate.
//!
//! Provides all common communications interfaces for the controller software: the message
//! definitions exchanged with the state estimator, the trajectory reference source and the
//! actuation layer, and the networking abstractions used to move them.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Message definitions and topic helpers
pub mod msg;

/// Network module
pub mod net;
