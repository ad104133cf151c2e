//! # Differential flatness controller library.
//!
//! This library allows other crates in the workspace (and the benchmarks) to access items defined
//! inside the controller crate.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Differential flatness control module - keeps the vehicle on the reference trajectory
pub mod df_ctrl;

/// Subscriber client - receives state estimates and references from the network
pub mod sub_client;

/// Command server - publishes actuator commands
pub mod cmd_server;
