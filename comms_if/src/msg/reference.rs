//! # Motion reference messages
//!
//! References are either continuous trajectory samples, which carry their own time
//! derivatives, or discrete waypoints from which the controller must recover the derivatives
//! itself. Control mode requests are sent on the same topic so that ordering between a mode
//! change and the first reference of that mode is preserved.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A continuous trajectory reference sample in the world frame.
///
/// Any derivative that is not provided is treated as zero by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrajectoryReference {
    /// Time at which the sample is valid. If not given the sample is treated as valid at the
    /// time it is consumed.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,

    /// Units: meters
    #[serde(default)]
    pub position_m: Option<[f64; 3]>,

    /// Units: meters/second
    #[serde(default)]
    pub velocity_ms: Option<[f64; 3]>,

    /// Units: meters/second^2
    #[serde(default)]
    pub acceleration_mss: Option<[f64; 3]>,

    /// Units: meters/second^3
    #[serde(default)]
    pub jerk_msss: Option<[f64; 3]>,

    /// Units: meters/second^4
    #[serde(default)]
    pub snap_mssss: Option<[f64; 3]>,

    /// Heading, angle of the body x axis from the world x axis about world z.
    ///
    /// Units: radians
    #[serde(default)]
    pub yaw_rad: Option<f64>,

    /// Units: radians/second
    #[serde(default)]
    pub yaw_rate_rads: Option<f64>,

    /// Units: radians/second^2
    #[serde(default)]
    pub yaw_acc_radss: Option<f64>,
}

/// A discrete waypoint with no derivative information.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    /// Time at which the vehicle should be at the waypoint
    pub timestamp: DateTime<Utc>,

    /// Units: meters
    pub position_m: [f64; 3],

    /// Units: radians
    #[serde(default)]
    pub yaw_rad: f64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Translational control modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    /// Hold the position and heading captured when the mode was entered
    Hover,

    /// Go to a position set-point, no feedforward
    Position,

    /// Track a velocity reference
    Speed,

    /// Track a full trajectory (position and derivatives)
    Trajectory,
}

/// Heading control modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YawMode {
    /// Track the reference yaw angle
    Angle,

    /// Track the reference yaw rate
    Speed,
}

/// Messages accepted on the reference topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefMsg {
    /// A continuous trajectory sample
    Trajectory(TrajectoryReference),

    /// A discrete waypoint
    Waypoint(Waypoint),

    /// Request a change of control and yaw mode
    SetMode {
        control_mode: ControlMode,
        yaw_mode: YawMode,
    },

    /// Stop the controller, commanding zero thrust
    Stop,

    /// Clear a stop or a latched fault and re-arm the controller
    Reset,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl RefMsg {
    /// Parse a reference message from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl TrajectoryReference {
    /// A stationary reference at the given position and heading.
    pub fn hover(position_m: [f64; 3], yaw_rad: f64) -> Self {
        Self {
            position_m: Some(position_m),
            velocity_ms: Some([0.0; 3]),
            acceleration_mss: Some([0.0; 3]),
            jerk_msss: Some([0.0; 3]),
            yaw_rad: Some(yaw_rad),
            yaw_rate_rads: Some(0.0),
            ..Default::default()
        }
    }
}

impl Default for ControlMode {
    fn default() -> Self {
        ControlMode::Trajectory
    }
}

impl Default for YawMode {
    fn default() -> Self {
        YawMode::Angle
    }
}
