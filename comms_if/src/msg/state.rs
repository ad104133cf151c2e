//! # Vehicle state estimate messages

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// State estimate of the vehicle as produced by the external estimator.
///
/// All quantities except the angular velocity are expressed in the world (ENU) frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateEstimate {
    /// Time at which the estimate is valid
    pub timestamp: DateTime<Utc>,

    /// Position of the vehicle.
    ///
    /// Units: meters,
    /// Frame: World
    pub position_m: [f64; 3],

    /// Linear velocity of the vehicle.
    ///
    /// Units: meters/second,
    /// Frame: World
    pub velocity_ms: [f64; 3],

    /// Attitude quaternion rotating the body frame into the world frame, stored as
    /// `[x, y, z, w]`.
    pub attitude_q: [f64; 4],

    /// Angular velocity of the body.
    ///
    /// Units: radians/second,
    /// Frame: Body
    pub angular_velocity_rads: [f64; 3],
}

impl StateEstimate {
    /// A state at rest at the origin with level attitude.
    pub fn at_rest(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            position_m: [0.0; 3],
            velocity_ms: [0.0; 3],
            attitude_q: [0.0, 0.0, 0.0, 1.0],
            angular_velocity_rads: [0.0; 3],
        }
    }

    /// Return true if every field of the estimate is finite.
    pub fn is_finite(&self) -> bool {
        self.position_m
            .iter()
            .chain(self.velocity_ms.iter())
            .chain(self.attitude_q.iter())
            .chain(self.angular_velocity_rads.iter())
            .all(|v| v.is_finite())
    }
}
