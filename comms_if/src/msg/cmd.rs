//! # Actuator command messages

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Body-rate, torque and collective thrust command sent to the actuation layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActuatorCmd {
    /// Time at which the command was generated
    pub timestamp: DateTime<Utc>,

    /// Collective thrust demand.
    ///
    /// Units: newtons
    pub thrust_n: f64,

    /// Collective thrust demand as a fraction of the maximum thrust, between 0 and 1.
    pub thrust_norm: f64,

    /// Desired attitude, body to world, stored as `[x, y, z, w]`.
    pub attitude_q: [f64; 4],

    /// Body rate demand.
    ///
    /// Units: radians/second,
    /// Frame: Body
    pub body_rates_rads: [f64; 3],

    /// Angular acceleration demand.
    ///
    /// Units: radians/second^2,
    /// Frame: Body
    pub body_acc_radss: [f64; 3],

    /// Torque demand.
    ///
    /// Units: newton meters,
    /// Frame: Body
    pub torque_nm: [f64; 3],
}

impl ActuatorCmd {
    /// A command with zero thrust, rates and torque, holding a level attitude.
    pub fn zero(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            thrust_n: 0.0,
            thrust_norm: 0.0,
            attitude_q: [0.0, 0.0, 0.0, 1.0],
            body_rates_rads: [0.0; 3],
            body_acc_radss: [0.0; 3],
            torque_nm: [0.0; 3],
        }
    }
}
