//! # Command output stage
//!
//! Converts a corrected command into the actuator command, applying hard limits to the thrust
//! and to each axis of the body rate, angular acceleration and torque independently. Saturation is reported per channel so that the
//! corrector can stop integrating.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use chrono::{DateTime, Utc};
use nalgebra::Vector3;
use serde::Serialize;

// Internal
use comms_if::msg::ActuatorCmd;
use super::{quat_to_msg, CorrectedCmd, Params};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Channels of the last command which hit a limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SaturationReport {
    /// Thrust demand was below zero
    pub thrust_low: bool,

    /// Thrust demand was above the maximum thrust
    pub thrust_high: bool,

    /// Body rate demand exceeded the limit on the given axis
    pub body_rates: [bool; 3],

    /// Angular acceleration demand exceeded the limit on the given axis
    pub body_acc: [bool; 3],

    /// Torque demand exceeded the limit on the given axis
    pub torque: [bool; 3],

    /// A non-finite value was replaced by zero
    pub non_finite: bool,
}

/// The command output stage.
#[derive(Debug, Clone)]
pub struct OutputStage {
    max_thrust_n: f64,
    max_body_rate_rads: Vector3<f64>,
    max_body_acc_radss: Vector3<f64>,
    max_torque_nm: Vector3<f64>,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl SaturationReport {
    /// True if any channel is saturated.
    pub fn any(&self) -> bool {
        self.thrust_low
            || self.thrust_high
            || self.body_rates.iter().any(|s| *s)
            || self.body_acc.iter().any(|s| *s)
            || self.torque.iter().any(|s| *s)
            || self.non_finite
    }
}

impl OutputStage {
    pub fn new(params: &Params) -> Self {
        Self {
            max_thrust_n: params.vehicle.max_thrust_n,
            max_body_rate_rads: Vector3::from(params.vehicle.max_body_rate_rads),
            max_body_acc_radss: Vector3::from(params.vehicle.max_body_acc_radss),
            max_torque_nm: Vector3::from(params.vehicle.max_torque_nm),
        }
    }

    /// Build the actuator command for the given correction.
    ///
    /// Each channel is clamped on its own, so the direction of a vector demand is not preserved
    /// when more than one of its axes saturates. The torque is clamped against its own limit,
    /// not recomputed from the clamped angular acceleration.
    pub fn make_command(
        &self,
        cmd: &CorrectedCmd,
        timestamp: DateTime<Utc>
    ) -> (ActuatorCmd, SaturationReport) {
        let mut sat = SaturationReport::default();

        let mut thrust_n = cmd.thrust_n;
        if !thrust_n.is_finite() {
            thrust_n = 0.0;
            sat.non_finite = true;
        }
        if thrust_n < 0.0 {
            thrust_n = 0.0;
            sat.thrust_low = true;
        }
        if thrust_n > self.max_thrust_n {
            thrust_n = self.max_thrust_n;
            sat.thrust_high = true;
        }

        let body_rates_rads = clamp_axes(
            &cmd.body_rates_rads,
            &self.max_body_rate_rads,
            &mut sat.body_rates,
            &mut sat.non_finite
        );
        let body_acc_radss = clamp_axes(
            &cmd.body_acc_radss,
            &self.max_body_acc_radss,
            &mut sat.body_acc,
            &mut sat.non_finite
        );
        let torque_nm = clamp_axes(
            &cmd.torque_nm,
            &self.max_torque_nm,
            &mut sat.torque,
            &mut sat.non_finite
        );

        (
            ActuatorCmd {
                timestamp,
                thrust_n,
                thrust_norm: thrust_n / self.max_thrust_n,
                attitude_q: quat_to_msg(&cmd.desired.attitude),
                body_rates_rads,
                body_acc_radss,
                torque_nm,
            },
            sat
        )
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

/// Clamp each axis of `demand` to `+/-max`, replacing non-finite values by zero.
fn clamp_axes(
    demand: &Vector3<f64>,
    max: &Vector3<f64>,
    saturated: &mut [bool; 3],
    non_finite: &mut bool
) -> [f64; 3] {
    let mut out = [0f64; 3];

    for i in 0..3 {
        let mut v = demand[i];

        if !v.is_finite() {
            v = 0.0;
            *non_finite = true;
        }
        if v.abs() > max[i] {
            v = v.signum() * max[i];
            saturated[i] = true;
        }

        out[i] = v;
    }

    out
}
