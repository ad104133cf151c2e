//! # Differential flatness control module
//!
//! DfCtrl keeps a multirotor on a reference trajectory by exploiting the differential flatness
//! of its dynamics. Position and yaw, together with their time derivatives, fully determine the
//! attitude, body rates and collective thrust the vehicle needs in order to follow them. These
//! can be computed algebraically, with no iterative inversion of the dynamics.
//!
//! Each cycle runs the following chain:
//!
//! 1. `flat_ref` samples the active reference at the cycle time, producing a `FlatOutput`
//!    (recovering derivatives from waypoints with a polynomial fit where needed).
//! 2. `flatness` maps the flat output to a desired attitude, body rates, angular acceleration
//!    and thrust.
//! 3. `feedback` corrects this feedforward using the position, velocity and attitude errors
//!    against the current state estimate, either by running a second flatness pass on the
//!    corrected acceleration (position loop) or by attitude feedback only (attitude loop).
//! 4. `output` saturates the result into the `ActuatorCmd` sent to the actuation layer.
//!
//! The cycle itself, and the `Uninitialised -> Armed -> Running -> Faulted/Stopped` state
//! machine, live in `state`.
//!
//! Frames follow the ENU convention: world z points up and gravity is `-g * z`.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

mod feedback;
mod flat_ref;
mod flatness;
mod output;
mod params;
mod state;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use chrono::{DateTime, Utc};
use nalgebra::{Quaternion, UnitQuaternion, Vector3};

// Internal
use comms_if::msg::StateEstimate;

pub use feedback::*;
pub use flat_ref::*;
pub use flatness::*;
pub use output::*;
pub use params::*;
pub use state::*;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Minimum norm of a state estimate quaternion for it to be considered valid.
const MIN_QUATERNION_NORM: f64 = 1e-6;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// The vehicle state estimate in the form used by the controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VehicleState {
    /// Time at which the estimate is valid
    pub timestamp: DateTime<Utc>,

    /// Units: meters, Frame: World
    pub position_m: Vector3<f64>,

    /// Units: meters/second, Frame: World
    pub velocity_ms: Vector3<f64>,

    /// Body to world rotation
    pub attitude: UnitQuaternion<f64>,

    /// Units: radians/second, Frame: Body
    pub angular_velocity_rads: Vector3<f64>,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Potential errors that can occur during processing of the module.
#[derive(Debug, thiserror::Error)]
pub enum DfCtrlError {
    #[error("Configuration error: {0}")]
    ConfigError(#[from] ParamsError),

    #[error("DfCtrl has not been initialised")]
    NotInitialised,

    #[error("Insufficient reference data: {0}")]
    InsufficientReferenceData(String),

    #[error(
        "Degenerate attitude: the thrust vector norm {0:.3e} m/s^2 is too small to define a \
        body z axis"
    )]
    DegenerateAttitude(f64),

    #[error("State estimate is invalid: {0}")]
    InvalidState(String),

    #[error("Could not set up the archives: {0}")]
    ArchiveError(#[from] util::archive::ArchiveError),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl VehicleState {
    /// Convert a state estimate message into the controller's representation.
    ///
    /// Fails if any field is not finite or if the attitude quaternion has no length. The
    /// quaternion is normalised.
    pub fn from_estimate(est: &StateEstimate) -> Result<Self, DfCtrlError> {
        if !est.is_finite() {
            return Err(DfCtrlError::InvalidState("non-finite value".into()))
        }

        let [qx, qy, qz, qw] = est.attitude_q;
        let q = Quaternion::new(qw, qx, qy, qz);

        if q.norm() < MIN_QUATERNION_NORM {
            return Err(DfCtrlError::InvalidState("zero length attitude quaternion".into()))
        }

        Ok(Self {
            timestamp: est.timestamp,
            position_m: Vector3::from(est.position_m),
            velocity_ms: Vector3::from(est.velocity_ms),
            attitude: UnitQuaternion::from_quaternion(q),
            angular_velocity_rads: Vector3::from(est.angular_velocity_rads),
        })
    }

    /// Heading of the vehicle (yaw angle of the body x axis about world z).
    pub fn yaw(&self) -> f64 {
        self.attitude.euler_angles().2
    }
}

/// Convert a unit quaternion into the `[x, y, z, w]` message layout.
pub fn quat_to_msg(q: &UnitQuaternion<f64>) -> [f64; 4] {
    [q.i, q.j, q.k, q.w]
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_vehicle_state_from_estimate() {
        let mut est = StateEstimate::at_rest(Utc::now());
        est.position_m = [1.0, 2.0, 3.0];

        // Unnormalised quarter turn about z
        let half = std::f64::consts::FRAC_PI_4;
        est.attitude_q = [0.0, 0.0, 2.0 * half.sin(), 2.0 * half.cos()];

        let vs = VehicleState::from_estimate(&est).unwrap();

        assert_eq!(vs.position_m, Vector3::new(1.0, 2.0, 3.0));
        assert_relative_eq!(vs.yaw(), std::f64::consts::FRAC_PI_2, epsilon = 1e-12);
        assert_relative_eq!(vs.attitude.quaternion().norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_invalid_estimate() {
        let mut est = StateEstimate::at_rest(Utc::now());
        est.attitude_q = [0.0; 4];
        assert!(matches!(
            VehicleState::from_estimate(&est),
            Err(DfCtrlError::InvalidState(_))
        ));

        let mut est = StateEstimate::at_rest(Utc::now());
        est.velocity_ms[1] = std::f64::NAN;
        assert!(matches!(
            VehicleState::from_estimate(&est),
            Err(DfCtrlError::InvalidState(_))
        ));
    }
}
