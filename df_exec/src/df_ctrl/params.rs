//! Parameters structure for DfCtrl

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use std::path::Path;
use nalgebra::{Matrix3, Vector3};
use serde::Deserialize;

// Internal
use comms_if::msg::{ControlMode, YawMode};
use util::params;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Parameters for differential flatness control.
///
/// The vehicle and gain tables have no defaults, every key must be present in the file.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Params {
    pub vehicle: VehicleParams,

    pub gains: GainParams,

    #[serde(default)]
    pub control: ControlParams,

    #[serde(default)]
    pub flatness: FlatnessParams,

    #[serde(default)]
    pub reference: ReferenceParams,

    #[serde(default, rename = "loop")]
    pub loop_cfg: LoopParams,
}

/// Physical parameters of the vehicle.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct VehicleParams {
    /// Units: kilograms
    pub mass_kg: f64,

    /// Inertia tensor about the centre of mass, row major.
    ///
    /// Units: kilogram meters^2,
    /// Frame: Body
    pub inertia_kgm2: [[f64; 3]; 3],

    /// Maximum collective thrust the rotors can produce.
    ///
    /// Units: newtons
    pub max_thrust_n: f64,

    /// Maximum absolute body rate about each body axis.
    ///
    /// Units: radians/second
    pub max_body_rate_rads: [f64; 3],

    /// Maximum absolute angular acceleration about each body axis.
    ///
    /// Units: radians/second^2
    pub max_body_acc_radss: [f64; 3],

    /// Maximum absolute torque the rotors can produce about each body axis.
    ///
    /// Units: newton meters
    pub max_torque_nm: [f64; 3],
}

/// Feedback gains, one value per world (or body, for attitude) axis.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct GainParams {
    /// Position error proportional gain
    pub position_kp: [f64; 3],

    /// Velocity error (position derivative) gain
    pub position_kd: [f64; 3],

    /// Position error integral gain
    pub position_ki: [f64; 3],

    /// Speed mode velocity error proportional gain
    pub speed_kp: [f64; 3],

    /// Speed mode velocity error derivative gain
    pub speed_kd: [f64; 3],

    /// Speed mode velocity error integral gain
    pub speed_ki: [f64; 3],

    /// Attitude error gain, mapping the attitude error to a body rate correction
    pub attitude_kp: [f64; 3],

    /// Body rate error gain, mapping the rate error to an angular acceleration correction
    pub rate_kp: [f64; 3],

    /// Bound on the contribution of the integral term on each axis.
    ///
    /// The accumulator is clamped to `antiwindup_cte / ki`.
    ///
    /// Units: meters/second^2
    pub antiwindup_cte: f64,
}

/// Control configuration.
#[derive(Deserialize, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct ControlParams {
    pub architecture: FeedbackArchitecture,

    pub thrust_projection: ThrustProjection,

    /// Control mode in use before any mode request is received
    pub initial_control_mode: ControlMode,

    /// Yaw mode in use before any mode request is received
    pub initial_yaw_mode: YawMode,

    /// If true the proportional term in position and hover modes is clamped to the speed limits
    pub proportional_limitation: bool,

    /// Units: meters/second
    pub speed_limits_ms: [f64; 3],

    /// Speed references with a norm below this value are treated as a hover request.
    ///
    /// Units: meters/second
    pub hover_speed_threshold_ms: f64,
}

/// Flatness transform configuration.
#[derive(Deserialize, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct FlatnessParams {
    /// Units: meters/second^2
    pub gravity_mss: f64,

    /// Norm of `z_b x x_c` below which the heading construction is replaced by the previous body
    /// y axis. The two are blended between `heading_epsilon` and `2 * heading_epsilon`.
    pub heading_epsilon: f64,

    /// Norm of the specific thrust vector below which no attitude can be found.
    ///
    /// Units: meters/second^2
    pub degenerate_epsilon: f64,
}

/// Reference generator configuration.
#[derive(Deserialize, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct ReferenceParams {
    /// Maximum order of the polynomial fitted to waypoints
    pub poly_order: usize,

    /// Number of most recent waypoints used in the fit
    pub fit_window: usize,

    /// Maximum time a reference is propagated beyond its timestamp (or the last waypoint).
    ///
    /// Units: seconds
    pub max_extrapolation_s: f64,
}

/// Loop timing and fault handling.
#[derive(Deserialize, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct LoopParams {
    /// Units: hertz
    pub rate_hz: f64,

    /// Maximum state estimate age before the controller faults.
    ///
    /// Units: seconds
    pub stale_timeout_s: f64,

    /// Time the state estimate must be fresh for before leaving a fault.
    ///
    /// Units: seconds
    pub recovery_delay_s: f64,

    /// Time of clean running after which the consecutive fault count is cleared.
    ///
    /// Units: seconds
    pub recovery_window_s: f64,

    /// Number of consecutive automatic recoveries allowed before a fault latches
    pub max_auto_recoveries: u32,

    /// Number of consecutive degenerate attitude ticks tolerated before faulting
    pub max_degenerate_retries: u32,

    /// Longest time the last command is repeated for lack of a usable reference, after which
    /// the vehicle hovers where it is.
    ///
    /// Units: seconds
    pub max_hold_s: f64,

    pub fault_output: FaultOutput,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// How the feedback is combined with the flatness feedforward.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackArchitecture {
    /// Correct the desired acceleration and run a second flatness pass on it
    PositionLoop,

    /// Use the feedforward attitude and thrust, with attitude feedback only
    AttitudeLoop,
}

/// Axis the collective thrust force is projected onto.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThrustProjection {
    Desired,
    Current,
}

/// Command emitted while the controller is faulted.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FaultOutput {
    /// Zero thrust and zero rates
    Zero,

    /// Repeat the last good command
    Hold,
}

/// Errors raised while loading or validating the parameters.
#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    #[error("Could not load parameters: {0}")]
    LoadError(#[from] params::LoadError),

    #[error("Invalid parameter {0}: {1}")]
    InvalidParam(&'static str, String),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Params {
    /// Load the parameters from the given file and validate them.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ParamsError> {
        let params: Self = params::load(path)?;
        params.validate()?;
        Ok(params)
    }

    /// Check that the parameters describe a physically meaningful vehicle and controller.
    pub fn validate(&self) -> Result<(), ParamsError> {
        let v = &self.vehicle;

        positive("vehicle.mass_kg", v.mass_kg)?;
        positive("vehicle.max_thrust_n", v.max_thrust_n)?;
        for r in v.max_body_rate_rads.iter() {
            positive("vehicle.max_body_rate_rads", *r)?;
        }
        for a in v.max_body_acc_radss.iter() {
            positive("vehicle.max_body_acc_radss", *a)?;
        }
        for t in v.max_torque_nm.iter() {
            positive("vehicle.max_torque_nm", *t)?;
        }

        // Inertia must be symmetric positive definite
        let j = self.inertia();
        if j.iter().any(|x| !x.is_finite()) || (j - j.transpose()).amax() > 1e-9 {
            return Err(invalid("vehicle.inertia_kgm2", "must be finite and symmetric"))
        }
        if j.cholesky().is_none() {
            return Err(invalid("vehicle.inertia_kgm2", "must be positive definite"))
        }

        let g = &self.gains;
        for (name, gains) in [
            ("gains.position_kp", &g.position_kp),
            ("gains.position_kd", &g.position_kd),
            ("gains.position_ki", &g.position_ki),
            ("gains.speed_kp", &g.speed_kp),
            ("gains.speed_kd", &g.speed_kd),
            ("gains.speed_ki", &g.speed_ki),
            ("gains.attitude_kp", &g.attitude_kp),
            ("gains.rate_kp", &g.rate_kp),
        ]
        .iter()
        {
            for k in gains.iter() {
                non_negative(*name, *k)?;
            }
        }
        non_negative("gains.antiwindup_cte", g.antiwindup_cte)?;

        for s in self.control.speed_limits_ms.iter() {
            positive("control.speed_limits_ms", *s)?;
        }
        non_negative("control.hover_speed_threshold_ms", self.control.hover_speed_threshold_ms)?;

        positive("flatness.gravity_mss", self.flatness.gravity_mss)?;
        positive("flatness.heading_epsilon", self.flatness.heading_epsilon)?;
        positive("flatness.degenerate_epsilon", self.flatness.degenerate_epsilon)?;

        if self.reference.fit_window == 0 {
            return Err(invalid("reference.fit_window", "must be at least 1"))
        }
        non_negative("reference.max_extrapolation_s", self.reference.max_extrapolation_s)?;

        let l = &self.loop_cfg;
        positive("loop.rate_hz", l.rate_hz)?;
        positive("loop.stale_timeout_s", l.stale_timeout_s)?;
        non_negative("loop.recovery_delay_s", l.recovery_delay_s)?;
        non_negative("loop.recovery_window_s", l.recovery_window_s)?;
        non_negative("loop.max_hold_s", l.max_hold_s)?;

        Ok(())
    }

    /// The inertia tensor as a matrix.
    pub fn inertia(&self) -> Matrix3<f64> {
        let j = &self.vehicle.inertia_kgm2;
        Matrix3::from_fn(|r, c| j[r][c])
    }

    /// Nominal period of the control loop in seconds.
    pub fn period_s(&self) -> f64 {
        1.0 / self.loop_cfg.rate_hz
    }

    /// Acceleration due to gravity in the world frame.
    pub fn gravity(&self) -> Vector3<f64> {
        Vector3::new(0.0, 0.0, -self.flatness.gravity_mss)
    }
}

impl Default for ControlParams {
    fn default() -> Self {
        Self {
            architecture: FeedbackArchitecture::PositionLoop,
            thrust_projection: ThrustProjection::Desired,
            initial_control_mode: ControlMode::Trajectory,
            initial_yaw_mode: YawMode::Angle,
            proportional_limitation: false,
            speed_limits_ms: [3.0, 3.0, 2.0],
            hover_speed_threshold_ms: 1e-4,
        }
    }
}

impl Default for FlatnessParams {
    fn default() -> Self {
        Self {
            gravity_mss: 9.81,
            heading_epsilon: 1e-3,
            degenerate_epsilon: 1e-3,
        }
    }
}

impl Default for ReferenceParams {
    fn default() -> Self {
        Self {
            poly_order: 4,
            fit_window: 8,
            max_extrapolation_s: 0.5,
        }
    }
}

impl Default for LoopParams {
    fn default() -> Self {
        Self {
            rate_hz: 100.0,
            stale_timeout_s: 0.1,
            recovery_delay_s: 0.1,
            recovery_window_s: 5.0,
            max_auto_recoveries: 3,
            max_degenerate_retries: 10,
            max_hold_s: 0.5,
            fault_output: FaultOutput::Zero,
        }
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

fn invalid(name: &'static str, reason: &str) -> ParamsError {
    ParamsError::InvalidParam(name, reason.to_string())
}

fn positive(name: &'static str, value: f64) -> Result<(), ParamsError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    }
    else {
        Err(ParamsError::InvalidParam(name, format!("must be positive, found {}", value)))
    }
}

fn non_negative(name: &'static str, value: f64) -> Result<(), ParamsError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    }
    else {
        Err(ParamsError::InvalidParam(name, format!("must not be negative, found {}", value)))
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    /// A parameter file for a 1.5 kg quadrotor, shared by the other DfCtrl tests.
    pub(crate) const TEST_PARAMS: &str = r#"
        [vehicle]
        mass_kg = 1.5
        inertia_kgm2 = [[0.0347, 0.0, 0.0], [0.0, 0.0458, 0.0], [0.0, 0.0, 0.0977]]
        max_thrust_n = 40.0
        max_body_rate_rads = [6.0, 6.0, 3.0]
        max_body_acc_radss = [40.0, 40.0, 20.0]
        max_torque_nm = [2.0, 2.0, 1.0]

        [gains]
        position_kp = [6.0, 6.0, 8.0]
        position_kd = [3.0, 3.0, 4.0]
        position_ki = [0.5, 0.5, 1.0]
        speed_kp = [4.0, 4.0, 5.0]
        speed_kd = [0.0, 0.0, 0.0]
        speed_ki = [0.2, 0.2, 0.4]
        attitude_kp = [5.0, 5.0, 4.0]
        rate_kp = [12.0, 12.0, 6.0]
        antiwindup_cte = 1.0

        [loop]
        rate_hz = 100.0
        stale_timeout_s = 0.1
        recovery_delay_s = 0.02
        recovery_window_s = 1.0
        max_auto_recoveries = 2
        max_degenerate_retries = 3
        max_hold_s = 0.1
        fault_output = "zero"
    "#;

    pub(crate) fn test_params() -> Params {
        let p: Params = params::from_str(TEST_PARAMS).unwrap();
        p.validate().unwrap();
        p
    }

    #[test]
    fn test_load_params() {
        let p = test_params();

        assert_eq!(p.vehicle.mass_kg, 1.5);
        assert_eq!(p.inertia()[(2, 2)], 0.0977);
        assert_eq!(p.control.architecture, FeedbackArchitecture::PositionLoop);
        assert_eq!(p.control.thrust_projection, ThrustProjection::Desired);
        assert_eq!(p.loop_cfg.max_auto_recoveries, 2);
        assert_eq!(p.loop_cfg.max_hold_s, 0.1);
        assert_eq!(p.gains.rate_kp, [12.0, 12.0, 6.0]);
        assert_eq!(p.period_s(), 0.01);
        assert_eq!(p.gravity(), Vector3::new(0.0, 0.0, -9.81));
    }

    #[test]
    fn test_missing_mass() {
        let s = TEST_PARAMS.replace("mass_kg = 1.5", "");
        assert!(params::from_str::<Params>(&s).is_err());
    }

    #[test]
    fn test_reject_non_physical() {
        let mut p = test_params();
        p.vehicle.mass_kg = 0.0;
        assert!(matches!(
            p.validate(),
            Err(ParamsError::InvalidParam("vehicle.mass_kg", _))
        ));

        let mut p = test_params();
        p.vehicle.inertia_kgm2[1][1] = -0.01;
        assert!(matches!(
            p.validate(),
            Err(ParamsError::InvalidParam("vehicle.inertia_kgm2", _))
        ));

        let mut p = test_params();
        p.vehicle.inertia_kgm2[0][1] = 0.01;
        assert!(matches!(
            p.validate(),
            Err(ParamsError::InvalidParam("vehicle.inertia_kgm2", _))
        ));

        let mut p = test_params();
        p.vehicle.max_body_rate_rads[2] = 0.0;
        assert!(p.validate().is_err());

        let mut p = test_params();
        p.vehicle.max_torque_nm[0] = -1.0;
        assert!(matches!(
            p.validate(),
            Err(ParamsError::InvalidParam("vehicle.max_torque_nm", _))
        ));

        let mut p = test_params();
        p.gains.rate_kp[1] = -2.0;
        assert!(matches!(
            p.validate(),
            Err(ParamsError::InvalidParam("gains.rate_kp", _))
        ));

        let mut p = test_params();
        p.gains.position_kd[0] = -1.0;
        assert!(matches!(
            p.validate(),
            Err(ParamsError::InvalidParam("gains.position_kd", _))
        ));
    }
}
