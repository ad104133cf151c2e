//! # Feedback error corrector
//!
//! Corrects the flatness feedforward with the tracking errors against the current state
//! estimate.
//!
//! In the position loop architecture the position, velocity and integral errors are turned into
//! a correction of the desired acceleration, which is passed through the flatness transform a
//! second time. In the attitude loop architecture the feedforward attitude and thrust are used
//! as they are. Both then correct the feedforward body rates with the attitude error
//! `e_R = 1/2 vee(R_d^T R - R^T R_d)`.
//!
//! The rate loop closes on the estimated body rates `w`, giving the angular acceleration
//! `alpha = alpha_ff + K_rate (w_cmd - w)` and the torque `J alpha + w x J w`.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::debug;
use nalgebra::{Matrix3, Vector3};
use serde::Serialize;

// Internal
use comms_if::msg::{ControlMode, YawMode};
use util::maths::wrap_pi;
use super::{
    DesiredState,
    DfCtrlError,
    FeedbackArchitecture,
    FlatOutput,
    FlatnessTransform,
    Params,
    ThrustProjection,
    VehicleState
};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Tracking errors computed during a correction, all reference minus estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrackingErrors {
    /// Units: meters, Frame: World
    pub position_m: [f64; 3],

    /// Units: meters/second, Frame: World
    pub velocity_ms: [f64; 3],

    /// Attitude error vector `e_R`, current attitude relative to the desired one.
    ///
    /// Frame: Body
    pub attitude: [f64; 3],

    /// The integral accumulator after this correction
    pub integral: [f64; 3],

    /// Body rate command minus the estimated body rate.
    ///
    /// Units: radians/second, Frame: Body
    pub body_rates_rads: [f64; 3],
}

/// The result of a correction.
#[derive(Debug, Clone, Copy)]
pub struct CorrectedCmd {
    /// The desired state the command tracks, from the second flatness pass in the position loop
    pub desired: DesiredState,

    /// Corrected acceleration demand.
    ///
    /// Units: meters/second^2, Frame: World
    pub accel_cmd_mss: Vector3<f64>,

    /// Body rate demand including attitude feedback.
    ///
    /// Units: radians/second, Frame: Body
    pub body_rates_rads: Vector3<f64>,

    /// Angular acceleration demand including rate feedback.
    ///
    /// Units: radians/second^2, Frame: Body
    pub body_acc_radss: Vector3<f64>,

    /// Units: newton meters, Frame: Body
    pub torque_nm: Vector3<f64>,

    /// Collective thrust demand.
    ///
    /// Units: newtons
    pub thrust_n: f64,

    pub errors: TrackingErrors,
}

/// Inputs to a single correction.
pub struct CorrectionInput<'a> {
    /// Reference flat output, already shaped for the control and yaw modes
    pub flat: &'a FlatOutput,

    /// Result of the flatness transform on `flat`
    pub feedforward: &'a DesiredState,

    pub state: &'a VehicleState,

    pub control_mode: ControlMode,

    /// Time since the last correction.
    ///
    /// Units: seconds
    pub dt_s: f64,

    /// If true the integral accumulator is held, set while the output is saturated
    pub freeze_integral: bool,

    /// Body y axis of the previous command, see `FlatnessTransform::compute`
    pub prev_y_axis: Option<&'a Vector3<f64>>,
}

/// The feedback error corrector.
///
/// Owns the integral accumulator, which is cleared whenever the control mode changes.
#[derive(Debug, Clone)]
pub struct FeedbackCorrector {
    architecture: FeedbackArchitecture,
    thrust_projection: ThrustProjection,

    position_kp: Vector3<f64>,
    position_kd: Vector3<f64>,
    position_ki: Vector3<f64>,
    speed_kp: Vector3<f64>,
    speed_kd: Vector3<f64>,
    speed_ki: Vector3<f64>,
    attitude_kp: Vector3<f64>,
    rate_kp: Vector3<f64>,
    antiwindup_cte: f64,

    inertia: Matrix3<f64>,

    /// Proportional term limits, if proportional limitation is enabled
    p_limits: Option<Vector3<f64>>,

    integral: Vector3<f64>,
    prev_vel_error: Option<Vector3<f64>>,
    mode: Option<ControlMode>,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl TrackingErrors {
    pub fn zero() -> Self {
        Self {
            position_m: [0.0; 3],
            velocity_ms: [0.0; 3],
            attitude: [0.0; 3],
            integral: [0.0; 3],
            body_rates_rads: [0.0; 3],
        }
    }
}

impl Default for TrackingErrors {
    fn default() -> Self {
        Self::zero()
    }
}

impl FeedbackCorrector {
    pub fn new(params: &Params) -> Self {
        let g = &params.gains;
        let c = &params.control;

        Self {
            architecture: c.architecture,
            thrust_projection: c.thrust_projection,
            position_kp: Vector3::from(g.position_kp),
            position_kd: Vector3::from(g.position_kd),
            position_ki: Vector3::from(g.position_ki),
            speed_kp: Vector3::from(g.speed_kp),
            speed_kd: Vector3::from(g.speed_kd),
            speed_ki: Vector3::from(g.speed_ki),
            attitude_kp: Vector3::from(g.attitude_kp),
            rate_kp: Vector3::from(g.rate_kp),
            antiwindup_cte: g.antiwindup_cte,
            inertia: params.inertia(),
            p_limits: match c.proportional_limitation {
                true => Some(Vector3::from(c.speed_limits_ms)),
                false => None
            },
            integral: Vector3::zeros(),
            prev_vel_error: None,
            mode: None,
        }
    }

    /// Clear the integral accumulator and derivative memory.
    pub fn reset(&mut self) {
        self.integral = Vector3::zeros();
        self.prev_vel_error = None;
    }

    pub fn integral(&self) -> Vector3<f64> {
        self.integral
    }

    /// The bound on the magnitude of each axis of the integral accumulator for the given
    /// integral gains. Axes with a zero gain do not integrate.
    pub fn integral_bound(&self, ki: &Vector3<f64>) -> Vector3<f64> {
        ki.map(|k| if k > 0.0 { self.antiwindup_cte / k } else { 0.0 })
    }

    /// Correct the feedforward for the current tracking errors.
    pub fn correct(
        &mut self,
        transform: &FlatnessTransform,
        input: &CorrectionInput
    ) -> Result<CorrectedCmd, DfCtrlError> {

        if self.mode != Some(input.control_mode) {
            if self.mode.is_some() {
                debug!(
                    "Control mode changed to {:?}, clearing integral accumulator",
                    input.control_mode
                );
            }
            self.reset();
            self.mode = Some(input.control_mode);
        }

        let flat = input.flat;
        let state = input.state;
        let dt = input.dt_s;

        let e_p = flat.position_m - state.position_m;
        let e_v = flat.velocity_ms - state.velocity_ms;

        // ---- TRANSLATIONAL FEEDBACK ----

        let (feedback, integrand, ki) = match input.control_mode {
            ControlMode::Speed => {
                let e_v_dot = match self.prev_vel_error {
                    Some(prev) if dt > 0.0 => (e_v - prev) / dt,
                    _ => Vector3::zeros()
                };

                (
                    self.speed_kp.component_mul(&e_v) + self.speed_kd.component_mul(&e_v_dot),
                    e_v,
                    self.speed_ki
                )
            },
            _ => {
                let mut p_term = self.position_kp.component_mul(&e_p);
                if let Some(lim) = self.p_limits {
                    p_term = p_term.zip_map(&lim, |p, l| p.max(-l).min(l));
                }

                (
                    p_term + self.position_kd.component_mul(&e_v),
                    e_p,
                    self.position_ki
                )
            }
        };
        self.prev_vel_error = Some(e_v);

        // Integrate unless the output is saturated, then clamp to the anti-windup bound
        if !input.freeze_integral && dt > 0.0 {
            self.integral += integrand * dt;
        }
        let bound = self.integral_bound(&ki);
        self.integral = self.integral.zip_map(&bound, |i, b| i.max(-b).min(b));

        let accel_cmd_mss = flat.acceleration_mss + feedback + ki.component_mul(&self.integral);

        // ---- ATTITUDE ----

        let desired = match self.architecture {
            FeedbackArchitecture::PositionLoop => transform.compute(
                &flat.with_acceleration(accel_cmd_mss),
                input.prev_y_axis
            )?,
            FeedbackArchitecture::AttitudeLoop => *input.feedforward
        };

        let rot = state.attitude.to_rotation_matrix().into_inner();
        let e_r = attitude_error(&desired.rotation, &rot);

        let body_rates_rads = desired.body_rates_rads - self.attitude_kp.component_mul(&e_r);

        // ---- RATE ----

        let w = state.angular_velocity_rads;
        let e_w = body_rates_rads - w;
        let body_acc_radss = desired.body_acc_radss + self.rate_kp.component_mul(&e_w);
        let torque_nm = self.inertia * body_acc_radss + w.cross(&(self.inertia * w));

        let thrust_n = match self.thrust_projection {
            ThrustProjection::Desired => desired.thrust_n,
            ThrustProjection::Current => desired.force_n().dot(&rot.column(2))
        };

        Ok(CorrectedCmd {
            desired,
            accel_cmd_mss,
            body_rates_rads,
            body_acc_radss,
            torque_nm,
            thrust_n,
            errors: TrackingErrors {
                position_m: e_p.into(),
                velocity_ms: e_v.into(),
                attitude: e_r.into(),
                integral: self.integral.into(),
                body_rates_rads: e_w.into(),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Attitude error `1/2 vee(R_d^T R - R^T R_d)` of `rot` relative to `rot_des`.
pub fn attitude_error(rot_des: &Matrix3<f64>, rot: &Matrix3<f64>) -> Vector3<f64> {
    let m = rot_des.transpose() * rot - rot.transpose() * rot_des;
    Vector3::new(m[(2, 1)], m[(0, 2)], m[(1, 0)]) * 0.5
}

/// Adapt a sampled flat output to the active control and yaw modes.
///
/// - `Position` keeps only the position and yaw set-point.
/// - `Speed` replaces the position by the current one, so that only velocity is tracked.
/// - In the `Speed` yaw mode the yaw is integrated from the current heading at the reference
///   yaw rate.
pub fn shape_flat_output(
    flat: &FlatOutput,
    control_mode: ControlMode,
    yaw_mode: YawMode,
    state: &VehicleState,
    dt_s: f64
) -> FlatOutput {
    let mut shaped = *flat;

    match control_mode {
        ControlMode::Position => {
            shaped = FlatOutput::hover(flat.position_m, flat.yaw_rad);
            shaped.order = 0;
        },
        ControlMode::Speed => shaped.position_m = state.position_m,
        ControlMode::Hover | ControlMode::Trajectory => ()
    }

    if yaw_mode == YawMode::Speed {
        shaped.yaw_rad = wrap_pi(state.yaw() + flat.yaw_rate_rads * dt_s.max(0.0));
    }

    shaped
}
