//! # Flatness transform
//!
//! Maps a flat output onto the attitude, body rates, angular acceleration, torque and
//! collective thrust that realise it.
//!
//! With `t = a - g` the specific thrust vector, the body z axis is `z_b = t / |t|`. The heading
//! fixes the rest of the frame: `y_b` is `z_b x x_c` normalised, where `x_c` is the yaw
//! direction in the horizontal plane, and `x_b = y_b x z_b`. Body rates follow from the jerk and
//! the angular acceleration from the snap, through the first and second derivatives of `z_b`.
//!
//! When `z_b` comes close to `x_c` the cross product loses its length. Below
//! `heading_epsilon` the previous body y axis, projected perpendicular to the new `z_b`, is
//! used instead. Between `heading_epsilon` and `2 * heading_epsilon` the two are blended so
//! that the attitude does not jump when the fallback engages.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

// Internal
use super::{DfCtrlError, FlatOutput, Params};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Norm below which a blended y axis is considered degenerate.
const MIN_AXIS_NORM: f64 = 1e-9;

/// Minimum norm of a held y axis after projection perpendicular to `z_b`.
const MIN_HELD_AXIS_NORM: f64 = 0.1;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// The state and inputs required to follow a flat output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DesiredState {
    /// Body to world rotation, columns are the body axes in the world frame
    pub rotation: Matrix3<f64>,

    /// Body to world attitude
    pub attitude: UnitQuaternion<f64>,

    /// Units: radians/second, Frame: Body
    pub body_rates_rads: Vector3<f64>,

    /// Units: radians/second^2, Frame: Body
    pub body_acc_radss: Vector3<f64>,

    /// Units: newton meters, Frame: Body
    pub torque_nm: Vector3<f64>,

    /// Collective thrust along the body z axis.
    ///
    /// Units: newtons
    pub thrust_n: f64,

    /// The specific thrust vector `a - g`.
    ///
    /// Units: meters/second^2, Frame: World
    pub specific_thrust_mss: Vector3<f64>,

    /// True if the previous body y axis contributed to the heading
    pub heading_fallback: bool,
}

/// The flatness transform for a vehicle.
#[derive(Debug, Clone)]
pub struct FlatnessTransform {
    mass_kg: f64,
    inertia: Matrix3<f64>,
    gravity_mss: Vector3<f64>,
    heading_epsilon: f64,
    degenerate_epsilon: f64,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl DesiredState {
    pub fn y_axis(&self) -> Vector3<f64> {
        self.rotation.column(1).into_owned()
    }

    pub fn z_axis(&self) -> Vector3<f64> {
        self.rotation.column(2).into_owned()
    }

    /// The world frame thrust force.
    pub fn force_n(&self) -> Vector3<f64> {
        self.z_axis() * self.thrust_n
    }
}

impl FlatnessTransform {
    pub fn new(params: &Params) -> Self {
        Self {
            mass_kg: params.vehicle.mass_kg,
            inertia: params.inertia(),
            gravity_mss: params.gravity(),
            heading_epsilon: params.flatness.heading_epsilon,
            degenerate_epsilon: params.flatness.degenerate_epsilon,
        }
    }

    /// Compute the desired state for the given flat output.
    ///
    /// `prev_y_axis` is the body y axis commanded on the previous cycle, used when the heading
    /// is singular. If it is `None` the world y axis is used in its place.
    pub fn compute(
        &self,
        flat: &FlatOutput,
        prev_y_axis: Option<&Vector3<f64>>
    ) -> Result<DesiredState, DfCtrlError> {

        // ---- ATTITUDE ----

        let t = flat.acceleration_mss - self.gravity_mss;
        let c = t.norm();
        if !(c >= self.degenerate_epsilon) {
            return Err(DfCtrlError::DegenerateAttitude(c))
        }

        let z_b = t / c;

        let (sin_yaw, cos_yaw) = flat.yaw_rad.sin_cos();
        let yaw_rate = flat.yaw_rate_rads;
        let x_c = Vector3::new(cos_yaw, sin_yaw, 0.0);
        let x_c_dot = Vector3::new(-sin_yaw, cos_yaw, 0.0) * yaw_rate;
        let x_c_ddot = Vector3::new(-sin_yaw, cos_yaw, 0.0) * flat.yaw_acc_radss
            - x_c * (yaw_rate * yaw_rate);

        let u = z_b.cross(&x_c);
        let u_norm = u.norm();
        let (y_b, weight) = self.y_axis(&z_b, &u, prev_y_axis);
        let x_b = y_b.cross(&z_b);
        let rotation = Matrix3::from_columns(&[x_b, y_b, z_b]);

        // ---- BODY RATES ----

        let e3 = Vector3::z();
        let j = flat.jerk_msss;
        let z_dot = (j - z_b * z_b.dot(&j)) / c;
        let u_dot = z_dot.cross(&x_c) + z_b.cross(&x_c_dot);

        let p = -z_dot.dot(&y_b);
        let q = z_dot.dot(&x_b);

        // The yaw rate follows exactly from the heading construction, while the heading is held
        // only its projection on the body z axis is used.
        let r_held = yaw_rate * e3.dot(&z_b);
        let r = if weight > 0.0 {
            weight * (-u_dot.dot(&x_b) / u_norm) + (1.0 - weight) * r_held
        }
        else {
            r_held
        };

        let body_rates_rads = Vector3::new(p, q, r);

        // ---- ANGULAR ACCELERATION ----

        let s = flat.snap_mssss;
        let c_dot = z_b.dot(&j);
        let c_ddot = z_dot.dot(&j) + z_b.dot(&s);
        let z_ddot = (s - z_b * c_ddot - z_dot * (2.0 * c_dot)) / c;

        let w = body_rates_rads;
        let v = rotation.transpose() * z_ddot - w.cross(&w.cross(&e3));

        let r_dot_held = flat.yaw_acc_radss * e3.dot(&z_b) + yaw_rate * e3.dot(&z_dot);
        let r_dot = if weight > 0.0 {
            let x_b_dot = y_b * r - z_b * q;
            let u_ddot = z_ddot.cross(&x_c)
                + z_dot.cross(&x_c_dot) * 2.0
                + z_b.cross(&x_c_ddot);
            let r_dot_nominal = -(u_ddot.dot(&x_b) + u_dot.dot(&x_b_dot)) / u_norm
                + u_dot.dot(&x_b) * u.dot(&u_dot) / u_norm.powi(3);

            weight * r_dot_nominal + (1.0 - weight) * r_dot_held
        }
        else {
            r_dot_held
        };

        let body_acc_radss = Vector3::new(-v[1], v[0], r_dot);

        let torque_nm = self.inertia * body_acc_radss + w.cross(&(self.inertia * w));

        let attitude = UnitQuaternion::from_rotation_matrix(
            &Rotation3::from_matrix_unchecked(rotation)
        );

        Ok(DesiredState {
            rotation,
            attitude,
            body_rates_rads,
            body_acc_radss,
            torque_nm,
            thrust_n: self.mass_kg * c,
            specific_thrust_mss: t,
            heading_fallback: weight < 1.0,
        })
    }

    /// Find the body y axis from `u = z_b x x_c`.
    ///
    /// Returns the axis and the weight given to the heading construction, 1 away from the
    /// singularity and 0 when the previous axis is held.
    fn y_axis(
        &self,
        z_b: &Vector3<f64>,
        u: &Vector3<f64>,
        prev_y_axis: Option<&Vector3<f64>>
    ) -> (Vector3<f64>, f64) {
        let u_norm = u.norm();
        let weight = ((u_norm - self.heading_epsilon) / self.heading_epsilon).max(0.0).min(1.0);

        if weight >= 1.0 {
            return (u / u_norm, 1.0)
        }

        let held = hold_y_axis(z_b, prev_y_axis);

        if weight <= 0.0 {
            return (held, 0.0)
        }

        let blend = u / u_norm * weight + held * (1.0 - weight);
        let blend_norm = blend.norm();

        if blend_norm > MIN_AXIS_NORM {
            (blend / blend_norm, weight)
        }
        else if weight >= 0.5 {
            (u / u_norm, weight)
        }
        else {
            (held, 0.0)
        }
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

/// Project a previous y axis perpendicular to `z_b`.
///
/// Falls back on the world y and then world x axes if the previous axis is (nearly) parallel to
/// `z_b`. For a unit `z_b` at least one of the world axes always projects to a norm of at least
/// `1 / sqrt(2)`.
fn hold_y_axis(z_b: &Vector3<f64>, prev_y_axis: Option<&Vector3<f64>>) -> Vector3<f64> {
    let world_axes = [Vector3::y(), Vector3::x()];

    for cand in prev_y_axis.into_iter().chain(world_axes.iter()) {
        let proj = cand - z_b * z_b.dot(cand);
        let norm = proj.norm();
        if norm > MIN_HELD_AXIS_NORM {
            return proj / norm
        }
    }

    Vector3::y()
}
