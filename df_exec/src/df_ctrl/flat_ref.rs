//! # Flat output reference generator
//!
//! Turns the active reference into a flat output (position and yaw with their derivatives)
//! sampled at the cycle time.
//!
//! Continuous trajectory references are propagated from their own timestamp to the cycle time
//! using the derivatives they carry. Discrete waypoints have their derivatives recovered by a
//! least squares polynomial fit over the most recent waypoints, which is then evaluated (and
//! differentiated) at the cycle time.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use std::collections::VecDeque;
use chrono::{DateTime, Utc};
use log::trace;
use nalgebra::{DMatrix, Vector3};

// Internal
use comms_if::msg::{TrajectoryReference, Waypoint};
use util::{
    maths::{poly_deriv, poly_val, unwrap_near, wrap_pi},
    time::seconds_between
};
use super::{DfCtrlError, ReferenceParams};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Highest position derivative used by the flatness transform (snap).
pub const MAX_FLAT_ORDER: usize = 4;

/// Singular value threshold used when solving the waypoint fit.
const FIT_SVD_EPS: f64 = 1e-12;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// The flat outputs of the vehicle and their derivatives at a single instant.
///
/// All vectors are in the world frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlatOutput {
    pub position_m: Vector3<f64>,
    pub velocity_ms: Vector3<f64>,
    pub acceleration_mss: Vector3<f64>,
    pub jerk_msss: Vector3<f64>,
    pub snap_mssss: Vector3<f64>,

    pub yaw_rad: f64,
    pub yaw_rate_rads: f64,
    pub yaw_acc_radss: f64,

    /// Highest position derivative actually supplied by the reference, anything above it is
    /// zero. Body rate feedforward needs at least 3 (jerk), angular acceleration feedforward
    /// needs 4 (snap).
    pub order: usize,
}

/// Values substituted for parts of the reference that are missing.
#[derive(Debug, Clone, Copy)]
pub struct RefFallback {
    /// Position to use if the reference has none. If `None` a reference without a position
    /// cannot be sampled.
    pub position_m: Option<Vector3<f64>>,

    /// Yaw to use if the reference has none
    pub yaw_rad: f64,
}

/// The reference generator.
///
/// Holds the buffer of recent waypoints, continuous references are sampled without side
/// effects.
#[derive(Debug, Clone)]
pub struct RefGenerator {
    params: ReferenceParams,

    /// Most recent waypoints, oldest first
    waypoints: VecDeque<Waypoint>,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// The reference currently being tracked.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActiveRef {
    /// The latest continuous trajectory sample
    Trajectory(TrajectoryReference),

    /// The waypoint buffer held by the generator
    Waypoints,

    /// A fixed point captured when hover was entered
    Hover {
        position_m: Vector3<f64>,
        yaw_rad: f64,
    },
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl FlatOutput {
    /// A stationary flat output.
    pub fn hover(position_m: Vector3<f64>, yaw_rad: f64) -> Self {
        Self {
            position_m,
            velocity_ms: Vector3::zeros(),
            acceleration_mss: Vector3::zeros(),
            jerk_msss: Vector3::zeros(),
            snap_mssss: Vector3::zeros(),
            yaw_rad,
            yaw_rate_rads: 0.0,
            yaw_acc_radss: 0.0,
            order: MAX_FLAT_ORDER,
        }
    }

    /// Copy of this output with the acceleration replaced.
    pub fn with_acceleration(&self, acceleration_mss: Vector3<f64>) -> Self {
        Self {
            acceleration_mss,
            ..*self
        }
    }
}

impl RefGenerator {
    pub fn new(params: ReferenceParams) -> Self {
        Self {
            waypoints: VecDeque::with_capacity(params.fit_window + 1),
            params,
        }
    }

    /// Add a waypoint to the fit buffer.
    ///
    /// A waypoint with the same timestamp as the newest one replaces it, one older than the
    /// newest is rejected and `false` is returned.
    pub fn push_waypoint(&mut self, waypoint: Waypoint) -> bool {
        if let Some(last) = self.waypoints.back() {
            if waypoint.timestamp < last.timestamp {
                return false
            }
            if waypoint.timestamp == last.timestamp {
                self.waypoints.pop_back();
            }
        }

        self.waypoints.push_back(waypoint);

        while self.waypoints.len() > self.params.fit_window {
            self.waypoints.pop_front();
        }

        true
    }

    /// Empty the waypoint buffer.
    pub fn clear_waypoints(&mut self) {
        self.waypoints.clear();
    }

    pub fn num_waypoints(&self) -> usize {
        self.waypoints.len()
    }

    /// Sample the active reference at the given time.
    pub fn sample(
        &self,
        reference: &ActiveRef,
        time: DateTime<Utc>,
        fallback: &RefFallback
    ) -> Result<FlatOutput, DfCtrlError> {
        match reference {
            ActiveRef::Trajectory(r) => self.sample_trajectory(r, time, fallback),
            ActiveRef::Waypoints => self.sample_waypoints(time),
            ActiveRef::Hover { position_m, yaw_rad } => Ok(FlatOutput::hover(*position_m, *yaw_rad))
        }
    }

    /// Propagate a continuous reference to the given time.
    ///
    /// The reference is propagated forward from its timestamp by at most `max_extrapolation_s`,
    /// a reference stamped in the future is used as is.
    pub fn sample_trajectory(
        &self,
        reference: &TrajectoryReference,
        time: DateTime<Utc>,
        fallback: &RefFallback
    ) -> Result<FlatOutput, DfCtrlError> {
        let p0 = match (reference.position_m, fallback.position_m) {
            (Some(p), _) => Vector3::from(p),
            (None, Some(p)) => p,
            (None, None) => return Err(DfCtrlError::InsufficientReferenceData(
                "trajectory reference has no position".into()
            ))
        };

        let order = if reference.snap_mssss.is_some() { 4 }
            else if reference.jerk_msss.is_some() { 3 }
            else if reference.acceleration_mss.is_some() { 2 }
            else if reference.velocity_ms.is_some() { 1 }
            else { 0 };

        let vec_or_zero = |v: Option<[f64; 3]>| v.map(Vector3::from).unwrap_or_else(Vector3::zeros);
        let v0 = vec_or_zero(reference.velocity_ms);
        let a0 = vec_or_zero(reference.acceleration_mss);
        let j0 = vec_or_zero(reference.jerk_msss);
        let s0 = vec_or_zero(reference.snap_mssss);

        let yaw0 = reference.yaw_rad.unwrap_or(fallback.yaw_rad);
        let yaw_rate0 = reference.yaw_rate_rads.unwrap_or(0.0);
        let yaw_acc0 = reference.yaw_acc_radss.unwrap_or(0.0);

        let dt = match reference.timestamp {
            Some(ts) => seconds_between(&ts, &time)
                .max(0.0)
                .min(self.params.max_extrapolation_s),
            None => 0.0
        };

        let dt2 = dt * dt;
        let dt3 = dt2 * dt;
        let dt4 = dt3 * dt;

        Ok(FlatOutput {
            position_m: p0 + v0 * dt + a0 * (dt2 / 2.0) + j0 * (dt3 / 6.0) + s0 * (dt4 / 24.0),
            velocity_ms: v0 + a0 * dt + j0 * (dt2 / 2.0) + s0 * (dt3 / 6.0),
            acceleration_mss: a0 + j0 * dt + s0 * (dt2 / 2.0),
            jerk_msss: j0 + s0 * dt,
            snap_mssss: s0,
            yaw_rad: wrap_pi(yaw0 + yaw_rate0 * dt + yaw_acc0 * dt2 / 2.0),
            yaw_rate_rads: yaw_rate0 + yaw_acc0 * dt,
            yaw_acc_radss: yaw_acc0,
            order,
        })
    }

    /// Fit a polynomial through the buffered waypoints and evaluate it at the given time.
    ///
    /// The order of the fit is `min(poly_order, n - 1)` for `n` waypoints. Times are measured
    /// relative to the newest waypoint, and the fit is evaluated no earlier than the oldest
    /// waypoint and no later than `max_extrapolation_s` after the newest.
    pub fn sample_waypoints(&self, time: DateTime<Utc>) -> Result<FlatOutput, DfCtrlError> {
        let (first, last) = match (self.waypoints.front(), self.waypoints.back()) {
            (Some(f), Some(l)) => (f, l),
            _ => return Err(DfCtrlError::InsufficientReferenceData(
                "no waypoints have been received".into()
            ))
        };

        let n = self.waypoints.len();
        let order = self.params.poly_order.min(n - 1);

        // Sample times relative to the newest waypoint, all <= 0
        let taus: Vec<f64> = self.waypoints
            .iter()
            .map(|w| seconds_between(&last.timestamp, &w.timestamp))
            .collect();

        let tau = seconds_between(&last.timestamp, &time)
            .max(seconds_between(&last.timestamp, &first.timestamp))
            .min(self.params.max_extrapolation_s);

        let mut yaws = Vec::with_capacity(n);
        let mut prev_yaw = first.yaw_rad;
        for w in self.waypoints.iter() {
            prev_yaw = unwrap_near(w.yaw_rad, prev_yaw);
            yaws.push(prev_yaw);
        }

        // Columns are x, y, z and unwrapped yaw
        let b = DMatrix::from_fn(n, 4, |r, c| match c {
            3 => yaws[r],
            _ => self.waypoints[r].position_m[c]
        });

        let coeffs = if order == 0 {
            // Least squares constant is the mean
            DMatrix::from_fn(1, 4, |_, c| b.column(c).mean())
        }
        else {
            let a = DMatrix::from_fn(n, order + 1, |r, c| taus[r].powi((order - c) as i32));

            a.svd(true, true)
                .solve(&b, FIT_SVD_EPS)
                .map_err(|e| DfCtrlError::InsufficientReferenceData(
                    format!("waypoint fit failed: {}", e)
                ))?
        };

        // Evaluate each column and its derivatives up to snap
        let mut derivs = [[0f64; MAX_FLAT_ORDER + 1]; 4];
        for (c, d) in derivs.iter_mut().enumerate() {
            let mut poly: Vec<f64> = coeffs.column(c).iter().cloned().collect();
            for v in d.iter_mut() {
                *v = poly_val(&tau, &poly);
                poly = poly_deriv(&poly);
            }
        }

        trace!(
            "Waypoint fit of order {} over {} points evaluated at {:.3} s",
            order, n, tau
        );

        let vec_of = |k: usize| Vector3::new(derivs[0][k], derivs[1][k], derivs[2][k]);

        Ok(FlatOutput {
            position_m: vec_of(0),
            velocity_ms: vec_of(1),
            acceleration_mss: vec_of(2),
            jerk_msss: vec_of(3),
            snap_mssss: vec_of(4),
            yaw_rad: wrap_pi(derivs[3][0]),
            yaw_rate_rads: derivs[3][1],
            yaw_acc_radss: derivs[3][2],
            order: order.min(MAX_FLAT_ORDER),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::Duration;

    fn generator() -> RefGenerator {
        RefGenerator::new(ReferenceParams {
            poly_order: 4,
            fit_window: 6,
            max_extrapolation_s: 0.5,
        })
    }

    fn no_fallback() -> RefFallback {
        RefFallback {
            position_m: None,
            yaw_rad: 0.0
        }
    }

    #[test]
    fn test_trajectory_propagation() {
        let gen = generator();
        let t0 = Utc::now();

        let r = TrajectoryReference {
            timestamp: Some(t0),
            position_m: Some([1.0, 0.0, 2.0]),
            velocity_ms: Some([1.0, 0.0, 0.0]),
            acceleration_mss: Some([0.0, 2.0, 0.0]),
            jerk_msss: Some([0.0, 0.0, 6.0]),
            yaw_rad: Some(0.5),
            yaw_rate_rads: Some(1.0),
            ..Default::default()
        };

        let f = gen.sample_trajectory(&r, t0 + Duration::milliseconds(100), &no_fallback())
            .unwrap();

        assert_eq!(f.order, 3);
        assert_relative_eq!(f.position_m, Vector3::new(1.1, 0.01, 2.001), epsilon = 1e-12);
        assert_relative_eq!(f.velocity_ms, Vector3::new(1.0, 0.2, 0.03), epsilon = 1e-12);
        assert_relative_eq!(f.acceleration_mss, Vector3::new(0.0, 2.0, 0.6), epsilon = 1e-12);
        assert_relative_eq!(f.jerk_msss, Vector3::new(0.0, 0.0, 6.0), epsilon = 1e-12);
        assert_relative_eq!(f.snap_mssss, Vector3::zeros());
        assert_relative_eq!(f.yaw_rad, 0.6, epsilon = 1e-12);

        // Sampling has no side effects on the reference
        assert_eq!(r.position_m, Some([1.0, 0.0, 2.0]));
    }

    #[test]
    fn test_trajectory_extrapolation_bound() {
        let gen = generator();
        let t0 = Utc::now();

        let r = TrajectoryReference {
            timestamp: Some(t0),
            position_m: Some([0.0, 0.0, 1.0]),
            velocity_ms: Some([2.0, 0.0, 0.0]),
            ..Default::default()
        };

        let f = gen.sample_trajectory(&r, t0 + Duration::seconds(10), &no_fallback())
            .unwrap();
        assert_relative_eq!(f.position_m[0], 1.0, epsilon = 1e-12);

        // Future references are not propagated backwards
        let f = gen.sample_trajectory(&r, t0 - Duration::seconds(1), &no_fallback())
            .unwrap();
        assert_relative_eq!(f.position_m[0], 0.0);
    }

    #[test]
    fn test_trajectory_missing_position() {
        let gen = generator();
        let r = TrajectoryReference {
            velocity_ms: Some([1.0, 0.0, 0.0]),
            ..Default::default()
        };

        assert!(matches!(
            gen.sample_trajectory(&r, Utc::now(), &no_fallback()),
            Err(DfCtrlError::InsufficientReferenceData(_))
        ));

        let fallback = RefFallback {
            position_m: Some(Vector3::new(3.0, 2.0, 1.0)),
            yaw_rad: 0.3
        };
        let f = gen.sample_trajectory(&r, Utc::now(), &fallback).unwrap();
        assert_eq!(f.position_m, Vector3::new(3.0, 2.0, 1.0));
        assert_eq!(f.yaw_rad, 0.3);
        assert_eq!(f.order, 1);
    }

    #[test]
    fn test_waypoint_fit_recovers_derivatives() {
        let mut gen = generator();
        let t0 = Utc::now();

        // x = t^2, y = t^3, z = 1, yaw = 0.1 t
        for i in 0..6 {
            let t = i as f64 * 0.2;
            gen.push_waypoint(Waypoint {
                timestamp: t0 + Duration::milliseconds(i * 200),
                position_m: [t * t, t * t * t, 1.0],
                yaw_rad: 0.1 * t
            });
        }
        assert_eq!(gen.num_waypoints(), 6);

        // Sample at t = 0.9, between waypoints
        let f = gen.sample_waypoints(t0 + Duration::milliseconds(900)).unwrap();

        assert_eq!(f.order, 4);
        assert_relative_eq!(f.position_m, Vector3::new(0.81, 0.729, 1.0), epsilon = 1e-8);
        assert_relative_eq!(f.velocity_ms, Vector3::new(1.8, 2.43, 0.0), epsilon = 1e-7);
        assert_relative_eq!(f.acceleration_mss, Vector3::new(2.0, 5.4, 0.0), epsilon = 1e-6);
        assert_relative_eq!(f.jerk_msss, Vector3::new(0.0, 6.0, 0.0), epsilon = 1e-5);
        assert_relative_eq!(f.yaw_rad, 0.09, epsilon = 1e-8);
        assert_relative_eq!(f.yaw_rate_rads, 0.1, epsilon = 1e-7);
    }

    #[test]
    fn test_waypoint_window_and_order() {
        let mut gen = generator();
        let t0 = Utc::now();

        assert!(matches!(
            gen.sample_waypoints(t0),
            Err(DfCtrlError::InsufficientReferenceData(_))
        ));

        // A single waypoint gives position only
        gen.push_waypoint(Waypoint {
            timestamp: t0,
            position_m: [1.0, 2.0, 3.0],
            yaw_rad: 0.0
        });
        let f = gen.sample_waypoints(t0 + Duration::milliseconds(50)).unwrap();
        assert_eq!(f.order, 0);
        assert_relative_eq!(f.position_m, Vector3::new(1.0, 2.0, 3.0), epsilon = 1e-12);
        assert_relative_eq!(f.velocity_ms, Vector3::zeros());

        // Two waypoints give a line
        gen.push_waypoint(Waypoint {
            timestamp: t0 + Duration::seconds(1),
            position_m: [2.0, 2.0, 3.0],
            yaw_rad: 0.0
        });
        let f = gen.sample_waypoints(t0 + Duration::seconds(1)).unwrap();
        assert_eq!(f.order, 1);
        assert_relative_eq!(f.velocity_ms, Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-9);

        // Out of order waypoints are rejected
        assert!(!gen.push_waypoint(Waypoint {
            timestamp: t0,
            position_m: [0.0; 3],
            yaw_rad: 0.0
        }));

        // The buffer never grows beyond the window
        for i in 2..20 {
            gen.push_waypoint(Waypoint {
                timestamp: t0 + Duration::seconds(i),
                position_m: [i as f64, 0.0, 0.0],
                yaw_rad: 0.0
            });
        }
        assert_eq!(gen.num_waypoints(), 6);

        gen.clear_waypoints();
        assert_eq!(gen.num_waypoints(), 0);
    }

    #[test]
    fn test_waypoint_yaw_unwrap() {
        let mut gen = generator();
        let t0 = Utc::now();
        let pi = std::f64::consts::PI;

        // Constant yaw rate of 1 rad/s crossing +pi
        for i in 0..4 {
            let yaw = wrap_pi(pi - 0.15 + 0.1 * i as f64);
            gen.push_waypoint(Waypoint {
                timestamp: t0 + Duration::milliseconds(i * 100),
                position_m: [0.0; 3],
                yaw_rad: yaw
            });
        }

        let f = gen.sample_waypoints(t0 + Duration::milliseconds(300)).unwrap();
        assert_relative_eq!(f.yaw_rate_rads, 1.0, epsilon = 1e-6);
        assert_relative_eq!(f.yaw_rad, wrap_pi(pi + 0.15), epsilon = 1e-8);
    }
}
