//! # DfCtrl Benchmark

use std::sync::Arc;

use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nalgebra::Vector3;

use comms_if::msg::{RefMsg, StateEstimate, TrajectoryReference, Waypoint};
use df_lib::df_ctrl::{DfCtrl, FlatOutput, FlatnessTransform, InputData, Params};
use util::module::State;

fn load_params() -> Params {
    util::params::from_str(include_str!("../../params/df_ctrl.toml"))
        .expect("Bad benchmark params")
}

/// A point on a 2 m radius circle flown at 1.5 rad/s.
fn circle_flat(t: f64) -> FlatOutput {
    let (r, w) = (2.0, 1.5);
    let (s, c) = (w * t).sin_cos();

    FlatOutput {
        position_m: Vector3::new(r * c, r * s, 1.0),
        velocity_ms: Vector3::new(-r * w * s, r * w * c, 0.0),
        acceleration_mss: Vector3::new(-r * w * w * c, -r * w * w * s, 0.0),
        jerk_msss: Vector3::new(r * w.powi(3) * s, -r * w.powi(3) * c, 0.0),
        snap_mssss: Vector3::new(r * w.powi(4) * c, r * w.powi(4) * s, 0.0),
        yaw_rad: w * t,
        yaw_rate_rads: w,
        yaw_acc_radss: 0.0,
        order: 4,
    }
}

fn df_ctrl_benchmark(c: &mut Criterion) {
    let params = load_params();

    // ---- Flatness transform alone ----

    let transform = FlatnessTransform::new(&params);
    let flat = circle_flat(0.3);
    let prev_y = Vector3::y();

    c.bench_function("flatness_transform", |b| b.iter(|| {
        transform.compute(black_box(&flat), Some(&prev_y))
    }));

    // ---- Full control cycle on a continuous reference ----

    let mut df = DfCtrl::default();
    df.init(Arc::new(params.clone()), None).expect("Could not init DfCtrl");

    let t0 = Utc::now();
    let mut state = StateEstimate::at_rest(t0);
    state.position_m = [2.0, 0.0, 1.0];
    let reference = RefMsg::Trajectory(TrajectoryReference {
        timestamp: Some(t0),
        position_m: Some([2.0, 0.0, 1.0]),
        velocity_ms: Some([0.0, 3.0, 0.0]),
        acceleration_mss: Some([-4.5, 0.0, 0.0]),
        jerk_msss: Some([0.0, -6.75, 0.0]),
        snap_mssss: Some([10.125, 0.0, 0.0]),
        yaw_rad: Some(0.0),
        yaw_rate_rads: Some(0.0),
        yaw_acc_radss: Some(0.0),
    });
    df.proc(&InputData { time: t0, state: Some(state), refs: vec![reference] })
        .expect("DfCtrl processing failed");

    let mut tick: i64 = 0;
    c.bench_function("df_ctrl_tick_trajectory", |b| b.iter(|| {
        tick += 1;
        let time = t0 + Duration::microseconds(tick);
        state.timestamp = time;

        df.proc(black_box(&InputData { time, state: Some(state), refs: vec![] }))
    }));

    // ---- Full control cycle on waypoints ----

    let mut df = DfCtrl::default();
    df.init(Arc::new(params), None).expect("Could not init DfCtrl");

    let waypoints: Vec<RefMsg> = (0..8)
        .map(|i| {
            let f = circle_flat(i as f64 * 0.1);
            RefMsg::Waypoint(Waypoint {
                timestamp: t0 + Duration::milliseconds(i * 100),
                position_m: f.position_m.into(),
                yaw_rad: f.yaw_rad,
            })
        })
        .collect();

    let t_last = t0 + Duration::milliseconds(700);
    let mut state = StateEstimate::at_rest(t_last);
    state.position_m = circle_flat(0.7).position_m.into();
    df.proc(&InputData { time: t_last, state: Some(state), refs: waypoints })
        .expect("DfCtrl processing failed");

    let mut tick: i64 = 0;
    c.bench_function("df_ctrl_tick_waypoints", |b| b.iter(|| {
        tick += 1;
        let time = t_last + Duration::microseconds(tick);
        state.timestamp = time;

        df.proc(black_box(&InputData { time, state: Some(state), refs: vec![] }))
    }));
}

criterion_group!(benches, df_ctrl_benchmark);
criterion_main!(benches);
