//! DfCtrl module state and the control loop state machine

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use std::sync::Arc;
use std::time::Instant;
use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use nalgebra::Vector3;
use serde::Serialize;

// Internal
use comms_if::msg::{ActuatorCmd, ControlMode, RefMsg, StateEstimate, YawMode};
use util::{
    archive::{Archived, ArchiveError, Archiver},
    module::State,
    session::{get_elapsed_seconds, Session},
    time::seconds_between
};
use super::*;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Differential flatness control module state
#[derive(Default)]
pub struct DfCtrl {
    params: Option<Arc<Params>>,
    parts: Option<Components>,

    /// Executing mode
    mode: DfCtrlMode,

    control_mode: ControlMode,
    yaw_mode: YawMode,

    /// The reference being tracked, `None` until one is received
    active_ref: Option<ActiveRef>,

    /// Latest accepted state estimate
    state: Option<VehicleState>,

    /// Heading used when the reference does not specify one
    held_yaw: Option<f64>,

    /// Point held while a speed mode reference is close to zero
    speed_hover: Option<(Vector3<f64>, f64)>,

    prev_y_axis: Option<Vector3<f64>>,
    last_tick: Option<DateTime<Utc>>,
    saturation: SaturationReport,
    degenerate_count: u32,
    holding: bool,

    /// Time from which the reference has been continuously unusable
    insufficient_since: Option<DateTime<Utc>>,

    fault: FaultMonitor,

    /// Last command computed from a successful cycle
    last_cmd: Option<ActuatorCmd>,

    report: StatusReport,
    arch_report: Archiver,

    /// The command emitted on the last cycle
    output: Option<ActuatorCmd>,
    arch_output: Archiver,
}

/// The processing stages, built from the parameters on initialisation.
struct Components {
    generator: RefGenerator,
    transform: FlatnessTransform,
    corrector: FeedbackCorrector,
    output: OutputStage,
}

/// Fault bookkeeping for the loop driver.
#[derive(Debug, Default, Clone, Copy)]
struct FaultMonitor {
    cause: Option<FaultCause>,

    /// Time from which the state estimate has been continuously fresh while faulted
    fresh_since: Option<DateTime<Utc>>,

    /// Time at which running last (re)started
    running_since: Option<DateTime<Utc>>,

    consecutive_faults: u32,

    /// If true the fault is persistent and only an explicit reset clears it
    latched: bool,
}

/// Input data to DfCtrl.
#[derive(Debug, Clone)]
pub struct InputData {
    /// Time of the cycle
    pub time: DateTime<Utc>,

    /// Latest state estimate, or `None` if no new estimate arrived since the last cycle
    pub state: Option<StateEstimate>,

    /// Reference messages received since the last cycle, oldest first
    pub refs: Vec<RefMsg>,
}

/// Status report for DfCtrl processing.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatusReport {
    pub mode: DfCtrlMode,
    pub control_mode: ControlMode,
    pub fault: Option<FaultCause>,
    pub consecutive_faults: u32,

    /// Age of the state estimate at the cycle time, infinite if there is none
    pub state_age_s: f64,

    /// Time since the previous cycle
    pub dt_s: f64,

    /// Processing time of this cycle
    pub tick_duration_s: f64,

    /// The previous command was repeated
    pub held_cmd: bool,

    /// The reference could not be sampled
    pub insufficient_ref: bool,

    /// The flatness transform had no valid attitude
    pub degenerate: bool,

    /// The heading singularity fallback was used
    pub heading_fallback: bool,

    /// Derivative order of the sampled reference
    pub flat_order: usize,

    pub errors: TrackingErrors,
    pub saturation: SaturationReport,
}

/// Flattened status report written to the archive.
#[derive(Serialize)]
struct ReportRecord {
    time_s: f64,
    mode: DfCtrlMode,
    control_mode: ControlMode,
    fault: Option<FaultCause>,
    consecutive_faults: u32,
    state_age_s: f64,
    dt_s: f64,
    tick_duration_s: f64,
    held_cmd: bool,
    insufficient_ref: bool,
    degenerate: bool,
    heading_fallback: bool,
    flat_order: usize,
    pos_err_x_m: f64,
    pos_err_y_m: f64,
    pos_err_z_m: f64,
    vel_err_x_ms: f64,
    vel_err_y_ms: f64,
    vel_err_z_ms: f64,
    att_err_x: f64,
    att_err_y: f64,
    att_err_z: f64,
    integral_x: f64,
    integral_y: f64,
    integral_z: f64,
    rate_err_x_rads: f64,
    rate_err_y_rads: f64,
    rate_err_z_rads: f64,
    thrust_sat: bool,
    rate_sat_x: bool,
    rate_sat_y: bool,
    rate_sat_z: bool,
    acc_sat: bool,
    torque_sat: bool,
}

/// Flattened actuator command written to the archive.
#[derive(Serialize)]
struct OutputRecord {
    time_s: f64,
    thrust_n: f64,
    thrust_norm: f64,
    q_x: f64,
    q_y: f64,
    q_z: f64,
    q_w: f64,
    rate_x_rads: f64,
    rate_y_rads: f64,
    rate_z_rads: f64,
    acc_x_radss: f64,
    acc_y_radss: f64,
    acc_z_radss: f64,
    torque_x_nm: f64,
    torque_y_nm: f64,
    torque_z_nm: f64,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// The possible modes of execution of DfCtrl. Each mode is handled by a `mode_xyz` function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DfCtrlMode {
    /// No state estimate has been received yet
    Uninitialised,

    /// State is known, waiting for a reference. Zero thrust is commanded.
    Armed,

    /// Tracking the reference
    Running,

    /// A fault has occured, the fault command is output until recovery or reset
    Faulted,

    /// Stopped on request, zero thrust is commanded until reset
    Stopped,
}

/// Causes of a transition into `Faulted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FaultCause {
    StaleState,
    DegenerateAttitude,
    InvalidState,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Default for DfCtrlMode {
    fn default() -> Self {
        DfCtrlMode::Uninitialised
    }
}

impl State for DfCtrl {
    type InitData = Arc<Params>;
    type InitError = DfCtrlError;

    type InputData = InputData;
    type OutputData = ActuatorCmd;
    type StatusReport = StatusReport;
    type ProcError = DfCtrlError;

    /// Initialise the DfCtrl module.
    ///
    /// Expected init data is the loaded parameters, which are validated here.
    fn init(&mut self, init_data: Self::InitData, session: Option<&Session>)
        -> Result<(), Self::InitError>
    {
        init_data.validate()?;

        if let Some(session) = session {
            self.arch_report = Archiver::from_path(session, "df_ctrl/status_report.csv")?;
            self.arch_output = Archiver::from_path(session, "df_ctrl/output.csv")?;
        }

        self.parts = Some(Components {
            generator: RefGenerator::new(init_data.reference.clone()),
            transform: FlatnessTransform::new(&init_data),
            corrector: FeedbackCorrector::new(&init_data),
            output: OutputStage::new(&init_data),
        });
        self.control_mode = init_data.control.initial_control_mode;
        self.yaw_mode = init_data.control.initial_yaw_mode;
        self.params = Some(init_data);
        self.mode = DfCtrlMode::Uninitialised;

        info!(
            "DfCtrl initialised in {:?}/{:?} mode",
            self.control_mode, self.yaw_mode
        );

        Ok(())
    }

    /// Perform one control cycle.
    ///
    /// Processing involves:
    ///  1. Ingest the new state estimate and reference messages.
    ///  1. Check the age of the state estimate.
    ///  1. Run the current mode, which for `Running` samples the reference and passes it
    ///     through the flatness transform, the feedback corrector and the output stage.
    ///
    /// Only an uninitialised module returns an error, all other failures are handled by
    /// changing mode and emitting a safe command.
    fn proc(&mut self, input_data: &Self::InputData)
        -> Result<(Self::OutputData, Self::StatusReport), Self::ProcError>
    {
        let tick_start = Instant::now();
        let params = self.params()?;
        let time = input_data.time;

        // Setup cycle data
        self.report = StatusReport::default();

        let dt = match self.last_tick {
            Some(prev) => seconds_between(&prev, &time),
            None => params.period_s()
        };
        if dt > 0.0 {
            self.last_tick = Some(time);
        }
        self.report.dt_s = dt;

        if let Some(est) = input_data.state.as_ref() {
            self.ingest_state(est);
        }
        for msg in input_data.refs.iter() {
            self.handle_ref(msg);
        }

        let state_age = self.state.map(|s| seconds_between(&s.timestamp, &time));
        self.report.state_age_s = state_age.unwrap_or(std::f64::INFINITY);
        let fresh = match state_age {
            Some(age) => age <= params.loop_cfg.stale_timeout_s,
            None => false
        };

        // Mode execution
        let output = match self.mode {
            DfCtrlMode::Uninitialised => self.mode_uninitialised(time, dt, fresh),
            DfCtrlMode::Armed => self.mode_armed(time, dt, fresh),
            DfCtrlMode::Running => self.mode_running(time, dt, fresh),
            DfCtrlMode::Faulted => self.mode_faulted(time, dt, fresh),
            DfCtrlMode::Stopped => ActuatorCmd::zero(time)
        };

        self.report.mode = self.mode;
        self.report.control_mode = self.control_mode;
        self.report.fault = self.fault.cause;
        self.report.consecutive_faults = self.fault.consecutive_faults;
        self.report.saturation = self.saturation;
        self.report.tick_duration_s = tick_start.elapsed().as_secs_f64();

        trace!(
            "DfCtrl output ({:?}): thrust {:.3} N, rates {:?}",
            self.mode, output.thrust_n, output.body_rates_rads
        );

        self.output = Some(output);

        Ok((output, self.report))
    }
}

impl Archived for DfCtrl {
    fn write(&mut self) -> Result<(), ArchiveError> {
        let time_s = get_elapsed_seconds();
        let r = &self.report;

        self.arch_report.serialise(ReportRecord {
            time_s,
            mode: r.mode,
            control_mode: r.control_mode,
            fault: r.fault,
            consecutive_faults: r.consecutive_faults,
            state_age_s: r.state_age_s,
            dt_s: r.dt_s,
            tick_duration_s: r.tick_duration_s,
            held_cmd: r.held_cmd,
            insufficient_ref: r.insufficient_ref,
            degenerate: r.degenerate,
            heading_fallback: r.heading_fallback,
            flat_order: r.flat_order,
            pos_err_x_m: r.errors.position_m[0],
            pos_err_y_m: r.errors.position_m[1],
            pos_err_z_m: r.errors.position_m[2],
            vel_err_x_ms: r.errors.velocity_ms[0],
            vel_err_y_ms: r.errors.velocity_ms[1],
            vel_err_z_ms: r.errors.velocity_ms[2],
            att_err_x: r.errors.attitude[0],
            att_err_y: r.errors.attitude[1],
            att_err_z: r.errors.attitude[2],
            integral_x: r.errors.integral[0],
            integral_y: r.errors.integral[1],
            integral_z: r.errors.integral[2],
            rate_err_x_rads: r.errors.body_rates_rads[0],
            rate_err_y_rads: r.errors.body_rates_rads[1],
            rate_err_z_rads: r.errors.body_rates_rads[2],
            thrust_sat: r.saturation.thrust_low || r.saturation.thrust_high,
            rate_sat_x: r.saturation.body_rates[0],
            rate_sat_y: r.saturation.body_rates[1],
            rate_sat_z: r.saturation.body_rates[2],
            acc_sat: r.saturation.body_acc.iter().any(|s| *s),
            torque_sat: r.saturation.torque.iter().any(|s| *s),
        })?;

        if let Some(o) = self.output {
            self.arch_output.serialise(OutputRecord {
                time_s,
                thrust_n: o.thrust_n,
                thrust_norm: o.thrust_norm,
                q_x: o.attitude_q[0],
                q_y: o.attitude_q[1],
                q_z: o.attitude_q[2],
                q_w: o.attitude_q[3],
                rate_x_rads: o.body_rates_rads[0],
                rate_y_rads: o.body_rates_rads[1],
                rate_z_rads: o.body_rates_rads[2],
                acc_x_radss: o.body_acc_radss[0],
                acc_y_radss: o.body_acc_radss[1],
                acc_z_radss: o.body_acc_radss[2],
                torque_x_nm: o.torque_nm[0],
                torque_y_nm: o.torque_nm[1],
                torque_z_nm: o.torque_nm[2],
            })?;
        }

        Ok(())
    }
}

impl DfCtrl {
    /// Current mode of execution.
    pub fn mode(&self) -> DfCtrlMode {
        self.mode
    }

    /// True if the controller is faulted and will not recover without a reset.
    pub fn is_latched(&self) -> bool {
        self.fault.latched
    }

    pub fn control_mode(&self) -> (ControlMode, YawMode) {
        (self.control_mode, self.yaw_mode)
    }

    /// Stop the controller. Zero thrust is output until `reset` is called.
    pub fn stop(&mut self) {
        if self.mode != DfCtrlMode::Stopped {
            info!("DfCtrl stopped from {:?}", self.mode);
            self.mode = DfCtrlMode::Stopped;
        }
    }

    /// Clear any stop or fault, including a latched one.
    ///
    /// The controller returns to `Armed` (or `Uninitialised` if no state is known) and waits for
    /// a new reference.
    pub fn reset(&mut self) {
        if self.params.is_none() {
            return
        }

        info!("DfCtrl reset from {:?}", self.mode);

        self.mode = match self.state {
            Some(_) => DfCtrlMode::Armed,
            None => DfCtrlMode::Uninitialised
        };
        self.fault = FaultMonitor::default();
        self.active_ref = None;
        self.speed_hover = None;
        self.prev_y_axis = None;
        self.last_cmd = None;
        self.saturation = SaturationReport::default();
        self.degenerate_count = 0;
        self.holding = false;
        self.insufficient_since = None;
        self.held_yaw = self.state.map(|s| s.yaw());

        if let Some(parts) = self.parts.as_mut() {
            parts.generator.clear_waypoints();
            parts.corrector.reset();
        }
    }

    fn params(&self) -> Result<Arc<Params>, DfCtrlError> {
        self.params.clone().ok_or(DfCtrlError::NotInitialised)
    }

    /// Accept a new state estimate, unless it is invalid or older than the current one.
    fn ingest_state(&mut self, est: &StateEstimate) {
        match VehicleState::from_estimate(est) {
            Ok(vs) => {
                if let Some(current) = self.state {
                    if vs.timestamp < current.timestamp {
                        debug!("Discarding out of order state estimate");
                        return
                    }
                }
                if self.held_yaw.is_none() {
                    self.held_yaw = Some(vs.yaw());
                }
                self.state = Some(vs);
            },
            Err(e) => warn!("Rejected state estimate: {}", e)
        }
    }

    /// Apply a reference message.
    fn handle_ref(&mut self, msg: &RefMsg) {
        match msg {
            RefMsg::Stop => self.stop(),
            RefMsg::Reset => self.reset(),
            RefMsg::SetMode { control_mode, yaw_mode } => {
                self.set_mode(*control_mode, *yaw_mode)
            },
            RefMsg::Trajectory(r) => {
                if self.control_mode == ControlMode::Hover {
                    trace!("Ignoring trajectory reference in hover mode");
                    return
                }
                self.active_ref = Some(ActiveRef::Trajectory(*r));
            },
            RefMsg::Waypoint(w) => {
                if self.control_mode == ControlMode::Hover {
                    trace!("Ignoring waypoint in hover mode");
                    return
                }
                let accepted = match self.parts.as_mut() {
                    Some(p) => p.generator.push_waypoint(*w),
                    None => false
                };
                if accepted {
                    self.active_ref = Some(ActiveRef::Waypoints);
                }
                else {
                    warn!("Discarding out of order waypoint at {}", w.timestamp);
                }
            }
        }
    }

    /// Change the control and yaw modes.
    ///
    /// Any held reference is discarded since it belongs to the previous mode. While flying the
    /// vehicle holds its current position and heading until a reference for the new mode
    /// arrives. Entering hover always captures the current position and heading.
    fn set_mode(&mut self, control_mode: ControlMode, yaw_mode: YawMode) {
        if control_mode == self.control_mode && yaw_mode == self.yaw_mode {
            return
        }

        info!(
            "Control mode changed from {:?}/{:?} to {:?}/{:?}",
            self.control_mode, self.yaw_mode, control_mode, yaw_mode
        );

        self.control_mode = control_mode;
        self.yaw_mode = yaw_mode;
        self.active_ref = None;
        self.speed_hover = None;
        self.held_yaw = self.state.map(|s| s.yaw());

        if let Some(p) = self.parts.as_mut() {
            p.generator.clear_waypoints();
        }

        if let Some(state) = self.state {
            match self.mode {
                DfCtrlMode::Running | DfCtrlMode::Faulted => self.hold_position(&state),
                _ => self.ensure_hover_ref(&state)
            }
        }
    }

    /// In hover mode make sure there is a hover point to hold.
    fn ensure_hover_ref(&mut self, state: &VehicleState) {
        if self.control_mode == ControlMode::Hover && self.active_ref.is_none() {
            self.hold_position(state);
        }
    }

    /// Replace the active reference by the current position and heading, at rest.
    fn hold_position(&mut self, state: &VehicleState) {
        info!(
            "Hovering at [{:.3}, {:.3}, {:.3}] m, yaw {:.3} rad",
            state.position_m[0], state.position_m[1], state.position_m[2], state.yaw()
        );

        if let Some(p) = self.parts.as_mut() {
            p.generator.clear_waypoints();
        }
        self.active_ref = Some(ActiveRef::Hover {
            position_m: state.position_m,
            yaw_rad: state.yaw()
        });
    }

    // ---- MODES ----

    fn mode_uninitialised(&mut self, time: DateTime<Utc>, dt: f64, fresh: bool) -> ActuatorCmd {
        if self.state.is_some() {
            info!("Initial state estimate received, DfCtrl armed");
            self.mode = DfCtrlMode::Armed;
            return self.mode_armed(time, dt, fresh)
        }

        ActuatorCmd::zero(time)
    }

    fn mode_armed(&mut self, time: DateTime<Utc>, dt: f64, fresh: bool) -> ActuatorCmd {
        if !fresh {
            return ActuatorCmd::zero(time)
        }

        if let Some(state) = self.state {
            self.ensure_hover_ref(&state);
        }

        if self.active_ref.is_none() {
            return ActuatorCmd::zero(time)
        }

        // Only start running once the reference can actually be tracked
        match self.run_tick(time, dt) {
            Ok(cmd) => {
                info!("Reference received, DfCtrl running");
                self.mode = DfCtrlMode::Running;
                self.fault.running_since = Some(time);
                self.accept_command(cmd)
            },
            Err(e) => {
                trace!("Waiting for a usable reference: {}", e);
                ActuatorCmd::zero(time)
            }
        }
    }

    fn mode_running(&mut self, time: DateTime<Utc>, dt: f64, fresh: bool) -> ActuatorCmd {
        if !fresh {
            return self.enter_fault(FaultCause::StaleState, time)
        }

        if dt <= 0.0 {
            warn!("Non-positive cycle time step ({} s), repeating the previous command", dt);
            return self.hold_command(time)
        }

        match self.run_tick(time, dt) {
            Ok(cmd) => self.accept_command(cmd),
            Err(DfCtrlError::InsufficientReferenceData(reason)) => {
                self.report.insufficient_ref = true;

                let since = *self.insufficient_since.get_or_insert(time);
                let held_for_s = seconds_between(&since, &time);
                let max_hold_s = self.params
                    .as_ref()
                    .map(|p| p.loop_cfg.max_hold_s)
                    .unwrap_or(0.0);

                if held_for_s > max_hold_s {
                    if let Some(state) = self.state {
                        warn!(
                            "No usable reference for {:.3} s ({}), hovering in place",
                            held_for_s, reason
                        );
                        self.hold_position(&state);

                        match self.run_tick(time, dt) {
                            Ok(cmd) => return self.accept_command(cmd),
                            Err(e) => warn!("Could not hover in place: {}", e)
                        }
                    }
                }
                else if !self.holding {
                    warn!("Holding the last command: {}", reason);
                }

                self.hold_command(time)
            },
            Err(DfCtrlError::DegenerateAttitude(norm)) => {
                self.report.degenerate = true;
                self.degenerate_count += 1;

                let max_retries = self.params
                    .as_ref()
                    .map(|p| p.loop_cfg.max_degenerate_retries)
                    .unwrap_or(0);

                if self.degenerate_count > max_retries {
                    self.enter_fault(FaultCause::DegenerateAttitude, time)
                }
                else {
                    warn!(
                        "Degenerate attitude (thrust vector norm {:.3e}), holding the last \
                        command ({} of {} retries)",
                        norm, self.degenerate_count, max_retries
                    );
                    self.hold_command(time)
                }
            },
            Err(e) => {
                error!("Control cycle failed: {}", e);
                self.enter_fault(FaultCause::InvalidState, time)
            }
        }
    }

    fn mode_faulted(&mut self, time: DateTime<Utc>, dt: f64, fresh: bool) -> ActuatorCmd {
        if self.fault.latched {
            return self.fault_command(time)
        }

        if !fresh {
            self.fault.fresh_since = None;
            return self.fault_command(time)
        }

        let fresh_since = *self.fault.fresh_since.get_or_insert(time);
        let recovery_delay_s = self.params
            .as_ref()
            .map(|p| p.loop_cfg.recovery_delay_s)
            .unwrap_or(0.0);

        if seconds_between(&fresh_since, &time) >= recovery_delay_s {
            info!("Recovered from {:?} fault, DfCtrl running", self.fault.cause);
            self.mode = DfCtrlMode::Running;
            self.fault.cause = None;
            self.fault.fresh_since = None;
            self.fault.running_since = Some(time);
            return self.mode_running(time, dt, fresh)
        }

        self.fault_command(time)
    }

    // ---- FAULTS AND HOLDING ----

    /// Move into `Faulted`, returning the fault command.
    fn enter_fault(&mut self, cause: FaultCause, time: DateTime<Utc>) -> ActuatorCmd {
        let (max_auto_recoveries, recovery_window_s) = match self.params.as_ref() {
            Some(p) => (p.loop_cfg.max_auto_recoveries, p.loop_cfg.recovery_window_s),
            None => (0, 0.0)
        };

        error!("DfCtrl faulted: {:?} (state age {:.3} s)", cause, self.report.state_age_s);

        // A long enough clean run clears the count of consecutive faults
        let clean_run = match self.fault.running_since {
            Some(t) => seconds_between(&t, &time) >= recovery_window_s,
            None => false
        };
        if clean_run {
            self.fault.consecutive_faults = 0;
        }
        self.fault.consecutive_faults += 1;

        if self.fault.consecutive_faults > max_auto_recoveries && !self.fault.latched {
            error!(
                "Fault is persistent ({} consecutive faults), DfCtrl must be reset",
                self.fault.consecutive_faults
            );
            self.fault.latched = true;
        }

        self.mode = DfCtrlMode::Faulted;
        self.fault.cause = Some(cause);
        self.fault.fresh_since = None;
        self.fault.running_since = None;
        self.degenerate_count = 0;
        self.insufficient_since = None;
        self.saturation = SaturationReport::default();

        if let Some(p) = self.parts.as_mut() {
            p.corrector.reset();
        }

        self.fault_command(time)
    }

    fn fault_command(&mut self, time: DateTime<Utc>) -> ActuatorCmd {
        let fault_output = self.params
            .as_ref()
            .map(|p| p.loop_cfg.fault_output)
            .unwrap_or(FaultOutput::Zero);

        match fault_output {
            FaultOutput::Zero => ActuatorCmd::zero(time),
            FaultOutput::Hold => self.hold_command(time)
        }
    }

    /// Repeat the last good command, or zero if there is none.
    fn hold_command(&mut self, time: DateTime<Utc>) -> ActuatorCmd {
        self.report.held_cmd = true;
        self.holding = true;

        match self.last_cmd {
            Some(cmd) => ActuatorCmd {
                timestamp: time,
                ..cmd
            },
            None => ActuatorCmd::zero(time)
        }
    }

    /// Record a successfully computed command.
    fn accept_command(&mut self, cmd: ActuatorCmd) -> ActuatorCmd {
        if self.holding {
            info!("Control cycle succeeded, no longer holding the last command");
        }
        self.holding = false;
        self.insufficient_since = None;
        self.degenerate_count = 0;
        self.last_cmd = Some(cmd);
        cmd
    }

    // ---- CONTROL CYCLE ----

    /// Run the control chain for one cycle.
    fn run_tick(&mut self, time: DateTime<Utc>, dt: f64) -> Result<ActuatorCmd, DfCtrlError> {
        let state = match self.state {
            Some(s) => s,
            None => return Err(DfCtrlError::InvalidState("no state estimate".into()))
        };

        self.ensure_hover_ref(&state);

        let reference = match self.active_ref {
            Some(r) => r,
            None => return Err(DfCtrlError::InsufficientReferenceData(
                "no reference has been received".into()
            ))
        };

        let params = self.params()?;
        let parts = match self.parts.as_mut() {
            Some(p) => p,
            None => return Err(DfCtrlError::NotInitialised)
        };

        // ---- REFERENCE ----

        let fallback = RefFallback {
            position_m: match self.control_mode {
                ControlMode::Speed => Some(state.position_m),
                _ => None
            },
            yaw_rad: self.held_yaw.unwrap_or_else(|| state.yaw())
        };

        let mut sampled = parts.generator.sample(&reference, time, &fallback)?;
        let mut effective_mode = self.control_mode;

        // A speed reference of zero holds position
        if self.control_mode == ControlMode::Speed {
            if sampled.velocity_ms.norm() < params.control.hover_speed_threshold_ms {
                let (p, y) = *self.speed_hover.get_or_insert((state.position_m, state.yaw()));
                sampled = FlatOutput::hover(p, y);
                effective_mode = ControlMode::Hover;
            }
            else {
                self.speed_hover = None;
            }
        }

        let flat = shape_flat_output(&sampled, effective_mode, self.yaw_mode, &state, dt);
        self.report.flat_order = flat.order;

        // ---- FLATNESS AND FEEDBACK ----

        let feedforward = parts.transform.compute(&flat, self.prev_y_axis.as_ref())?;

        let corrected = parts.corrector.correct(&parts.transform, &CorrectionInput {
            flat: &flat,
            feedforward: &feedforward,
            state: &state,
            control_mode: effective_mode,
            dt_s: dt,
            freeze_integral: self.saturation.any(),
            prev_y_axis: self.prev_y_axis.as_ref(),
        })?;

        // ---- OUTPUT ----

        let (cmd, sat) = parts.output.make_command(&corrected, time);

        if sat.any() && !self.saturation.any() {
            debug!("Command saturated: {:?}", sat);
        }
        if corrected.desired.heading_fallback {
            trace!("Heading singular, holding the previous body y axis");
        }

        self.saturation = sat;
        self.prev_y_axis = Some(corrected.desired.y_axis());
        self.report.heading_fallback = corrected.desired.heading_fallback;
        self.report.errors = corrected.errors;

        Ok(cmd)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::df_ctrl::params::test::test_params;
    use approx::assert_relative_eq;
    use chrono::Duration;
    use comms_if::msg::TrajectoryReference;

    const G: f64 = 9.81;

    fn init_ctrl(params: Params) -> DfCtrl {
        let mut df = DfCtrl::default();
        df.init(Arc::new(params), None).unwrap();
        df
    }

    fn hover_state(time: DateTime<Utc>) -> StateEstimate {
        let mut s = StateEstimate::at_rest(time);
        s.position_m = [0.0, 0.0, 1.0];
        s
    }

    fn hover_ref() -> RefMsg {
        RefMsg::Trajectory(TrajectoryReference::hover([0.0, 0.0, 1.0], 0.0))
    }

    fn tick(
        df: &mut DfCtrl,
        time: DateTime<Utc>,
        state: Option<StateEstimate>,
        refs: Vec<RefMsg>
    ) -> (ActuatorCmd, StatusReport) {
        df.proc(&InputData { time, state, refs }).unwrap()
    }

    /// Tick at `t0 + ms` with a fresh state estimate.
    fn tick_fresh(df: &mut DfCtrl, t0: DateTime<Utc>, ms: i64) -> (ActuatorCmd, StatusReport) {
        let t = t0 + Duration::milliseconds(ms);
        tick(df, t, Some(hover_state(t)), vec![])
    }

    /// A controller running a hover reference from `t0`.
    fn running_ctrl(params: Params, t0: DateTime<Utc>) -> DfCtrl {
        let mut df = init_ctrl(params);
        tick(&mut df, t0, Some(hover_state(t0)), vec![hover_ref()]);
        assert_eq!(df.mode(), DfCtrlMode::Running);
        df
    }

    #[test]
    fn test_not_initialised() {
        let mut df = DfCtrl::default();
        let res = df.proc(&InputData {
            time: Utc::now(),
            state: None,
            refs: vec![]
        });

        assert!(matches!(res, Err(DfCtrlError::NotInitialised)));
    }

    #[test]
    fn test_init_rejects_invalid_params() {
        let mut params = test_params();
        params.vehicle.mass_kg = -1.0;

        let mut df = DfCtrl::default();
        assert!(matches!(
            df.init(Arc::new(params), None),
            Err(DfCtrlError::ConfigError(_))
        ));
    }

    #[test]
    fn test_arming_sequence() {
        let mut df = init_ctrl(test_params());
        let t0 = Utc::now();

        let (cmd, report) = tick(&mut df, t0, None, vec![]);
        assert_eq!(report.mode, DfCtrlMode::Uninitialised);
        assert_eq!(cmd.thrust_n, 0.0);
        assert!(report.state_age_s.is_infinite());

        let (cmd, report) = tick_fresh(&mut df, t0, 10);
        assert_eq!(report.mode, DfCtrlMode::Armed);
        assert_eq!(cmd.thrust_n, 0.0);

        // A reference with no position can't be tracked, stay armed
        let t = t0 + Duration::milliseconds(20);
        let no_pos = RefMsg::Trajectory(TrajectoryReference {
            velocity_ms: Some([1.0, 0.0, 0.0]),
            ..Default::default()
        });
        let (_, report) = tick(&mut df, t, Some(hover_state(t)), vec![no_pos]);
        assert_eq!(report.mode, DfCtrlMode::Armed);

        let t = t0 + Duration::milliseconds(30);
        let (cmd, report) = tick(&mut df, t, Some(hover_state(t)), vec![hover_ref()]);
        assert_eq!(report.mode, DfCtrlMode::Running);
        assert!(cmd.thrust_n > 0.0);
    }

    #[test]
    fn test_end_to_end_hover() {
        let params = test_params();
        let t0 = Utc::now();
        let mut df = running_ctrl(params.clone(), t0);

        for i in 1..=200 {
            let (cmd, report) = tick_fresh(&mut df, t0, i * 10);

            assert_eq!(report.mode, DfCtrlMode::Running);
            assert_relative_eq!(cmd.thrust_n, params.vehicle.mass_kg * G, epsilon = 1e-9);
            assert_relative_eq!(
                cmd.thrust_norm,
                params.vehicle.mass_kg * G / params.vehicle.max_thrust_n,
                epsilon = 1e-9
            );
            for r in cmd.body_rates_rads.iter() {
                assert_relative_eq!(*r, 0.0, epsilon = 1e-9);
            }
            for t in cmd.torque_nm.iter() {
                assert_relative_eq!(*t, 0.0, epsilon = 1e-9);
            }
            assert_relative_eq!(cmd.attitude_q[0], 0.0, epsilon = 1e-9);
            assert_relative_eq!(cmd.attitude_q[1], 0.0, epsilon = 1e-9);
            assert_relative_eq!(cmd.attitude_q[2], 0.0, epsilon = 1e-9);
            assert_relative_eq!(cmd.attitude_q[3].abs(), 1.0, epsilon = 1e-9);
            assert!(!report.saturation.thrust_high);
        }
    }

    #[test]
    fn test_stale_state_timeout() {
        let t0 = Utc::now();

        // 50 ms without a new estimate is within the 100 ms timeout
        let mut df = running_ctrl(test_params(), t0);
        let (_, report) = tick(&mut df, t0 + Duration::milliseconds(50), None, vec![]);
        assert_eq!(report.mode, DfCtrlMode::Running);
        assert_relative_eq!(report.state_age_s, 0.05, epsilon = 1e-12);

        // 150 ms is not
        let mut df = running_ctrl(test_params(), t0);
        let (cmd, report) = tick(&mut df, t0 + Duration::milliseconds(150), None, vec![]);
        assert_eq!(report.mode, DfCtrlMode::Faulted);
        assert_eq!(report.fault, Some(FaultCause::StaleState));
        assert_eq!(cmd.thrust_n, 0.0);
    }

    #[test]
    fn test_fault_recovery() {
        let t0 = Utc::now();
        let mut df = running_ctrl(test_params(), t0);

        let (_, report) = tick(&mut df, t0 + Duration::milliseconds(150), None, vec![]);
        assert_eq!(report.mode, DfCtrlMode::Faulted);

        // Recovery delay is 20 ms of fresh state
        let (_, report) = tick_fresh(&mut df, t0, 160);
        assert_eq!(report.mode, DfCtrlMode::Faulted);
        let (_, report) = tick_fresh(&mut df, t0, 170);
        assert_eq!(report.mode, DfCtrlMode::Faulted);
        let (cmd, report) = tick_fresh(&mut df, t0, 180);
        assert_eq!(report.mode, DfCtrlMode::Running);
        assert_eq!(report.fault, None);
        assert!(cmd.thrust_n > 0.0);
    }

    #[test]
    fn test_persistent_fault() {
        let t0 = Utc::now();
        let mut df = running_ctrl(test_params(), t0);
        let mut t_ms = 0;

        // Up to two automatic recoveries are allowed
        for fault in 1..=3 {
            t_ms += 150;
            let (_, report) = tick(&mut df, t0 + Duration::milliseconds(t_ms), None, vec![]);
            assert_eq!(report.mode, DfCtrlMode::Faulted);
            assert_eq!(report.consecutive_faults, fault);

            for _ in 0..3 {
                t_ms += 10;
                tick_fresh(&mut df, t0, t_ms);
            }

            if fault < 3 {
                assert_eq!(df.mode(), DfCtrlMode::Running);
            }
        }

        assert!(df.is_latched());
        for _ in 0..100 {
            t_ms += 10;
            let (cmd, report) = tick_fresh(&mut df, t0, t_ms);
            assert_eq!(report.mode, DfCtrlMode::Faulted);
            assert_eq!(cmd.thrust_n, 0.0);
        }

        // Explicit reset clears the latch
        t_ms += 10;
        let t = t0 + Duration::milliseconds(t_ms);
        let (_, report) = tick(&mut df, t, Some(hover_state(t)), vec![RefMsg::Reset]);
        assert_eq!(report.mode, DfCtrlMode::Armed);
        assert!(!df.is_latched());

        t_ms += 10;
        let t = t0 + Duration::milliseconds(t_ms);
        let (_, report) = tick(&mut df, t, Some(hover_state(t)), vec![hover_ref()]);
        assert_eq!(report.mode, DfCtrlMode::Running);
    }

    #[test]
    fn test_clean_run_clears_fault_count() {
        let t0 = Utc::now();
        let mut df = running_ctrl(test_params(), t0);

        tick(&mut df, t0 + Duration::milliseconds(150), None, vec![]);
        tick_fresh(&mut df, t0, 160);
        tick_fresh(&mut df, t0, 180);
        assert_eq!(df.mode(), DfCtrlMode::Running);

        // Run cleanly for longer than the recovery window
        let mut t_ms = 180;
        while t_ms < 1500 {
            t_ms += 10;
            tick_fresh(&mut df, t0, t_ms);
        }

        t_ms += 150;
        let (_, report) = tick(&mut df, t0 + Duration::milliseconds(t_ms), None, vec![]);
        assert_eq!(report.mode, DfCtrlMode::Faulted);
        assert_eq!(report.consecutive_faults, 1);
    }

    #[test]
    fn test_stop_and_reset() {
        let t0 = Utc::now();
        let mut df = running_ctrl(test_params(), t0);

        let t = t0 + Duration::milliseconds(10);
        let (cmd, report) = tick(&mut df, t, Some(hover_state(t)), vec![RefMsg::Stop]);
        assert_eq!(report.mode, DfCtrlMode::Stopped);
        assert_eq!(cmd.thrust_n, 0.0);
        assert_eq!(cmd.body_rates_rads, [0.0; 3]);

        // References do not restart a stopped controller
        let t = t0 + Duration::milliseconds(20);
        let (cmd, report) = tick(&mut df, t, Some(hover_state(t)), vec![hover_ref()]);
        assert_eq!(report.mode, DfCtrlMode::Stopped);
        assert_eq!(cmd.thrust_n, 0.0);

        df.reset();
        assert_eq!(df.mode(), DfCtrlMode::Armed);
    }

    #[test]
    fn test_degenerate_hold_then_fault() {
        let t0 = Utc::now();
        let mut df = running_ctrl(test_params(), t0);
        let (good, _) = tick_fresh(&mut df, t0, 10);

        // Free fall reference
        let free_fall = RefMsg::Trajectory(TrajectoryReference {
            position_m: Some([0.0, 0.0, 1.0]),
            acceleration_mss: Some([0.0, 0.0, -G]),
            ..Default::default()
        });

        // Three retries hold the last good command
        for i in 0..3 {
            let t = t0 + Duration::milliseconds(20 + i * 10);
            let refs = if i == 0 { vec![free_fall.clone()] } else { vec![] };
            let (cmd, report) = tick(&mut df, t, Some(hover_state(t)), refs);

            assert_eq!(report.mode, DfCtrlMode::Running);
            assert!(report.degenerate && report.held_cmd);
            assert_eq!(cmd.thrust_n, good.thrust_n);
            assert_eq!(cmd.timestamp, t);
        }

        let (cmd, report) = tick_fresh(&mut df, t0, 50);
        assert_eq!(report.mode, DfCtrlMode::Faulted);
        assert_eq!(report.fault, Some(FaultCause::DegenerateAttitude));
        assert_eq!(cmd.thrust_n, 0.0);
    }

    #[test]
    fn test_insufficient_reference_holds() {
        let t0 = Utc::now();
        let mut df = running_ctrl(test_params(), t0);
        let (good, _) = tick_fresh(&mut df, t0, 10);

        let t = t0 + Duration::milliseconds(20);
        let no_pos = RefMsg::Trajectory(TrajectoryReference {
            velocity_ms: Some([1.0, 0.0, 0.0]),
            ..Default::default()
        });
        let (cmd, report) = tick(&mut df, t, Some(hover_state(t)), vec![no_pos]);

        assert_eq!(report.mode, DfCtrlMode::Running);
        assert!(report.insufficient_ref && report.held_cmd);
        assert_eq!(cmd.thrust_n, good.thrust_n);
        assert_eq!(cmd.attitude_q, good.attitude_q);
    }

    #[test]
    fn test_insufficient_reference_hold_is_bounded() {
        let t0 = Utc::now();
        let mut df = running_ctrl(test_params(), t0);
        tick_fresh(&mut df, t0, 10);

        let t = t0 + Duration::milliseconds(20);
        let no_pos = RefMsg::Trajectory(TrajectoryReference {
            velocity_ms: Some([1.0, 0.0, 0.0]),
            ..Default::default()
        });
        tick(&mut df, t, Some(hover_state(t)), vec![no_pos]);

        // The vehicle drifts while the last command is held
        let drifted = |t: DateTime<Utc>| {
            let mut s = hover_state(t);
            s.position_m = [0.3, -0.2, 1.1];
            s
        };
        let t = t0 + Duration::milliseconds(100);
        let (_, report) = tick(&mut df, t, Some(drifted(t)), vec![]);
        assert!(report.insufficient_ref && report.held_cmd);

        // Held for longer than 0.1 s, hover where the vehicle is
        let t = t0 + Duration::milliseconds(140);
        let (cmd, report) = tick(&mut df, t, Some(drifted(t)), vec![]);
        assert_eq!(report.mode, DfCtrlMode::Running);
        assert!(!report.held_cmd);
        assert_eq!(report.errors.position_m, [0.0; 3]);
        assert_relative_eq!(cmd.thrust_n, 1.5 * G, epsilon = 1e-9);

        let t = t0 + Duration::milliseconds(150);
        let (_, report) = tick(&mut df, t, Some(drifted(t)), vec![]);
        assert!(!report.insufficient_ref && !report.held_cmd);
    }

    #[test]
    fn test_mode_change_holds_position() {
        let t0 = Utc::now();
        let mut df = init_ctrl(test_params());

        let accelerate = RefMsg::Trajectory(TrajectoryReference {
            timestamp: Some(t0),
            position_m: Some([0.0, 0.0, 1.0]),
            acceleration_mss: Some([3.0, 0.0, 0.0]),
            yaw_rad: Some(0.0),
            ..Default::default()
        });
        let (tilted, report) = tick(&mut df, t0, Some(hover_state(t0)), vec![accelerate]);
        assert_eq!(report.mode, DfCtrlMode::Running);
        assert!(tilted.attitude_q[1] > 0.1);

        let set_position = RefMsg::SetMode {
            control_mode: ControlMode::Position,
            yaw_mode: YawMode::Angle
        };
        let at = |t: DateTime<Utc>, x: f64| {
            let mut s = hover_state(t);
            s.position_m = [x, 0.0, 1.0];
            s
        };

        // The tilted command is not repeated, the vehicle holds where it is
        let t = t0 + Duration::milliseconds(10);
        let (cmd, report) = tick(&mut df, t, Some(at(t, 0.5)), vec![set_position]);
        assert_eq!(report.mode, DfCtrlMode::Running);
        assert_eq!(report.control_mode, ControlMode::Position);
        assert!(!report.held_cmd && !report.insufficient_ref);
        assert_eq!(report.errors.position_m, [0.0; 3]);
        assert_relative_eq!(cmd.thrust_n, 1.5 * G, epsilon = 1e-9);
        assert_relative_eq!(cmd.attitude_q[1], 0.0, epsilon = 1e-9);

        // Drifting forwards is corrected back towards the hold point
        let t = t0 + Duration::milliseconds(20);
        let (cmd, report) = tick(&mut df, t, Some(at(t, 0.7)), vec![]);
        assert_relative_eq!(report.errors.position_m[0], -0.2, epsilon = 1e-12);
        assert!(cmd.attitude_q[1] < 0.0);

        // A position reference for the new mode replaces the hold point
        let t = t0 + Duration::milliseconds(30);
        let target = RefMsg::Trajectory(TrajectoryReference::hover([2.0, 0.0, 1.0], 0.0));
        let (_, report) = tick(&mut df, t, Some(at(t, 0.7)), vec![target]);
        assert_relative_eq!(report.errors.position_m[0], 1.3, epsilon = 1e-12);
    }

    #[test]
    fn test_repeated_tick_time() {
        let t0 = Utc::now();
        let mut df = running_ctrl(test_params(), t0);

        let (first, _) = tick_fresh(&mut df, t0, 10);

        // Different state, same cycle time
        let t = t0 + Duration::milliseconds(10);
        let mut moved = hover_state(t);
        moved.position_m = [0.5, 0.0, 1.0];
        let (second, report) = tick(&mut df, t, Some(moved), vec![]);

        assert!(report.held_cmd);
        assert_eq!(report.dt_s, 0.0);
        assert_eq!(first, second);
    }

    #[test]
    fn test_hold_fault_output() {
        let mut params = test_params();
        params.loop_cfg.fault_output = FaultOutput::Hold;

        let t0 = Utc::now();
        let mut df = running_ctrl(params, t0);
        let (good, _) = tick_fresh(&mut df, t0, 10);

        let (cmd, report) = tick(&mut df, t0 + Duration::milliseconds(200), None, vec![]);
        assert_eq!(report.mode, DfCtrlMode::Faulted);
        assert_eq!(cmd.thrust_n, good.thrust_n);
    }

    #[test]
    fn test_hover_mode_captures_position() {
        let t0 = Utc::now();
        let mut df = running_ctrl(test_params(), t0);

        let t = t0 + Duration::milliseconds(10);
        let mut s = hover_state(t);
        s.position_m = [1.0, -1.0, 2.0];
        let set_hover = RefMsg::SetMode {
            control_mode: ControlMode::Hover,
            yaw_mode: YawMode::Angle
        };
        tick(&mut df, t, Some(s), vec![set_hover]);

        // Vehicle drifts away, the hover point stays where the mode was entered
        let t = t0 + Duration::milliseconds(20);
        let mut s = hover_state(t);
        s.position_m = [1.0, -1.0, 1.8];
        let (cmd, report) = tick(&mut df, t, Some(s), vec![hover_ref()]);

        assert_eq!(report.mode, DfCtrlMode::Running);
        assert_eq!(report.control_mode, ControlMode::Hover);
        assert_relative_eq!(report.errors.position_m[2], 0.2, epsilon = 1e-12);
        assert!(cmd.thrust_n > 1.5 * G);
    }

    #[test]
    fn test_speed_mode() {
        let t0 = Utc::now();
        let mut df = running_ctrl(test_params(), t0);

        let set_speed = RefMsg::SetMode {
            control_mode: ControlMode::Speed,
            yaw_mode: YawMode::Angle
        };
        let forward = RefMsg::Trajectory(TrajectoryReference {
            velocity_ms: Some([1.0, 0.0, 0.0]),
            yaw_rad: Some(0.0),
            ..Default::default()
        });

        let t = t0 + Duration::milliseconds(10);
        let (_, report) = tick(&mut df, t, Some(hover_state(t)), vec![set_speed, forward]);
        assert_eq!(report.mode, DfCtrlMode::Running);
        assert_eq!(report.errors.position_m, [0.0; 3]);
        assert_relative_eq!(report.errors.velocity_ms[0], 1.0);

        // Accelerating forwards pitches the thrust axis forwards
        let (cmd, _) = tick_fresh(&mut df, t0, 20);
        assert!(cmd.attitude_q[1] > 0.0);

        // A zero speed reference holds position
        let t = t0 + Duration::milliseconds(30);
        let stop = RefMsg::Trajectory(TrajectoryReference {
            velocity_ms: Some([0.0; 3]),
            ..Default::default()
        });
        let mut s = hover_state(t);
        s.velocity_ms = [0.0; 3];
        let (cmd, report) = tick(&mut df, t, Some(s), vec![stop]);
        assert_eq!(report.mode, DfCtrlMode::Running);
        assert_relative_eq!(cmd.thrust_n, 1.5 * G, epsilon = 1e-9);
    }

    #[test]
    fn test_waypoint_tracking() {
        let t0 = Utc::now();
        let mut df = init_ctrl(test_params());

        let wps: Vec<RefMsg> = (0..4)
            .map(|i| RefMsg::Waypoint(comms_if::msg::Waypoint {
                timestamp: t0 + Duration::milliseconds(i * 100),
                position_m: [0.0, 0.0, 1.0 + 0.1 * i as f64],
                yaw_rad: 0.0
            }))
            .collect();

        let t = t0 + Duration::milliseconds(300);
        let (cmd, report) = tick(&mut df, t, Some(hover_state(t)), wps);

        assert_eq!(report.mode, DfCtrlMode::Running);
        assert_eq!(report.flat_order, 3);

        // Reference climbing at 1 m/s from 1.3 m, vehicle at rest at 1 m
        assert_relative_eq!(report.errors.position_m[2], 0.3, epsilon = 1e-6);
        assert_relative_eq!(report.errors.velocity_ms[2], 1.0, epsilon = 1e-6);
        assert!(cmd.thrust_n > 1.5 * G);
    }
}
