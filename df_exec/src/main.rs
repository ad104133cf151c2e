//! Main controller executable entry point.
//!
//! # Architecture
//!
//! The general execution methodology consists of:
//!
//!     - Initialise the session, logging and parameters
//!     - Initialise DfCtrl and the network clients
//!     - Main loop, at the configured control rate:
//!         - Take the latest state estimate
//!         - Take the pending references, from the network or a reference script
//!         - DfCtrl processing
//!         - Publish the actuator command
//!         - Write archives
//!
//! A zero thrust command is published on exit.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use chrono::Utc;
use color_eyre::{Report, eyre::WrapErr};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use structopt::StructOpt;

// Internal
use comms_if::{
    msg::{self, ActuatorCmd, RefMsg, StateEstimate},
    net::{NetParams, zmq}
};
use df_lib::{
    cmd_server::CmdServer,
    df_ctrl::{DfCtrl, InputData, Params},
    sub_client::Subscriber
};
use util::{
    archive::Archived,
    host,
    logger::{logger_init, LevelFilter},
    module::State,
    script_interpreter::{PendingRefs, ScriptInterpreter},
    session::Session
};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Maximum number of reference messages buffered between two cycles.
const REF_QUEUE_CAPACITY: usize = 256;

/// Number of consecutive overruns after which overruns stop being logged.
const MAX_LOGGED_OVERRUNS: u64 = 10;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Differential flatness trajectory tracking controller
#[derive(Debug, StructOpt)]
#[structopt(name = "df_exec")]
struct Opt {
    /// Identity of the vehicle, used as the namespace of all topics
    #[structopt(long, default_value = "drone0")]
    drone_id: String,

    /// Controller parameter file
    #[structopt(long, parse(from_os_str), default_value = "df_ctrl.toml")]
    params: PathBuf,

    /// Network parameter file
    #[structopt(long, parse(from_os_str), default_value = "net.toml")]
    net_params: PathBuf,

    /// Minimum log level (info, debug or trace)
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    /// Reference script to replay in place of the network reference input
    #[structopt(parse(from_os_str))]
    script: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Sources of reference messages.
enum RefSource {
    Remote(Subscriber<RefMsg>),
    Script(ScriptInterpreter)
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Executable main function, entry point.
fn main() -> Result<(), Report> {
    color_eyre::install()?;

    let opt = Opt::from_args();

    // ---- EARLY INITIALISATION ----

    let session = Session::new(
        &format!("df_exec_{}", opt.drone_id),
        "sessions"
    ).wrap_err("Failed to create the session")?;

    logger_init(opt.log_level, Some(&opt.drone_id), &session)
        .wrap_err("Failed to initialise logging")?;

    info!("Differential Flatness Controller Executable\n");
    info!(
        "Running on: {}",
        host::get_hostname().unwrap_or_else(|| String::from("unknown host"))
    );
    info!("Session directory: {:?}\n", session.session_root);
    debug!("Options: {:?}", opt);

    // ---- LOAD PARAMETERS ----

    let params = Arc::new(
        Params::load(&opt.params)
            .wrap_err_with(|| format!("Could not load the controller params from {:?}", opt.params))?
    );

    let net_params: NetParams = util::params::load(&opt.net_params)
        .wrap_err_with(|| format!("Could not load the net params from {:?}", opt.net_params))?;

    info!(
        "Parameters loaded: mass {} kg, max thrust {} N, {:?} architecture at {} Hz",
        params.vehicle.mass_kg,
        params.vehicle.max_thrust_n,
        params.control.architecture,
        params.loop_cfg.rate_hz
    );

    // ---- INITIALISE MODULES ----

    info!("Initialising modules...");

    let mut df_ctrl = DfCtrl::default();
    df_ctrl.init(params.clone(), Some(&session))
        .wrap_err("Failed to initialise DfCtrl")?;
    info!("DfCtrl init complete");

    // ---- INITIALISE NETWORK ----

    info!("Initialising network");

    let zmq_ctx = zmq::Context::new();

    let state_sub: Subscriber<StateEstimate> = Subscriber::new(
        &zmq_ctx,
        &net_params.state_endpoint,
        &msg::topic(&opt.drone_id, msg::STATE_TOPIC),
        1
    ).wrap_err("Failed to initialise the state subscriber")?;
    info!("State subscriber initialised");

    let mut ref_source = match opt.script {
        Some(ref path) => {
            info!("Loading reference script from {:?}", path);

            let si = ScriptInterpreter::new(path)
                .wrap_err("Failed to load the reference script")?;

            info!(
                "Loaded script lasts {:.02} s and contains {} references\n",
                si.get_duration(),
                si.get_num_refs()
            );

            RefSource::Script(si)
        },
        None => {
            let sub = Subscriber::new(
                &zmq_ctx,
                &net_params.ref_endpoint,
                &msg::topic(&opt.drone_id, msg::REF_TOPIC),
                REF_QUEUE_CAPACITY
            ).wrap_err("Failed to initialise the reference subscriber")?;
            info!("Reference subscriber initialised");

            RefSource::Remote(sub)
        }
    };

    let cmd_server = CmdServer::new(
        &zmq_ctx,
        &net_params.cmd_endpoint,
        &msg::topic(&opt.drone_id, msg::CMD_TOPIC)
    ).wrap_err("Failed to initialise the CmdServer")?;
    info!("CmdServer initialised");

    info!("Network initialisation complete");

    // ---- MAIN LOOP ----

    info!("Begining main loop\n");

    let cycle_period = Duration::from_secs_f64(params.period_s());
    let mut num_consec_cycle_overruns: u64 = 0;
    let mut num_cycles: u64 = 0;

    loop {
        let cycle_start_instant = Instant::now();

        // ---- DATA INPUT ----

        let refs = match ref_source {
            RefSource::Remote(ref sub) => sub.drain(),
            RefSource::Script(ref mut si) => match si.get_pending() {
                PendingRefs::None => vec![],
                PendingRefs::Some(r) => r,
                PendingRefs::EndOfScript => {
                    info!("End of reference script reached, stopping");
                    break
                }
            }
        };

        let input = InputData {
            time: Utc::now(),
            state: state_sub.latest(),
            refs
        };

        // ---- CONTROL PROCESSING ----

        let cmd = match df_ctrl.proc(&input) {
            Ok((cmd, _)) => cmd,
            Err(e) => {
                error!("Error during DfCtrl processing: {}", e);
                ActuatorCmd::zero(input.time)
            }
        };

        if let Err(e) = cmd_server.send(&cmd) {
            warn!("CmdServer error: {}", e);
        }

        // ---- WRITE ARCHIVES ----

        if let Err(e) = df_ctrl.write() {
            warn!("Could not write DfCtrl archives: {}", e);
        }

        // ---- CYCLE MANAGEMENT ----

        let cycle_dur = Instant::now() - cycle_start_instant;

        match cycle_period.checked_sub(cycle_dur) {
            Some(d) => {
                num_consec_cycle_overruns = 0;
                thread::sleep(d);
            },
            None => {
                num_consec_cycle_overruns += 1;

                if num_consec_cycle_overruns <= MAX_LOGGED_OVERRUNS {
                    warn!(
                        "Cycle overran by {:.06} s",
                        cycle_dur.as_secs_f64() - cycle_period.as_secs_f64()
                    );
                }
            }
        }

        num_cycles += 1;
    }

    // ---- SHUTDOWN ----

    df_ctrl.stop();
    if let Err(e) = cmd_server.send(&ActuatorCmd::zero(Utc::now())) {
        warn!("Could not send the final zero command: {}", e);
    }

    info!("End of execution after {} cycles", num_cycles);

    Ok(())
}
