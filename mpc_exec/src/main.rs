//! Main MPC executable entry point.
//!
//! # Architecture
//!
//! The executable bridges the vehicle simulator to the trajectory controller:
//!
//!     - Initialise the session, logging and parameters
//!     - Initialise TrajCtrl and move it onto the worker thread
//!     - Main loop:
//!         - Receive an event from the simulator bridge
//!         - Post telemetry to the worker, or answer manual events immediately
//!         - Queue commands finished by the worker behind the artificial delay
//!         - Send queued commands which are due
//!
//! The worker only ever processes the most recent telemetry, so the main loop never waits on an
//! optimisation.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use color_eyre::{eyre::WrapErr, Result};
use log::{debug, error, info, warn};
use std::{
    sync::{
        mpsc::{channel, TryRecvError},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use structopt::StructOpt;

// Internal
use comms_if::{
    net::zmq,
    sim::{SimEvent, Telemetry},
};
use mpc_lib::{
    params::MpcExecParams,
    sim_server::{input_from_telemetry, SimServer},
    traj_ctrl::TrajCtrl,
    worker::{worker_thread, Mailbox, WorkerSignal},
};
use util::{
    host,
    logger::{logger_init, LevelFilter, LoggerSettings},
    module::State,
    session::Session,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

/// Model predictive trajectory controller for the vehicle simulator.
#[derive(StructOpt, Debug)]
#[structopt(name = "mpc_exec")]
struct Opt {
    /// Trajectory control parameter file, relative to the params directory
    #[structopt(long, default_value = "traj_ctrl.toml")]
    traj_ctrl_params: String,

    /// Executable parameter file, relative to the params directory
    #[structopt(long, default_value = "mpc_exec.toml")]
    exec_params: String,

    /// Override the artificial delay before commands are sent, in milliseconds
    #[structopt(long)]
    delay_ms: Option<u64>,

    /// Least severe log level written, one of info, debug or trace
    #[structopt(long, default_value = "debug")]
    log_level: LevelFilter,
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Executable main function, entry point.
fn main() -> Result<()> {
    color_eyre::install()?;

    let opt = Opt::from_args();

    // ---- EARLY INITIALISATION ----

    let session = Session::new("mpc_exec", "sessions").wrap_err("Failed to create the session")?;

    logger_init(&LoggerSettings::with_min_level(opt.log_level), &session)
        .wrap_err("Failed to initialise logging")?;

    info!("MPC Trajectory Control Executable\n");
    info!(
        "Running on: {:#?}",
        host::get_uname().wrap_err("Failed to get host information")?
    );
    info!("Session directory: {:?}\n", session.session_root);
    debug!("CLI arguments: {:?}", opt);

    // ---- LOAD PARAMETERS ----

    let mut exec_params: MpcExecParams =
        util::params::load(&opt.exec_params).wrap_err("Could not load exec params")?;

    if let Some(d) = opt.delay_ms {
        exec_params.artificial_delay_ms = d;
    }
    let artificial_delay = Duration::from_millis(exec_params.artificial_delay_ms);

    info!("Exec parameters loaded");

    // ---- INITIALISE MODULES ----

    let mut traj_ctrl = TrajCtrl::default();
    traj_ctrl
        .init(opt.traj_ctrl_params.clone(), &session)
        .wrap_err("Failed to initialise TrajCtrl")?;
    info!("TrajCtrl init complete");

    session.save("params/mpc_exec.json", exec_params.clone());
    session.save("params/traj_ctrl.json", traj_ctrl.params().clone());

    // ---- INITIALISE NETWORK ----

    let zmq_ctx = zmq::Context::new();
    let mut server =
        SimServer::new(&zmq_ctx, &exec_params).wrap_err("Failed to initialise the SimServer")?;
    info!(
        "SimServer listening on {}, artificial delay {} ms",
        exec_params.sim_endpoint, exec_params.artificial_delay_ms
    );

    // ---- START WORKER ----

    let mailbox = Arc::new(Mailbox::new());
    let (worker_sender, main_receiver) = channel();
    let worker_mailbox = mailbox.clone();
    let worker_handle = thread::Builder::new()
        .name("traj_ctrl_worker".into())
        .spawn(move || worker_thread(traj_ctrl, worker_mailbox, worker_sender))
        .wrap_err("Failed to start the worker thread")?;

    // ---- MAIN LOOP ----

    info!("Begining main loop\n");

    let mut was_connected = false;
    let mut num_discarded: u64 = 0;
    let mut worker_stopped = false;

    // The most recently posted telemetry, kept so the input of a degraded cycle can be saved
    let mut last_telem: Option<(u64, Telemetry)> = None;

    let result: Result<()> = loop {
        // ---- DATA INPUT ----

        match server.recv_event() {
            Ok(Some(SimEvent::Telemetry(telem))) => {
                let seq = mailbox.post(input_from_telemetry(telem.clone()));
                last_telem = Some((seq, telem));
            }
            Ok(Some(SimEvent::Manual)) => {
                if let Err(e) = server.send_manual() {
                    warn!("Could not send manual reply: {}", e);
                }
            }
            Ok(None) => (),
            Err(e) => warn!("Bad event from the simulator: {}", e),
        }

        if server.connected() != was_connected {
            was_connected = server.connected();
            match was_connected {
                true => info!("Simulator bridge connected"),
                false => warn!("Simulator bridge disconnected"),
            }
        }

        // ---- WORKER OUTPUT ----

        loop {
            match main_receiver.try_recv() {
                Ok(WorkerSignal::Command(seq, output, report)) => {
                    debug!(
                        "Command {} ready: steering {:.4}, throttle {:.3} ({:?})",
                        seq, output.steering, output.throttle, report.outcome
                    );
                    if let Err(e) = server.queue_command(&output, Instant::now() + artificial_delay) {
                        warn!("Could not queue command {}: {}", seq, e);
                    }

                    if report.degraded {
                        if let Some((_, telem)) = last_telem.as_ref().filter(|(s, _)| *s == seq) {
                            session.save_with_timestamp("degraded/telemetry.json", telem.clone());
                        }
                    }
                }
                Ok(WorkerSignal::Discarded(_)) => num_discarded += 1,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    worker_stopped = true;
                    break;
                }
            }
        }

        // ---- DATA OUTPUT ----

        if let Err(e) = server.send_due(Instant::now()) {
            warn!("Could not send command: {}", e);
        }

        if worker_stopped {
            error!("Worker thread stopped unexpectedly");
            break Err(color_eyre::eyre::eyre!("The worker thread has exited"));
        }
    };

    info!("{} stale results were discarded", num_discarded);

    mailbox.stop();
    if worker_handle.join().is_err() {
        error!("Worker thread panicked");
    }
    session.exit();

    result
}
