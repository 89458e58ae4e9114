//! Main planner executable entry point.
//!
//! # Architecture
//!
//! The general execution methodology consists of:
//!
//!     - Initialise the session, logging and parameters
//!     - Initialise the data store and the supervisor
//!     - Main loop:
//!         - Drain the ingress channel (ingestion and bookkeeping only)
//!         - Tick the supervisor (search, corridors, optimization,
//!           deconfliction run inline here)
//!         - Forward egress messages to the transport adapters
//!
//! Transport adapters (the processes or threads converting wire messages
//! into [`IngressMsg`] values and consuming [`Egress`] values) are out of
//! scope of this executable; they receive the channel endpoints created
//! here.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use color_eyre::{
    eyre::{eyre, WrapErr},
    Report,
};
use log::{debug, info, warn};
use std::env;
use std::sync::mpsc;
use std::time::{Duration, Instant};

// Internal
use comms_if::ingress::IngressMsg;
use plan_lib::{data_store::DataStore, params::PlanExecParams, sup::Supervisor};
use util::{
    logger::{logger_init, LevelFilter},
    session::{self, Session},
};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Target period of one cycle.
const CYCLE_PERIOD_S: f64 = 0.10;

/// Depth of the bounded ingress channel.
const INGRESS_CHANNEL_DEPTH: usize = 256;

/// Number of cycles between occupancy cloud publications.
const OCC_CLOUD_CYCLE_DIVIDER: u64 = 10;

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Executable main function, entry point.
fn main() -> Result<(), Report> {
    // ---- EARLY INITIALISATION ----

    let session = Session::new("plan_exec", "sessions")
        .wrap_err("Failed to create the session")?;

    logger_init(LevelFilter::Info, &session)
        .map_err(|e| eyre!("Failed to initialise logging: {:?}", e))?;

    info!("Talos UAV Planning Executable\n");
    info!("Session directory: {:?}\n", session.session_root);

    // ---- LOAD PARAMETERS ----

    let args: Vec<String> = env::args().collect();
    let params_path = match args.len() {
        1 => "plan_exec.toml".to_string(),
        2 => args[1].clone(),
        _ => {
            return Err(eyre!(
                "Expected either zero or one argument, found {}",
                args.len() - 1
            ))
        }
    };

    let params: PlanExecParams =
        util::params::load(&params_path).wrap_err("Could not load planner params")?;

    info!("Parameters loaded from {:?}", params_path);

    // ---- INITIALISE MODULES ----

    let mut ds = DataStore::new(params.clone()).wrap_err("Failed to initialise the data store")?;
    let mut sup = Supervisor::new(params);

    info!("Module initialisation complete\n");

    // ---- INITIALISE INGRESS ----

    // The sender half is handed to the transport adapters; keeping one here
    // stops the channel from disconnecting when no adapter is attached.
    let (ingress_tx, ingress_rx) = mpsc::sync_channel::<IngressMsg>(INGRESS_CHANNEL_DEPTH);
    let _ingress_tx = ingress_tx;

    // ---- MAIN LOOP ----

    info!("Begining main loop\n");

    let mut skip_tick = false;

    loop {
        let cycle_start_instant = Instant::now();
        let now_s = session::get_elapsed_seconds();

        // ---- DATA INPUT ----

        // Ingestion only; planning never runs here
        while let Ok(msg) = ingress_rx.try_recv() {
            ds.ingest(&msg, now_s);
        }

        // ---- SUPERVISOR ----

        if skip_tick {
            // The previous cycle overran its budget; coalesce by skipping
            // this one
            skip_tick = false;
        } else {
            let egress = sup.tick(&mut ds, now_s);

            for msg in &egress {
                // Forwarding to the transport adapters happens here; without
                // any attached, publications are traced for introspection
                debug!("Egress: {:?}", msg);
            }

            if ds.num_cycles % OCC_CLOUD_CYCLE_DIVIDER == 0 && ds.risk_map.is_updated() {
                let cloud = ds.risk_map.publish();
                debug!("Occupancy cloud: {} points", cloud.points_m.len());
            }
        }

        // ---- CYCLE MANAGEMENT ----

        let elapsed_s = cycle_start_instant.elapsed().as_secs_f64();
        if elapsed_s > CYCLE_PERIOD_S {
            ds.num_consec_cycle_overruns += 1;
            skip_tick = true;
            warn!(
                "Cycle overran its budget ({:.3} s > {:.3} s), skipping next tick \
                 ({} consecutive overruns)",
                elapsed_s, CYCLE_PERIOD_S, ds.num_consec_cycle_overruns
            );
        } else {
            ds.num_consec_cycle_overruns = 0;
            std::thread::sleep(Duration::from_secs_f64(CYCLE_PERIOD_S - elapsed_s));
        }
    }
}
