//! Runs one import job and exits.
//!
//! Started by the supervisor with the job id as its only argument. Shared
//! state comes from `BULKIMPORT_CONFIG`, `BULKIMPORT_DATABASE` and
//! `BULKIMPORT_LOCK_DIR`.

use std::process::ExitCode;

use clap::Parser;

use bulkimport::{config, logging, worker, HandlerRegistry};

#[derive(Parser, Debug)]
#[command(name = "bulkimport-worker", version, about = "Process one CSV import job")]
struct Args {
    /// Id of a Pending job in the job database.
    #[arg(value_name = "JOB_ID")]
    job_id: String,

    /// Log at debug level.
    #[arg(short, long, env = "BULKIMPORT_VERBOSE")]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.verbose);

    let config = match config::load_from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Failed to load configuration: {}", e);
            return exit(worker::WorkerExit::Bootstrap);
        }
    };

    exit(worker::run(&args.job_id, &config, HandlerRegistry::with_builtins()))
}

fn exit(status: worker::WorkerExit) -> ExitCode {
    ExitCode::from(status.code() as u8)
}
