//! Worker process serving one configurable [`ScriptedEnv`].
//!
//! Launched by an `AsyncVectorEnv`; the mock flags come first, the
//! worker arguments the runner appends follow.
//!
//! [`ScriptedEnv`]: parvec_test_utils::ScriptedEnv

use std::process::ExitCode;

use clap::Parser;
use parvec_core::AutoResetWrapper;
use parvec_harness::MockEnvArgs;
use parvec_vector::{init_logging, run_worker, run_worker_inline, WorkerArgs, WorkerError};
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "parvec-mock-worker")]
#[command(about = "Serve a scripted multi-agent env to a parvec async runner")]
struct Cli {
    #[command(flatten)]
    mock: MockEnvArgs,
    #[command(flatten)]
    worker: WorkerArgs,
}

fn serve(cli: &Cli) -> Result<(), WorkerError> {
    let index = cli.worker.index;
    let build = || cli.mock.build(index);
    match (cli.mock.autoreset, cli.mock.inline) {
        (false, false) => run_worker(&cli.worker, build),
        (false, true) => run_worker_inline(&cli.worker, build),
        (true, false) => run_worker(&cli.worker, || AutoResetWrapper::new(build())),
        (true, true) => run_worker_inline(&cli.worker, || AutoResetWrapper::new(build())),
    }
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();
    match serve(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(index = cli.worker.index, error = %e, "mock worker exited");
            ExitCode::FAILURE
        }
    }
}
