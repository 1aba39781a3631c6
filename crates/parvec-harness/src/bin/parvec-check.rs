//! Run the compliance drivers against mock environments.

use std::error::Error;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use parvec_harness::{
    discrete_policy, parallel_api_check, vector_env_check, CheckConfig, ComplianceReport,
    MockEnvArgs,
};
use parvec_test_utils::RandomLifetimeEnv;
use parvec_vector::{init_logging, AsyncConfig, AsyncVectorEnv, SyncConfig, SyncVectorEnv};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "parvec-check")]
#[command(about = "API-compliance checks for parvec environments and runners")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check a single random-lifetime env
    Env {
        #[command(flatten)]
        env: EnvArgs,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Check an in-process vector of random-lifetime envs
    Sync {
        /// Number of sub-environments
        #[arg(long, default_value_t = 4)]
        num_envs: usize,
        #[command(flatten)]
        env: EnvArgs,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Check a vector of `parvec-mock-worker` processes
    Async {
        /// Number of worker processes
        #[arg(long, default_value_t = 4)]
        num_envs: usize,
        /// Return observations over the socket
        #[arg(long)]
        no_shared_memory: bool,
        #[command(flatten)]
        mock: MockEnvArgs,
        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(Args, Debug)]
struct EnvArgs {
    /// Agents per env
    #[arg(long, default_value_t = 4)]
    agents: usize,
    /// Upper bound of each agent's lifetime
    #[arg(long, default_value_t = 20)]
    max_lifetime: u32,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Step budget
    #[arg(long, default_value_t = 1000)]
    cycles: usize,
    /// Seed of the first reset and of the action sampler
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

impl RunArgs {
    fn config(&self) -> CheckConfig {
        CheckConfig {
            num_cycles: self.cycles,
            seed: self.seed,
            ..CheckConfig::default()
        }
    }
}

fn run(command: Commands) -> Result<ComplianceReport, Box<dyn Error>> {
    match command {
        Commands::Env { env, run } => {
            let mut env = RandomLifetimeEnv::new(env.agents, env.max_lifetime);
            let policy = discrete_policy(ChaCha8Rng::seed_from_u64(run.seed));
            Ok(parallel_api_check(&mut env, &run.config(), policy)?)
        }
        Commands::Sync { num_envs, env, run } => {
            let EnvArgs {
                agents,
                max_lifetime,
            } = env;
            let mut venv = SyncVectorEnv::from_fns(
                (0..num_envs).map(|_| move || RandomLifetimeEnv::new(agents, max_lifetime)),
                SyncConfig { debug: true },
            )?;
            let policy = discrete_policy(ChaCha8Rng::seed_from_u64(run.seed));
            Ok(vector_env_check(&mut venv, &run.config(), policy)?)
        }
        Commands::Async {
            num_envs,
            no_shared_memory,
            mock,
            run,
        } => {
            let program = std::env::current_exe()?.with_file_name(format!(
                "parvec-mock-worker{}",
                std::env::consts::EXE_SUFFIX
            ));
            let config = AsyncConfig::new(num_envs, mock.worker_spawn(program))
                .shared_memory(!no_shared_memory);
            let reference = || mock.reference();
            let mut venv = if mock.inline {
                AsyncVectorEnv::new_inline(reference, config)?
            } else {
                AsyncVectorEnv::new(reference, config)?
            };
            let policy = discrete_policy(ChaCha8Rng::seed_from_u64(run.seed));
            let report = vector_env_check(&mut venv, &run.config(), policy)?;
            venv.close_with(Default::default())?;
            Ok(report)
        }
    }
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(report) => {
            println!(
                "passed: {} episodes, {} steps, {} warnings",
                report.episodes,
                report.steps,
                report.warnings.len()
            );
            for warning in &report.warnings {
                println!("  warning: {warning}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "compliance check failed");
            eprintln!("failed: {e}");
            ExitCode::FAILURE
        }
    }
}
