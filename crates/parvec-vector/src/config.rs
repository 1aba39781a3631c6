//! Runner configuration, validation, and configuration errors.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use parvec_core::{AgentId, EnvId};
use thiserror::Error;

// ── SyncConfig ─────────────────────────────────────────────────────

/// Configuration for [`SyncVectorEnv`](crate::SyncVectorEnv).
#[derive(Clone, Debug, Default)]
pub struct SyncConfig {
    /// After every env call, check that the result maps are keyed by
    /// exactly the agents the env reported. Slows down stepping.
    /// Default: `false`.
    pub debug: bool,
}

impl SyncConfig {
    /// Check structural invariants. Always succeeds today.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

// ── WorkerSpawn ────────────────────────────────────────────────────

/// How to launch one worker process.
///
/// The runner appends the worker arguments (`--socket-name`, `--index`,
/// `--num-envs` and the shared-memory paths) after `args`, so `program`
/// must parse them, typically by flattening
/// [`WorkerArgs`](crate::WorkerArgs) into its own parser.
#[derive(Clone, Debug)]
pub struct WorkerSpawn {
    /// Executable to run.
    pub program: PathBuf,
    /// Leading arguments, placed before the worker arguments.
    pub args: Vec<OsString>,
}

impl WorkerSpawn {
    /// Launch `program` with no leading arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append a leading argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Re-launch the current executable as the worker.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

// ── AsyncConfig ────────────────────────────────────────────────────

/// Configuration for [`AsyncVectorEnv`](crate::AsyncVectorEnv).
#[derive(Clone, Debug)]
pub struct AsyncConfig {
    /// Number of worker processes, one per sub-environment.
    pub num_envs: usize,
    /// Worker launch recipe.
    pub worker: WorkerSpawn,
    /// Route observations (and a global or per-agent state) through a
    /// shared-memory arena instead of the socket. Default: `true`.
    pub use_shared_memory: bool,
    /// How long to wait for every worker to connect. Default: 30 s.
    pub connect_timeout: Duration,
}

impl AsyncConfig {
    /// `num_envs` workers launched with `worker`, other fields default.
    pub fn new(num_envs: usize, worker: WorkerSpawn) -> Self {
        Self {
            num_envs,
            worker,
            use_shared_memory: true,
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// Builder-style toggle for [`use_shared_memory`](Self::use_shared_memory).
    pub fn shared_memory(mut self, enabled: bool) -> Self {
        self.use_shared_memory = enabled;
        self
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_envs == 0 {
            return Err(ConfigError::NoEnvs);
        }
        if self.num_envs > u32::MAX as usize {
            return Err(ConfigError::TooManyEnvs {
                value: self.num_envs,
            });
        }
        if self.worker.program.as_os_str().is_empty() {
            return Err(ConfigError::EmptyWorkerProgram);
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroConnectTimeout);
        }
        Ok(())
    }
}

// ── CloseOptions ───────────────────────────────────────────────────

/// Options for closing an [`AsyncVectorEnv`](crate::AsyncVectorEnv).
#[derive(Clone, Copy, Debug, Default)]
pub struct CloseOptions {
    /// Bound on waiting for a pending operation and for workers to
    /// acknowledge `close`. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Kill workers instead of asking them to close.
    pub terminate: bool,
}

// ── ConfigError ────────────────────────────────────────────────────

/// Configuration errors, raised at construction or at the start of the
/// offending call.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A runner needs at least one sub-environment.
    #[error("a vector env requires at least one sub-environment")]
    NoEnvs,
    /// More envs than `EnvId` can address.
    #[error("{value} sub-environments exceed the addressable maximum")]
    TooManyEnvs {
        /// Requested count.
        value: usize,
    },
    /// `WorkerSpawn::program` is empty.
    #[error("worker program is empty")]
    EmptyWorkerProgram,
    /// `connect_timeout` is zero.
    #[error("connect_timeout must be non-zero")]
    ZeroConnectTimeout,
    /// A per-env seed sequence does not have one seed per env.
    #[error("got {actual} seeds for {expected} sub-environments")]
    SeedCount {
        /// Number of envs.
        expected: usize,
        /// Number of seeds supplied.
        actual: usize,
    },
    /// A seed mapping's keys do not match the env ids.
    #[error("seed keys must match the ids of sub-environments; {env} is {problem}")]
    SeedKeys {
        /// First offending env.
        env: EnvId,
        /// `"missing"` or `"unknown"`.
        problem: &'static str,
    },
    /// A sub-environment's `possible_agents` differ from the reference.
    #[error("env_0 and {env} have different possible agents")]
    PossibleAgentsMismatch {
        /// The offending env.
        env: EnvId,
    },
    /// The reference env has no space for one of its possible agents.
    #[error("reference env has no {property} space for agent '{agent}'")]
    MissingSpace {
        /// `"observation"` or `"action"`.
        property: &'static str,
        /// The agent.
        agent: AgentId,
    },
    /// A sub-environment's spaces differ from the reference.
    #[error(
        "{env} has a {property} space different from env_0; in order to batch \
         {property}s, the {property} spaces from all environments must be equal"
    )]
    SpaceMismatch {
        /// `"observation"`, `"action"` or `"state"`.
        property: &'static str,
        /// The offending env.
        env: EnvId,
    },
    /// Shared memory was requested for payloads that cannot be laid out
    /// in fixed-size blocks.
    #[error("shared memory is unsupported here ({reason}); set `use_shared_memory = false`")]
    SharedMemoryUnsupported {
        /// What could not be laid out.
        reason: String,
    },
}
