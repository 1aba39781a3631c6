//! Top-level error type for vector runners.
//!
//! Variants follow the runner's error taxonomy: configuration, contract
//! violations by a sub-environment, begin/await sequencing, timeouts and
//! remote failures, plus the plumbing errors underneath them.

use std::io;
use std::time::Duration;

use parvec_core::{AgentId, EnvError, EnvId, LayoutError};
use parvec_shm::ShmError;
use thiserror::Error;

use crate::async_vector::AsyncState;
use crate::config::ConfigError;
use crate::protocol::FrameError;

/// Errors from a vector runner.
#[derive(Debug, Error)]
pub enum VectorError {
    /// Malformed configuration or incompatible sub-environments.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A sub-environment returned results inconsistent with its agents.
    #[error("{env}: {reason}")]
    ContractViolation {
        /// The offending env.
        env: EnvId,
        /// What was inconsistent.
        reason: String,
    },
    /// An agent live in an env before the step has no action for it.
    #[error("no action for agent '{agent}' in {env}")]
    MissingAction {
        /// The agent.
        agent: AgentId,
        /// The env it is live in.
        env: EnvId,
    },
    /// A begin was issued while another operation is in flight.
    #[error("calling `{operation}` while waiting for a pending call to `{pending}` to complete")]
    AlreadyPending {
        /// The rejected call.
        operation: &'static str,
        /// The operation in flight.
        pending: AsyncState,
    },
    /// `call` named one of the runner's own operations.
    #[error("trying to call '{name}' with `call`; use '{name}' directly instead")]
    ReservedName {
        /// The reserved name.
        name: String,
    },
    /// An await was issued without the matching begin.
    #[error("calling `{operation}` without any prior call to `{expected}`")]
    NoPendingCall {
        /// The rejected call.
        operation: &'static str,
        /// The state the await requires.
        expected: AsyncState,
    },
    /// An await exceeded its deadline. Worker-side completion is unknown.
    #[error("the call to `{operation}` has timed out after {after:?}")]
    Timeout {
        /// The await that timed out.
        operation: &'static str,
        /// The deadline that elapsed.
        after: Duration,
    },
    /// A sub-environment failed inside worker `index`.
    #[error("worker {index}: {source}")]
    Remote {
        /// Index of the failing worker.
        index: usize,
        /// The failure as raised by the env.
        #[source]
        source: EnvError,
    },
    /// A sub-environment failed in-process.
    #[error("{env}: {source}")]
    Env {
        /// The failing env.
        env: EnvId,
        /// The failure as raised by the env.
        #[source]
        source: EnvError,
    },
    /// `state()` is not available for these sub-environments.
    #[error("{reason}")]
    StateUnavailable {
        /// Why, and what to use instead.
        reason: String,
    },
    /// A worker can no longer be used.
    #[error("worker {index} is unavailable: {reason}")]
    WorkerUnavailable {
        /// Index of the worker.
        index: usize,
        /// What happened to it.
        reason: String,
    },
    /// The runner was already closed.
    #[error("`{operation}` called on a closed runner")]
    Closed {
        /// The operation attempted.
        operation: &'static str,
    },
    /// A frame to or from a worker could not be transferred.
    #[error("worker {index}: {source}")]
    Protocol {
        /// Index of the worker.
        index: usize,
        /// The framing failure.
        #[source]
        source: FrameError,
    },
    /// A worker answered with a reply for a different command.
    #[error("worker {index}: expected a `{expected}` reply")]
    UnexpectedReply {
        /// Index of the worker.
        index: usize,
        /// The reply kind that was expected.
        expected: &'static str,
    },
    /// A shared-memory block could not be decoded.
    #[error("{env}: shared memory block for '{key}': {source}")]
    Layout {
        /// The env whose slot was read.
        env: EnvId,
        /// The block key.
        key: String,
        /// The decoding failure.
        #[source]
        source: LayoutError,
    },
    /// Shared-memory arena failure.
    #[error(transparent)]
    Shm(#[from] ShmError),
    /// OS-level failure (spawning, sockets, threads).
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
}

impl VectorError {
    /// The env-raised failure behind a `Remote` or `Env` error.
    pub fn env_error(&self) -> Option<&EnvError> {
        match self {
            VectorError::Remote { source, .. } | VectorError::Env { source, .. } => Some(source),
            _ => None,
        }
    }

    pub(crate) fn contract(env: EnvId, reason: impl Into<String>) -> Self {
        VectorError::ContractViolation {
            env,
            reason: reason.into(),
        }
    }
}
