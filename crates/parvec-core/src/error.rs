//! Error types raised by sub-environments and payload encoding.
//!
//! [`EnvError`] is serializable so a failure raised inside a worker
//! process reaches the orchestrator with its variant and message intact.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by a sub-environment.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum EnvError {
    /// Environment-specific failure.
    #[error("{message}")]
    Failed {
        /// Human-readable description of the failure.
        message: String,
    },
    /// An action was rejected by the environment.
    #[error("invalid action for agent '{agent}': {reason}")]
    InvalidAction {
        /// The acting agent.
        agent: String,
        /// Why the action was rejected.
        reason: String,
    },
    /// An agent id outside `possible_agents` was used.
    #[error("unknown agent '{agent}'")]
    UnknownAgent {
        /// The offending id.
        agent: String,
    },
    /// `step` was called before the first `reset`.
    #[error("step called before reset")]
    NotReset,
    /// `call` named a capability the environment does not provide.
    #[error("environment has no callable '{name}'")]
    UnknownCapability {
        /// The requested capability.
        name: String,
    },
    /// `set_attr` named an attribute the environment does not expose.
    #[error("environment has no settable attribute '{name}'")]
    UnknownAttribute {
        /// The requested attribute.
        name: String,
    },
    /// An argument to `call` / `set_attr` had the wrong shape.
    #[error("bad argument for '{name}': {reason}")]
    BadArgument {
        /// Capability or attribute name.
        name: String,
        /// What was wrong.
        reason: String,
    },
    /// `call` named one of the worker's own commands.
    #[error(
        "trying to call '{name}' with `call`; use '{name}' directly instead"
    )]
    ReservedName {
        /// The reserved name.
        name: String,
    },
    /// The environment exposes no state.
    #[error("environment does not expose a state")]
    StateUnsupported,
    /// The environment panicked while handling a command.
    #[error("environment panicked: {message}")]
    Panicked {
        /// The panic payload, when it was a string.
        message: String,
    },
}

impl EnvError {
    /// Shorthand for [`EnvError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        EnvError::Failed {
            message: message.into(),
        }
    }
}

/// Errors from encoding a payload into a fixed-size shared-memory block.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LayoutError {
    /// The payload's encoded size differs from the block size.
    #[error("payload needs {actual} bytes, block holds {expected}")]
    LengthMismatch {
        /// Block size dictated by the space.
        expected: usize,
        /// Encoded payload size.
        actual: usize,
    },
    /// The block is not a whole number of elements.
    #[error("block of {len} bytes is not a multiple of the {width}-byte element")]
    Misaligned {
        /// Block size.
        len: usize,
        /// Element width.
        width: usize,
    },
}
