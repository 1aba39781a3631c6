//! Strongly-typed identifiers and the agent/env keyed map aliases.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Identifies a sub-environment slot inside a vector runner.
///
/// Assigned once at construction as `EnvId(0) .. EnvId(n - 1)` and never
/// reassigned. Renders as `env_{n}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvId(pub u32);

impl EnvId {
    /// Position of this env in the runner's slot order.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// The ids of a runner with `n` sub-environments, in slot order.
    pub fn range(n: usize) -> Vec<EnvId> {
        (0..n as u32).map(EnvId).collect()
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "env_{}", self.0)
    }
}

impl From<u32> for EnvId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Identifies an agent, drawn from a sub-environment's `possible_agents`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Create an agent id from any string-like value.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The agent name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(v: &str) -> Self {
        Self(v.to_owned())
    }
}

impl From<String> for AgentId {
    fn from(v: String) -> Self {
        Self(v)
    }
}

impl std::borrow::Borrow<str> for AgentId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Ordered list of agents, typically the live agents of one env.
pub type AgentList = SmallVec<[AgentId; 8]>;

/// Per-agent values, in agent order.
pub type AgentMap<T> = IndexMap<AgentId, T>;

/// Per-env values, in env order.
pub type EnvMap<T> = IndexMap<EnvId, T>;

/// Agent-major batched values: agent first, then the envs holding it.
pub type AgentMajor<T> = IndexMap<AgentId, EnvMap<T>>;
