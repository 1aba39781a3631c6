//! Space signatures used to check that every sub-environment batches
//! with the reference env.

use parvec_core::{AgentId, AgentMap, EnvId, ParallelEnv, Space, StateSpaces};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Every per-agent space of one env, keyed by its possible agents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpaceSignature {
    /// Ordered possible agents.
    pub possible_agents: Vec<AgentId>,
    /// Observation space per possible agent.
    pub observation: AgentMap<Space>,
    /// Action space per possible agent.
    pub action: AgentMap<Space>,
    /// Declared state spaces.
    pub state: StateSpaces,
}

/// Outcome of comparing a signature against the reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceCheck {
    /// Possible agents match.
    pub possible_agents: bool,
    /// Observation spaces match.
    pub observation: bool,
    /// Action spaces match.
    pub action: bool,
    /// State spaces match.
    pub state: bool,
}

impl SpaceSignature {
    /// Read the signature of `env`.
    ///
    /// Fails when `env` has no observation or action space for one of
    /// its possible agents.
    pub fn of<E: ParallelEnv + ?Sized>(env: &E) -> Result<Self, ConfigError> {
        let possible_agents = env.possible_agents().to_vec();
        let mut observation = AgentMap::with_capacity(possible_agents.len());
        let mut action = AgentMap::with_capacity(possible_agents.len());
        for agent in &possible_agents {
            let obs = env
                .observation_space(agent)
                .ok_or_else(|| ConfigError::MissingSpace {
                    property: "observation",
                    agent: agent.clone(),
                })?;
            let act = env
                .action_space(agent)
                .ok_or_else(|| ConfigError::MissingSpace {
                    property: "action",
                    agent: agent.clone(),
                })?;
            observation.insert(agent.clone(), obs.clone());
            action.insert(agent.clone(), act.clone());
        }
        Ok(Self {
            possible_agents,
            observation,
            action,
            state: env.state_spaces(),
        })
    }

    /// Compare `other` against `self` (the reference).
    pub fn compare(&self, other: &SpaceSignature) -> SpaceCheck {
        SpaceCheck {
            possible_agents: self.possible_agents == other.possible_agents,
            observation: self.observation == other.observation,
            action: self.action == other.action,
            state: self.state == other.state,
        }
    }
}

impl SpaceCheck {
    /// Whether every property matched.
    pub fn is_match(&self) -> bool {
        self.possible_agents && self.observation && self.action && self.state
    }

    /// Turn a failed check into the matching configuration error.
    pub fn into_result(self, env: EnvId) -> Result<(), ConfigError> {
        if !self.possible_agents {
            return Err(ConfigError::PossibleAgentsMismatch { env });
        }
        let property = if !self.observation {
            "observation"
        } else if !self.action {
            "action"
        } else if !self.state {
            "state"
        } else {
            return Ok(());
        };
        Err(ConfigError::SpaceMismatch { property, env })
    }
}
