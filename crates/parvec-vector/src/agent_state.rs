//! Agent-major view of per-agent env state.

use std::ops::{Deref, DerefMut};

use parvec_core::{AgentId, AgentMajor, BatchedSpace, EnvMap, EnvState, Space, StateSpaces};

use crate::error::VectorError;
use crate::vector::VectorEnv;

/// Wraps a runner whose envs keep one state per agent and republishes
/// `state()` agent-major: `state[agent][env]` for every env holding
/// `agent`.
///
/// Everything else is reached through `Deref` to the wrapped runner.
#[derive(Debug)]
pub struct AgentStateWrapper<V> {
    inner: V,
}

impl<V: VectorEnv> AgentStateWrapper<V> {
    /// Wrap `inner`. Fails unless its envs declare per-agent state
    /// spaces.
    pub fn new(inner: V) -> Result<Self, VectorError> {
        match inner.state_spaces() {
            StateSpaces::PerAgent(_) => Ok(Self { inner }),
            StateSpaces::Global(_) => Err(VectorError::StateUnavailable {
                reason: "sub-environments have a global state space; call `state()` on the \
                         runner directly"
                    .to_owned(),
            }),
            StateSpaces::None => Err(VectorError::StateUnavailable {
                reason: "sub-environments do not expose per-agent state spaces".to_owned(),
            }),
        }
    }

    /// State space of `agent` in one env.
    pub fn single_state_space(&self, agent: &AgentId) -> Option<&Space> {
        match self.inner.state_spaces() {
            StateSpaces::PerAgent(spaces) => spaces.get(agent),
            _ => None,
        }
    }

    /// Batched state space of `agent`.
    pub fn state_space(&self, agent: &AgentId) -> Option<BatchedSpace> {
        let single = self.single_state_space(agent)?.clone();
        Some(BatchedSpace::new(single, self.inner.env_ids().to_vec()))
    }

    /// Per-agent state of every env, agent-major.
    ///
    /// Only envs currently holding an agent appear under it. An env
    /// reporting a global state is a contract violation.
    pub fn state(&mut self) -> Result<AgentMajor<V::State>, VectorError> {
        let raw = self.inner.raw_states()?;
        let mut major: AgentMajor<V::State> = self
            .inner
            .possible_agents()
            .iter()
            .map(|a| (a.clone(), EnvMap::new()))
            .collect();

        for (env, state) in raw {
            let mut per_agent = match state {
                EnvState::PerAgent(states) => states,
                EnvState::Empty => continue,
                EnvState::Global(_) => {
                    return Err(VectorError::contract(
                        env,
                        "returned a global state for per-agent state spaces",
                    ))
                }
            };
            for agent in self.inner.agents()[&env].iter() {
                let s = per_agent.swap_remove(agent).ok_or_else(|| {
                    VectorError::contract(env, format!("no state for live agent '{agent}'"))
                })?;
                if let Some(envs) = major.get_mut(agent) {
                    envs.insert(env, s);
                }
            }
        }

        major.retain(|_, envs| !envs.is_empty());
        Ok(major)
    }

    /// The wrapped runner.
    pub fn inner(&self) -> &V {
        &self.inner
    }

    /// Mutable access to the wrapped runner.
    pub fn inner_mut(&mut self) -> &mut V {
        &mut self.inner
    }

    /// Unwrap.
    pub fn into_inner(self) -> V {
        self.inner
    }
}

impl<V> Deref for AgentStateWrapper<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.inner
    }
}

impl<V> DerefMut for AgentStateWrapper<V> {
    fn deref_mut(&mut self) -> &mut V {
        &mut self.inner
    }
}
