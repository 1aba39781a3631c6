//! The collective contract shared by [`SyncVectorEnv`](crate::SyncVectorEnv)
//! and [`AsyncVectorEnv`](crate::AsyncVectorEnv).

use parvec_core::{
    AgentId, AgentMajor, BatchedSpace, EnvId, EnvMap, EnvState, Options, Payload, Space,
    StateSpaces, Value,
};

use crate::batch::{Seeds, VectorReset, VectorStep};
use crate::error::VectorError;
use crate::ledger::{AgentLedger, AgentsSnapshot};

/// Many sub-environments driven as one.
///
/// Every accessor reflects the ledger as of the last completed `reset` or
/// `step`. Results are agent-major and only contain the envs that hold
/// each agent.
pub trait VectorEnv {
    /// Per-agent observation.
    type Observation: Payload;
    /// Per-agent action.
    type Action: Payload;
    /// Global or per-agent state.
    type State: Payload;
    /// Per-agent info.
    type Info: Payload + Default;

    /// The agent-liveness ledger.
    fn ledger(&self) -> &AgentLedger;

    /// Observation space of one agent in one env.
    fn single_observation_space(&self, agent: &AgentId) -> Option<&Space>;

    /// Action space of one agent in one env.
    fn single_action_space(&self, agent: &AgentId) -> Option<&Space>;

    /// State spaces declared by the sub-environments.
    fn state_spaces(&self) -> &StateSpaces;

    /// Reset every env.
    fn reset(
        &mut self,
        seeds: Seeds,
        options: &Options,
    ) -> Result<VectorReset<Self::Observation, Self::Info>, VectorError>;

    /// Step every env with agent-major `actions`. Envs that finished on the
    /// previous step are reset instead.
    fn step(
        &mut self,
        actions: AgentMajor<Self::Action>,
    ) -> Result<VectorStep<Self::Observation, Self::Info>, VectorError>;

    /// The state of every env, unfiltered.
    fn raw_states(&mut self) -> Result<EnvMap<EnvState<Self::State>>, VectorError>;

    /// Invoke a named capability on every env.
    fn call(&mut self, name: &str, args: &[Value]) -> Result<EnvMap<Value>, VectorError>;

    /// Set a named attribute to `value` on every env.
    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), VectorError>;

    /// Release every env.
    fn close(&mut self) -> Result<(), VectorError>;

    /// Env ids in slot order.
    fn env_ids(&self) -> &[EnvId] {
        self.ledger().env_ids()
    }

    /// Number of sub-environments.
    fn num_envs(&self) -> usize {
        self.ledger().env_ids().len()
    }

    /// Every agent that may ever be live.
    fn possible_agents(&self) -> &[AgentId] {
        self.ledger().possible_agents()
    }

    /// Live agents per env.
    fn agents(&self) -> &AgentsSnapshot {
        self.ledger().agents()
    }

    /// Live agents per env before the last `reset` or `step`.
    fn agents_old(&self) -> &AgentsSnapshot {
        self.ledger().agents_old()
    }

    /// Envs currently holding `agent`.
    fn envs_have_agent(&self, agent: &AgentId) -> &[EnvId] {
        self.ledger().envs_have_agent(agent)
    }

    /// Envs that reset on the next step.
    fn autoreset_envs(&self) -> &EnvMap<bool> {
        self.ledger().autoreset_flags()
    }

    /// Live agent count per env.
    fn num_agents(&self) -> EnvMap<usize> {
        self.ledger().num_agents()
    }

    /// Batched observation space of `agent`.
    fn observation_space(&self, agent: &AgentId) -> Option<BatchedSpace> {
        let single = self.single_observation_space(agent)?.clone();
        Some(BatchedSpace::new(single, self.env_ids().to_vec()))
    }

    /// Batched action space of `agent`.
    fn action_space(&self, agent: &AgentId) -> Option<BatchedSpace> {
        let single = self.single_action_space(agent)?.clone();
        Some(BatchedSpace::new(single, self.env_ids().to_vec()))
    }

    /// Global state space of one env, `None` unless the envs have a
    /// single global state.
    fn single_state_space(&self) -> Option<&Space> {
        match self.state_spaces() {
            StateSpaces::Global(space) => Some(space),
            _ => None,
        }
    }

    /// Batched global state space.
    fn state_space(&self) -> Option<BatchedSpace> {
        let single = self.single_state_space()?.clone();
        Some(BatchedSpace::new(single, self.env_ids().to_vec()))
    }

    /// Global state per env, skipping envs with nothing to report.
    ///
    /// Fails when the envs have per-agent states (read those through
    /// [`AgentStateWrapper`](crate::AgentStateWrapper)) or no state.
    fn state(&mut self) -> Result<EnvMap<Self::State>, VectorError> {
        match self.state_spaces() {
            StateSpaces::Global(_) => {}
            StateSpaces::PerAgent(_) => {
                return Err(VectorError::StateUnavailable {
                    reason: "sub-environments have per-agent state spaces; use \
                             `AgentStateWrapper` to get the state of each agent"
                        .to_owned(),
                })
            }
            StateSpaces::None => {
                return Err(VectorError::StateUnavailable {
                    reason: "sub-environments do not expose a state".to_owned(),
                })
            }
        }
        let mut states = EnvMap::new();
        for (env, state) in self.raw_states()? {
            match state {
                EnvState::Global(s) => {
                    states.insert(env, s);
                }
                EnvState::Empty => {}
                EnvState::PerAgent(_) => {
                    return Err(VectorError::contract(
                        env,
                        "returned a per-agent state for a global state space",
                    ))
                }
            }
        }
        Ok(states)
    }
}
