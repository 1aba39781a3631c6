//! A deterministic multi-agent environment with scripted agent lifetimes.
//!
//! Agent `i` terminates on the step numbered `lifetimes[i]` (1-based) and
//! leaves the live set. Observations are `[t, agent index, seed]`, so a
//! test can tell which env, agent and episode produced each one.

use std::thread;
use std::time::Duration;

use parvec_core::{
    AgentId, AgentMap, EnvError, EnvState, Options, ParallelEnv, ResetOutput, Space,
    StateSpaces, StepOutput, Value,
};
use serde::{Deserialize, Serialize};

/// Number of discrete actions per agent.
pub const NUM_ACTIONS: u64 = 4;

/// Length of every observation.
pub const OBS_DIM: usize = 3;

/// Which state the env exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateMode {
    None,
    /// `[t, live agent count]`.
    Global,
    /// `[t, agent index]` per live agent.
    PerAgent,
}

/// Info reported for every agent that acted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptedInfo {
    pub t: u32,
}

#[derive(Clone, Debug)]
pub struct ScriptedEnv {
    possible: Vec<AgentId>,
    lifetimes: Vec<u32>,
    observation_space: Space,
    action_space: Space,
    state_space: Space,
    state_mode: StateMode,
    agents: Vec<AgentId>,
    t: u32,
    seed: Option<u64>,
    reward_scale: f64,
    truncate_at: Option<u32>,
    fail_at_step: Option<u32>,
    panic_at_step: Option<u32>,
    step_delay: Option<Duration>,
    pub resets: usize,
    pub steps: usize,
    pub closes: usize,
    pub last_actions: AgentMap<i64>,
}

impl ScriptedEnv {
    /// Agents named by `lifetimes`, each finishing after its lifetime.
    pub fn new(lifetimes: &[(&str, u32)]) -> Self {
        Self {
            possible: lifetimes.iter().map(|(a, _)| AgentId::from(*a)).collect(),
            lifetimes: lifetimes.iter().map(|(_, l)| *l).collect(),
            observation_space: Space::boxed(-1.0, f32::MAX, &[OBS_DIM]),
            action_space: Space::discrete(NUM_ACTIONS),
            state_space: Space::boxed(0.0, f32::MAX, &[2]),
            state_mode: StateMode::None,
            agents: Vec::new(),
            t: 0,
            seed: None,
            reward_scale: 1.0,
            truncate_at: None,
            fail_at_step: None,
            panic_at_step: None,
            step_delay: None,
            resets: 0,
            steps: 0,
            closes: 0,
            last_actions: AgentMap::new(),
        }
    }

    /// `p0` and `p1`, both finishing after `lifetime` steps.
    pub fn two_agents(lifetime: u32) -> Self {
        Self::new(&[("p0", lifetime), ("p1", lifetime)])
    }

    /// Override every agent's observation space.
    pub fn with_observation_space(mut self, space: Space) -> Self {
        self.observation_space = space;
        self
    }

    pub fn with_global_state(mut self) -> Self {
        self.state_mode = StateMode::Global;
        self
    }

    pub fn with_agent_state(mut self) -> Self {
        self.state_mode = StateMode::PerAgent;
        self
    }

    /// Truncate every live agent on step `t`.
    pub fn truncate_at(mut self, t: u32) -> Self {
        self.truncate_at = Some(t);
        self
    }

    /// Return an error from step number `t`.
    pub fn fail_at_step(mut self, t: u32) -> Self {
        self.fail_at_step = Some(t);
        self
    }

    /// Panic inside step number `t`.
    pub fn panic_at_step(mut self, t: u32) -> Self {
        self.panic_at_step = Some(t);
        self
    }

    /// Sleep for `delay` in every step.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    /// Steps taken in the current episode.
    pub fn t(&self) -> u32 {
        self.t
    }

    /// Seed of the current episode.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn reward_scale(&self) -> f64 {
        self.reward_scale
    }

    pub(crate) fn set_lifetimes(&mut self, lifetimes: Vec<u32>) {
        self.lifetimes = lifetimes;
    }

    fn index_of(&self, agent: &AgentId) -> usize {
        self.possible.iter().position(|a| a == agent).unwrap_or(0)
    }

    fn observation(&self, agent: &AgentId) -> Vec<f32> {
        let seed = self.seed.map_or(-1.0, |s| (s % 1_000_000) as f32);
        vec![self.t as f32, self.index_of(agent) as f32, seed]
    }

    fn check_actions(&self, actions: &AgentMap<i64>) -> Result<(), EnvError> {
        for (agent, action) in actions {
            if !self.agents.contains(agent) {
                return Err(EnvError::InvalidAction {
                    agent: agent.to_string(),
                    reason: "agent is not live".into(),
                });
            }
            if !(0..NUM_ACTIONS as i64).contains(action) {
                return Err(EnvError::InvalidAction {
                    agent: agent.to_string(),
                    reason: format!("action {action} is out of range"),
                });
            }
        }
        if let Some(missing) = self.agents.iter().find(|a| !actions.contains_key(*a)) {
            return Err(EnvError::failed(format!("no action for agent '{missing}'")));
        }
        Ok(())
    }
}

impl ParallelEnv for ScriptedEnv {
    type Observation = Vec<f32>;
    type Action = i64;
    type State = Vec<f32>;
    type Info = ScriptedInfo;

    fn possible_agents(&self) -> &[AgentId] {
        &self.possible
    }

    fn agents(&self) -> &[AgentId] {
        &self.agents
    }

    fn observation_space(&self, agent: &AgentId) -> Option<&Space> {
        self.possible.contains(agent).then_some(&self.observation_space)
    }

    fn action_space(&self, agent: &AgentId) -> Option<&Space> {
        self.possible.contains(agent).then_some(&self.action_space)
    }

    fn reset(
        &mut self,
        seed: Option<u64>,
        _options: &Options,
    ) -> Result<ResetOutput<Vec<f32>, ScriptedInfo>, EnvError> {
        self.resets += 1;
        self.t = 0;
        if seed.is_some() {
            self.seed = seed;
        }
        self.agents = self.possible.clone();
        Ok(ResetOutput {
            observations: self
                .agents
                .iter()
                .map(|a| (a.clone(), self.observation(a)))
                .collect(),
            infos: self
                .agents
                .iter()
                .map(|a| (a.clone(), ScriptedInfo { t: 0 }))
                .collect(),
        })
    }

    fn step(
        &mut self,
        actions: AgentMap<i64>,
    ) -> Result<StepOutput<Vec<f32>, ScriptedInfo>, EnvError> {
        self.check_actions(&actions)?;
        let t = self.t + 1;
        if self.fail_at_step == Some(t) {
            return Err(EnvError::failed(format!("scripted failure at step {t}")));
        }
        if self.panic_at_step == Some(t) {
            panic!("scripted panic at step {t}");
        }
        if let Some(delay) = self.step_delay {
            thread::sleep(delay);
        }

        self.steps += 1;
        self.t = t;
        self.last_actions = actions.clone();

        let acted = std::mem::take(&mut self.agents);
        let mut out = StepOutput {
            observations: AgentMap::new(),
            rewards: AgentMap::new(),
            terminations: AgentMap::new(),
            truncations: AgentMap::new(),
            infos: AgentMap::new(),
        };
        for agent in &acted {
            let terminated = t >= self.lifetimes[self.index_of(agent)];
            let truncated = !terminated && self.truncate_at == Some(t);
            out.observations.insert(agent.clone(), self.observation(agent));
            out.rewards
                .insert(agent.clone(), actions[agent] as f64 * self.reward_scale);
            out.terminations.insert(agent.clone(), terminated);
            out.truncations.insert(agent.clone(), truncated);
            out.infos.insert(agent.clone(), ScriptedInfo { t });
            if !terminated && !truncated {
                self.agents.push(agent.clone());
            }
        }
        Ok(out)
    }

    fn state_spaces(&self) -> StateSpaces {
        match self.state_mode {
            StateMode::None => StateSpaces::None,
            StateMode::Global => StateSpaces::Global(self.state_space.clone()),
            StateMode::PerAgent => StateSpaces::PerAgent(
                self.possible
                    .iter()
                    .map(|a| (a.clone(), self.state_space.clone()))
                    .collect(),
            ),
        }
    }

    fn state(&self) -> Result<EnvState<Vec<f32>>, EnvError> {
        match self.state_mode {
            StateMode::None => Err(EnvError::StateUnsupported),
            StateMode::Global if self.agents.is_empty() => Ok(EnvState::Empty),
            StateMode::Global => Ok(EnvState::Global(vec![
                self.t as f32,
                self.agents.len() as f32,
            ])),
            StateMode::PerAgent => Ok(EnvState::PerAgent(
                self.agents
                    .iter()
                    .map(|a| (a.clone(), vec![self.t as f32, self.index_of(a) as f32]))
                    .collect(),
            )),
        }
    }

    fn close(&mut self) -> Result<(), EnvError> {
        self.closes += 1;
        Ok(())
    }

    fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, EnvError> {
        match name {
            "steps" => Ok(Value::Int(self.t as i64)),
            "echo" => Ok(Value::List(args.to_vec())),
            _ => Err(EnvError::UnknownCapability {
                name: name.to_owned(),
            }),
        }
    }

    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), EnvError> {
        match name {
            "reward_scale" => {
                self.reward_scale = value.as_float().ok_or_else(|| EnvError::BadArgument {
                    name: name.to_owned(),
                    reason: "expected a number".into(),
                })?;
                Ok(())
            }
            _ => Err(EnvError::UnknownAttribute {
                name: name.to_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn act_all(env: &ScriptedEnv, action: i64) -> AgentMap<i64> {
        env.agents().iter().map(|a| (a.clone(), action)).collect()
    }

    #[test]
    fn agents_leave_at_their_lifetime() {
        let mut env = ScriptedEnv::new(&[("p0", 1), ("p1", 2)]);
        env.reset(Some(3), &Options::new()).unwrap();
        let out = env.step(act_all(&env, 1)).unwrap();
        assert!(out.terminations["p0"]);
        assert!(!out.terminations["p1"]);
        assert_eq!(env.agents(), &[AgentId::from("p1")]);
        env.step(act_all(&env, 1)).unwrap();
        assert!(env.agents().is_empty());
    }

    #[test]
    fn missing_action_rejected() {
        let mut env = ScriptedEnv::two_agents(5);
        env.reset(None, &Options::new()).unwrap();
        let mut actions = act_all(&env, 0);
        actions.swap_remove("p1");
        let err = env.step(actions).unwrap_err();
        assert!(err.to_string().contains("'p1'"), "got: {err}");
    }

    #[test]
    fn observation_carries_seed() {
        let mut env = ScriptedEnv::two_agents(5);
        let out = env.reset(Some(42), &Options::new()).unwrap();
        assert_eq!(out.observations["p1"], vec![0.0, 1.0, 42.0]);
    }
}
