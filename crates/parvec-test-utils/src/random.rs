//! An environment whose agent lifetimes are drawn from the reset seed.

use parvec_core::{
    AgentId, AgentMap, EnvError, EnvState, Options, ParallelEnv, ResetOutput, Space,
    StateSpaces, StepOutput, Value,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::scripted::{ScriptedEnv, ScriptedInfo};

/// [`ScriptedEnv`] with lifetimes in `1..=max_lifetime`, re-drawn on every
/// reset. Seeded resets are reproducible; unseeded resets continue the
/// current random stream.
#[derive(Clone, Debug)]
pub struct RandomLifetimeEnv {
    inner: ScriptedEnv,
    num_agents: usize,
    max_lifetime: u32,
    rng: ChaCha8Rng,
}

impl RandomLifetimeEnv {
    pub fn new(num_agents: usize, max_lifetime: u32) -> Self {
        let names: Vec<String> = (0..num_agents).map(|i| format!("agent_{i}")).collect();
        let lifetimes: Vec<(&str, u32)> = names.iter().map(|n| (n.as_str(), max_lifetime)).collect();
        Self {
            inner: ScriptedEnv::new(&lifetimes),
            num_agents,
            max_lifetime: max_lifetime.max(1),
            rng: ChaCha8Rng::seed_from_u64(0),
        }
    }

    pub fn inner(&self) -> &ScriptedEnv {
        &self.inner
    }
}

impl ParallelEnv for RandomLifetimeEnv {
    type Observation = Vec<f32>;
    type Action = i64;
    type State = Vec<f32>;
    type Info = ScriptedInfo;

    fn possible_agents(&self) -> &[AgentId] {
        self.inner.possible_agents()
    }

    fn agents(&self) -> &[AgentId] {
        self.inner.agents()
    }

    fn observation_space(&self, agent: &AgentId) -> Option<&Space> {
        self.inner.observation_space(agent)
    }

    fn action_space(&self, agent: &AgentId) -> Option<&Space> {
        self.inner.action_space(agent)
    }

    fn reset(
        &mut self,
        seed: Option<u64>,
        options: &Options,
    ) -> Result<ResetOutput<Vec<f32>, ScriptedInfo>, EnvError> {
        if let Some(seed) = seed {
            self.rng = ChaCha8Rng::seed_from_u64(seed);
        }
        let lifetimes = (0..self.num_agents)
            .map(|_| self.rng.random_range(1..=self.max_lifetime))
            .collect();
        self.inner.set_lifetimes(lifetimes);
        self.inner.reset(seed, options)
    }

    fn step(
        &mut self,
        actions: AgentMap<i64>,
    ) -> Result<StepOutput<Vec<f32>, ScriptedInfo>, EnvError> {
        self.inner.step(actions)
    }

    fn state_spaces(&self) -> StateSpaces {
        self.inner.state_spaces()
    }

    fn state(&self) -> Result<EnvState<Vec<f32>>, EnvError> {
        self.inner.state()
    }

    fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, EnvError> {
        self.inner.call(name, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn episode_length(env: &mut RandomLifetimeEnv, seed: u64) -> u32 {
        env.reset(Some(seed), &Options::new()).unwrap();
        while !env.agents().is_empty() {
            let actions = env.agents().iter().map(|a| (a.clone(), 0)).collect();
            env.step(actions).unwrap();
        }
        env.inner().t()
    }

    #[test]
    fn seeded_episodes_repeat() {
        let mut env = RandomLifetimeEnv::new(3, 20);
        let a = episode_length(&mut env, 11);
        let b = episode_length(&mut env, 11);
        assert_eq!(a, b);
        assert!((1..=20).contains(&a));
    }
}
