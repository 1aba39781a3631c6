//! Environment wrappers.

use crate::env::{EnvLayer, EnvState, LayerMarker, ParallelEnv, ResetOutput, StateSpaces, StepOutput};
use crate::error::EnvError;
use crate::id::{AgentId, AgentMap};
use crate::space::Space;
use crate::value::{Options, Value};

/// Resets the wrapped environment on the first `step` after all of its
/// agents finished.
///
/// The autoreset step ignores the supplied actions and reports zero
/// reward with false termination and truncation for every reset-time
/// agent. Vector runners detect the [`LayerMarker::AutoReset`] marker and
/// leave resetting to this wrapper.
#[derive(Debug)]
pub struct AutoResetWrapper<E> {
    env: E,
    needs_reset: bool,
}

impl<E: ParallelEnv> AutoResetWrapper<E> {
    /// Wrap `env`.
    pub fn new(env: E) -> Self {
        Self {
            env,
            needs_reset: false,
        }
    }

    /// The wrapped environment.
    pub fn inner(&self) -> &E {
        &self.env
    }

    /// Mutable access to the wrapped environment.
    pub fn inner_mut(&mut self) -> &mut E {
        &mut self.env
    }

    /// Unwrap.
    pub fn into_inner(self) -> E {
        self.env
    }

    /// Whether the next `step` will reset instead.
    pub fn needs_reset(&self) -> bool {
        self.needs_reset
    }
}

impl<E: ParallelEnv> ParallelEnv for AutoResetWrapper<E> {
    type Observation = E::Observation;
    type Action = E::Action;
    type State = E::State;
    type Info = E::Info;

    fn possible_agents(&self) -> &[AgentId] {
        self.env.possible_agents()
    }

    fn agents(&self) -> &[AgentId] {
        self.env.agents()
    }

    fn observation_space(&self, agent: &AgentId) -> Option<&Space> {
        self.env.observation_space(agent)
    }

    fn action_space(&self, agent: &AgentId) -> Option<&Space> {
        self.env.action_space(agent)
    }

    fn reset(
        &mut self,
        seed: Option<u64>,
        options: &Options,
    ) -> Result<ResetOutput<Self::Observation, Self::Info>, EnvError> {
        self.needs_reset = false;
        self.env.reset(seed, options)
    }

    fn step(
        &mut self,
        actions: AgentMap<Self::Action>,
    ) -> Result<StepOutput<Self::Observation, Self::Info>, EnvError> {
        if self.needs_reset {
            tracing::debug!("all agents finished, resetting wrapped env");
            self.needs_reset = false;
            let reset = self.env.reset(None, &Options::new())?;
            return Ok(StepOutput::from_reset(reset));
        }
        let out = self.env.step(actions)?;
        self.needs_reset = self.env.agents().is_empty();
        Ok(out)
    }

    fn state_spaces(&self) -> StateSpaces {
        self.env.state_spaces()
    }

    fn state(&self) -> Result<EnvState<Self::State>, EnvError> {
        self.env.state()
    }

    fn close(&mut self) -> Result<(), EnvError> {
        self.env.close()
    }

    fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, EnvError> {
        self.env.call(name, args)
    }

    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), EnvError> {
        self.env.set_attr(name, value)
    }

    fn layer_marker(&self) -> Option<LayerMarker> {
        Some(LayerMarker::AutoReset)
    }

    fn inner_layer(&self) -> Option<&dyn EnvLayer> {
        Some(&self.env)
    }
}
