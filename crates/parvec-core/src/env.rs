//! The sub-environment contract consumed by both vector runners.
//!
//! A [`ParallelEnv`] is one multi-agent simulation instance. Every live
//! agent acts simultaneously on each `step`; agents leave the live set when
//! they terminate or truncate and only come back through a `reset`.
//!
//! Wrappers expose themselves through [`EnvLayer`], so runners can walk a
//! wrapper chain looking for a [`LayerMarker`] (for example, to skip
//! their own autoreset when the env already resets itself).

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::EnvError;
use crate::id::{AgentId, AgentMap};
use crate::space::Space;
use crate::value::{Options, Value};

/// Bounds shared by every payload type that may cross a process boundary.
pub trait Payload: Clone + Debug + Send + Serialize + DeserializeOwned + 'static {}

impl<T> Payload for T where T: Clone + Debug + Send + Serialize + DeserializeOwned + 'static {}

// ── Result types ────────────────────────────────────────────────

/// Result of resetting one sub-environment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResetOutput<O, I> {
    /// Initial observation per live agent.
    pub observations: AgentMap<O>,
    /// Per-agent info.
    pub infos: AgentMap<I>,
}

/// Result of stepping one sub-environment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepOutput<O, I> {
    /// Observation per agent after the step.
    pub observations: AgentMap<O>,
    /// Reward per acting agent.
    pub rewards: AgentMap<f64>,
    /// Whether each acting agent reached a terminal state.
    pub terminations: AgentMap<bool>,
    /// Whether each acting agent was cut off by a time limit.
    pub truncations: AgentMap<bool>,
    /// Per-agent info.
    pub infos: AgentMap<I>,
}

impl<O, I: Default> StepOutput<O, I> {
    /// Turn a reset into a step result: zero reward and false flags for
    /// every reset-time agent.
    pub fn from_reset(reset: ResetOutput<O, I>) -> Self {
        let agents: Vec<AgentId> = reset.observations.keys().cloned().collect();
        let mut infos = reset.infos;
        for agent in &agents {
            infos.entry(agent.clone()).or_default();
        }
        StepOutput {
            rewards: agents.iter().map(|a| (a.clone(), 0.0)).collect(),
            terminations: agents.iter().map(|a| (a.clone(), false)).collect(),
            truncations: agents.iter().map(|a| (a.clone(), false)).collect(),
            observations: reset.observations,
            infos,
        }
    }
}

/// State spaces declared by a sub-environment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub enum StateSpaces {
    /// The environment has no state.
    #[default]
    None,
    /// One global state shared by all agents.
    Global(Space),
    /// One state per agent.
    PerAgent(AgentMap<Space>),
}

/// A sub-environment's current state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EnvState<S> {
    /// Nothing to report (for example, every agent has finished).
    Empty,
    /// One global state.
    Global(S),
    /// One state per live agent.
    PerAgent(AgentMap<S>),
}

impl<S> EnvState<S> {
    /// Whether the state carries no content.
    pub fn is_empty(&self) -> bool {
        match self {
            EnvState::Empty => true,
            EnvState::Global(_) => false,
            EnvState::PerAgent(states) => states.is_empty(),
        }
    }
}

// ── Wrapper chain ───────────────────────────────────────────────

/// Tag carried by a wrapper layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum LayerMarker {
    /// The layer resets its inner environment once every agent has
    /// finished.
    AutoReset,
    /// An application-defined tag.
    Custom(&'static str),
}

/// Object-safe view of one layer of a wrapper chain.
pub trait EnvLayer {
    /// This layer's marker, if it has one.
    fn marker(&self) -> Option<LayerMarker>;

    /// The wrapped layer, or `None` for an unwrapped environment.
    fn inner(&self) -> Option<&dyn EnvLayer>;
}

impl<E: ParallelEnv + ?Sized> EnvLayer for E {
    fn marker(&self) -> Option<LayerMarker> {
        self.layer_marker()
    }

    fn inner(&self) -> Option<&dyn EnvLayer> {
        self.inner_layer()
    }
}

/// Whether any layer of the chain starting at `layer` carries `marker`.
pub fn has_marker(layer: &dyn EnvLayer, marker: LayerMarker) -> bool {
    let mut current = Some(layer);
    while let Some(l) = current {
        if l.marker() == Some(marker) {
            return true;
        }
        current = l.inner();
    }
    false
}

// ── ParallelEnv ─────────────────────────────────────────────────

/// A single multi-agent simulation instance.
///
/// `possible_agents` is fixed for the lifetime of the environment;
/// `agents` is always an ordered subsequence of it.
pub trait ParallelEnv: Send {
    /// Per-agent observation.
    type Observation: Payload;
    /// Per-agent action.
    type Action: Payload;
    /// Global or per-agent state.
    type State: Payload;
    /// Per-agent info.
    type Info: Payload + Default;

    /// Every agent that may ever be live, in a fixed order.
    fn possible_agents(&self) -> &[AgentId];

    /// Currently live agents, in `possible_agents` order.
    fn agents(&self) -> &[AgentId];

    /// Observation space of `agent`, `None` for an unknown agent.
    fn observation_space(&self, agent: &AgentId) -> Option<&Space>;

    /// Action space of `agent`, `None` for an unknown agent.
    fn action_space(&self, agent: &AgentId) -> Option<&Space>;

    /// Start a new episode.
    fn reset(
        &mut self,
        seed: Option<u64>,
        options: &Options,
    ) -> Result<ResetOutput<Self::Observation, Self::Info>, EnvError>;

    /// Advance one step with an action for each live agent.
    fn step(
        &mut self,
        actions: AgentMap<Self::Action>,
    ) -> Result<StepOutput<Self::Observation, Self::Info>, EnvError>;

    /// Declared state spaces. Defaults to no state.
    fn state_spaces(&self) -> StateSpaces {
        StateSpaces::None
    }

    /// Current state.
    fn state(&self) -> Result<EnvState<Self::State>, EnvError> {
        Err(EnvError::StateUnsupported)
    }

    /// Release resources held by the environment.
    fn close(&mut self) -> Result<(), EnvError> {
        Ok(())
    }

    /// Invoke a named capability.
    fn call(&mut self, name: &str, _args: &[Value]) -> Result<Value, EnvError> {
        Err(EnvError::UnknownCapability {
            name: name.to_owned(),
        })
    }

    /// Set a named attribute.
    fn set_attr(&mut self, name: &str, _value: Value) -> Result<(), EnvError> {
        Err(EnvError::UnknownAttribute {
            name: name.to_owned(),
        })
    }

    /// Marker for this layer when the env is a wrapper.
    fn layer_marker(&self) -> Option<LayerMarker> {
        None
    }

    /// The wrapped env when this env is a wrapper.
    fn inner_layer(&self) -> Option<&dyn EnvLayer> {
        None
    }
}

impl<E: ParallelEnv + ?Sized> ParallelEnv for Box<E> {
    type Observation = E::Observation;
    type Action = E::Action;
    type State = E::State;
    type Info = E::Info;

    fn possible_agents(&self) -> &[AgentId] {
        (**self).possible_agents()
    }

    fn agents(&self) -> &[AgentId] {
        (**self).agents()
    }

    fn observation_space(&self, agent: &AgentId) -> Option<&Space> {
        (**self).observation_space(agent)
    }

    fn action_space(&self, agent: &AgentId) -> Option<&Space> {
        (**self).action_space(agent)
    }

    fn reset(
        &mut self,
        seed: Option<u64>,
        options: &Options,
    ) -> Result<ResetOutput<Self::Observation, Self::Info>, EnvError> {
        (**self).reset(seed, options)
    }

    fn step(
        &mut self,
        actions: AgentMap<Self::Action>,
    ) -> Result<StepOutput<Self::Observation, Self::Info>, EnvError> {
        (**self).step(actions)
    }

    fn state_spaces(&self) -> StateSpaces {
        (**self).state_spaces()
    }

    fn state(&self) -> Result<EnvState<Self::State>, EnvError> {
        (**self).state()
    }

    fn close(&mut self) -> Result<(), EnvError> {
        (**self).close()
    }

    fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, EnvError> {
        (**self).call(name, args)
    }

    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), EnvError> {
        (**self).set_attr(name, value)
    }

    fn layer_marker(&self) -> Option<LayerMarker> {
        (**self).layer_marker()
    }

    fn inner_layer(&self) -> Option<&dyn EnvLayer> {
        (**self).inner_layer()
    }
}
