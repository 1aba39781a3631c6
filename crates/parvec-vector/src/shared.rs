//! Shared-memory slot layouts and payload codecs.
//!
//! Each observation slot is the concatenation of one fixed-size block per
//! possible agent, keyed by agent name. A state slot holds either one
//! [`STATE_BLOCK`] (global state) or one block per agent.

use std::fmt;

use parvec_core::{AgentId, AgentMap, FixedLayout, LayoutError, Space, StateSpaces};
use parvec_shm::SlotLayout;

use crate::config::ConfigError;

/// Block key of a global state inside a state slot.
pub const STATE_BLOCK: &str = "__state__";

/// Encoders and decoders for payloads that travel through shared memory.
///
/// Built from [`FixedLayout`] impls with [`SharedCodec::fixed`]. Runners
/// that never touch shared memory carry `None` instead.
pub struct SharedCodec<O, S> {
    pub(crate) write_observation: fn(&O, &mut [u8]) -> Result<(), LayoutError>,
    pub(crate) read_observation: fn(&[u8]) -> Result<O, LayoutError>,
    pub(crate) write_state: fn(&S, &mut [u8]) -> Result<(), LayoutError>,
    pub(crate) read_state: fn(&[u8]) -> Result<S, LayoutError>,
}

impl<O: FixedLayout, S: FixedLayout> SharedCodec<O, S> {
    /// Codec using the payloads' fixed little-endian layouts.
    pub fn fixed() -> Self {
        Self {
            write_observation: O::write_fixed,
            read_observation: O::read_fixed,
            write_state: S::write_fixed,
            read_state: S::read_fixed,
        }
    }
}

impl<O, S> Clone for SharedCodec<O, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<O, S> Copy for SharedCodec<O, S> {}

impl<O, S> fmt::Debug for SharedCodec<O, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCodec").finish_non_exhaustive()
    }
}

fn block_len(what: &str, agent: Option<&AgentId>, space: &Space) -> Result<usize, ConfigError> {
    space
        .fixed_byte_len()
        .ok_or_else(|| ConfigError::SharedMemoryUnsupported {
            reason: match agent {
                Some(agent) => format!("{what} space of agent '{agent}' has no fixed shape"),
                None => format!("{what} space has no fixed shape"),
            },
        })
}

fn build(blocks: Vec<(String, usize)>) -> Result<SlotLayout, ConfigError> {
    SlotLayout::new(blocks).map_err(|e| ConfigError::SharedMemoryUnsupported {
        reason: e.to_string(),
    })
}

/// Observation slot layout: one block per possible agent.
pub fn observation_layout(
    possible_agents: &[AgentId],
    spaces: &AgentMap<Space>,
) -> Result<SlotLayout, ConfigError> {
    let mut blocks = Vec::with_capacity(possible_agents.len());
    for agent in possible_agents {
        let space = spaces.get(agent).ok_or_else(|| ConfigError::MissingSpace {
            property: "observation",
            agent: agent.clone(),
        })?;
        blocks.push((
            agent.as_str().to_owned(),
            block_len("observation", Some(agent), space)?,
        ));
    }
    build(blocks)
}

/// State slot layout, `None` when the envs have no state.
pub fn state_layout(
    possible_agents: &[AgentId],
    spaces: &StateSpaces,
) -> Result<Option<SlotLayout>, ConfigError> {
    match spaces {
        StateSpaces::None => Ok(None),
        StateSpaces::Global(space) => {
            let len = block_len("state", None, space)?;
            build(vec![(STATE_BLOCK.to_owned(), len)]).map(Some)
        }
        StateSpaces::PerAgent(per_agent) => {
            let mut blocks = Vec::with_capacity(possible_agents.len());
            for agent in possible_agents {
                if let Some(space) = per_agent.get(agent) {
                    blocks.push((
                        agent.as_str().to_owned(),
                        block_len("state", Some(agent), space)?,
                    ));
                }
            }
            build(blocks).map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agents() -> Vec<AgentId> {
        vec!["p0".into(), "p1".into()]
    }

    fn box_spaces() -> AgentMap<Space> {
        agents()
            .into_iter()
            .map(|a| (a, Space::boxed(0.0, 1.0, &[3])))
            .collect()
    }

    #[test]
    fn observation_blocks_follow_agent_order() {
        let layout = observation_layout(&agents(), &box_spaces()).unwrap();
        assert_eq!(layout.stride(), 24);
        assert_eq!(layout.entry("p0").unwrap(), (0, 12));
        assert_eq!(layout.entry("p1").unwrap(), (12, 12));
    }

    #[test]
    fn custom_space_is_unsupported() {
        let mut spaces = box_spaces();
        spaces.insert(
            "p1".into(),
            Space::Custom {
                name: "graph".into(),
            },
        );
        let err = observation_layout(&agents(), &spaces).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("'p1'"), "got: {msg}");
        assert!(msg.contains("use_shared_memory = false"), "got: {msg}");
    }

    #[test]
    fn global_state_has_one_block() {
        let layout = state_layout(&agents(), &StateSpaces::Global(Space::boxed(0.0, 1.0, &[2])))
            .unwrap()
            .unwrap();
        assert_eq!(layout.entry(STATE_BLOCK).unwrap(), (0, 8));
        assert!(state_layout(&agents(), &StateSpaces::None).unwrap().is_none());
    }

    #[test]
    fn fixed_codec_round_trips_observation() {
        let codec: SharedCodec<Vec<f32>, Vec<f32>> = SharedCodec::fixed();
        let mut buf = [0u8; 12];
        (codec.write_observation)(&vec![1.0, 2.0, 3.0], &mut buf).unwrap();
        assert_eq!((codec.read_observation)(&buf).unwrap(), vec![1.0, 2.0, 3.0]);
    }
}
