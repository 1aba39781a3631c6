//! Parvec: vectorized multi-agent environments.
//!
//! This is the top-level facade crate that re-exports the public API from
//! the parvec sub-crates. Most users only need `parvec` as a dependency.
//!
//! # Quick start
//!
//! ```rust
//! use parvec::prelude::*;
//!
//! // Every agent acts once, then terminates.
//! struct OneShot {
//!     possible: Vec<AgentId>,
//!     agents: Vec<AgentId>,
//!     space: Space,
//! }
//!
//! impl ParallelEnv for OneShot {
//!     type Observation = Vec<f32>;
//!     type Action = i64;
//!     type State = Vec<f32>;
//!     type Info = ();
//!
//!     fn possible_agents(&self) -> &[AgentId] { &self.possible }
//!     fn agents(&self) -> &[AgentId] { &self.agents }
//!     fn observation_space(&self, _: &AgentId) -> Option<&Space> { Some(&self.space) }
//!     fn action_space(&self, _: &AgentId) -> Option<&Space> { Some(&self.space) }
//!
//!     fn reset(
//!         &mut self,
//!         _seed: Option<u64>,
//!         _options: &Options,
//!     ) -> Result<ResetOutput<Vec<f32>, ()>, EnvError> {
//!         self.agents = self.possible.clone();
//!         Ok(ResetOutput {
//!             observations: self.agents.iter().map(|a| (a.clone(), vec![0.0])).collect(),
//!             infos: AgentMap::new(),
//!         })
//!     }
//!
//!     fn step(&mut self, actions: AgentMap<i64>) -> Result<StepOutput<Vec<f32>, ()>, EnvError> {
//!         let done = std::mem::take(&mut self.agents);
//!         Ok(StepOutput {
//!             observations: done.iter().map(|a| (a.clone(), vec![actions[a] as f32])).collect(),
//!             rewards: done.iter().map(|a| (a.clone(), 1.0)).collect(),
//!             terminations: done.iter().map(|a| (a.clone(), true)).collect(),
//!             truncations: done.iter().map(|a| (a.clone(), false)).collect(),
//!             infos: AgentMap::new(),
//!         })
//!     }
//! }
//!
//! let make = || OneShot {
//!     possible: vec!["p0".into(), "p1".into()],
//!     agents: Vec::new(),
//!     space: Space::boxed(0.0, 1.0, &[1]),
//! };
//! let mut venv = SyncVectorEnv::new(vec![make(), make()], SyncConfig::default()).unwrap();
//! let reset = venv.reset(Seeds::Broadcast(42), &Options::new()).unwrap();
//! assert_eq!(reset.observations["p0"].len(), 2);
//!
//! let actions: AgentMajor<i64> = venv
//!     .possible_agents()
//!     .iter()
//!     .map(|a| (a.clone(), venv.envs_have_agent(a).iter().map(|e| (*e, 1)).collect()))
//!     .collect();
//! let step = venv.step(actions).unwrap();
//! assert!(step.terminations["p1"][&EnvId(1)]);
//! assert!(venv.autoreset_envs().values().all(|flagged| *flagged));
//! ```
//!
//! # Modules
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `parvec-core` | IDs, spaces, values, the `ParallelEnv` contract, wrappers |
//! | [`shm`] | `parvec-shm` | Shared-memory slot arenas |
//! | [`vector`] | `parvec-vector` | Sync and async runners, worker loop, ledger |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Core types, traits, and IDs (`parvec-core`).
///
/// Contains [`types::ParallelEnv`], [`types::Space`], the identifier types
/// and [`types::AutoResetWrapper`].
pub use parvec_core as types;

/// Shared-memory slot arenas (`parvec-shm`).
///
/// Used by [`vector::AsyncVectorEnv`] to return observations without
/// serializing them over the socket.
pub use parvec_shm as shm;

/// Vector runners (`parvec-vector`).
///
/// [`vector::SyncVectorEnv`] steps envs in-process,
/// [`vector::AsyncVectorEnv`] drives one worker process per env, and
/// [`vector::worker_main`] is the entry point of a worker binary.
pub use parvec_vector as vector;

/// Common imports for typical parvec usage.
///
/// ```rust
/// use parvec::prelude::*;
/// ```
pub mod prelude {
    // Core types and traits
    pub use parvec_core::{
        AgentId, AgentMajor, AgentMap, AutoResetWrapper, EnvId, EnvMap, EnvState, Options,
        ParallelEnv, ResetOutput, Space, StateSpaces, StepOutput, Value,
    };

    // Errors
    pub use parvec_core::EnvError;
    pub use parvec_vector::{ConfigError, VectorError};

    // Runners
    pub use parvec_vector::{
        AgentStateWrapper, AsyncConfig, AsyncVectorEnv, CloseOptions, Seeds, SyncConfig,
        SyncVectorEnv, VectorEnv, VectorReset, VectorStep, WorkerSpawn,
    };
}
