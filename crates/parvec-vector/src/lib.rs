//! Vector runners that batch many multi-agent environments behind one
//! `reset` / `step` pair.
//!
//! Results are agent-major: `observations[agent][env]`. Because agents
//! finish at different times in different envs, the set of envs holding
//! an agent changes from step to step. [`AgentLedger`] is the single
//! source of truth for that membership.
//!
//! ```text
//! caller ── reset/step ──▶ SyncVectorEnv ── direct calls ──▶ envs (in-process)
//!                         AsyncVectorEnv ── local socket ──▶ worker processes
//!                              │                                   │
//!                              └──── SharedArena (observations) ◀──┘
//! ```
//!
//! - [`SyncVectorEnv`] steps every env in order on the caller's thread.
//! - [`AsyncVectorEnv`] owns one worker process per env and exposes
//!   begin/await pairs guarded by [`AsyncState`].
//! - [`worker`] is the loop each worker process runs.
//! - [`AgentStateWrapper`] republishes per-agent env state agent-major.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod agent_state;
pub mod async_vector;
pub mod batch;
pub mod config;
pub mod error;
pub mod ledger;
pub mod protocol;
pub mod shared;
pub mod signature;
pub mod sync_vector;
pub mod vector;
pub mod worker;

pub use agent_state::AgentStateWrapper;
pub use async_vector::{AsyncState, AsyncVectorEnv, CloseReport};
pub use batch::{Seeds, VectorReset, VectorStep};
pub use config::{AsyncConfig, CloseOptions, ConfigError, SyncConfig, WorkerSpawn};
pub use error::VectorError;
pub use ledger::AgentLedger;
pub use shared::SharedCodec;
pub use signature::{SpaceCheck, SpaceSignature};
pub use sync_vector::SyncVectorEnv;
pub use vector::VectorEnv;
pub use worker::{
    init_logging, run_worker, run_worker_inline, worker_main, WorkerArgs, WorkerError,
};
