//! Core types and traits for parvec.
//!
//! This is the leaf crate with no internal dependencies. It defines the
//! vocabulary shared by both vector runners and the worker processes:
//!
//! ```text
//! id       EnvId, AgentId, AgentMap / EnvMap / AgentMajor aliases
//! space    Space, BatchedSpace (structural equality, fixed byte length)
//! value    Value, Options (dynamic payloads for call / set_attr / reset)
//! layout   FixedLayout (flat encoding for shared-memory slots)
//! env      ParallelEnv contract, wrapper chain, result types
//! wrappers AutoResetWrapper
//! error    EnvError, LayoutError
//! ```

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod env;
pub mod error;
pub mod id;
pub mod layout;
pub mod space;
pub mod value;
pub mod wrappers;

pub use env::{
    has_marker, EnvLayer, EnvState, LayerMarker, ParallelEnv, Payload, ResetOutput, StateSpaces,
    StepOutput,
};
pub use error::{EnvError, LayoutError};
pub use id::{AgentId, AgentList, AgentMajor, AgentMap, EnvId, EnvMap};
pub use layout::FixedLayout;
pub use space::{BatchedSpace, Space};
pub use value::{Options, Value};
pub use wrappers::AutoResetWrapper;
