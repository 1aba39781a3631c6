//! Test utilities and mock environments for parvec development.
//!
//! - [`ScriptedEnv`]: agents with fixed lifetimes, deterministic
//!   observations, optional state, and injectable failures.
//! - [`RandomLifetimeEnv`]: agents whose lifetimes are drawn from the
//!   reset seed, for property tests.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod random;
pub mod scripted;

pub use random::RandomLifetimeEnv;
pub use scripted::{ScriptedEnv, ScriptedInfo, StateMode};
