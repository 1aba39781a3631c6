//! Drivers that exercise environments and vector runners end to end.
//!
//! - [`compliance`]: API-compliance checks for a single [`ParallelEnv`]
//!   and for any [`VectorEnv`], returning a [`ComplianceReport`].
//! - [`mock`]: command-line description of a [`ScriptedEnv`] shared by
//!   the `parvec-mock-worker` binary and the tests that spawn it.
//!
//! [`ParallelEnv`]: parvec_core::ParallelEnv
//! [`VectorEnv`]: parvec_vector::VectorEnv
//! [`ScriptedEnv`]: parvec_test_utils::ScriptedEnv

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod compliance;
pub mod mock;

pub use compliance::{
    discrete_policy, parallel_api_check, vector_env_check, CheckConfig, ComplianceError,
    ComplianceReport,
};
pub use mock::{MockEnvArgs, MockState};
