//! Flags describing the [`ScriptedEnv`] a mock worker serves.
//!
//! Every flag that targets one env takes the worker index, so a single
//! argument list can be handed to all workers and only the named one
//! misbehaves.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};
use parvec_core::Space;
use parvec_test_utils::scripted::OBS_DIM;
use parvec_test_utils::ScriptedEnv;
use parvec_vector::WorkerSpawn;

/// State exposed by the mock env.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum MockState {
    /// No state.
    #[default]
    None,
    /// One global state per env.
    Global,
    /// One state per live agent.
    PerAgent,
}

/// A two-agent [`ScriptedEnv`] (`p0`, `p1`) plus per-worker faults.
#[derive(Args, Clone, Debug, PartialEq)]
pub struct MockEnvArgs {
    /// Steps until both agents terminate.
    #[arg(long, default_value_t = 100)]
    pub lifetime: u32,
    /// Worker whose `p0` finishes after `--short-lifetime` steps.
    #[arg(long)]
    pub short_env: Option<u32>,
    /// Lifetime of `p0` in `--short-env`.
    #[arg(long, default_value_t = 3)]
    pub short_lifetime: u32,
    /// Worker whose env returns an error from step `--fail-step`.
    #[arg(long)]
    pub fail_env: Option<u32>,
    /// Step number that fails.
    #[arg(long, default_value_t = 1)]
    pub fail_step: u32,
    /// Worker whose env panics in step `--panic-step`.
    #[arg(long)]
    pub panic_env: Option<u32>,
    /// Step number that panics.
    #[arg(long, default_value_t = 1)]
    pub panic_step: u32,
    /// Worker that sleeps in every step. All workers when unset.
    #[arg(long)]
    pub slow_env: Option<u32>,
    /// Sleep per step, in milliseconds.
    #[arg(long, default_value_t = 0)]
    pub step_delay_ms: u64,
    /// Worker that declares a different observation space.
    #[arg(long)]
    pub mismatch_env: Option<u32>,
    /// State exposed by every env.
    #[arg(long, value_enum, default_value_t = MockState::None)]
    pub state: MockState,
    /// Wrap the env in `AutoResetWrapper`.
    #[arg(long)]
    pub autoreset: bool,
    /// Serve with `run_worker_inline`.
    #[arg(long)]
    pub inline: bool,
}

impl Default for MockEnvArgs {
    fn default() -> Self {
        Self {
            lifetime: 100,
            short_env: None,
            short_lifetime: 3,
            fail_env: None,
            fail_step: 1,
            panic_env: None,
            panic_step: 1,
            slow_env: None,
            step_delay_ms: 0,
            mismatch_env: None,
            state: MockState::None,
            autoreset: false,
            inline: false,
        }
    }
}

impl MockEnvArgs {
    /// Build the env served by worker `index`.
    pub fn build(&self, index: u32) -> ScriptedEnv {
        let p0 = if self.short_env == Some(index) {
            self.short_lifetime
        } else {
            self.lifetime
        };
        let mut env = ScriptedEnv::new(&[("p0", p0), ("p1", self.lifetime)]);
        if self.fail_env == Some(index) {
            env = env.fail_at_step(self.fail_step);
        }
        if self.panic_env == Some(index) {
            env = env.panic_at_step(self.panic_step);
        }
        if self.step_delay_ms > 0 && self.slow_env.is_none_or(|slow| slow == index) {
            env = env.with_step_delay(Duration::from_millis(self.step_delay_ms));
        }
        if self.mismatch_env == Some(index) {
            env = env.with_observation_space(Space::boxed(-1.0, f32::MAX, &[OBS_DIM + 1]));
        }
        match self.state {
            MockState::None => env,
            MockState::Global => env.with_global_state(),
            MockState::PerAgent => env.with_agent_state(),
        }
    }

    /// The env a runner should read spaces from: worker 0's env with no
    /// faults.
    pub fn reference(&self) -> ScriptedEnv {
        Self {
            fail_env: None,
            panic_env: None,
            mismatch_env: None,
            step_delay_ms: 0,
            ..self.clone()
        }
        .build(0)
    }

    /// Flags that reproduce `self`, omitting defaults.
    pub fn to_args(&self) -> Vec<OsString> {
        let defaults = Self::default();
        let mut args: Vec<OsString> = Vec::new();
        let mut push = |flag: &str, value: String| {
            args.push(flag.into());
            args.push(value.into());
        };
        if self.lifetime != defaults.lifetime {
            push("--lifetime", self.lifetime.to_string());
        }
        if let Some(index) = self.short_env {
            push("--short-env", index.to_string());
            push("--short-lifetime", self.short_lifetime.to_string());
        }
        if let Some(index) = self.fail_env {
            push("--fail-env", index.to_string());
            push("--fail-step", self.fail_step.to_string());
        }
        if let Some(index) = self.panic_env {
            push("--panic-env", index.to_string());
            push("--panic-step", self.panic_step.to_string());
        }
        if let Some(index) = self.slow_env {
            push("--slow-env", index.to_string());
        }
        if self.step_delay_ms != defaults.step_delay_ms {
            push("--step-delay-ms", self.step_delay_ms.to_string());
        }
        if let Some(index) = self.mismatch_env {
            push("--mismatch-env", index.to_string());
        }
        match self.state {
            MockState::None => {}
            MockState::Global => push("--state", "global".to_owned()),
            MockState::PerAgent => push("--state", "per-agent".to_owned()),
        }
        if self.autoreset {
            args.push("--autoreset".into());
        }
        if self.inline {
            args.push("--inline".into());
        }
        args
    }

    /// Launch recipe for `program`, a binary that flattens these flags.
    pub fn worker_spawn(&self, program: impl Into<PathBuf>) -> WorkerSpawn {
        let mut spawn = WorkerSpawn::new(program);
        spawn.args = self.to_args();
        spawn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use parvec_core::{Options, ParallelEnv};

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        mock: MockEnvArgs,
    }

    fn parse(args: Vec<OsString>) -> MockEnvArgs {
        let mut argv = vec![OsString::from("mock")];
        argv.extend(args);
        Cli::try_parse_from(argv).unwrap().mock
    }

    #[test]
    fn defaults_parse_from_no_flags() {
        assert_eq!(parse(Vec::new()), MockEnvArgs::default());
        assert!(MockEnvArgs::default().to_args().is_empty());
    }

    #[test]
    fn flags_round_trip() {
        let mock = MockEnvArgs {
            lifetime: 7,
            short_env: Some(1),
            short_lifetime: 2,
            fail_env: Some(2),
            fail_step: 4,
            step_delay_ms: 20,
            state: MockState::PerAgent,
            autoreset: true,
            ..MockEnvArgs::default()
        };
        assert_eq!(parse(mock.to_args()), mock);
    }

    #[test]
    fn short_env_only_shortens_p0_there() {
        let mock = MockEnvArgs {
            lifetime: 10,
            short_env: Some(1),
            short_lifetime: 1,
            ..MockEnvArgs::default()
        };
        let mut short = mock.build(1);
        short.reset(None, &Options::new()).unwrap();
        let actions = [("p0".into(), 0), ("p1".into(), 0)].into_iter().collect();
        short.step(actions).unwrap();
        assert_eq!(short.agents().len(), 1);

        let mut long = mock.build(0);
        long.reset(None, &Options::new()).unwrap();
        let actions = [("p0".into(), 0), ("p1".into(), 0)].into_iter().collect();
        long.step(actions).unwrap();
        assert_eq!(long.agents().len(), 2);
    }

    #[test]
    fn reference_drops_faults() {
        let mock = MockEnvArgs {
            mismatch_env: Some(0),
            ..MockEnvArgs::default()
        };
        let reference = mock.reference();
        let faulty = mock.build(0);
        let p0 = "p0".into();
        assert_ne!(reference.observation_space(&p0), faulty.observation_space(&p0));
    }

    #[test]
    fn spawn_carries_flags() {
        let mock = MockEnvArgs {
            inline: true,
            ..MockEnvArgs::default()
        };
        let spawn = mock.worker_spawn("/bin/worker");
        assert_eq!(spawn.args, vec![OsString::from("--inline")]);
    }
}
