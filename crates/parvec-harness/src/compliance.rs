//! API-compliance drivers.
//!
//! Both drivers run random episodes and check the agent bookkeeping
//! around every call. Hard violations fail the check with
//! [`ComplianceError::Violation`]; soft ones (a result map missing an
//! entry the caller could live without, a seeded reset that is not
//! reproducible) are collected as warnings in the [`ComplianceReport`].
//!
//! ```text
//! parallel_api_check   one env:    reset(seed, options), agents ⊆ possible,
//!                                  keys cover live agents, no revival,
//!                                  stable spaces, agents() agrees with flags
//! vector_env_check     vector env: autoreset flags = empty ledger entries,
//!                                  results cover pre-step envs_have_agents,
//!                                  state covers running envs
//! ```

use parvec_core::{
    AgentId, AgentMajor, AgentMap, BatchedSpace, EnvError, EnvId, EnvState, Options, ParallelEnv,
    Space, StateSpaces, Value,
};
use parvec_vector::{Seeds, VectorEnv, VectorError};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

// ── Config ─────────────────────────────────────────────────────────

/// Bounds of a compliance run.
#[derive(Clone, Debug)]
pub struct CheckConfig {
    /// Maximum steps per episode (single env) or in total (vector env).
    /// Default: 1000.
    pub num_cycles: usize,
    /// Episodes driven after the initial seeded reset. Default: 2.
    pub episodes: usize,
    /// Seed of the initial reset. Default: 0.
    pub seed: u64,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            num_cycles: 1000,
            episodes: 2,
            seed: 0,
        }
    }
}

// ── Report and errors ──────────────────────────────────────────────

/// Outcome of a passing check.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComplianceReport {
    /// Episodes started (single env) or collective resets (vector env).
    pub episodes: usize,
    /// Steps taken.
    pub steps: usize,
    /// Soft violations, in the order found.
    pub warnings: Vec<String>,
}

impl ComplianceReport {
    fn warn(&mut self, step: usize, message: String) {
        warn!(step, "{message}");
        self.warnings.push(format!("step {step}: {message}"));
    }
}

/// A failed check.
#[derive(Debug, Error)]
pub enum ComplianceError {
    /// The environment broke the API contract.
    #[error("step {step}: {reason}")]
    Violation {
        /// Step at which the violation was seen; 0 is the reset.
        step: usize,
        /// What was violated.
        reason: String,
    },
    /// The environment itself failed.
    #[error(transparent)]
    Env(#[from] EnvError),
    /// The vector runner failed.
    #[error(transparent)]
    Vector(#[from] VectorError),
    /// Observations could not be encoded for comparison.
    #[error("cannot encode observations: {0}")]
    Encode(#[from] bincode::error::EncodeError),
}

fn violation(step: usize, reason: impl Into<String>) -> ComplianceError {
    ComplianceError::Violation {
        step,
        reason: reason.into(),
    }
}

/// A policy that samples each action from the agent's space, for envs
/// whose actions are integers.
pub fn discrete_policy<R: Rng>(mut rng: R) -> impl FnMut(&AgentId, &Space) -> i64 {
    move |_, space| space.sample(&mut rng).as_int().unwrap_or(0)
}

// ── Single env ─────────────────────────────────────────────────────

/// Drive `env` through a seeded reset and `config.episodes` episodes of
/// at most `config.num_cycles` steps, choosing actions with `policy`.
pub fn parallel_api_check<E, F>(
    env: &mut E,
    config: &CheckConfig,
    mut policy: F,
) -> Result<ComplianceReport, ComplianceError>
where
    E: ParallelEnv,
    F: FnMut(&AgentId, &Space) -> E::Action,
{
    let mut report = ComplianceReport::default();
    let possible = env.possible_agents().to_vec();
    if possible.is_empty() {
        return Err(violation(0, "possible_agents is empty"));
    }
    let mut spaces = Vec::with_capacity(possible.len());
    for agent in &possible {
        let (Some(obs), Some(act)) = (env.observation_space(agent), env.action_space(agent)) else {
            return Err(violation(0, format!("agent '{agent}' has no space")));
        };
        spaces.push((obs.clone(), act.clone()));
    }
    let has_state = !matches!(env.state_spaces(), StateSpaces::None);

    let mut options = Options::new();
    options.insert("options".to_owned(), Value::Int(1));
    let first = env.reset(Some(config.seed), &options)?;
    let again = env.reset(Some(config.seed), &options)?;
    let encoding = bincode::config::standard();
    if bincode::serde::encode_to_vec(&first.observations, encoding)?
        != bincode::serde::encode_to_vec(&again.observations, encoding)?
    {
        report.warn(0, "seeded resets are not reproducible".to_owned());
    }

    for episode in 0..config.episodes {
        let reset = env.reset(None, &Options::new())?;
        report.episodes += 1;
        check_subsequence(env.agents(), &possible, 0)?;
        let mut live = env.agents().to_vec();
        if let Some(missing) = live.iter().find(|a| !reset.observations.contains_key(*a)) {
            return Err(violation(0, format!("reset has no observation for '{missing}'")));
        }
        if live.iter().any(|a| !reset.infos.contains_key(a)) {
            report.warn(0, "reset did not give every live agent an info".to_owned());
        }
        let mut finished: Vec<AgentId> = Vec::new();

        for step in 1..=config.num_cycles {
            let actions: AgentMap<E::Action> = live
                .iter()
                .map(|agent| {
                    let index = possible.iter().position(|a| a == agent).unwrap_or(0);
                    (agent.clone(), policy(agent, &spaces[index].1))
                })
                .collect();
            let out = env.step(actions)?;
            report.steps += 1;
            if has_state {
                env.state()?;
            }

            for agent in env.agents() {
                if finished.contains(agent) {
                    return Err(violation(step, format!("agent '{agent}' was revived")));
                }
                if !live.contains(agent) {
                    live.push(agent.clone());
                }
            }
            check_subsequence(env.agents(), &possible, step)?;

            compare_keys(&mut report, step, "observation", out.observations.keys(), &live);
            compare_keys(&mut report, step, "reward", out.rewards.keys(), &live);
            compare_keys(&mut report, step, "termination", out.terminations.keys(), &live);
            compare_keys(&mut report, step, "truncation", out.truncations.keys(), &live);
            compare_keys(&mut report, step, "info", out.infos.keys(), &live);

            let done: Vec<AgentId> = live
                .iter()
                .filter(|a| {
                    out.terminations.get(*a).copied().unwrap_or(false)
                        || out.truncations.get(*a).copied().unwrap_or(false)
                })
                .cloned()
                .collect();
            finished.extend(done.iter().cloned());
            if env.agents().is_empty() && finished.len() < possible.len() {
                report.warn(
                    step,
                    "no agents present but not every possible agent finished".to_owned(),
                );
            }

            for (agent, (obs, act)) in possible.iter().zip(&spaces) {
                if env.observation_space(agent) != Some(obs) || env.action_space(agent) != Some(act)
                {
                    return Err(violation(step, format!("spaces of '{agent}' changed")));
                }
            }

            live.retain(|a| !done.contains(a));
            let agents = env.agents();
            if agents.len() != live.len() || live.iter().any(|a| !agents.contains(a)) {
                return Err(violation(
                    step,
                    format!("agents() is {agents:?} but the flags leave {live:?}"),
                ));
            }
            if live.is_empty() {
                debug!(episode, steps = step, "episode finished");
                break;
            }
        }
    }

    info!(
        episodes = report.episodes,
        steps = report.steps,
        warnings = report.warnings.len(),
        "parallel API check passed"
    );
    Ok(report)
}

fn check_subsequence(
    agents: &[AgentId],
    possible: &[AgentId],
    step: usize,
) -> Result<(), ComplianceError> {
    let mut rest = possible.iter();
    for agent in agents {
        if !rest.any(|p| p == agent) {
            return Err(violation(
                step,
                format!("agents() is not an ordered subset of possible_agents at '{agent}'"),
            ));
        }
    }
    Ok(())
}

fn compare_keys<'a>(
    report: &mut ComplianceReport,
    step: usize,
    what: &str,
    keys: impl Iterator<Item = &'a AgentId>,
    live: &[AgentId],
) {
    let keys: Vec<&AgentId> = keys.collect();
    if live.iter().any(|a| !keys.contains(&a)) {
        report.warn(step, format!("a live agent was not given a {what}"));
    }
    if keys.iter().any(|k| !live.contains(*k)) {
        report.warn(step, format!("an agent was given a {what} but was not live"));
    }
}

// ── Vector env ─────────────────────────────────────────────────────

/// Drive `venv` for `config.num_cycles` collective steps after
/// `1 + config.episodes` resets, choosing each agent's action in each env
/// with `policy`.
pub fn vector_env_check<V, F>(
    venv: &mut V,
    config: &CheckConfig,
    mut policy: F,
) -> Result<ComplianceReport, ComplianceError>
where
    V: VectorEnv,
    F: FnMut(&AgentId, &Space) -> V::Action,
{
    let mut report = ComplianceReport::default();
    let num_envs = venv.num_envs();
    let batched = |space: Option<BatchedSpace>| space.map(|s| s.len());
    for agent in venv.possible_agents() {
        if batched(venv.observation_space(agent)) != Some(num_envs)
            || batched(venv.action_space(agent)) != Some(num_envs)
        {
            return Err(violation(
                0,
                format!("batched spaces of '{agent}' do not cover {num_envs} envs"),
            ));
        }
    }

    venv.reset(Seeds::Broadcast(config.seed), &Options::new())?;
    for _ in 0..config.episodes.max(1) {
        let reset = venv.reset(Seeds::Unseeded, &Options::new())?;
        report.episodes += 1;
        check_flags(venv, 0)?;
        for (agent, envs) in venv.ledger().envs_have_agents() {
            let got = reset.observations.get(agent);
            if let Some(env) = envs.iter().find(|e| !got.is_some_and(|m| m.contains_key(*e))) {
                return Err(violation(0, format!("reset has no observation for '{agent}' in {env}")));
            }
        }
    }

    for step in 1..=config.num_cycles {
        check_state(venv, step)?;
        let before = venv.ledger().envs_have_agents().clone();
        let agents_before = venv.agents().clone();

        let mut actions = AgentMajor::new();
        for (agent, envs) in &before {
            if envs.is_empty() {
                continue;
            }
            let Some(space) = venv.single_action_space(agent).cloned() else {
                return Err(violation(step, format!("no action space for '{agent}'")));
            };
            let per_env = envs.iter().map(|e| (*e, policy(agent, &space))).collect();
            actions.insert(agent.clone(), per_env);
        }
        let out = venv.step(actions)?;
        report.steps += 1;

        if venv.agents_old() != &agents_before {
            return Err(violation(step, "agents_old is not the pre-step snapshot"));
        }
        check_flags(venv, step)?;

        for (agent, envs) in &before {
            for env in envs {
                let covered = |major: &AgentMajor<bool>| {
                    major.get(agent).is_some_and(|m| m.contains_key(env))
                };
                if !covered(&out.terminations) || !covered(&out.truncations) {
                    return Err(violation(step, format!("no flags for '{agent}' in {env}")));
                }
                if !out.rewards.get(agent).is_some_and(|m| m.contains_key(env)) {
                    return Err(violation(step, format!("no reward for '{agent}' in {env}")));
                }
                let observed = out.observations.get(agent).is_some_and(|m| m.contains_key(env))
                    || out
                        .final_observations
                        .get(agent)
                        .is_some_and(|m| m.contains_key(env));
                if !observed {
                    return Err(violation(step, format!("no observation for '{agent}' in {env}")));
                }
                if !out.infos.get(agent).is_some_and(|m| m.contains_key(env)) {
                    report.warn(step, format!("no info for '{agent}' in {env}"));
                }
            }
        }
        for (agent, envs) in venv.ledger().envs_have_agents() {
            let got = out.observations.get(agent);
            if let Some(env) = envs.iter().find(|e| !got.is_some_and(|m| m.contains_key(*e))) {
                return Err(violation(
                    step,
                    format!("no observation for live agent '{agent}' in {env}"),
                ));
            }
        }
    }

    info!(
        num_envs,
        steps = report.steps,
        warnings = report.warnings.len(),
        "vector env check passed"
    );
    Ok(report)
}

fn check_flags<V: VectorEnv>(venv: &V, step: usize) -> Result<(), ComplianceError> {
    for (env, agents) in venv.agents().iter() {
        let flagged = venv.autoreset_envs().get(env).copied().unwrap_or(false);
        if flagged != agents.is_empty() {
            return Err(violation(
                step,
                format!("{env} has {} agents but autoreset flag {flagged}", agents.len()),
            ));
        }
        for agent in venv.possible_agents() {
            if agents.contains(agent) != venv.envs_have_agent(agent).contains(env) {
                return Err(violation(
                    step,
                    format!("envs_have_agent('{agent}') disagrees with agents of {env}"),
                ));
            }
        }
    }
    Ok(())
}

fn check_state<V: VectorEnv>(venv: &mut V, step: usize) -> Result<(), ComplianceError> {
    if matches!(venv.state_spaces(), StateSpaces::None) {
        return Ok(());
    }
    let states = venv.raw_states()?;
    let running: Vec<EnvId> = venv
        .agents()
        .iter()
        .filter(|(_, agents)| !agents.is_empty())
        .map(|(env, _)| *env)
        .collect();
    for env in running {
        let covered = match states.get(&env) {
            Some(EnvState::Global(_)) => true,
            Some(EnvState::PerAgent(per_agent)) => venv.agents()[&env]
                .iter()
                .all(|a| per_agent.contains_key(a)),
            Some(EnvState::Empty) | None => false,
        };
        if !covered {
            return Err(violation(step, format!("state does not cover running {env}")));
        }
    }
    Ok(())
}
