//! Batching helpers shared by both runners.
//!
//! Actions arrive agent-major and are split per env with
//! [`partition_actions`]. Per-env results are merged back agent-major with
//! [`BatchBuilder`]:
//!
//! ```text
//! actions[agent][env] ──partition──▶ env_actions[env][agent] ──▶ envs
//!                                                                 │
//! VectorStep[agent][env] ◀──────────── BatchBuilder ◀─────────────┘
//! ```
//!
//! Observations are keyed by the agents live after the call. Rewards,
//! terminations, truncations and infos are keyed by the agents that acted.

use parvec_core::{AgentId, AgentMajor, AgentMap, EnvId, EnvMap, ResetOutput, StepOutput};

use crate::config::ConfigError;
use crate::error::VectorError;
use crate::ledger::AgentLedger;

// ── Seeds ───────────────────────────────────────────────────────────

/// Seeds for a collective reset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Seeds {
    /// Every env resets without a seed.
    #[default]
    Unseeded,
    /// The same seed for every env.
    Broadcast(u64),
    /// One seed per env, in slot order.
    PerEnv(Vec<u64>),
    /// An explicit seed per env id. Keys must equal the runner's env ids.
    Mapping(EnvMap<Option<u64>>),
}

impl From<u64> for Seeds {
    fn from(seed: u64) -> Self {
        Seeds::Broadcast(seed)
    }
}

impl From<Option<u64>> for Seeds {
    fn from(seed: Option<u64>) -> Self {
        seed.map_or(Seeds::Unseeded, Seeds::Broadcast)
    }
}

impl From<Vec<u64>> for Seeds {
    fn from(seeds: Vec<u64>) -> Self {
        Seeds::PerEnv(seeds)
    }
}

impl From<EnvMap<Option<u64>>> for Seeds {
    fn from(seeds: EnvMap<Option<u64>>) -> Self {
        Seeds::Mapping(seeds)
    }
}

/// Resolve `seeds` to one optional seed per env, in `env_ids` order.
pub fn resolve_seeds(seeds: &Seeds, env_ids: &[EnvId]) -> Result<Vec<Option<u64>>, ConfigError> {
    match seeds {
        Seeds::Unseeded => Ok(vec![None; env_ids.len()]),
        Seeds::Broadcast(seed) => Ok(vec![Some(*seed); env_ids.len()]),
        Seeds::PerEnv(list) => {
            if list.len() != env_ids.len() {
                return Err(ConfigError::SeedCount {
                    expected: env_ids.len(),
                    actual: list.len(),
                });
            }
            Ok(list.iter().copied().map(Some).collect())
        }
        Seeds::Mapping(map) => {
            if let Some(unknown) = map.keys().find(|e| !env_ids.contains(*e)) {
                return Err(ConfigError::SeedKeys {
                    env: *unknown,
                    problem: "unknown",
                });
            }
            env_ids
                .iter()
                .map(|env| {
                    map.get(env).copied().ok_or(ConfigError::SeedKeys {
                        env: *env,
                        problem: "missing",
                    })
                })
                .collect()
        }
    }
}

// ── Actions ─────────────────────────────────────────────────────────

/// Split agent-major actions into one action map per env.
///
/// Uses the ledger as it stands before the step: an env receives actions
/// only for the agents live in it. Surplus entries are dropped. Every env
/// gets an entry, empty for envs with no live agents.
pub fn partition_actions<A>(
    mut actions: AgentMajor<A>,
    ledger: &AgentLedger,
) -> Result<EnvMap<AgentMap<A>>, VectorError> {
    let mut per_env: EnvMap<AgentMap<A>> = ledger
        .env_ids()
        .iter()
        .map(|env| (*env, AgentMap::new()))
        .collect();

    for (agent, envs) in ledger.envs_have_agents() {
        let Some(first) = envs.first() else {
            continue;
        };
        let Some(mut agent_actions) = actions.swap_remove(agent) else {
            return Err(VectorError::MissingAction {
                agent: agent.clone(),
                env: *first,
            });
        };
        for env in envs {
            let action =
                agent_actions
                    .swap_remove(env)
                    .ok_or_else(|| VectorError::MissingAction {
                        agent: agent.clone(),
                        env: *env,
                    })?;
            if let Some(slot) = per_env.get_mut(env) {
                slot.insert(agent.clone(), action);
            }
        }
    }
    Ok(per_env)
}

// ── Results ─────────────────────────────────────────────────────────

/// Agent-major result of a collective reset.
#[derive(Clone, Debug, PartialEq)]
pub struct VectorReset<O, I> {
    /// `observations[agent][env]` for every env holding `agent`.
    pub observations: AgentMajor<O>,
    /// Infos reported by each env, per agent.
    pub infos: AgentMajor<I>,
}

/// Agent-major result of a collective step.
#[derive(Clone, Debug, PartialEq)]
pub struct VectorStep<O, I> {
    /// Observations of the agents live after the step.
    pub observations: AgentMajor<O>,
    /// Last observations of agents that acted but are no longer live.
    pub final_observations: AgentMajor<O>,
    /// Reward per acting agent.
    pub rewards: AgentMajor<f64>,
    /// Termination flag per acting agent.
    pub terminations: AgentMajor<bool>,
    /// Truncation flag per acting agent.
    pub truncations: AgentMajor<bool>,
    /// Infos reported by each env, per agent.
    pub infos: AgentMajor<I>,
}

/// Merges per-env results into agent-major maps.
///
/// Entries are inserted in the order envs are pushed, so pushing in slot
/// order keeps every inner map in `EnvId` order. Agents with no entry are
/// dropped by `finish_*`.
#[derive(Debug)]
pub struct BatchBuilder<O, I> {
    observations: AgentMajor<O>,
    final_observations: AgentMajor<O>,
    rewards: AgentMajor<f64>,
    terminations: AgentMajor<bool>,
    truncations: AgentMajor<bool>,
    infos: AgentMajor<I>,
}

fn empty_major<T>(agents: &[AgentId]) -> AgentMajor<T> {
    agents.iter().map(|a| (a.clone(), EnvMap::new())).collect()
}

fn insert<T>(major: &mut AgentMajor<T>, agent: &AgentId, env: EnvId, value: T) {
    if let Some(envs) = major.get_mut(agent) {
        envs.insert(env, value);
    }
}

fn prune<T>(mut major: AgentMajor<T>) -> AgentMajor<T> {
    major.retain(|_, envs| !envs.is_empty());
    major
}

fn take<T>(
    map: &mut AgentMap<T>,
    agent: &AgentId,
    env: EnvId,
    what: &str,
) -> Result<T, VectorError> {
    map.swap_remove(agent)
        .ok_or_else(|| VectorError::contract(env, format!("no {what} for agent '{agent}'")))
}

impl<O, I> BatchBuilder<O, I> {
    /// Empty builder for `possible_agents`.
    pub fn new(possible_agents: &[AgentId]) -> Self {
        Self {
            observations: empty_major(possible_agents),
            final_observations: empty_major(possible_agents),
            rewards: empty_major(possible_agents),
            terminations: empty_major(possible_agents),
            truncations: empty_major(possible_agents),
            infos: empty_major(possible_agents),
        }
    }

    /// Add the reset result of `env`, whose live agents are now `live`.
    pub fn push_reset(
        &mut self,
        env: EnvId,
        reset: ResetOutput<O, I>,
        live: &[AgentId],
    ) -> Result<(), VectorError> {
        let mut observations = reset.observations;
        for agent in live {
            let obs = take(&mut observations, agent, env, "observation")?;
            insert(&mut self.observations, agent, env, obs);
        }
        self.push_infos(env, reset.infos);
        Ok(())
    }

    /// Add the step result of `env`.
    ///
    /// `acted` are the agents whose reward and flags are reported; `live`
    /// are the agents live in `env` after the step.
    pub fn push_step(
        &mut self,
        env: EnvId,
        step: StepOutput<O, I>,
        acted: &[AgentId],
        live: &[AgentId],
    ) -> Result<(), VectorError> {
        let StepOutput {
            mut observations,
            mut rewards,
            mut terminations,
            mut truncations,
            infos,
        } = step;

        for agent in live {
            let obs = take(&mut observations, agent, env, "observation")?;
            insert(&mut self.observations, agent, env, obs);
        }
        for agent in acted {
            let reward = take(&mut rewards, agent, env, "reward")?;
            let terminated = take(&mut terminations, agent, env, "termination")?;
            let truncated = take(&mut truncations, agent, env, "truncation")?;
            insert(&mut self.rewards, agent, env, reward);
            insert(&mut self.terminations, agent, env, terminated);
            insert(&mut self.truncations, agent, env, truncated);
            if !live.contains(agent) {
                if let Some(obs) = observations.swap_remove(agent) {
                    insert(&mut self.final_observations, agent, env, obs);
                }
            }
        }
        self.push_infos(env, infos);
        Ok(())
    }

    fn push_infos(&mut self, env: EnvId, infos: AgentMap<I>) {
        for (agent, info) in infos {
            insert(&mut self.infos, &agent, env, info);
        }
    }

    /// Finish a collective reset.
    pub fn finish_reset(self) -> VectorReset<O, I> {
        VectorReset {
            observations: prune(self.observations),
            infos: prune(self.infos),
        }
    }

    /// Finish a collective step.
    pub fn finish_step(self) -> VectorStep<O, I> {
        VectorStep {
            observations: prune(self.observations),
            final_observations: prune(self.final_observations),
            rewards: prune(self.rewards),
            terminations: prune(self.terminations),
            truncations: prune(self.truncations),
            infos: prune(self.infos),
        }
    }
}

// ── Debug checks ────────────────────────────────────────────────────

/// Check that `map` is keyed by exactly `expected`, in any order.
pub fn check_keys<T>(
    env: EnvId,
    what: &str,
    map: &AgentMap<T>,
    expected: &[AgentId],
) -> Result<(), VectorError> {
    if let Some(missing) = expected.iter().find(|a| !map.contains_key(*a)) {
        return Err(VectorError::contract(
            env,
            format!("{what} has no entry for agent '{missing}'"),
        ));
    }
    if let Some(extra) = map.keys().find(|a| !expected.contains(*a)) {
        return Err(VectorError::contract(
            env,
            format!("{what} has an entry for agent '{extra}' that did not act"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parvec_core::AgentList;

    fn agents(names: &[&str]) -> AgentList {
        names.iter().map(|n| AgentId::from(*n)).collect()
    }

    fn ledger_with(entries: &[&[&str]]) -> AgentLedger {
        let env_ids = EnvId::range(entries.len());
        let mut ledger = AgentLedger::new(&agents(&["p0", "p1"]), &env_ids);
        let snapshot = entries
            .iter()
            .enumerate()
            .map(|(i, names)| (EnvId(i as u32), agents(names)))
            .collect();
        ledger.rebuild(snapshot).unwrap();
        ledger
    }

    fn step_output(live: &[&str], acted: &[&str]) -> StepOutput<i32, ()> {
        let mut observations = AgentMap::new();
        let mut rewards = AgentMap::new();
        let mut terminations = AgentMap::new();
        let mut truncations = AgentMap::new();
        for (i, a) in acted.iter().enumerate() {
            observations.insert(AgentId::from(*a), i as i32);
            rewards.insert(AgentId::from(*a), 1.0);
            terminations.insert(AgentId::from(*a), !live.contains(a));
            truncations.insert(AgentId::from(*a), false);
        }
        StepOutput {
            observations,
            rewards,
            terminations,
            truncations,
            infos: AgentMap::new(),
        }
    }

    // ── Seeds ─────────────────────────────────────────────────

    #[test]
    fn broadcast_seed_reaches_every_env() {
        let seeds = resolve_seeds(&Seeds::from(42), &EnvId::range(3)).unwrap();
        assert_eq!(seeds, vec![Some(42); 3]);
        let none = resolve_seeds(&Seeds::from(None), &EnvId::range(2)).unwrap();
        assert_eq!(none, vec![None, None]);
    }

    #[test]
    fn per_env_seed_count_must_match() {
        let err = resolve_seeds(&Seeds::from(vec![1, 2]), &EnvId::range(3)).unwrap_err();
        assert_eq!(
            err,
            ConfigError::SeedCount {
                expected: 3,
                actual: 2
            }
        );
    }

    #[test]
    fn mapping_keys_must_match_env_ids() {
        let ids = EnvId::range(2);
        let mut map = EnvMap::new();
        map.insert(EnvId(1), Some(7));
        map.insert(EnvId(0), None);
        assert_eq!(
            resolve_seeds(&Seeds::Mapping(map.clone()), &ids).unwrap(),
            vec![None, Some(7)]
        );

        map.swap_remove(&EnvId(0));
        let err = resolve_seeds(&Seeds::Mapping(map.clone()), &ids).unwrap_err();
        assert!(err.to_string().contains("env_0 is missing"), "got: {err}");

        map.insert(EnvId(0), None);
        map.insert(EnvId(5), None);
        let err = resolve_seeds(&Seeds::Mapping(map), &ids).unwrap_err();
        assert!(err.to_string().contains("env_5 is unknown"), "got: {err}");
    }

    // ── Partitioning ──────────────────────────────────────────

    #[test]
    fn partition_follows_pre_step_ledger() {
        let ledger = ledger_with(&[&["p0", "p1"], &["p1"]]);
        let mut actions: AgentMajor<i64> = AgentMajor::new();
        actions.insert("p0".into(), [(EnvId(0), 10), (EnvId(1), 11)].into_iter().collect());
        actions.insert("p1".into(), [(EnvId(0), 20), (EnvId(1), 21)].into_iter().collect());

        let per_env = partition_actions(actions, &ledger).unwrap();
        assert_eq!(per_env.len(), 2);
        assert_eq!(per_env[&EnvId(0)].len(), 2);
        // Surplus p0 action for env_1 is dropped.
        assert_eq!(per_env[&EnvId(1)].len(), 1);
        assert_eq!(per_env[&EnvId(1)]["p1"], 21);
        let order: Vec<&str> = per_env[&EnvId(0)].keys().map(|a| a.as_str()).collect();
        assert_eq!(order, ["p0", "p1"]);
    }

    #[test]
    fn partition_rejects_missing_action() {
        let ledger = ledger_with(&[&["p0"], &["p0"]]);
        let mut actions: AgentMajor<i64> = AgentMajor::new();
        actions.insert("p0".into(), [(EnvId(0), 1)].into_iter().collect());
        let err = partition_actions(actions, &ledger).unwrap_err();
        assert!(matches!(
            err,
            VectorError::MissingAction { env: EnvId(1), .. }
        ));
    }

    #[test]
    fn empty_env_gets_empty_actions() {
        let ledger = ledger_with(&[&["p0"], &[]]);
        let mut actions: AgentMajor<i64> = AgentMajor::new();
        actions.insert("p0".into(), [(EnvId(0), 1)].into_iter().collect());
        let per_env = partition_actions(actions, &ledger).unwrap();
        assert!(per_env[&EnvId(1)].is_empty());
    }

    // ── BatchBuilder ──────────────────────────────────────────

    #[test]
    fn step_keys_observations_by_live_and_rewards_by_acted() {
        let possible = agents(&["p0", "p1"]);
        let mut builder: BatchBuilder<i32, ()> = BatchBuilder::new(&possible);
        let both = agents(&["p0", "p1"]);
        builder
            .push_step(EnvId(0), step_output(&["p0", "p1"], &["p0", "p1"]), &both, &both)
            .unwrap();
        builder
            .push_step(EnvId(1), step_output(&["p1"], &["p0", "p1"]), &both, &agents(&["p1"]))
            .unwrap();
        let step = builder.finish_step();

        let p0_envs: Vec<EnvId> = step.observations["p0"].keys().copied().collect();
        assert_eq!(p0_envs, [EnvId(0)]);
        assert_eq!(step.rewards["p0"].len(), 2);
        assert!(step.terminations["p0"][&EnvId(1)]);
        let finished: Vec<EnvId> = step.final_observations["p0"].keys().copied().collect();
        assert_eq!(finished, [EnvId(1)]);
        assert!(!step.final_observations.contains_key("p1"));
    }

    #[test]
    fn missing_reward_is_contract_violation() {
        let possible = agents(&["p0"]);
        let mut builder: BatchBuilder<i32, ()> = BatchBuilder::new(&possible);
        let mut out = step_output(&["p0"], &["p0"]);
        out.rewards.clear();
        let err = builder
            .push_step(EnvId(2), out, &agents(&["p0"]), &agents(&["p0"]))
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("env_2") && msg.contains("reward"), "got: {msg}");
    }

    #[test]
    fn agents_without_entries_are_pruned() {
        let possible = agents(&["p0", "p1"]);
        let mut builder: BatchBuilder<i32, ()> = BatchBuilder::new(&possible);
        let reset = ResetOutput {
            observations: [(AgentId::from("p1"), 3)].into_iter().collect(),
            infos: AgentMap::new(),
        };
        builder.push_reset(EnvId(0), reset, &agents(&["p1"])).unwrap();
        let reset = builder.finish_reset();
        assert!(!reset.observations.contains_key("p0"));
        assert_eq!(reset.observations["p1"][&EnvId(0)], 3);
        assert!(reset.infos.is_empty());
    }

    // ── check_keys ────────────────────────────────────────────

    #[test]
    fn check_keys_flags_missing_and_extra() {
        let map: AgentMap<f64> = [(AgentId::from("p1"), 0.0)].into_iter().collect();
        let err = check_keys(EnvId(0), "rewards", &map, &agents(&["p0", "p1"])).unwrap_err();
        assert!(err.to_string().contains("no entry for agent 'p0'"), "got: {err}");
        let err = check_keys(EnvId(0), "rewards", &map, &agents(&[])).unwrap_err();
        assert!(err.to_string().contains("'p1' that did not act"), "got: {err}");
        assert!(check_keys(EnvId(0), "rewards", &map, &agents(&["p1"])).is_ok());
    }
}
