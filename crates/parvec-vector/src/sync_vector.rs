//! In-process runner: every env is driven in slot order on the caller's
//! thread.

use std::fmt;

use parvec_core::{
    has_marker, AgentId, AgentList, AgentMajor, AgentMap, EnvId, EnvMap, EnvState, LayerMarker,
    Options, ParallelEnv, Space, StateSpaces, StepOutput, Value,
};
use tracing::{debug, info, warn};

use crate::batch::{
    check_keys, partition_actions, resolve_seeds, BatchBuilder, Seeds, VectorReset, VectorStep,
};
use crate::config::{ConfigError, SyncConfig};
use crate::error::VectorError;
use crate::ledger::AgentLedger;
use crate::protocol::is_reserved;
use crate::signature::SpaceSignature;
use crate::vector::VectorEnv;

/// Runs every sub-environment sequentially in the calling thread.
///
/// Envs whose wrapper chain carries [`LayerMarker::AutoReset`] reset
/// themselves; every other env is reset by the runner on the step after
/// all its agents finished.
pub struct SyncVectorEnv<E: ParallelEnv> {
    envs: Vec<E>,
    env_ids: Vec<EnvId>,
    spaces: SpaceSignature,
    ledger: AgentLedger,
    need_autoreset: Vec<bool>,
    config: SyncConfig,
    closed: bool,
}

fn live_agents<E: ParallelEnv>(env: &E) -> AgentList {
    env.agents().iter().cloned().collect()
}

impl<E: ParallelEnv> SyncVectorEnv<E> {
    /// Take ownership of `envs`. `envs[0]` is the reference env.
    ///
    /// Fails when `envs` is empty or when any env's possible agents or
    /// spaces differ from the reference.
    pub fn new(envs: Vec<E>, config: SyncConfig) -> Result<Self, VectorError> {
        config.validate()?;
        let Some(reference) = envs.first() else {
            return Err(ConfigError::NoEnvs.into());
        };
        if envs.len() > u32::MAX as usize {
            return Err(ConfigError::TooManyEnvs { value: envs.len() }.into());
        }
        let spaces = SpaceSignature::of(reference)?;
        let env_ids = EnvId::range(envs.len());
        for (env_id, env) in env_ids.iter().zip(&envs).skip(1) {
            if env.possible_agents() != spaces.possible_agents.as_slice() {
                return Err(ConfigError::PossibleAgentsMismatch { env: *env_id }.into());
            }
            spaces
                .compare(&SpaceSignature::of(env)?)
                .into_result(*env_id)?;
        }

        let need_autoreset: Vec<bool> = envs
            .iter()
            .map(|env| !has_marker(env, LayerMarker::AutoReset))
            .collect();
        if config.debug {
            debug!(?need_autoreset, "envs needing manual autoreset");
        }

        let mut ledger = AgentLedger::new(&spaces.possible_agents, &env_ids);
        ledger.rebuild(
            env_ids
                .iter()
                .zip(&envs)
                .map(|(id, env)| (*id, live_agents(env)))
                .collect(),
        )?;

        info!(num_envs = envs.len(), "sync vector env ready");
        Ok(Self {
            envs,
            env_ids,
            spaces,
            ledger,
            need_autoreset,
            config,
            closed: false,
        })
    }

    /// Build every env with its own constructor.
    pub fn from_fns<F>(
        env_fns: impl IntoIterator<Item = F>,
        config: SyncConfig,
    ) -> Result<Self, VectorError>
    where
        F: FnOnce() -> E,
    {
        Self::new(env_fns.into_iter().map(|f| f()).collect(), config)
    }

    /// The env in slot `env`.
    pub fn sub_env(&self, env: EnvId) -> Option<&E> {
        self.envs.get(env.index())
    }

    /// Mutable access to the env in slot `env`.
    pub fn sub_env_mut(&mut self, env: EnvId) -> Option<&mut E> {
        self.envs.get_mut(env.index())
    }

    /// Every env, in slot order.
    pub fn envs(&self) -> &[E] {
        &self.envs
    }

    /// Whether the runner resets `env` itself once all its agents finish.
    pub fn need_autoreset(&self, env: EnvId) -> bool {
        self.need_autoreset.get(env.index()).copied().unwrap_or(false)
    }

    fn env_error(env: EnvId) -> impl FnOnce(parvec_core::EnvError) -> VectorError {
        move |source| VectorError::Env { env, source }
    }
}

/// Keys a debug-mode step result must carry: the agents that acted, then
/// any agent that joined during the step.
fn observation_keys(acted: &[AgentId], live: &[AgentId]) -> AgentList {
    let mut keys: AgentList = acted.iter().cloned().collect();
    keys.extend(live.iter().filter(|a| !acted.contains(*a)).cloned());
    keys
}

fn check_step<O, I>(
    env: EnvId,
    out: &StepOutput<O, I>,
    acted: &[AgentId],
    live: &[AgentId],
) -> Result<(), VectorError> {
    let observed = observation_keys(acted, live);
    check_keys(env, "observations", &out.observations, &observed)?;
    check_keys(env, "rewards", &out.rewards, acted)?;
    check_keys(env, "terminations", &out.terminations, acted)?;
    check_keys(env, "truncations", &out.truncations, acted)?;
    check_keys(env, "infos", &out.infos, &observed)
}

fn check_reset<O, I>(
    env: EnvId,
    observations: &AgentMap<O>,
    infos: &AgentMap<I>,
    live: &[AgentId],
) -> Result<(), VectorError> {
    check_keys(env, "observations", observations, live)?;
    check_keys(env, "infos", infos, live)
}

impl<E: ParallelEnv> VectorEnv for SyncVectorEnv<E> {
    type Observation = E::Observation;
    type Action = E::Action;
    type State = E::State;
    type Info = E::Info;

    fn ledger(&self) -> &AgentLedger {
        &self.ledger
    }

    fn single_observation_space(&self, agent: &AgentId) -> Option<&Space> {
        self.spaces.observation.get(agent)
    }

    fn single_action_space(&self, agent: &AgentId) -> Option<&Space> {
        self.spaces.action.get(agent)
    }

    fn state_spaces(&self) -> &StateSpaces {
        &self.spaces.state
    }

    fn reset(
        &mut self,
        seeds: Seeds,
        options: &Options,
    ) -> Result<VectorReset<E::Observation, E::Info>, VectorError> {
        let seeds = resolve_seeds(&seeds, &self.env_ids)?;
        let mut batch = BatchBuilder::new(self.ledger.possible_agents());
        let mut snapshot = EnvMap::with_capacity(self.envs.len());

        for ((env_id, env), seed) in self.env_ids.iter().zip(&mut self.envs).zip(seeds) {
            let out = env.reset(seed, options).map_err(Self::env_error(*env_id))?;
            let live = live_agents(env);
            if self.config.debug {
                check_reset(*env_id, &out.observations, &out.infos, &live)?;
            }
            batch.push_reset(*env_id, out, &live)?;
            snapshot.insert(*env_id, live);
        }

        self.ledger.rebuild(snapshot)?;
        Ok(batch.finish_reset())
    }

    fn step(
        &mut self,
        actions: AgentMajor<E::Action>,
    ) -> Result<VectorStep<E::Observation, E::Info>, VectorError> {
        let mut per_env = partition_actions(actions, &self.ledger)?;
        let mut batch = BatchBuilder::new(self.ledger.possible_agents());
        let mut snapshot = EnvMap::with_capacity(self.envs.len());

        for (slot, env) in self.envs.iter_mut().enumerate() {
            let env_id = self.env_ids[slot];
            let env_actions = per_env.swap_remove(&env_id).unwrap_or_default();

            if self.ledger.autoreset(env_id) && self.need_autoreset[slot] {
                debug!(env = %env_id, "all agents finished, resetting");
                let reset = env
                    .reset(None, &Options::new())
                    .map_err(Self::env_error(env_id))?;
                let live = live_agents(env);
                if self.config.debug {
                    check_reset(env_id, &reset.observations, &reset.infos, &live)?;
                }
                batch.push_step(env_id, StepOutput::from_reset(reset), &live, &live)?;
                snapshot.insert(env_id, live);
                continue;
            }

            let before = self.ledger.agents()[&env_id].clone();
            let out = env.step(env_actions).map_err(Self::env_error(env_id))?;
            let live = live_agents(env);
            // An env that reset itself reports its reset-time agents.
            let acted = if before.is_empty() { live.clone() } else { before };
            if self.config.debug {
                check_step(env_id, &out, &acted, &live)?;
            }
            batch.push_step(env_id, out, &acted, &live)?;
            snapshot.insert(env_id, live);
        }

        self.ledger.commit(snapshot)?;
        Ok(batch.finish_step())
    }

    fn raw_states(&mut self) -> Result<EnvMap<EnvState<E::State>>, VectorError> {
        self.env_ids
            .iter()
            .zip(&self.envs)
            .map(|(env_id, env)| {
                env.state()
                    .map(|state| (*env_id, state))
                    .map_err(Self::env_error(*env_id))
            })
            .collect()
    }

    fn call(&mut self, name: &str, args: &[Value]) -> Result<EnvMap<Value>, VectorError> {
        if is_reserved(name) {
            return Err(VectorError::ReservedName {
                name: name.to_owned(),
            });
        }
        let mut results = EnvMap::with_capacity(self.envs.len());
        for (env_id, env) in self.env_ids.iter().zip(&mut self.envs) {
            let value = env.call(name, args).map_err(Self::env_error(*env_id))?;
            results.insert(*env_id, value);
        }
        Ok(results)
    }

    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), VectorError> {
        for (env_id, env) in self.env_ids.iter().zip(&mut self.envs) {
            env.set_attr(name, value.clone())
                .map_err(Self::env_error(*env_id))?;
        }
        Ok(())
    }

    /// Close every env, even after one fails; the first failure is
    /// returned. Closing twice is a no-op.
    fn close(&mut self) -> Result<(), VectorError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first = None;
        for (env_id, env) in self.env_ids.iter().zip(&mut self.envs) {
            if let Err(source) = env.close() {
                warn!(env = %env_id, error = %source, "env failed to close");
                first.get_or_insert(VectorError::Env {
                    env: *env_id,
                    source,
                });
            }
        }
        info!(num_envs = self.envs.len(), "sync vector env closed");
        first.map_or(Ok(()), Err)
    }
}

impl<E: ParallelEnv> Drop for SyncVectorEnv<E> {
    fn drop(&mut self) {
        if !self.closed {
            let _ = VectorEnv::close(self);
        }
    }
}

impl<E: ParallelEnv> fmt::Display for SyncVectorEnv<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncVectorEnv(num_envs={})", self.envs.len())
    }
}

impl<E: ParallelEnv> fmt::Debug for SyncVectorEnv<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncVectorEnv")
            .field("num_envs", &self.envs.len())
            .field("agents", self.ledger.agents())
            .field("autoreset", self.ledger.autoreset_flags())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parvec_core::{AutoResetWrapper, EnvError, ResetOutput};
    use parvec_test_utils::{ScriptedEnv, ScriptedInfo};

    fn envs(n: usize, lifetime: u32) -> Vec<ScriptedEnv> {
        (0..n).map(|_| ScriptedEnv::two_agents(lifetime)).collect()
    }

    fn act_all<V: VectorEnv<Action = i64>>(venv: &V, action: i64) -> AgentMajor<i64> {
        venv.possible_agents()
            .iter()
            .map(|agent| {
                let envs: EnvMap<i64> =
                    venv.envs_have_agent(agent).iter().map(|e| (*e, action)).collect();
                (agent.clone(), envs)
            })
            .collect()
    }

    // ── Construction ──────────────────────────────────────────

    #[test]
    fn env_ids_are_dense_and_stable() {
        let venv = SyncVectorEnv::new(envs(4, 5), SyncConfig::default()).unwrap();
        assert_eq!(venv.env_ids(), EnvId::range(4).as_slice());
        assert_eq!(venv.num_envs(), 4);
        assert_eq!(venv.to_string(), "SyncVectorEnv(num_envs=4)");
    }

    #[test]
    fn empty_env_list_rejected() {
        let err = SyncVectorEnv::<ScriptedEnv>::new(vec![], SyncConfig::default()).unwrap_err();
        assert!(matches!(err, VectorError::Config(ConfigError::NoEnvs)));
    }

    #[test]
    fn mismatched_observation_space_rejected() {
        let mut list = envs(3, 5);
        list[2] = ScriptedEnv::two_agents(5).with_observation_space(Space::boxed(0.0, 1.0, &[9]));
        let err = SyncVectorEnv::new(list, SyncConfig::default()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("env_2"), "got: {msg}");
        assert!(msg.contains("observation space"), "got: {msg}");
    }

    #[test]
    fn mismatched_possible_agents_rejected() {
        let list = vec![
            ScriptedEnv::two_agents(5),
            ScriptedEnv::new(&[("p0", 5), ("p2", 5)]),
        ];
        let err = SyncVectorEnv::new(list, SyncConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            VectorError::Config(ConfigError::PossibleAgentsMismatch { env: EnvId(1) })
        ));
    }

    #[test]
    fn batched_spaces_repeat_single_space() {
        let venv = SyncVectorEnv::new(envs(3, 5), SyncConfig::default()).unwrap();
        let p0 = AgentId::from("p0");
        let batched = venv.action_space(&p0).unwrap();
        assert_eq!(batched.len(), 3);
        assert_eq!(&batched.single, venv.single_action_space(&p0).unwrap());
        assert!(venv.observation_space(&"nobody".into()).is_none());
    }

    // ── Reset ─────────────────────────────────────────────────

    #[test]
    fn reset_batches_agent_major_and_rebuilds_ledger() {
        let mut venv = SyncVectorEnv::new(envs(3, 5), SyncConfig::default()).unwrap();
        let out = venv.reset(Seeds::PerEnv(vec![10, 11, 12]), &Options::new()).unwrap();
        assert_eq!(out.observations.len(), 2);
        assert_eq!(out.observations["p1"][&EnvId(2)], vec![0.0, 1.0, 12.0]);
        assert_eq!(venv.envs_have_agent(&"p0".into()).len(), 3);
        assert!(venv.autoreset_envs().values().all(|f| !*f));
        assert_eq!(venv.sub_env(EnvId(1)).unwrap().seed(), Some(11));
    }

    #[test]
    fn broadcast_seed_is_shared() {
        let mut venv = SyncVectorEnv::new(envs(2, 5), SyncConfig::default()).unwrap();
        venv.reset(Seeds::from(9), &Options::new()).unwrap();
        assert!(venv.envs().iter().all(|e| e.seed() == Some(9)));
    }

    #[test]
    fn bad_seed_shape_rejected_before_any_reset() {
        let mut venv = SyncVectorEnv::new(envs(2, 5), SyncConfig::default()).unwrap();
        let err = venv.reset(Seeds::PerEnv(vec![1]), &Options::new()).unwrap_err();
        assert!(matches!(err, VectorError::Config(ConfigError::SeedCount { .. })));
        assert!(venv.envs().iter().all(|e| e.resets == 0));
    }

    // ── Step ──────────────────────────────────────────────────

    #[test]
    fn step_reports_rewards_for_every_acting_agent() {
        let mut venv = SyncVectorEnv::new(envs(2, 5), SyncConfig { debug: true }).unwrap();
        venv.reset(Seeds::Unseeded, &Options::new()).unwrap();
        let out = venv.step(act_all(&venv, 2)).unwrap();
        assert_eq!(out.rewards["p0"][&EnvId(1)], 2.0);
        assert!(!out.terminations["p1"][&EnvId(0)]);
        assert_eq!(out.infos["p0"][&EnvId(0)].t, 1);
        assert_eq!(venv.sub_env(EnvId(0)).unwrap().last_actions.len(), 2);
    }

    #[test]
    fn finished_env_is_reset_on_next_step() {
        let mut venv = SyncVectorEnv::new(envs(1, 2), SyncConfig { debug: true }).unwrap();
        venv.reset(Seeds::Unseeded, &Options::new()).unwrap();
        venv.step(act_all(&venv, 1)).unwrap();
        let out = venv.step(act_all(&venv, 1)).unwrap();
        assert!(out.terminations["p0"][&EnvId(0)]);
        assert!(out.observations.is_empty());
        assert_eq!(out.final_observations["p1"][&EnvId(0)][0], 2.0);
        assert!(venv.autoreset_envs()[&EnvId(0)]);

        // No actions are needed for an env that is about to reset.
        let out = venv.step(AgentMajor::new()).unwrap();
        assert_eq!(out.rewards["p0"][&EnvId(0)], 0.0);
        assert!(!out.truncations["p1"][&EnvId(0)]);
        assert_eq!(venv.agents()[&EnvId(0)].len(), 2);
        assert_eq!(venv.sub_env(EnvId(0)).unwrap().resets, 2);
    }

    #[test]
    fn self_resetting_env_is_not_reset_twice() {
        let list: Vec<_> = (0..2)
            .map(|_| AutoResetWrapper::new(ScriptedEnv::two_agents(1)))
            .collect();
        let mut venv = SyncVectorEnv::new(list, SyncConfig { debug: true }).unwrap();
        assert!(!venv.need_autoreset(EnvId(0)));
        venv.reset(Seeds::Unseeded, &Options::new()).unwrap();
        venv.step(act_all(&venv, 0)).unwrap();
        assert!(venv.autoreset_envs()[&EnvId(1)]);

        let out = venv.step(AgentMajor::new()).unwrap();
        assert_eq!(out.rewards["p1"].len(), 2);
        assert_eq!(venv.sub_env(EnvId(0)).unwrap().inner().resets, 2);
    }

    /// Where [`StrayInfo`] corrupts its info map.
    #[derive(Clone, Copy)]
    enum Stray {
        ResetExtra,
        StepExtra,
        StepMissing,
    }

    /// A scripted env whose info keys disagree with its agents.
    struct StrayInfo {
        env: ScriptedEnv,
        stray: Stray,
    }

    impl ParallelEnv for StrayInfo {
        type Observation = Vec<f32>;
        type Action = i64;
        type State = Vec<f32>;
        type Info = ScriptedInfo;

        fn possible_agents(&self) -> &[AgentId] {
            self.env.possible_agents()
        }

        fn agents(&self) -> &[AgentId] {
            self.env.agents()
        }

        fn observation_space(&self, agent: &AgentId) -> Option<&Space> {
            self.env.observation_space(agent)
        }

        fn action_space(&self, agent: &AgentId) -> Option<&Space> {
            self.env.action_space(agent)
        }

        fn reset(
            &mut self,
            seed: Option<u64>,
            options: &Options,
        ) -> Result<ResetOutput<Vec<f32>, ScriptedInfo>, EnvError> {
            let mut out = self.env.reset(seed, options)?;
            if let Stray::ResetExtra = self.stray {
                out.infos.insert("ghost".into(), ScriptedInfo::default());
            }
            Ok(out)
        }

        fn step(
            &mut self,
            actions: AgentMap<i64>,
        ) -> Result<StepOutput<Vec<f32>, ScriptedInfo>, EnvError> {
            let mut out = self.env.step(actions)?;
            match self.stray {
                Stray::ResetExtra => {}
                Stray::StepExtra => {
                    out.infos.insert("ghost".into(), ScriptedInfo::default());
                }
                Stray::StepMissing => {
                    out.infos.shift_remove("p1");
                }
            }
            Ok(out)
        }
    }

    fn stray(stray: Stray) -> SyncVectorEnv<StrayInfo> {
        let list = vec![StrayInfo {
            env: ScriptedEnv::two_agents(5),
            stray,
        }];
        SyncVectorEnv::new(list, SyncConfig { debug: true }).unwrap()
    }

    #[test]
    fn debug_mode_checks_info_keys() {
        let err = stray(Stray::ResetExtra)
            .reset(Seeds::Unseeded, &Options::new())
            .unwrap_err();
        assert!(matches!(err, VectorError::ContractViolation { env: EnvId(0), .. }));
        assert!(err.to_string().contains("infos has an entry for agent 'ghost'"), "got: {err}");

        let mut venv = stray(Stray::StepExtra);
        venv.reset(Seeds::Unseeded, &Options::new()).unwrap();
        let err = venv.step(act_all(&venv, 0)).unwrap_err();
        assert!(err.to_string().contains("'ghost'"), "got: {err}");

        let mut venv = stray(Stray::StepMissing);
        venv.reset(Seeds::Unseeded, &Options::new()).unwrap();
        let err = venv.step(act_all(&venv, 0)).unwrap_err();
        assert!(err.to_string().contains("infos has no entry for agent 'p1'"), "got: {err}");
    }

    #[test]
    fn stray_info_keys_pass_without_debug() {
        let list = vec![StrayInfo {
            env: ScriptedEnv::two_agents(5),
            stray: Stray::StepExtra,
        }];
        let mut venv = SyncVectorEnv::new(list, SyncConfig::default()).unwrap();
        venv.reset(Seeds::Unseeded, &Options::new()).unwrap();
        let out = venv.step(act_all(&venv, 0)).unwrap();
        assert!(!out.infos.contains_key("ghost"));
    }

    #[test]
    fn env_failure_names_the_env() {
        let mut list = envs(3, 5);
        list[1] = ScriptedEnv::two_agents(5).fail_at_step(1);
        let mut venv = SyncVectorEnv::new(list, SyncConfig::default()).unwrap();
        venv.reset(Seeds::Unseeded, &Options::new()).unwrap();
        let err = venv.step(act_all(&venv, 0)).unwrap_err();
        assert!(matches!(err, VectorError::Env { env: EnvId(1), .. }));
        assert!(err.to_string().contains("scripted failure"), "got: {err}");
    }

    // ── State / call / attrs ──────────────────────────────────

    #[test]
    fn global_state_skips_finished_envs() {
        let list = vec![
            ScriptedEnv::two_agents(1).with_global_state(),
            ScriptedEnv::two_agents(3).with_global_state(),
        ];
        let mut venv = SyncVectorEnv::new(list, SyncConfig::default()).unwrap();
        venv.reset(Seeds::Unseeded, &Options::new()).unwrap();
        venv.step(act_all(&venv, 0)).unwrap();
        let states = venv.state().unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[&EnvId(1)], vec![1.0, 2.0]);
        assert_eq!(venv.state_space().unwrap().len(), 2);
    }

    #[test]
    fn per_agent_state_points_to_wrapper() {
        let list = vec![ScriptedEnv::two_agents(3).with_agent_state()];
        let mut venv = SyncVectorEnv::new(list, SyncConfig::default()).unwrap();
        venv.reset(Seeds::Unseeded, &Options::new()).unwrap();
        let err = venv.state().unwrap_err();
        assert!(err.to_string().contains("AgentStateWrapper"), "got: {err}");
    }

    #[test]
    fn call_collects_per_env_results() {
        let mut venv = SyncVectorEnv::new(envs(2, 5), SyncConfig::default()).unwrap();
        venv.reset(Seeds::Unseeded, &Options::new()).unwrap();
        venv.step(act_all(&venv, 0)).unwrap();
        let steps = venv.call("steps", &[]).unwrap();
        assert_eq!(steps[&EnvId(1)], Value::Int(1));
        let err = venv.call("step", &[]).unwrap_err();
        assert!(matches!(err, VectorError::ReservedName { .. }));
    }

    #[test]
    fn set_attr_reaches_every_env() {
        let mut venv = SyncVectorEnv::new(envs(2, 5), SyncConfig::default()).unwrap();
        venv.set_attr("reward_scale", Value::Float(0.5)).unwrap();
        assert!(venv.envs().iter().all(|e| e.reward_scale() == 0.5));
        let err = venv.set_attr("gravity", Value::Float(1.0)).unwrap_err();
        assert!(err.to_string().contains("gravity"), "got: {err}");
    }

    #[test]
    fn close_closes_each_env_once() {
        let mut venv = SyncVectorEnv::new(envs(2, 5), SyncConfig::default()).unwrap();
        venv.close().unwrap();
        venv.close().unwrap();
        assert!(venv.envs().iter().all(|e| e.closes == 1));
    }
}
