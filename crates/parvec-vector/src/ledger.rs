//! The agent-liveness ledger.
//!
//! [`AgentLedger`] records which agents are live in which env. It holds
//! two immutable snapshots, `agents` (current) and `agents_old` (before
//! the most recent reset or step), plus two views derived from
//! `agents` after every mutation:
//!
//! - `envs_have_agents`: the inverse index, agent → envs holding it;
//! - the autoreset flags: env → "every agent finished on the last step".
//!
//! The ledger only changes through [`rebuild`](AgentLedger::rebuild)
//! (after a reset) and [`commit`](AgentLedger::commit) (after a step).
//! Both replace the snapshots wholesale and recompute the derived views,
//! so readers never observe a half-updated ledger.

use std::sync::Arc;

use parvec_core::{AgentId, AgentList, AgentMap, EnvId, EnvMap};
use smallvec::SmallVec;

use crate::error::VectorError;

/// Ordered list of envs, typically the envs holding one agent.
pub type EnvList = SmallVec<[EnvId; 8]>;

/// One immutable snapshot of env → live agents.
pub type AgentsSnapshot = Arc<EnvMap<AgentList>>;

/// Agent-liveness ledger shared by both runners.
#[derive(Clone, Debug)]
pub struct AgentLedger {
    possible_agents: Vec<AgentId>,
    env_ids: Vec<EnvId>,
    agents: AgentsSnapshot,
    agents_old: AgentsSnapshot,
    envs_have_agents: AgentMap<EnvList>,
    autoreset: EnvMap<bool>,
    /// Agents that left each env since its last reset.
    departed: EnvMap<AgentList>,
}

impl AgentLedger {
    /// An empty ledger: no env holds any agent, no env is flagged.
    pub fn new(possible_agents: &[AgentId], env_ids: &[EnvId]) -> Self {
        let empty: EnvMap<AgentList> = env_ids.iter().map(|e| (*e, AgentList::new())).collect();
        let mut ledger = Self {
            possible_agents: possible_agents.to_vec(),
            env_ids: env_ids.to_vec(),
            agents: Arc::new(empty.clone()),
            agents_old: Arc::new(empty.clone()),
            envs_have_agents: AgentMap::new(),
            autoreset: env_ids.iter().map(|e| (*e, false)).collect(),
            departed: empty,
        };
        ledger.reindex();
        ledger
    }

    /// Replace the ledger after every env was reset.
    ///
    /// Clears every autoreset flag.
    pub fn rebuild(&mut self, agents: EnvMap<AgentList>) -> Result<(), VectorError> {
        self.validate(&agents)?;
        self.agents_old = std::mem::replace(&mut self.agents, Arc::new(agents));
        for departed in self.departed.values_mut() {
            departed.clear();
        }
        for flag in self.autoreset.values_mut() {
            *flag = false;
        }
        self.reindex();
        Ok(())
    }

    /// Replace the ledger after a step.
    ///
    /// Envs flagged for autoreset before the call were reset during the
    /// step and may bring back agents that finished earlier. Every other
    /// env may only lose agents it had or gain agents it never had in
    /// this episode. Afterwards an env is flagged iff it has no agents.
    pub fn commit(&mut self, agents: EnvMap<AgentList>) -> Result<(), VectorError> {
        self.validate(&agents)?;

        for (env, now) in &agents {
            let was_reset = self.autoreset[env];
            if was_reset {
                continue;
            }
            let departed = &self.departed[env];
            if let Some(revived) = now.iter().find(|a| departed.contains(*a)) {
                return Err(VectorError::contract(
                    *env,
                    format!("agent '{revived}' was revived without a reset"),
                ));
            }
        }

        for (env, now) in &agents {
            let before = &self.agents[env];
            let departed = &mut self.departed[env];
            if self.autoreset[env] {
                departed.clear();
            }
            departed.extend(before.iter().filter(|a| !now.contains(*a)).cloned());
        }

        for (env, now) in &agents {
            self.autoreset[env] = now.is_empty();
        }
        self.agents_old = std::mem::replace(&mut self.agents, Arc::new(agents));
        self.reindex();
        Ok(())
    }

    fn validate(&self, agents: &EnvMap<AgentList>) -> Result<(), VectorError> {
        if agents.len() != self.env_ids.len()
            || agents.keys().zip(&self.env_ids).any(|(a, b)| a != b)
        {
            let env = self
                .env_ids
                .iter()
                .find(|e| !agents.contains_key(*e))
                .copied()
                .unwrap_or(EnvId(self.env_ids.len() as u32));
            return Err(VectorError::contract(
                env,
                "ledger update does not cover every env in order",
            ));
        }
        for (env, live) in agents {
            let mut cursor = 0usize;
            for agent in live {
                match self.possible_agents[cursor..].iter().position(|p| p == agent) {
                    Some(offset) => cursor += offset + 1,
                    None => {
                        let reason = if self.possible_agents.contains(agent) {
                            format!("agent '{agent}' is out of possible_agents order")
                        } else {
                            format!("agent '{agent}' is not in possible_agents")
                        };
                        return Err(VectorError::contract(*env, reason));
                    }
                }
            }
        }
        Ok(())
    }

    fn reindex(&mut self) {
        let mut index: AgentMap<EnvList> = self
            .possible_agents
            .iter()
            .map(|a| (a.clone(), EnvList::new()))
            .collect();
        for (env, live) in self.agents.iter() {
            for agent in live {
                if let Some(envs) = index.get_mut(agent) {
                    envs.push(*env);
                }
            }
        }
        self.envs_have_agents = index;
    }

    /// Every agent that may ever be live.
    pub fn possible_agents(&self) -> &[AgentId] {
        &self.possible_agents
    }

    /// Env ids in slot order.
    pub fn env_ids(&self) -> &[EnvId] {
        &self.env_ids
    }

    /// Current snapshot: env → live agents.
    pub fn agents(&self) -> &AgentsSnapshot {
        &self.agents
    }

    /// Snapshot before the most recent reset or step.
    pub fn agents_old(&self) -> &AgentsSnapshot {
        &self.agents_old
    }

    /// Inverse index: agent → envs currently holding it.
    pub fn envs_have_agents(&self) -> &AgentMap<EnvList> {
        &self.envs_have_agents
    }

    /// Envs currently holding `agent`, in slot order.
    pub fn envs_have_agent(&self, agent: &AgentId) -> &[EnvId] {
        self.envs_have_agents
            .get(agent)
            .map(|envs| envs.as_slice())
            .unwrap_or(&[])
    }

    /// Autoreset flags: env → "reset on the next step".
    pub fn autoreset_flags(&self) -> &EnvMap<bool> {
        &self.autoreset
    }

    /// Whether `env` resets on the next step.
    pub fn autoreset(&self, env: EnvId) -> bool {
        self.autoreset.get(&env).copied().unwrap_or(false)
    }

    /// Live agent count per env.
    pub fn num_agents(&self) -> EnvMap<usize> {
        self.agents.iter().map(|(e, a)| (*e, a.len())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ids(names: &[&str]) -> AgentList {
        names.iter().map(|n| AgentId::from(*n)).collect()
    }

    fn ledger(n: usize) -> AgentLedger {
        AgentLedger::new(&ids(&["p0", "p1"]), &EnvId::range(n))
    }

    fn snapshot(entries: &[&[&str]]) -> EnvMap<AgentList> {
        entries
            .iter()
            .enumerate()
            .map(|(i, names)| (EnvId(i as u32), ids(names)))
            .collect()
    }

    // ── Construction ──────────────────────────────────────────

    #[test]
    fn new_ledger_is_empty() {
        let l = ledger(3);
        assert_eq!(l.env_ids().len(), 3);
        assert!(l.agents().values().all(|a| a.is_empty()));
        assert!(l.envs_have_agent(&"p0".into()).is_empty());
        assert!(l.autoreset_flags().values().all(|f| !*f));
    }

    // ── Rebuild / commit ──────────────────────────────────────

    #[test]
    fn rebuild_recomputes_index_and_clears_flags() {
        let mut l = ledger(3);
        l.rebuild(snapshot(&[&["p0", "p1"], &["p0", "p1"], &["p1"]]))
            .unwrap();
        assert_eq!(l.envs_have_agent(&"p0".into()), &[EnvId(0), EnvId(1)]);
        assert_eq!(
            l.envs_have_agent(&"p1".into()),
            &[EnvId(0), EnvId(1), EnvId(2)]
        );
        assert!(l.agents_old().values().all(|a| a.is_empty()));
        assert_eq!(l.num_agents()[&EnvId(2)], 1);
    }

    #[test]
    fn agent_finishing_leaves_index() {
        let mut l = ledger(3);
        l.rebuild(snapshot(&[&["p0", "p1"], &["p0", "p1"], &["p0", "p1"]]))
            .unwrap();
        l.commit(snapshot(&[&["p0", "p1"], &["p1"], &["p0", "p1"]]))
            .unwrap();
        assert_eq!(l.agents()[&EnvId(1)].as_slice(), ids(&["p1"]).as_slice());
        assert_eq!(l.envs_have_agent(&"p0".into()), &[EnvId(0), EnvId(2)]);
        assert_eq!(
            l.agents_old()[&EnvId(1)].as_slice(),
            ids(&["p0", "p1"]).as_slice()
        );
        assert!(!l.autoreset(EnvId(1)));
    }

    #[test]
    fn empty_env_is_flagged_until_next_step() {
        let mut l = ledger(2);
        l.rebuild(snapshot(&[&["p0"], &["p0"]])).unwrap();
        l.commit(snapshot(&[&["p0"], &[]])).unwrap();
        assert!(l.autoreset(EnvId(1)));
        assert!(!l.autoreset(EnvId(0)));

        // Autoreset brings p0 back in env_1.
        l.commit(snapshot(&[&["p0"], &["p0"]])).unwrap();
        assert!(!l.autoreset(EnvId(1)));
        assert_eq!(l.envs_have_agent(&"p0".into()), &[EnvId(0), EnvId(1)]);
    }

    #[test]
    fn rebuild_clears_pending_autoreset() {
        let mut l = ledger(1);
        l.rebuild(snapshot(&[&["p0"]])).unwrap();
        l.commit(snapshot(&[&[]])).unwrap();
        assert!(l.autoreset(EnvId(0)));
        l.rebuild(snapshot(&[&["p0"]])).unwrap();
        assert!(!l.autoreset(EnvId(0)));
    }

    // ── Contract checks ───────────────────────────────────────

    #[test]
    fn revival_without_reset_rejected() {
        let mut l = ledger(1);
        l.rebuild(snapshot(&[&["p0", "p1"]])).unwrap();
        l.commit(snapshot(&[&["p1"]])).unwrap();
        let err = l.commit(snapshot(&[&["p0", "p1"]])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("revived"), "got: {msg}");
    }

    #[test]
    fn unknown_agent_rejected() {
        let mut l = ledger(1);
        let err = l.rebuild(snapshot(&[&["p7"]])).unwrap_err();
        assert!(err.to_string().contains("not in possible_agents"));
    }

    #[test]
    fn out_of_order_agents_rejected() {
        let mut l = ledger(1);
        let err = l.rebuild(snapshot(&[&["p1", "p0"]])).unwrap_err();
        assert!(err.to_string().contains("order"));
    }

    #[test]
    fn missing_env_rejected() {
        let mut l = ledger(2);
        let err = l.rebuild(snapshot(&[&["p0"]])).unwrap_err();
        assert!(matches!(
            err,
            VectorError::ContractViolation { env: EnvId(1), .. }
        ));
    }

    // ── Properties ────────────────────────────────────────────

    fn arb_snapshot(n: usize) -> impl Strategy<Value = Vec<(bool, bool)>> {
        proptest::collection::vec((any::<bool>(), any::<bool>()), n)
    }

    fn to_snapshot(flags: &[(bool, bool)]) -> EnvMap<AgentList> {
        flags
            .iter()
            .enumerate()
            .map(|(i, (a, b))| {
                let mut live = AgentList::new();
                if *a {
                    live.push("p0".into());
                }
                if *b {
                    live.push("p1".into());
                }
                (EnvId(i as u32), live)
            })
            .collect()
    }

    proptest! {
        #[test]
        fn index_is_exact_inverse(flags in arb_snapshot(6)) {
            let mut l = ledger(6);
            l.rebuild(to_snapshot(&flags)).unwrap();
            for agent in l.possible_agents().to_vec() {
                for env in EnvId::range(6) {
                    let in_index = l.envs_have_agent(&agent).contains(&env);
                    let in_agents = l.agents()[&env].contains(&agent);
                    prop_assert_eq!(in_index, in_agents);
                }
            }
        }

        #[test]
        fn flags_track_emptiness_after_commit(
            start in arb_snapshot(5),
            shrink in proptest::collection::vec((any::<bool>(), any::<bool>()), 5),
        ) {
            let mut l = ledger(5);
            l.rebuild(to_snapshot(&start)).unwrap();
            // Agents only ever leave here, so no revival can occur.
            let next: Vec<(bool, bool)> = start
                .iter()
                .zip(&shrink)
                .map(|((a, b), (ka, kb))| (*a && *ka, *b && *kb))
                .collect();
            l.commit(to_snapshot(&next)).unwrap();
            for (env, live) in l.agents().iter() {
                prop_assert_eq!(l.autoreset(*env), live.is_empty());
            }
            prop_assert_eq!(&**l.agents_old(), &to_snapshot(&start));
        }
    }
}
