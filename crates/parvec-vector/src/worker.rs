//! The loop each worker process runs.
//!
//! A worker owns exactly one env for its whole life:
//!
//! ```text
//! build env ─▶ connect ─▶ Hello ─▶ ┌─ Request ─▶ handle ─▶ Reply ─┐
//!                                  └──────────────────────────────┘
//!                                        │ error or panic
//!                                        ▼
//!                                  Error ─▶ Reply(Failed) ─▶ close env ─▶ exit
//! ```
//!
//! Signals are not intercepted. A worker killed by SIGINT or SIGTERM
//! sends no error report; the orchestrator sees its connection drop and
//! raises [`VectorError::WorkerUnavailable`](crate::VectorError::WorkerUnavailable)
//! for that index on the next collective call, or `Protocol` if the
//! command could not be written.
//!
//! Binaries either call [`worker_main`] or flatten [`WorkerArgs`] into
//! their own parser and call [`run_worker`] / [`run_worker_inline`].

use std::any::Any;
use std::ffi::OsString;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use interprocess::local_socket::traits::Stream as _;
use interprocess::local_socket::{GenericNamespaced, Stream, ToNsName};
use parvec_core::{
    has_marker, AgentList, AgentMap, EnvError, EnvState, FixedLayout, LayerMarker, Options,
    ParallelEnv, StepOutput,
};
use parvec_shm::SharedArena;
use thiserror::Error;
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

use crate::protocol::{
    is_reserved, read_frame, write_frame, Command, FrameError, Observations, Reply, Request,
    SharedState, StateReply, WorkerMessage,
};
use crate::shared::{observation_layout, state_layout, SharedCodec, STATE_BLOCK};
use crate::signature::{SpaceCheck, SpaceSignature};

// ── Arguments ──────────────────────────────────────────────────────

/// Arguments the orchestrator appends to every worker command line.
#[derive(Clone, Debug, PartialEq, Eq, clap::Args)]
pub struct WorkerArgs {
    /// Local socket the orchestrator listens on.
    #[arg(long)]
    pub socket_name: String,
    /// Slot of this worker.
    #[arg(long)]
    pub index: u32,
    /// Number of workers, and of slots in each arena.
    #[arg(long)]
    pub num_envs: u32,
    /// Backing file of the observation arena.
    #[arg(long)]
    pub obs_shm: Option<PathBuf>,
    /// Backing file of the state arena.
    #[arg(long)]
    pub state_shm: Option<PathBuf>,
}

impl WorkerArgs {
    /// Render back into command-line form.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--socket-name".into(),
            self.socket_name.clone().into(),
            "--index".into(),
            self.index.to_string().into(),
            "--num-envs".into(),
            self.num_envs.to_string().into(),
        ];
        if let Some(path) = &self.obs_shm {
            args.push("--obs-shm".into());
            args.push(path.as_os_str().to_owned());
        }
        if let Some(path) = &self.state_shm {
            args.push("--state-shm".into());
            args.push(path.as_os_str().to_owned());
        }
        args
    }
}

#[derive(Debug, Parser)]
#[command(about = "parvec worker process")]
struct WorkerCli {
    #[command(flatten)]
    worker: WorkerArgs,
}

// ── WorkerError ────────────────────────────────────────────────────

/// Why a worker loop ended abnormally.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The orchestrator's socket could not be reached.
    #[error("cannot connect to orchestrator at '{name}': {source}")]
    Connect {
        /// Socket name.
        name: String,
        /// The connection failure.
        #[source]
        source: io::Error,
    },
    /// The link to the orchestrator broke.
    #[error("orchestrator link: {0}")]
    Frame(#[from] FrameError),
    /// Shared-memory paths were passed to a worker without a codec.
    #[error("shared memory requested, but this worker was started with run_worker_inline")]
    SharedMemoryUnavailable,
    /// A command failed; the failure was reported to the orchestrator.
    #[error("`{command}` failed: {source}")]
    Command {
        /// Name of the failed command.
        command: &'static str,
        /// The env failure.
        #[source]
        source: EnvError,
    },
}

// ── Worker ─────────────────────────────────────────────────────────

type Message<E> = WorkerMessage<
    <E as ParallelEnv>::Observation,
    <E as ParallelEnv>::State,
    <E as ParallelEnv>::Info,
>;

type WorkerReply<E> =
    Reply<<E as ParallelEnv>::Observation, <E as ParallelEnv>::State, <E as ParallelEnv>::Info>;

enum Flow {
    Continue,
    Exit,
}

struct Worker<E: ParallelEnv> {
    env: E,
    index: u32,
    num_envs: usize,
    obs_shm: Option<PathBuf>,
    state_shm: Option<PathBuf>,
    codec: Option<SharedCodec<E::Observation, E::State>>,
    obs_arena: Option<SharedArena>,
    state_arena: Option<SharedArena>,
    need_autoreset: bool,
    /// Every agent finished on the previous step.
    autoreset: bool,
    closed: bool,
}

fn shm_failure(e: impl std::fmt::Display) -> EnvError {
    EnvError::failed(format!("shared memory: {e}"))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

impl<E: ParallelEnv> Worker<E> {
    fn new(
        env: E,
        args: &WorkerArgs,
        codec: Option<SharedCodec<E::Observation, E::State>>,
    ) -> Self {
        let need_autoreset = !has_marker(&env, LayerMarker::AutoReset);
        debug!(index = args.index, need_autoreset, "worker env ready");
        Self {
            env,
            index: args.index,
            num_envs: args.num_envs as usize,
            obs_shm: args.obs_shm.clone(),
            state_shm: args.state_shm.clone(),
            codec,
            obs_arena: None,
            state_arena: None,
            need_autoreset,
            autoreset: false,
            closed: false,
        }
    }

    fn live(&self) -> AgentList {
        self.env.agents().iter().cloned().collect()
    }

    /// Serve requests until the orchestrator hangs up, sends `Close`, or
    /// a command fails.
    fn run<R: Read, W: Write>(&mut self, reader: &mut R, writer: &mut W) -> Result<(), WorkerError> {
        loop {
            let request: Request<E::Action> = match read_frame(reader) {
                Ok(request) => request,
                Err(FrameError::Closed) => {
                    debug!(index = self.index, "orchestrator hung up");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            let op = request.op;
            let command = request.command.name();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.handle(request.command)))
                .unwrap_or_else(|payload| {
                    Err(EnvError::Panicked {
                        message: panic_message(&*payload),
                    })
                });

            match outcome {
                Ok((reply, flow)) => {
                    let message: Message<E> = WorkerMessage::Reply {
                        op,
                        success: true,
                        reply,
                    };
                    write_frame(writer, &message)?;
                    if let Flow::Exit = flow {
                        debug!(index = self.index, "closed by orchestrator");
                        return Ok(());
                    }
                }
                Err(error) => {
                    debug!(index = self.index, command, %error, "command failed");
                    let report: Message<E> = WorkerMessage::Error {
                        index: self.index,
                        error: error.clone(),
                    };
                    write_frame(writer, &report)?;
                    let failed: Message<E> = WorkerMessage::Reply {
                        op,
                        success: false,
                        reply: Reply::Failed,
                    };
                    write_frame(writer, &failed)?;
                    return Err(WorkerError::Command {
                        command,
                        source: error,
                    });
                }
            }
        }
    }

    fn handle(&mut self, command: Command<E::Action>) -> Result<(WorkerReply<E>, Flow), EnvError> {
        let reply = match command {
            Command::Reset { seed, options } => {
                let out = self.env.reset(seed, &options)?;
                self.autoreset = false;
                Reply::Reset {
                    observations: self.publish(out.observations)?,
                    infos: out.infos,
                    agents: self.live(),
                }
            }
            Command::Step(actions) => self.step(actions)?,
            Command::State => {
                let state = self.env.state()?;
                Reply::State(self.publish_state(state)?)
            }
            Command::Agents => Reply::Agents(self.live()),
            Command::Close => {
                self.closed = true;
                self.env.close()?;
                return Ok((Reply::Closed, Flow::Exit));
            }
            Command::Call { name, args } => {
                if is_reserved(&name) {
                    return Err(EnvError::ReservedName { name });
                }
                Reply::Call(self.env.call(&name, &args)?)
            }
            Command::SetAttr { name, value } => {
                self.env.set_attr(&name, value)?;
                Reply::AttrSet
            }
            Command::CheckSpaces(reference) => Reply::Spaces(self.check_spaces(&reference)?),
        };
        Ok((reply, Flow::Continue))
    }

    fn step(&mut self, actions: AgentMap<E::Action>) -> Result<WorkerReply<E>, EnvError> {
        let (out, acted) = if self.autoreset && self.need_autoreset {
            debug!(index = self.index, "all agents finished, resetting");
            let reset = self.env.reset(None, &Options::new())?;
            (StepOutput::from_reset(reset), self.live())
        } else {
            let before = self.live();
            let out = self.env.step(actions)?;
            // An env that reset itself reports its reset-time agents.
            let acted = if before.is_empty() { self.live() } else { before };
            (out, acted)
        };
        let agents = self.live();
        self.autoreset = agents.is_empty();
        Ok(Reply::Step {
            observations: self.publish(out.observations)?,
            rewards: out.rewards,
            terminations: out.terminations,
            truncations: out.truncations,
            infos: out.infos,
            acted,
            agents,
        })
    }

    /// Compare spaces with the orchestrator's reference and, on a match,
    /// attach to the arenas laid out from that reference.
    fn check_spaces(&mut self, reference: &SpaceSignature) -> Result<SpaceCheck, EnvError> {
        let own = SpaceSignature::of(&self.env).map_err(|e| EnvError::failed(e.to_string()))?;
        let check = reference.compare(&own);
        if check.is_match() {
            self.attach(reference)?;
        }
        Ok(check)
    }

    fn attach(&mut self, reference: &SpaceSignature) -> Result<(), EnvError> {
        let slot = self.index as usize;
        if let Some(path) = &self.obs_shm {
            let layout = observation_layout(&reference.possible_agents, &reference.observation)
                .map_err(shm_failure)?;
            let arena =
                SharedArena::attach(path, layout, self.num_envs, slot).map_err(shm_failure)?;
            self.obs_arena = Some(arena);
        }
        if let Some(path) = &self.state_shm {
            if let Some(layout) =
                state_layout(&reference.possible_agents, &reference.state).map_err(shm_failure)?
            {
                let arena =
                    SharedArena::attach(path, layout, self.num_envs, slot).map_err(shm_failure)?;
                self.state_arena = Some(arena);
            }
        }
        Ok(())
    }

    fn publish(
        &mut self,
        observations: AgentMap<E::Observation>,
    ) -> Result<Observations<E::Observation>, EnvError> {
        let (Some(arena), Some(codec)) = (self.obs_arena.as_mut(), self.codec) else {
            return Ok(Observations::Inline(observations));
        };
        let slot = self.index as usize;
        let mut written = AgentList::new();
        for (agent, obs) in &observations {
            let block = arena.block_mut(slot, agent.as_str()).map_err(shm_failure)?;
            (codec.write_observation)(obs, block).map_err(shm_failure)?;
            written.push(agent.clone());
        }
        Ok(Observations::Shared(written))
    }

    fn publish_state(
        &mut self,
        state: EnvState<E::State>,
    ) -> Result<StateReply<E::State>, EnvError> {
        let (Some(arena), Some(codec)) = (self.state_arena.as_mut(), self.codec) else {
            return Ok(StateReply::Inline(state));
        };
        let slot = self.index as usize;
        let shared = match state {
            EnvState::Empty => SharedState::Empty,
            EnvState::Global(s) => {
                let block = arena.block_mut(slot, STATE_BLOCK).map_err(shm_failure)?;
                (codec.write_state)(&s, block).map_err(shm_failure)?;
                SharedState::Global
            }
            EnvState::PerAgent(states) => {
                let mut written = AgentList::new();
                for (agent, s) in &states {
                    let block = arena.block_mut(slot, agent.as_str()).map_err(shm_failure)?;
                    (codec.write_state)(s, block).map_err(shm_failure)?;
                    written.push(agent.clone());
                }
                SharedState::PerAgent(written)
            }
        };
        Ok(StateReply::Shared(shared))
    }

    /// Close the env unless `Close` already did.
    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match panic::catch_unwind(AssertUnwindSafe(|| self.env.close())) {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(index = self.index, %error, "env failed to close"),
            Err(_) => warn!(index = self.index, "env panicked while closing"),
        }
    }
}

// ── Entry points ───────────────────────────────────────────────────

fn serve<E, F>(
    args: &WorkerArgs,
    env_fn: F,
    codec: Option<SharedCodec<E::Observation, E::State>>,
) -> Result<(), WorkerError>
where
    E: ParallelEnv,
    F: FnOnce() -> E,
{
    if codec.is_none() && (args.obs_shm.is_some() || args.state_shm.is_some()) {
        return Err(WorkerError::SharedMemoryUnavailable);
    }

    let mut worker = Worker::new(env_fn(), args, codec);
    let outcome = connect(args).and_then(|stream| {
        let (recv, send) = stream.split();
        let mut reader = BufReader::new(recv);
        let mut writer = BufWriter::new(send);
        let hello: Message<E> = WorkerMessage::Hello {
            index: args.index,
            pid: std::process::id(),
        };
        write_frame(&mut writer, &hello)?;
        worker.run(&mut reader, &mut writer)
    });
    worker.release();
    outcome
}

fn connect(args: &WorkerArgs) -> Result<Stream, WorkerError> {
    let connect_err = |source| WorkerError::Connect {
        name: args.socket_name.clone(),
        source,
    };
    let name = args
        .socket_name
        .as_str()
        .to_ns_name::<GenericNamespaced>()
        .map_err(connect_err)?;
    Stream::connect(name).map_err(connect_err)
}

/// Serve one env, routing observations and state through the shared
/// arenas named in `args`.
pub fn run_worker<E, F>(args: &WorkerArgs, env_fn: F) -> Result<(), WorkerError>
where
    E: ParallelEnv,
    E::Observation: FixedLayout,
    E::State: FixedLayout,
    F: FnOnce() -> E,
{
    serve(args, env_fn, Some(SharedCodec::fixed()))
}

/// Serve one env whose payloads travel only over the socket.
///
/// Fails if `args` carries shared-memory paths.
pub fn run_worker_inline<E, F>(args: &WorkerArgs, env_fn: F) -> Result<(), WorkerError>
where
    E: ParallelEnv,
    F: FnOnce() -> E,
{
    serve(args, env_fn, None)
}

/// Install a stderr `fmt` subscriber filtered by `RUST_LOG`
/// (default `warn`). Does nothing if a subscriber is already set.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// `main` for a worker binary: parse [`WorkerArgs`], install logging and
/// serve the env built by `env_fn`.
pub fn worker_main<E, F>(env_fn: F) -> ExitCode
where
    E: ParallelEnv,
    E::Observation: FixedLayout,
    E::State: FixedLayout,
    F: FnOnce() -> E,
{
    init_logging();
    let cli = WorkerCli::parse();
    match run_worker(&cli.worker, env_fn) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(index = cli.worker.index, error = %e, "worker exited");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parvec_core::{AgentId, Options, Value};
    use parvec_shm::SlotLayout;
    use parvec_test_utils::ScriptedEnv;
    use std::io::Cursor;

    type TestMessage = WorkerMessage<Vec<f32>, Vec<f32>, parvec_test_utils::ScriptedInfo>;

    fn args(index: u32) -> WorkerArgs {
        WorkerArgs {
            socket_name: "parvec-test.sock".into(),
            index,
            num_envs: 2,
            obs_shm: None,
            state_shm: None,
        }
    }

    fn inline_worker(env: ScriptedEnv) -> Worker<ScriptedEnv> {
        Worker::new(env, &args(0), None)
    }

    fn requests(commands: Vec<Command<i64>>) -> Cursor<Vec<u8>> {
        let mut wire = Vec::new();
        for (op, command) in commands.into_iter().enumerate() {
            write_frame(
                &mut wire,
                &Request {
                    op: op as u64,
                    command,
                },
            )
            .unwrap();
        }
        Cursor::new(wire)
    }

    fn replies(wire: Vec<u8>) -> Vec<TestMessage> {
        let mut cursor = Cursor::new(wire);
        let mut out = Vec::new();
        loop {
            match read_frame(&mut cursor) {
                Ok(msg) => out.push(msg),
                Err(FrameError::Closed) => return out,
                Err(e) => panic!("bad frame: {e}"),
            }
        }
    }

    fn reset() -> Command<i64> {
        Command::Reset {
            seed: Some(1),
            options: Options::new(),
        }
    }

    fn step(agents: &[&str]) -> Command<i64> {
        Command::Step(agents.iter().map(|a| (AgentId::from(*a), 1)).collect())
    }

    // ── Arguments ───────────────────────────────────────────────

    #[test]
    fn args_survive_the_command_line() {
        let mut original = args(3);
        original.obs_shm = Some("/dev/shm/parvec-x.shm".into());
        let argv = std::iter::once(OsString::from("worker")).chain(original.to_args());
        let parsed = WorkerCli::try_parse_from(argv).unwrap();
        assert_eq!(parsed.worker, original);
    }

    #[test]
    fn inline_worker_refuses_shared_memory() {
        let mut with_shm = args(0);
        with_shm.obs_shm = Some("/nonexistent".into());
        let err = run_worker_inline(&with_shm, || ScriptedEnv::two_agents(3)).unwrap_err();
        assert!(matches!(err, WorkerError::SharedMemoryUnavailable));
    }

    // ── Commands ────────────────────────────────────────────────

    #[test]
    fn finished_env_resets_on_next_step() {
        let mut worker = inline_worker(ScriptedEnv::two_agents(1));
        worker.handle(reset()).unwrap();
        let (reply, _) = worker.handle(step(&["p0", "p1"])).unwrap();
        match reply {
            Reply::Step { agents, acted, .. } => {
                assert!(agents.is_empty());
                assert_eq!(acted.len(), 2);
            }
            other => panic!("expected a step reply, got {other:?}"),
        }
        let (reply, _) = worker.handle(Command::Step(AgentMap::new())).unwrap();
        match reply {
            Reply::Step {
                rewards,
                terminations,
                agents,
                ..
            } => {
                assert_eq!(agents.len(), 2);
                assert_eq!(rewards["p0"], 0.0);
                assert!(!terminations["p1"]);
            }
            other => panic!("expected a step reply, got {other:?}"),
        }
        assert_eq!(worker.env.resets, 2);
    }

    #[test]
    fn call_rejects_reserved_names() {
        let mut worker = inline_worker(ScriptedEnv::two_agents(3));
        let err = worker
            .handle(Command::Call {
                name: "step".into(),
                args: Vec::new(),
            })
            .err()
            .unwrap();
        assert_eq!(err, EnvError::ReservedName { name: "step".into() });
    }

    #[test]
    fn call_and_set_attr_reach_env() {
        let mut worker = inline_worker(ScriptedEnv::two_agents(3));
        let (reply, _) = worker
            .handle(Command::Call {
                name: "echo".into(),
                args: vec![Value::Int(4)],
            })
            .unwrap();
        assert_eq!(reply, Reply::Call(Value::List(vec![Value::Int(4)])));
        worker
            .handle(Command::SetAttr {
                name: "reward_scale".into(),
                value: Value::Float(2.5),
            })
            .unwrap();
        assert_eq!(worker.env.reward_scale(), 2.5);
    }

    #[test]
    fn mismatched_spaces_are_reported_not_raised() {
        let reference = SpaceSignature::of(&ScriptedEnv::two_agents(3)).unwrap();
        let mut worker = inline_worker(ScriptedEnv::two_agents(3).with_global_state());
        let (reply, _) = worker.handle(Command::CheckSpaces(reference)).unwrap();
        match reply {
            Reply::Spaces(check) => {
                assert!(check.observation);
                assert!(!check.state);
            }
            other => panic!("expected a spaces reply, got {other:?}"),
        }
    }

    // ── Loop ────────────────────────────────────────────────────

    #[test]
    fn replies_echo_operation_numbers() {
        let mut worker = inline_worker(ScriptedEnv::two_agents(3));
        let mut reader = requests(vec![reset(), Command::Agents, Command::Close]);
        let mut wire = Vec::new();
        worker.run(&mut reader, &mut wire).unwrap();
        worker.release();

        let messages = replies(wire);
        assert_eq!(messages.len(), 3);
        for (op, msg) in messages.iter().enumerate() {
            match msg {
                WorkerMessage::Reply {
                    op: got, success, ..
                } => {
                    assert_eq!(*got, op as u64);
                    assert!(success);
                }
                other => panic!("expected a reply, got {other:?}"),
            }
        }
        assert_eq!(worker.env.closes, 1);
    }

    #[test]
    fn panic_is_reported_then_loop_exits() {
        let mut worker = inline_worker(ScriptedEnv::two_agents(5).panic_at_step(1));
        let mut reader = requests(vec![reset(), step(&["p0", "p1"]), Command::Agents]);
        let mut wire = Vec::new();
        let err = worker.run(&mut reader, &mut wire).unwrap_err();
        assert!(matches!(err, WorkerError::Command { command: "step", .. }), "got: {err}");
        worker.release();

        let messages = replies(wire);
        assert_eq!(messages.len(), 3, "agents must never be answered");
        match &messages[1] {
            WorkerMessage::Error { index, error } => {
                assert_eq!(*index, 0);
                assert!(error.to_string().contains("scripted panic"), "got: {error}");
            }
            other => panic!("expected an error report, got {other:?}"),
        }
        assert_eq!(
            messages[2],
            WorkerMessage::Reply {
                op: 1,
                success: false,
                reply: Reply::Failed
            }
        );
        assert_eq!(worker.env.closes, 1);
    }

    #[test]
    fn hang_up_ends_loop_cleanly() {
        let mut worker = inline_worker(ScriptedEnv::two_agents(3));
        let mut reader = requests(vec![reset()]);
        let mut wire = Vec::new();
        worker.run(&mut reader, &mut wire).unwrap();
        worker.release();
        worker.release();
        assert_eq!(worker.env.closes, 1);
    }

    // ── Shared memory ───────────────────────────────────────────

    #[test]
    fn observations_land_in_own_slot() {
        let env = ScriptedEnv::two_agents(3);
        let reference = SpaceSignature::of(&env).unwrap();
        let layout: SlotLayout =
            observation_layout(&reference.possible_agents, &reference.observation).unwrap();
        let arena = SharedArena::create(layout, 2).unwrap();

        let mut worker_args = args(1);
        worker_args.obs_shm = Some(arena.path().to_path_buf());
        let mut worker = Worker::new(env, &worker_args, Some(SharedCodec::fixed()));
        worker.handle(Command::CheckSpaces(reference)).unwrap();
        let (reply, _) = worker.handle(reset()).unwrap();

        match reply {
            Reply::Reset { observations, .. } => {
                assert_eq!(
                    observations,
                    Observations::Shared(["p0", "p1"].into_iter().map(AgentId::from).collect())
                );
            }
            other => panic!("expected a reset reply, got {other:?}"),
        }
        let block = arena.block(1, "p1").unwrap();
        assert_eq!(
            <Vec<f32> as FixedLayout>::read_fixed(block).unwrap(),
            vec![0.0, 1.0, 1.0]
        );
        assert!(arena.block(0, "p1").unwrap().iter().all(|b| *b == 0));
    }
}
