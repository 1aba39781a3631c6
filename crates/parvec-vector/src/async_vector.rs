//! Multi-process runner: one worker process per env.
//!
//! ```text
//!                  ┌─ local socket ─▶ worker 0 ── env
//! AsyncVectorEnv ──┼─ local socket ─▶ worker 1 ── env
//!   │  ▲           └─ local socket ─▶ worker n ── env
//!   │  │ replies (per-worker channel)     │
//!   │  └─ errors (shared channel) ◀───────┤ reader threads
//!   └──── SharedArena slots ◀─────────────┘ (worker i writes slot i)
//! ```
//!
//! Collective operations are begin/await pairs guarded by one
//! [`AsyncState`]. Every request carries an operation number; replies to
//! an operation that was abandoned by a timeout are discarded when they
//! arrive late.
//!
//! A failed command makes its worker report the error, answer with a
//! failed reply, and exit. The await that sees the failure raises the
//! last reported error; results from the workers that succeeded are
//! dropped.

use std::fmt;
use std::io::{self, BufReader, BufWriter};
use std::marker::PhantomData;
use std::process::{Child, Command as Process, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use interprocess::local_socket::traits::{Listener as _, Stream as _};
use interprocess::local_socket::{
    GenericNamespaced, Listener, ListenerNonblockingMode, ListenerOptions, RecvHalf, SendHalf,
    Stream, ToNsName,
};
use parvec_core::{
    AgentId, AgentMajor, AgentMap, EnvError, EnvId, EnvMap, EnvState, FixedLayout,
    Options, ParallelEnv, ResetOutput, Space, StateSpaces, StepOutput, Value,
};
use parvec_shm::SharedArena;
use tracing::{debug, error, info, warn};

use crate::batch::{partition_actions, resolve_seeds, BatchBuilder, Seeds, VectorReset, VectorStep};
use crate::config::{AsyncConfig, CloseOptions, ConfigError};
use crate::error::VectorError;
use crate::ledger::AgentLedger;
use crate::protocol::{
    is_reserved, read_frame, write_frame, Command, FrameError, Observations, Reply, Request,
    SharedState, StateReply, WorkerMessage,
};
use crate::shared::{observation_layout, state_layout, SharedCodec, STATE_BLOCK};
use crate::signature::SpaceSignature;
use crate::vector::VectorEnv;
use crate::worker::WorkerArgs;

// ── AsyncState ───────────────────────────────────────────────────

/// Which collective operation is in flight.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AsyncState {
    /// Nothing is pending.
    #[default]
    Default,
    /// `reset_begin` was issued.
    WaitingReset,
    /// `step_begin` was issued.
    WaitingStep,
    /// `call_begin` was issued.
    WaitingCall,
}

impl fmt::Display for AsyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncState::Default => write!(f, "default"),
            AsyncState::WaitingReset => write!(f, "reset_begin"),
            AsyncState::WaitingStep => write!(f, "step_begin"),
            AsyncState::WaitingCall => write!(f, "call_begin"),
        }
    }
}

// ── CloseReport ──────────────────────────────────────────────────

/// Report from [`AsyncVectorEnv::close_with`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloseReport {
    /// Total time spent closing.
    pub total_ms: u64,
    /// Whether workers were killed instead of closed gracefully.
    pub terminated: bool,
    /// Worker processes waited for.
    pub workers_reaped: usize,
    /// Reader threads joined.
    pub readers_joined: usize,
}

// ── Worker links ─────────────────────────────────────────────────

/// What a reader thread forwards to the orchestrator.
enum Incoming<O, S, I> {
    Reply {
        op: u64,
        success: bool,
        reply: Reply<O, S, I>,
    },
    /// The connection ended; `None` for a clean hang-up.
    Disconnected(Option<FrameError>),
}

enum LinkFailure {
    Timeout,
    Lost(String),
}

struct WorkerLink<O, S, I> {
    index: usize,
    pid: u32,
    child: Child,
    writer: BufWriter<SendHalf>,
    replies: Receiver<Incoming<O, S, I>>,
    reader: Option<JoinHandle<()>>,
    /// Why the worker can no longer be used.
    lost: Option<String>,
}

impl<O, S, I> WorkerLink<O, S, I> {
    fn send<A: serde::Serialize>(&mut self, op: u64, command: Command<A>) -> Result<(), VectorError> {
        if let Some(reason) = &self.lost {
            return Err(VectorError::WorkerUnavailable {
                index: self.index,
                reason: reason.clone(),
            });
        }
        match write_frame(&mut self.writer, &Request { op, command }) {
            Ok(()) => Ok(()),
            Err(source) => {
                self.lost = Some(format!("connection failed: {source}"));
                Err(VectorError::Protocol {
                    index: self.index,
                    source,
                })
            }
        }
    }

    /// Wait for the reply to `op`, discarding stale replies.
    fn recv(
        &mut self,
        op: u64,
        deadline: Option<Instant>,
    ) -> Result<(bool, Reply<O, S, I>), LinkFailure> {
        loop {
            let incoming = match deadline {
                Some(deadline) => self.replies.recv_deadline(deadline),
                None => self
                    .replies
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };
            match incoming {
                Ok(Incoming::Reply {
                    op: got,
                    success,
                    reply,
                }) => {
                    if got == op {
                        return Ok((success, reply));
                    }
                    warn!(worker = self.index, op = got, expected = op, "discarding stale reply");
                }
                Ok(Incoming::Disconnected(cause)) => {
                    let reason = match cause {
                        Some(e) => format!("connection failed: {e}"),
                        None => "worker hung up".to_owned(),
                    };
                    self.lost = Some(reason.clone());
                    return Err(LinkFailure::Lost(reason));
                }
                Err(RecvTimeoutError::Timeout) => return Err(LinkFailure::Timeout),
                Err(RecvTimeoutError::Disconnected) => {
                    let reason = self
                        .lost
                        .clone()
                        .unwrap_or_else(|| "reader stopped".to_owned());
                    self.lost = Some(reason.clone());
                    return Err(LinkFailure::Lost(reason));
                }
            }
        }
    }

    /// Wait for the process to exit, killing it once `deadline` passes.
    fn reap(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        if let Some(deadline) = deadline {
            loop {
                if self.child.try_wait()?.is_some() {
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    warn!(worker = self.index, pid = self.pid, "worker did not exit, killing");
                    self.kill();
                    break;
                }
                thread::sleep(Duration::from_millis(2));
            }
        }
        self.child.wait().map(|_| ())
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!(worker = self.index, error = %e, "kill failed; worker already exited");
        }
    }
}

fn spawn_reader<O, S, I>(
    index: usize,
    recv: RecvHalf,
    replies: Sender<Incoming<O, S, I>>,
    errors: Sender<(usize, EnvError)>,
) -> io::Result<JoinHandle<()>>
where
    O: serde::de::DeserializeOwned + Send + 'static,
    S: serde::de::DeserializeOwned + Send + 'static,
    I: serde::de::DeserializeOwned + Send + 'static,
{
    thread::Builder::new()
        .name(format!("parvec-reader-{index}"))
        .spawn(move || {
            let mut reader = BufReader::new(recv);
            loop {
                match read_frame::<_, WorkerMessage<O, S, I>>(&mut reader) {
                    Ok(WorkerMessage::Reply { op, success, reply }) => {
                        if replies.send(Incoming::Reply { op, success, reply }).is_err() {
                            return;
                        }
                    }
                    Ok(WorkerMessage::Error {
                        index: reported,
                        error,
                    }) => {
                        let _ = errors.send((reported as usize, error));
                    }
                    Ok(WorkerMessage::Hello { .. }) => {
                        warn!(worker = index, "ignoring repeated hello");
                    }
                    Err(FrameError::Closed) => {
                        let _ = replies.send(Incoming::Disconnected(None));
                        return;
                    }
                    Err(e) => {
                        let _ = replies.send(Incoming::Disconnected(Some(e)));
                        return;
                    }
                }
            }
        })
}

static SOCKET_SEQ: AtomicU64 = AtomicU64::new(0);

fn socket_name() -> String {
    format!(
        "parvec-{}-{}.sock",
        std::process::id(),
        SOCKET_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

fn kill_all(children: &mut [Child]) {
    for child in children.iter_mut() {
        let _ = child.kill();
        let _ = child.wait();
    }
}

/// Accept one connection per worker and order them by the index in each
/// worker's `Hello`.
fn accept_workers<O, S, I>(
    listener: &Listener,
    children: &mut [Child],
    timeout: Duration,
) -> Result<Vec<(Stream, u32)>, VectorError>
where
    O: serde::de::DeserializeOwned,
    S: serde::de::DeserializeOwned,
    I: serde::de::DeserializeOwned,
{
    let n = children.len();
    let deadline = Instant::now() + timeout;
    let mut slots: Vec<Option<(Stream, u32)>> = (0..n).map(|_| None).collect();
    let mut connected = 0;
    while connected < n {
        match listener.accept() {
            Ok(mut stream) => {
                let hello: WorkerMessage<O, S, I> = read_frame(&mut stream)
                    .map_err(|source| VectorError::Protocol { index: connected, source })?;
                let WorkerMessage::Hello { index, pid } = hello else {
                    return Err(VectorError::UnexpectedReply {
                        index: connected,
                        expected: "hello",
                    });
                };
                let slot = index as usize;
                if !slots.get(slot).is_some_and(Option::is_none) {
                    return Err(VectorError::WorkerUnavailable {
                        index: slot,
                        reason: "connected twice or with an unknown index".to_owned(),
                    });
                }
                debug!(worker = slot, pid, "worker connected");
                slots[slot] = Some((stream, pid));
                connected += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                for (index, child) in children.iter_mut().enumerate() {
                    if let Some(status) = child.try_wait()? {
                        if slots[index].is_none() {
                            return Err(VectorError::WorkerUnavailable {
                                index,
                                reason: format!("exited during startup ({status})"),
                            });
                        }
                    }
                }
                if Instant::now() >= deadline {
                    return Err(VectorError::Timeout {
                        operation: "connect",
                        after: timeout,
                    });
                }
                thread::sleep(Duration::from_millis(2));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(slots.into_iter().flatten().collect())
}

// ── Shared-memory decoding ───────────────────────────────────────

fn read_block<T>(
    arena: &SharedArena,
    decode: fn(&[u8]) -> Result<T, parvec_core::LayoutError>,
    env: EnvId,
    key: &str,
) -> Result<T, VectorError> {
    let block = arena.block(env.index(), key)?;
    decode(block).map_err(|source| VectorError::Layout {
        env,
        key: key.to_owned(),
        source,
    })
}

fn no_arena(env: EnvId, what: &str) -> VectorError {
    VectorError::contract(
        env,
        format!("worker reported {what} in shared memory, but no arena exists"),
    )
}

// ── AsyncVectorEnv ───────────────────────────────────────────────

/// Runs every sub-environment in its own worker process.
///
/// Construct with [`new`](Self::new) (shared memory available) or
/// [`new_inline`](Self::new_inline) (payloads always travel over the
/// socket). The worker binary must serve the same env type with the
/// matching entry point, [`run_worker`](crate::run_worker) or
/// [`run_worker_inline`](crate::run_worker_inline).
pub struct AsyncVectorEnv<E: ParallelEnv> {
    workers: Vec<WorkerLink<E::Observation, E::State, E::Info>>,
    errors: Receiver<(usize, EnvError)>,
    env_ids: Vec<EnvId>,
    spaces: SpaceSignature,
    ledger: AgentLedger,
    obs_arena: Option<SharedArena>,
    state_arena: Option<SharedArena>,
    codec: Option<SharedCodec<E::Observation, E::State>>,
    state: AsyncState,
    next_op: u64,
    pending_op: u64,
    pending_call: Option<String>,
    closed: bool,
    _env: PhantomData<fn() -> E>,
}

type LinkReply<E> =
    Reply<<E as ParallelEnv>::Observation, <E as ParallelEnv>::State, <E as ParallelEnv>::Info>;

impl<E: ParallelEnv> AsyncVectorEnv<E>
where
    E::Observation: FixedLayout,
    E::State: FixedLayout,
{
    /// Spawn `config.num_envs` workers.
    ///
    /// `env_fn` builds a reference env in this process; its possible
    /// agents and spaces are read, then it is closed. With
    /// `config.use_shared_memory`, observations (and state) are routed
    /// through shared arenas sized from those spaces.
    pub fn new<F>(env_fn: F, config: AsyncConfig) -> Result<Self, VectorError>
    where
        F: FnOnce() -> E,
    {
        Self::build(env_fn, config, Some(SharedCodec::fixed()))
    }
}

impl<E: ParallelEnv> AsyncVectorEnv<E> {
    /// Spawn workers that return every payload over the socket.
    ///
    /// `config.use_shared_memory` is ignored.
    pub fn new_inline<F>(env_fn: F, config: AsyncConfig) -> Result<Self, VectorError>
    where
        F: FnOnce() -> E,
    {
        Self::build(env_fn, config.shared_memory(false), None)
    }

    fn build<F>(
        env_fn: F,
        config: AsyncConfig,
        codec: Option<SharedCodec<E::Observation, E::State>>,
    ) -> Result<Self, VectorError>
    where
        F: FnOnce() -> E,
    {
        config.validate()?;
        let mut reference = env_fn();
        let spaces = SpaceSignature::of(&reference);
        if let Err(error) = reference.close() {
            warn!(%error, "reference env failed to close");
        }
        drop(reference);
        let spaces = spaces?;
        let n = config.num_envs;
        let env_ids = EnvId::range(n);

        let (obs_arena, state_arena, codec) = if config.use_shared_memory {
            let codec = codec.ok_or_else(|| ConfigError::SharedMemoryUnsupported {
                reason: "payloads have no fixed layout".to_owned(),
            })?;
            let obs = SharedArena::create(
                observation_layout(&spaces.possible_agents, &spaces.observation)?,
                n,
            )?;
            let state = state_layout(&spaces.possible_agents, &spaces.state)?
                .map(|layout| SharedArena::create(layout, n))
                .transpose()?;
            (Some(obs), state, Some(codec))
        } else {
            (None, None, None)
        };

        let name = socket_name();
        let listener = ListenerOptions::new()
            .name(name.as_str().to_ns_name::<GenericNamespaced>()?)
            .nonblocking(ListenerNonblockingMode::Accept)
            .create_sync()?;

        let mut children = Vec::with_capacity(n);
        for index in 0..n {
            let args = WorkerArgs {
                socket_name: name.clone(),
                index: index as u32,
                num_envs: n as u32,
                obs_shm: obs_arena.as_ref().map(|a| a.path().to_path_buf()),
                state_shm: state_arena.as_ref().map(|a| a.path().to_path_buf()),
            };
            let spawned = Process::new(&config.worker.program)
                .args(&config.worker.args)
                .args(args.to_args())
                .stdin(Stdio::null())
                .spawn();
            match spawned {
                Ok(child) => children.push(child),
                Err(e) => {
                    kill_all(&mut children);
                    return Err(e.into());
                }
            }
        }

        let streams = match accept_workers::<E::Observation, E::State, E::Info>(
            &listener,
            &mut children,
            config.connect_timeout,
        ) {
            Ok(streams) => streams,
            Err(e) => {
                kill_all(&mut children);
                return Err(e);
            }
        };
        drop(listener);

        let (error_tx, errors) = crossbeam_channel::unbounded();
        let mut workers = Vec::with_capacity(n);
        let mut failure = None;
        for (index, (child, (stream, pid))) in children.into_iter().zip(streams).enumerate() {
            let (recv, send) = stream.split();
            let (reply_tx, replies) = crossbeam_channel::unbounded();
            let reader = match spawn_reader(index, recv, reply_tx, error_tx.clone()) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    failure.get_or_insert(e);
                    None
                }
            };
            workers.push(WorkerLink {
                index,
                pid,
                child,
                writer: BufWriter::new(send),
                replies,
                reader,
                lost: None,
            });
        }
        drop(error_tx);

        let ledger = AgentLedger::new(&spaces.possible_agents, &env_ids);
        let mut venv = Self {
            workers,
            errors,
            env_ids,
            spaces,
            ledger,
            obs_arena,
            state_arena,
            codec,
            state: AsyncState::Default,
            next_op: 0,
            pending_op: 0,
            pending_call: None,
            closed: false,
            _env: PhantomData,
        };
        if let Some(e) = failure {
            return Err(e.into());
        }
        venv.check_spaces()?;
        venv.sync_agents()?;

        info!(
            num_envs = n,
            shared_memory = venv.obs_arena.is_some(),
            "async vector env ready"
        );
        Ok(venv)
    }

    fn check_spaces(&mut self) -> Result<(), VectorError> {
        let commands = self
            .env_ids
            .iter()
            .map(|_| Command::CheckSpaces(self.spaces.clone()))
            .collect();
        let replies = self.round_trip("check_spaces", commands)?;
        for (index, reply) in replies.into_iter().enumerate() {
            match reply {
                Reply::Spaces(check) => check.into_result(self.env_ids[index])?,
                _ => return Err(Self::unexpected(index, "spaces")),
            }
        }
        Ok(())
    }

    fn sync_agents(&mut self) -> Result<(), VectorError> {
        let commands = self.env_ids.iter().map(|_| Command::Agents).collect();
        let replies = self.round_trip("agents", commands)?;
        let mut snapshot = EnvMap::with_capacity(replies.len());
        for (index, reply) in replies.into_iter().enumerate() {
            match reply {
                Reply::Agents(agents) => {
                    snapshot.insert(self.env_ids[index], agents);
                }
                _ => return Err(Self::unexpected(index, "agents")),
            }
        }
        self.ledger.rebuild(snapshot)
    }

    // ── Accessors ───────────────────────────────────────────────

    /// The operation in flight.
    pub fn async_state(&self) -> AsyncState {
        self.state
    }

    /// Process id of every worker, in slot order.
    pub fn worker_pids(&self) -> Vec<u32> {
        self.workers.iter().map(|w| w.pid).collect()
    }

    /// Whether observations travel through shared memory.
    pub fn uses_shared_memory(&self) -> bool {
        self.obs_arena.is_some()
    }

    /// Whether the runner has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // ── Sequencing ──────────────────────────────────────────────

    fn ensure_default(&self, operation: &'static str) -> Result<(), VectorError> {
        if self.closed {
            return Err(VectorError::Closed { operation });
        }
        match self.state {
            AsyncState::Default => Ok(()),
            pending => Err(VectorError::AlreadyPending { operation, pending }),
        }
    }

    fn ensure_waiting(
        &self,
        operation: &'static str,
        expected: AsyncState,
    ) -> Result<(), VectorError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(VectorError::NoPendingCall {
                operation,
                expected,
            })
        }
    }

    /// Send one command per worker under a fresh operation number.
    fn dispatch(&mut self, commands: Vec<Command<E::Action>>) -> Result<(), VectorError> {
        self.next_op += 1;
        let op = self.next_op;
        for (link, command) in self.workers.iter_mut().zip(commands) {
            link.send(op, command)?;
        }
        self.pending_op = op;
        Ok(())
    }

    /// Collect the reply of every worker to the pending operation.
    fn gather(
        &mut self,
        operation: &'static str,
        timeout: Option<Duration>,
    ) -> Result<Vec<(bool, LinkReply<E>)>, VectorError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let op = self.pending_op;
        let mut replies = Vec::with_capacity(self.workers.len());
        let mut lost = None;
        for link in &mut self.workers {
            match link.recv(op, deadline) {
                Ok(reply) => replies.push(reply),
                Err(LinkFailure::Timeout) => {
                    return Err(VectorError::Timeout {
                        operation,
                        after: timeout.unwrap_or_default(),
                    })
                }
                Err(LinkFailure::Lost(reason)) => {
                    lost.get_or_insert(VectorError::WorkerUnavailable {
                        index: link.index,
                        reason,
                    });
                    replies.push((false, Reply::Failed));
                }
            }
        }
        if let Some(e) = lost {
            // A worker that reported an error and then hung up is more
            // useful to the caller than the hang-up itself.
            return Err(self.raise_if_errors(&replies).err().unwrap_or(e));
        }
        Ok(replies)
    }

    /// Drain one error report per failed reply, log each, and raise the
    /// last.
    fn raise_if_errors(&mut self, replies: &[(bool, LinkReply<E>)]) -> Result<(), VectorError> {
        let failures = replies.iter().filter(|(success, _)| !success).count();
        if failures == 0 {
            return Ok(());
        }
        let mut last = None;
        for _ in 0..failures {
            let Ok((index, error)) = self.errors.try_recv() else {
                break;
            };
            error!(worker = index, %error, "received error from worker");
            if let Some(link) = self.workers.get_mut(index) {
                link.lost = Some(format!("failed: {error}"));
            }
            last = Some(VectorError::Remote {
                index,
                source: error,
            });
        }
        match last {
            Some(e) => Err(e),
            None => {
                let index = replies
                    .iter()
                    .position(|(success, _)| !success)
                    .unwrap_or(0);
                Err(VectorError::WorkerUnavailable {
                    index,
                    reason: "reported a failure without an error".to_owned(),
                })
            }
        }
    }

    /// Send, wait without a deadline and raise any failure.
    fn round_trip(
        &mut self,
        operation: &'static str,
        commands: Vec<Command<E::Action>>,
    ) -> Result<Vec<LinkReply<E>>, VectorError> {
        self.ensure_default(operation)?;
        self.dispatch(commands)?;
        let replies = self.gather(operation, None)?;
        self.raise_if_errors(&replies)?;
        Ok(replies.into_iter().map(|(_, reply)| reply).collect())
    }

    /// Finish an await: restore `Default`, then raise any failure.
    fn finish_await(
        &mut self,
        operation: &'static str,
        timeout: Option<Duration>,
    ) -> Result<Vec<LinkReply<E>>, VectorError> {
        let outcome = self.gather(operation, timeout);
        self.state = AsyncState::Default;
        self.pending_call = None;
        let replies = outcome?;
        self.raise_if_errors(&replies)?;
        Ok(replies.into_iter().map(|(_, reply)| reply).collect())
    }

    fn unexpected(index: usize, expected: &'static str) -> VectorError {
        VectorError::UnexpectedReply { index, expected }
    }

    fn read_observations(
        &self,
        env: EnvId,
        observations: Observations<E::Observation>,
    ) -> Result<AgentMap<E::Observation>, VectorError> {
        match observations {
            Observations::Inline(map) => Ok(map),
            Observations::Shared(agents) => {
                let (Some(arena), Some(codec)) = (&self.obs_arena, &self.codec) else {
                    return Err(no_arena(env, "observations"));
                };
                agents
                    .into_iter()
                    .map(|agent| {
                        let obs = read_block(arena, codec.read_observation, env, agent.as_str())?;
                        Ok((agent, obs))
                    })
                    .collect()
            }
        }
    }

    fn read_state(
        &self,
        env: EnvId,
        state: StateReply<E::State>,
    ) -> Result<EnvState<E::State>, VectorError> {
        let shared = match state {
            StateReply::Inline(state) => return Ok(state),
            StateReply::Shared(shared) => shared,
        };
        let (Some(arena), Some(codec)) = (&self.state_arena, &self.codec) else {
            return Err(no_arena(env, "state"));
        };
        match shared {
            SharedState::Empty => Ok(EnvState::Empty),
            SharedState::Global => Ok(EnvState::Global(read_block(
                arena,
                codec.read_state,
                env,
                STATE_BLOCK,
            )?)),
            SharedState::PerAgent(agents) => agents
                .into_iter()
                .map(|agent| {
                    let s = read_block(arena, codec.read_state, env, agent.as_str())?;
                    Ok((agent, s))
                })
                .collect::<Result<AgentMap<_>, VectorError>>()
                .map(EnvState::PerAgent),
        }
    }

    // ── Reset ───────────────────────────────────────────────────

    /// Send `reset` to every worker.
    pub fn reset_begin(&mut self, seeds: Seeds, options: &Options) -> Result<(), VectorError> {
        self.ensure_default("reset_begin")?;
        let seeds = resolve_seeds(&seeds, &self.env_ids)?;
        let commands = seeds
            .into_iter()
            .map(|seed| Command::Reset {
                seed,
                options: options.clone(),
            })
            .collect();
        self.dispatch(commands)?;
        self.state = AsyncState::WaitingReset;
        Ok(())
    }

    /// Wait for every worker's reset and rebuild the ledger.
    pub fn reset_await(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<VectorReset<E::Observation, E::Info>, VectorError> {
        self.ensure_waiting("reset_await", AsyncState::WaitingReset)?;
        let replies = self.finish_await("reset_await", timeout)?;

        let mut batch = BatchBuilder::new(self.ledger.possible_agents());
        let mut snapshot = EnvMap::with_capacity(replies.len());
        for (index, reply) in replies.into_iter().enumerate() {
            let env = self.env_ids[index];
            let Reply::Reset {
                observations,
                infos,
                agents,
            } = reply
            else {
                return Err(Self::unexpected(index, "reset"));
            };
            let observations = self.read_observations(env, observations)?;
            batch.push_reset(env, ResetOutput { observations, infos }, &agents)?;
            snapshot.insert(env, agents);
        }
        self.ledger.rebuild(snapshot)?;
        Ok(batch.finish_reset())
    }

    // ── Step ────────────────────────────────────────────────────

    /// Partition `actions` by the current ledger and send each worker
    /// its share. Workers whose env finished reset instead.
    pub fn step_begin(&mut self, actions: AgentMajor<E::Action>) -> Result<(), VectorError> {
        self.ensure_default("step_begin")?;
        let mut per_env = partition_actions(actions, &self.ledger)?;
        let commands = self
            .env_ids
            .iter()
            .map(|env| Command::Step(per_env.swap_remove(env).unwrap_or_default()))
            .collect();
        self.dispatch(commands)?;
        self.state = AsyncState::WaitingStep;
        Ok(())
    }

    /// Wait for every worker's step and commit the ledger.
    pub fn step_await(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<VectorStep<E::Observation, E::Info>, VectorError> {
        self.ensure_waiting("step_await", AsyncState::WaitingStep)?;
        let replies = self.finish_await("step_await", timeout)?;

        let mut batch = BatchBuilder::new(self.ledger.possible_agents());
        let mut snapshot = EnvMap::with_capacity(replies.len());
        for (index, reply) in replies.into_iter().enumerate() {
            let env = self.env_ids[index];
            let Reply::Step {
                observations,
                rewards,
                terminations,
                truncations,
                infos,
                acted,
                agents,
            } = reply
            else {
                return Err(Self::unexpected(index, "step"));
            };
            let step = StepOutput {
                observations: self.read_observations(env, observations)?,
                rewards,
                terminations,
                truncations,
                infos,
            };
            batch.push_step(env, step, &acted, &agents)?;
            snapshot.insert(env, agents);
        }
        self.ledger.commit(snapshot)?;
        Ok(batch.finish_step())
    }

    // ── Call ────────────────────────────────────────────────────

    /// Invoke `name` on every worker's env.
    pub fn call_begin(&mut self, name: &str, args: &[Value]) -> Result<(), VectorError> {
        self.ensure_default("call_begin")?;
        if is_reserved(name) {
            return Err(VectorError::ReservedName {
                name: name.to_owned(),
            });
        }
        let commands = self
            .env_ids
            .iter()
            .map(|_| Command::Call {
                name: name.to_owned(),
                args: args.to_vec(),
            })
            .collect();
        self.dispatch(commands)?;
        self.state = AsyncState::WaitingCall;
        self.pending_call = Some(name.to_owned());
        Ok(())
    }

    /// Collect every worker's result of the pending `call`.
    pub fn call_await(&mut self, timeout: Option<Duration>) -> Result<EnvMap<Value>, VectorError> {
        self.ensure_waiting("call_await", AsyncState::WaitingCall)?;
        let replies = self.finish_await("call_await", timeout)?;
        replies
            .into_iter()
            .enumerate()
            .map(|(index, reply)| match reply {
                Reply::Call(value) => Ok((self.env_ids[index], value)),
                _ => Err(Self::unexpected(index, "call")),
            })
            .collect()
    }

    // ── Close ───────────────────────────────────────────────────

    /// Close every worker and reap every process.
    ///
    /// A pending operation is awaited first, bounded by
    /// `options.timeout`; if it times out the workers are killed. With
    /// `options.terminate` the pending operation is abandoned and the
    /// workers are killed straight away. Closing twice is a no-op.
    pub fn close_with(&mut self, options: CloseOptions) -> Result<CloseReport, VectorError> {
        if self.closed {
            return Ok(CloseReport {
                total_ms: 0,
                terminated: false,
                workers_reaped: 0,
                readers_joined: 0,
            });
        }
        let start = Instant::now();
        let mut terminate = options.terminate;

        if self.state != AsyncState::Default {
            warn!(
                pending = %self.state,
                "closing while waiting for a pending call to complete"
            );
            if !terminate {
                let operation = match self.state {
                    AsyncState::WaitingReset => "reset_await",
                    AsyncState::WaitingStep => "step_await",
                    _ => "call_await",
                };
                match self.finish_await(operation, options.timeout) {
                    Err(VectorError::Timeout { .. }) => terminate = true,
                    Err(e) => debug!(error = %e, "pending operation failed during close"),
                    Ok(_) => {}
                }
            }
            self.state = AsyncState::Default;
            self.pending_call = None;
        }
        self.closed = true;

        let deadline = options.timeout.map(|t| Instant::now() + t);
        let mut first_error = None;
        if !terminate {
            self.next_op += 1;
            let op = self.next_op;
            for link in &mut self.workers {
                if link.lost.is_none() {
                    if let Err(e) = link.send::<E::Action>(op, Command::Close) {
                        debug!(worker = link.index, error = %e, "close not delivered");
                    }
                }
            }
            for link in &mut self.workers {
                if link.lost.is_some() {
                    continue;
                }
                match link.recv(op, deadline) {
                    Ok((true, _)) => {}
                    Ok((false, _)) => {
                        if let Ok((index, error)) = self.errors.try_recv() {
                            error!(worker = index, %error, "received error from worker");
                            first_error.get_or_insert(VectorError::Remote {
                                index,
                                source: error,
                            });
                        }
                    }
                    Err(LinkFailure::Timeout) => {
                        warn!(worker = link.index, "close timed out, terminating");
                        terminate = true;
                        break;
                    }
                    Err(LinkFailure::Lost(reason)) => {
                        debug!(worker = link.index, %reason, "worker gone before close");
                    }
                }
            }
        }

        if terminate {
            warn!(num_envs = self.workers.len(), "terminating workers");
            for link in &mut self.workers {
                link.kill();
            }
        }

        let mut workers_reaped = 0;
        for link in &mut self.workers {
            match link.reap(deadline) {
                Ok(()) => workers_reaped += 1,
                Err(e) => warn!(worker = link.index, error = %e, "failed to reap worker"),
            }
        }
        let mut readers_joined = 0;
        for link in &mut self.workers {
            if let Some(handle) = link.reader.take() {
                if handle.join().is_ok() {
                    readers_joined += 1;
                }
            }
        }

        let report = CloseReport {
            total_ms: start.elapsed().as_millis() as u64,
            terminated: terminate,
            workers_reaped,
            readers_joined,
        };
        info!(
            num_envs = self.workers.len(),
            terminated = report.terminated,
            total_ms = report.total_ms,
            "async vector env closed"
        );
        first_error.map_or(Ok(report), Err)
    }
}

impl<E: ParallelEnv> VectorEnv for AsyncVectorEnv<E> {
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
        self.reset_begin(seeds, options)?;
        self.reset_await(None)
    }

    fn step(
        &mut self,
        actions: AgentMajor<E::Action>,
    ) -> Result<VectorStep<E::Observation, E::Info>, VectorError> {
        self.step_begin(actions)?;
        self.step_await(None)
    }

    fn raw_states(&mut self) -> Result<EnvMap<EnvState<E::State>>, VectorError> {
        let commands = self.env_ids.iter().map(|_| Command::State).collect();
        let replies = self.round_trip("state", commands)?;
        let mut states = EnvMap::with_capacity(replies.len());
        for (index, reply) in replies.into_iter().enumerate() {
            let env = self.env_ids[index];
            let Reply::State(state) = reply else {
                return Err(Self::unexpected(index, "state"));
            };
            states.insert(env, self.read_state(env, state)?);
        }
        Ok(states)
    }

    fn call(&mut self, name: &str, args: &[Value]) -> Result<EnvMap<Value>, VectorError> {
        self.call_begin(name, args)?;
        self.call_await(None)
    }

    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), VectorError> {
        let commands = self
            .env_ids
            .iter()
            .map(|_| Command::SetAttr {
                name: name.to_owned(),
                value: value.clone(),
            })
            .collect();
        let replies = self.round_trip("set_attr", commands)?;
        for (index, reply) in replies.into_iter().enumerate() {
            if !matches!(reply, Reply::AttrSet) {
                return Err(Self::unexpected(index, "set_attr"));
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), VectorError> {
        self.close_with(CloseOptions::default()).map(|_| ())
    }
}

impl<E: ParallelEnv> Drop for AsyncVectorEnv<E> {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close_with(CloseOptions {
                timeout: Some(Duration::from_secs(1)),
                terminate: true,
            });
        }
    }
}

impl<E: ParallelEnv> fmt::Display for AsyncVectorEnv<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AsyncVectorEnv(num_envs={})", self.workers.len())
    }
}

impl<E: ParallelEnv> fmt::Debug for AsyncVectorEnv<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncVectorEnv")
            .field("num_envs", &self.workers.len())
            .field("state", &self.state)
            .field("pending_call", &self.pending_call)
            .field("shared_memory", &self.obs_arena.is_some())
            .field("agents", self.ledger.agents())
            .field("closed", &self.closed)
            .finish()
    }
}
