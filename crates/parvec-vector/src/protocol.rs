//! Orchestrator ↔ worker wire protocol.
//!
//! Each worker holds one duplex local-socket connection. Both directions
//! carry length-prefixed frames:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┐
//! │ len: u32 BE  │ bincode (serde, standard)    │
//! └──────────────┴──────────────────────────────┘
//! ```
//!
//! The orchestrator sends [`Request`]s tagged with an operation number.
//! The worker answers each with one [`WorkerMessage::Reply`] echoing that
//! number, preceded by a [`WorkerMessage::Error`] when the command failed.

use std::io::{self, Read, Write};

use bincode::error::{DecodeError, EncodeError};
use parvec_core::{AgentList, AgentMap, EnvError, EnvState, Options, Value};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::signature::{SpaceCheck, SpaceSignature};

/// Names of the worker's own commands, which `call` may not use.
pub const RESERVED_NAMES: &[&str] = &[
    "reset",
    "step",
    "state",
    "agents",
    "close",
    "set_attr",
    "check_spaces",
];

/// Whether `name` is one of [`RESERVED_NAMES`].
pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_LEN: usize = 256 << 20;

// ── Orchestrator → worker ───────────────────────────────────────────

/// A command for the worker's env.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Command<A> {
    /// Reset the env.
    Reset {
        /// Seed for this env.
        seed: Option<u64>,
        /// Reset options.
        options: Options,
    },
    /// Step the env, or reset it when it finished on the previous step.
    Step(AgentMap<A>),
    /// Report the env's state.
    State,
    /// Report the env's live agents.
    Agents,
    /// Close the env and exit.
    Close,
    /// Invoke a named capability.
    Call {
        /// Capability name.
        name: String,
        /// Arguments.
        args: Vec<Value>,
    },
    /// Set a named attribute.
    SetAttr {
        /// Attribute name.
        name: String,
        /// New value.
        value: Value,
    },
    /// Compare the env's spaces against the reference signature.
    CheckSpaces(SpaceSignature),
}

impl<A> Command<A> {
    /// Command name, matching [`RESERVED_NAMES`].
    pub fn name(&self) -> &'static str {
        match self {
            Command::Reset { .. } => "reset",
            Command::Step(_) => "step",
            Command::State => "state",
            Command::Agents => "agents",
            Command::Close => "close",
            Command::Call { .. } => "call",
            Command::SetAttr { .. } => "set_attr",
            Command::CheckSpaces(_) => "check_spaces",
        }
    }
}

/// A command tagged with the orchestrator's operation number.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request<A> {
    /// Operation number, echoed in the reply.
    pub op: u64,
    /// The command.
    pub command: Command<A>,
}

// ── Worker → orchestrator ───────────────────────────────────────────

/// Where a reply's observations are.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Observations<O> {
    /// Carried in the frame.
    Inline(AgentMap<O>),
    /// Written to the worker's shared-memory slot for these agents.
    Shared(AgentList),
}

/// A state written to shared memory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharedState {
    /// Nothing was written.
    Empty,
    /// The global state block was written.
    Global,
    /// The blocks of these agents were written.
    PerAgent(AgentList),
}

/// Where a state reply's payload is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StateReply<S> {
    /// Carried in the frame.
    Inline(EnvState<S>),
    /// Written to the worker's shared-memory state slot.
    Shared(SharedState),
}

/// Result of one command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Reply<O, S, I> {
    /// Result of `Reset`.
    Reset {
        /// Observations of the live agents.
        observations: Observations<O>,
        /// Infos.
        infos: AgentMap<I>,
        /// Live agents after the reset.
        agents: AgentList,
    },
    /// Result of `Step`.
    Step {
        /// Observations returned by the env.
        observations: Observations<O>,
        /// Rewards.
        rewards: AgentMap<f64>,
        /// Termination flags.
        terminations: AgentMap<bool>,
        /// Truncation flags.
        truncations: AgentMap<bool>,
        /// Infos.
        infos: AgentMap<I>,
        /// Agents whose rewards and flags are reported.
        acted: AgentList,
        /// Live agents after the step.
        agents: AgentList,
    },
    /// Result of `State`.
    State(StateReply<S>),
    /// Result of `Agents`.
    Agents(AgentList),
    /// Result of `Close`.
    Closed,
    /// Result of `Call`.
    Call(Value),
    /// Result of `SetAttr`.
    AttrSet,
    /// Result of `CheckSpaces`.
    Spaces(SpaceCheck),
    /// The command failed; the error was sent just before.
    Failed,
}

/// A frame sent by a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WorkerMessage<O, S, I> {
    /// First frame after connecting.
    Hello {
        /// Worker index.
        index: u32,
        /// Worker process id.
        pid: u32,
    },
    /// A command failed in the env.
    Error {
        /// Worker index.
        index: u32,
        /// The failure.
        error: EnvError,
    },
    /// Answer to the request numbered `op`.
    Reply {
        /// Operation number of the request.
        op: u64,
        /// Whether the command succeeded.
        success: bool,
        /// The result.
        reply: Reply<O, S, I>,
    },
}

// ── Framing ─────────────────────────────────────────────────────────

/// Errors transferring one frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the connection.
    #[error("connection closed")]
    Closed,
    /// Socket failure.
    #[error("I/O: {0}")]
    Io(io::Error),
    /// The message could not be encoded.
    #[error("encode: {0}")]
    Encode(#[from] EncodeError),
    /// The frame could not be decoded.
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),
    /// The frame exceeds [`MAX_FRAME_LEN`].
    #[error("frame of {len} bytes exceeds the frame size limit")]
    TooLarge {
        /// Frame length.
        len: usize,
    },
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset => FrameError::Closed,
            _ => FrameError::Io(e),
        }
    }
}

/// Encode `msg` and write it as one frame.
pub fn write_frame<W: Write + ?Sized, T: Serialize>(w: &mut W, msg: &T) -> Result<(), FrameError> {
    let bytes = bincode::serde::encode_to_vec(msg, bincode::config::standard())?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge { len: bytes.len() });
    }
    let len = bytes.len() as u32;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(&bytes)?;
    w.flush()?;
    Ok(())
}

/// Read one frame and decode it.
pub fn read_frame<R: Read + ?Sized, T: DeserializeOwned>(r: &mut R) -> Result<T, FrameError> {
    let mut prefix = [0u8; 4];
    r.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge { len });
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    let (msg, _) = bincode::serde::decode_from_slice(&buf, bincode::config::standard())?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parvec_core::AgentId;
    use std::io::Cursor;

    type Message = WorkerMessage<Vec<f32>, Vec<f32>, ()>;

    #[test]
    fn frames_are_read_back_in_order() {
        let mut wire = Vec::new();
        let request: Request<i64> = Request {
            op: 7,
            command: Command::Step([(AgentId::from("p0"), 3)].into_iter().collect()),
        };
        write_frame(&mut wire, &request).unwrap();
        let reply: Message = WorkerMessage::Reply {
            op: 7,
            success: true,
            reply: Reply::Agents([AgentId::from("p1")].into_iter().collect()),
        };
        write_frame(&mut wire, &reply).unwrap();

        let len = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
        assert!(wire.len() > len + 4);

        let mut cursor = Cursor::new(wire);
        let first: Request<i64> = read_frame(&mut cursor).unwrap();
        assert_eq!(first.op, 7);
        match first.command {
            Command::Step(actions) => assert_eq!(actions["p0"], 3),
            other => panic!("expected step, got {}", other.name()),
        }
        let second: Message = read_frame(&mut cursor).unwrap();
        assert_eq!(second, reply);
    }

    #[test]
    fn eof_reads_as_closed() {
        let mut empty = Cursor::new(Vec::<u8>::new());
        let err = read_frame::<_, Message>(&mut empty).unwrap_err();
        assert!(matches!(err, FrameError::Closed));

        let mut truncated = Cursor::new(vec![0, 0, 0, 9, 1, 2]);
        let err = read_frame::<_, Message>(&mut truncated).unwrap_err();
        assert!(matches!(err, FrameError::Closed));
    }

    #[test]
    fn oversized_prefix_rejected() {
        let mut wire = Cursor::new(u32::MAX.to_be_bytes().to_vec());
        let err = read_frame::<_, Message>(&mut wire).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { .. }));
    }

    #[test]
    fn garbage_payload_is_decode_error() {
        let mut wire = vec![0, 0, 0, 2];
        wire.extend_from_slice(&[0xff, 0xff]);
        let err = read_frame::<_, Message>(&mut Cursor::new(wire)).unwrap_err();
        assert!(matches!(err, FrameError::Decode(_)), "got: {err}");
    }

    #[test]
    fn command_names_are_reserved() {
        let commands: Vec<Command<i64>> = vec![
            Command::Reset {
                seed: None,
                options: Options::new(),
            },
            Command::Step(AgentMap::new()),
            Command::State,
            Command::Agents,
            Command::Close,
            Command::SetAttr {
                name: "x".into(),
                value: Value::Unit,
            },
        ];
        for command in &commands {
            assert!(is_reserved(command.name()), "{}", command.name());
        }
        assert!(!is_reserved("call"));
        assert!(!is_reserved("render"));
    }
}
