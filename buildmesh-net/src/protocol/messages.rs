//! Tunnel messages.
//!
//! Every frame payload starts with a 12-byte header:
//! - 4 bytes: little-endian `i32` message type
//! - 8 bytes: little-endian `i64` send time, UTC microseconds
//!
//! followed by the bincode encoding of the kind's fields (nothing for
//! PING, PONG and TASK_START).

use std::fmt;
use std::ops::BitOr;

use buildmesh_core::serialization;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};

/// Size of the type + timestamp header.
pub const HEADER_SIZE: usize = 12;

/// Wire discriminant of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageKind {
    /// Liveness probe.
    Ping = 0,
    /// Liveness reply.
    Pong = 1,
    /// Run a process.
    TaskDispatch = 2,
    /// The process has been accepted.
    TaskStart = 3,
    /// The process touched a file.
    TaskFileAccess = 4,
    /// A chunk of console output.
    TaskOutput = 5,
    /// The process finished.
    TaskStop = 6,
}

impl MessageKind {
    /// All kinds, in discriminant order.
    pub const ALL: [MessageKind; 7] = [
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::TaskDispatch,
        MessageKind::TaskStart,
        MessageKind::TaskFileAccess,
        MessageKind::TaskOutput,
        MessageKind::TaskStop,
    ];

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Ping => "PING",
            MessageKind::Pong => "PONG",
            MessageKind::TaskDispatch => "TASK_DISPATCH",
            MessageKind::TaskStart => "TASK_START",
            MessageKind::TaskFileAccess => "TASK_FILEACCESS",
            MessageKind::TaskOutput => "TASK_OUTPUT",
            MessageKind::TaskStop => "TASK_STOP",
        }
    }
}

impl TryFrom<i32> for MessageKind {
    type Error = MeshError;

    fn try_from(value: i32) -> MeshResult<Self> {
        MessageKind::ALL
            .get(value as usize)
            .copied()
            .filter(|kind| *kind as i32 == value)
            .ok_or(MeshError::UnknownMessageType(value))
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// File access bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessMode(pub u32);

impl AccessMode {
    /// No access.
    pub const NONE: AccessMode = AccessMode(0);
    /// File was read.
    pub const READ: AccessMode = AccessMode(1);
    /// File was written.
    pub const WRITE: AccessMode = AccessMode(2);
    /// File was executed.
    pub const EXECUTE: AccessMode = AccessMode(4);

    /// Whether every bit of `other` is set.
    pub fn contains(self, other: AccessMode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AccessMode {
    type Output = AccessMode;

    fn bitor(self, rhs: AccessMode) -> AccessMode {
        AccessMode(self.0 | rhs.0)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |mode, c| if self.contains(mode) { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(AccessMode::READ, 'r'),
            flag(AccessMode::WRITE, 'w'),
            flag(AccessMode::EXECUTE, 'x')
        )
    }
}

/// Request to run one process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDispatch {
    /// Program to run.
    pub executable: String,
    /// Program arguments.
    pub arguments: Vec<String>,
    /// Working directory; empty means the worker's own.
    pub working_dir: String,
    /// Extra environment variables.
    pub environment: Vec<(String, String)>,
}

/// A file the running process accessed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFileAccess {
    /// Path as seen by the process.
    pub path: String,
    /// How it was accessed.
    pub mode: AccessMode,
}

/// A chunk of process output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Output text.
    pub chunk: String,
}

/// Completion of a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStop {
    /// Empty on success, otherwise the failure text.
    pub error: String,
}

/// Kind-specific message contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Liveness probe.
    Ping,
    /// Liveness reply.
    Pong,
    /// Run a process.
    TaskDispatch(TaskDispatch),
    /// The process has been accepted.
    TaskStart,
    /// The process touched a file.
    TaskFileAccess(TaskFileAccess),
    /// A chunk of console output.
    TaskOutput(TaskOutput),
    /// The process finished.
    TaskStop(TaskStop),
}

impl Payload {
    /// Wire discriminant.
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Ping => MessageKind::Ping,
            Payload::Pong => MessageKind::Pong,
            Payload::TaskDispatch(_) => MessageKind::TaskDispatch,
            Payload::TaskStart => MessageKind::TaskStart,
            Payload::TaskFileAccess(_) => MessageKind::TaskFileAccess,
            Payload::TaskOutput(_) => MessageKind::TaskOutput,
            Payload::TaskStop(_) => MessageKind::TaskStop,
        }
    }
}

/// A timestamped message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// When the sender created the message.
    pub sent_at: DateTime<Utc>,
    /// Contents.
    pub payload: Payload,
}

impl Message {
    /// Stamp `payload` with the current time.
    pub fn new(payload: Payload) -> Self {
        Self {
            sent_at: Utc::now(),
            payload,
        }
    }

    /// A PING.
    pub fn ping() -> Self {
        Self::new(Payload::Ping)
    }

    /// A PONG.
    pub fn pong() -> Self {
        Self::new(Payload::Pong)
    }

    /// A TASK_START.
    pub fn task_start() -> Self {
        Self::new(Payload::TaskStart)
    }

    /// A TASK_OUTPUT carrying `chunk`.
    pub fn task_output(chunk: impl Into<String>) -> Self {
        Self::new(Payload::TaskOutput(TaskOutput { chunk: chunk.into() }))
    }

    /// A TASK_FILEACCESS for `path`.
    pub fn task_file_access(path: impl Into<String>, mode: AccessMode) -> Self {
        Self::new(Payload::TaskFileAccess(TaskFileAccess {
            path: path.into(),
            mode,
        }))
    }

    /// A TASK_STOP; an empty `error` means success.
    pub fn task_stop(error: impl Into<String>) -> Self {
        Self::new(Payload::TaskStop(TaskStop { error: error.into() }))
    }

    /// Wire discriminant.
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Human-readable kind name.
    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Encode into a frame payload.
    pub fn encode(&self) -> MeshResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        let header = (self.kind() as i32, self.sent_at.timestamp_micros());
        serialization::serialize_into(&mut buf, &header)?;

        match &self.payload {
            Payload::Ping | Payload::Pong | Payload::TaskStart => {}
            Payload::TaskDispatch(body) => serialization::serialize_into(&mut buf, body)?,
            Payload::TaskFileAccess(body) => serialization::serialize_into(&mut buf, body)?,
            Payload::TaskOutput(body) => serialization::serialize_into(&mut buf, body)?,
            Payload::TaskStop(body) => serialization::serialize_into(&mut buf, body)?,
        }
        Ok(buf)
    }

    /// Decode a frame payload.
    pub fn decode(bytes: &[u8]) -> MeshResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(MeshError::MalformedMessage(format!(
                "{} bytes is shorter than the message header",
                bytes.len()
            )));
        }
        let (header, body) = bytes.split_at(HEADER_SIZE);
        let kind = MessageKind::try_from(i32::from_le_bytes([header[0], header[1], header[2], header[3]]))?;
        let mut micros = [0u8; 8];
        micros.copy_from_slice(&header[4..]);
        let micros = i64::from_le_bytes(micros);
        let sent_at = DateTime::<Utc>::from_timestamp_micros(micros)
            .ok_or_else(|| MeshError::MalformedMessage(format!("timestamp {} out of range", micros)))?;

        let payload = match kind {
            MessageKind::Ping => empty(kind, body, Payload::Ping)?,
            MessageKind::Pong => empty(kind, body, Payload::Pong)?,
            MessageKind::TaskStart => empty(kind, body, Payload::TaskStart)?,
            MessageKind::TaskDispatch => Payload::TaskDispatch(fields(kind, body)?),
            MessageKind::TaskFileAccess => Payload::TaskFileAccess(fields(kind, body)?),
            MessageKind::TaskOutput => Payload::TaskOutput(fields(kind, body)?),
            MessageKind::TaskStop => Payload::TaskStop(fields(kind, body)?),
        };

        Ok(Self { sent_at, payload })
    }
}

fn empty(kind: MessageKind, body: &[u8], payload: Payload) -> MeshResult<Payload> {
    if body.is_empty() {
        Ok(payload)
    } else {
        Err(MeshError::MalformedMessage(format!(
            "{} carries {} unexpected bytes",
            kind,
            body.len()
        )))
    }
}

fn fields<T: serde::de::DeserializeOwned>(kind: MessageKind, body: &[u8]) -> MeshResult<T> {
    serialization::deserialize(body).map_err(|e| MeshError::MalformedMessage(format!("{}: {}", kind, e)))
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Payload::Ping => write!(f, "Ping"),
            Payload::Pong => write!(f, "Pong"),
            Payload::TaskDispatch(d) => write!(
                f,
                "TaskDispatch(executable={}, args={})",
                d.executable,
                d.arguments.len()
            ),
            Payload::TaskStart => write!(f, "TaskStart"),
            Payload::TaskFileAccess(a) => write!(f, "TaskFileAccess({} {})", a.mode, a.path),
            Payload::TaskOutput(o) => write!(f, "TaskOutput(len={})", o.chunk.len()),
            Payload::TaskStop(s) if s.error.is_empty() => write!(f, "TaskStop(ok)"),
            Payload::TaskStop(s) => write!(f, "TaskStop(error={})", s.error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_micros(micros: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_micros(micros).unwrap()
    }

    #[test]
    fn test_header_layout() {
        let msg = Message {
            sent_at: at_micros(0x0102_0304_0506_0708),
            payload: Payload::TaskStop(TaskStop { error: String::new() }),
        };
        let bytes = msg.encode().unwrap();

        assert_eq!(&bytes[..4], &6i32.to_le_bytes());
        assert_eq!(&bytes[4..12], &0x0102_0304_0506_0708i64.to_le_bytes());
        // Empty string: u64 length prefix only.
        assert_eq!(bytes.len(), HEADER_SIZE + 8);
    }

    #[test]
    fn test_every_kind_survives_encoding() {
        let messages = vec![
            Message::ping(),
            Message::pong(),
            Message::new(Payload::TaskDispatch(TaskDispatch {
                executable: "/usr/bin/cc".into(),
                arguments: vec!["-c".into(), "main.c".into()],
                working_dir: "/src".into(),
                environment: vec![("LANG".into(), "C".into())],
            })),
            Message::task_start(),
            Message::task_file_access("/src/main.c", AccessMode::READ | AccessMode::WRITE),
            Message::task_output("main.c: warning: unused variable\n"),
            Message::task_stop("exit status: 1"),
        ];

        for (n, msg) in messages.into_iter().enumerate() {
            assert_eq!(msg.kind() as i32, n as i32);
            let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
            assert_eq!(decoded.payload, msg.payload);
            assert_eq!(decoded.sent_at.timestamp_micros(), msg.sent_at.timestamp_micros());
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut bytes = Message::ping().encode().unwrap();
        bytes[..4].copy_from_slice(&7i32.to_le_bytes());
        assert!(matches!(
            Message::decode(&bytes),
            Err(MeshError::UnknownMessageType(7))
        ));

        bytes[..4].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(matches!(
            Message::decode(&bytes),
            Err(MeshError::UnknownMessageType(-1))
        ));
    }

    #[test]
    fn test_malformed_bodies_rejected() {
        assert!(Message::decode(&[0u8; 5]).is_err());

        let mut ping = Message::ping().encode().unwrap();
        ping.push(0);
        assert!(matches!(Message::decode(&ping), Err(MeshError::MalformedMessage(_))));

        let stop = Message::task_stop("boom").encode().unwrap();
        assert!(Message::decode(&stop[..stop.len() - 1]).is_err());
    }

    #[test]
    fn test_access_mode() {
        let mode = AccessMode::READ | AccessMode::EXECUTE;
        assert!(mode.contains(AccessMode::READ));
        assert!(!mode.contains(AccessMode::WRITE));
        assert_eq!(mode.to_string(), "r-x");
        assert_eq!(AccessMode::NONE.to_string(), "---");
    }

    #[test]
    fn test_message_display() {
        assert_eq!(Message::task_stop("").to_string(), "TaskStop(ok)");
        assert_eq!(Message::task_output("abc").to_string(), "TaskOutput(len=3)");
        assert_eq!(MessageKind::TaskFileAccess.to_string(), "TASK_FILEACCESS");
    }
}
