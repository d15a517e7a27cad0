//! Wire vocabulary between coordinator and workers, plus channel naming.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::WorkerId;

/// Well-known channel the coordinator reads SYNs from.
pub const COORDINATOR_CHANNEL: &str = "/temperature-server";
/// Prefix of the per-worker channel carrying coordinator → worker traffic.
pub const SERVER_TO_CLIENT_PREFIX: &str = "/temperature-server-client-";
/// Prefix of the per-worker channel carrying worker → coordinator traffic.
pub const CLIENT_TO_SERVER_PREFIX: &str = "/temperature-client-server-";
/// Pending messages a channel buffers before senders block.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Name of the channel the coordinator writes to and `worker` reads from.
pub fn coordinator_to_worker_channel(worker: WorkerId) -> String {
    format!("{}{}", SERVER_TO_CLIENT_PREFIX, worker)
}

/// Name of the channel `worker` writes its ACK and readings to.
pub fn worker_to_coordinator_channel(worker: WorkerId) -> String {
    format!("{}{}", CLIENT_TO_SERVER_PREFIX, worker)
}

/// All protocol messages. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Worker asks to register.
    Syn { worker_id: WorkerId },
    /// Coordinator accepts a registration and hands out the worker's ordinal.
    SynAck { assigned_index: u32 },
    /// Worker confirms the registration on its dedicated outbound channel.
    Ack { worker_id: WorkerId },
    /// A temperature: the worker's local value, or the coordinator's broadcast estimate.
    Reading { value: f64 },
    /// Coordinator is done; workers stop.
    Done,
}

/// Message kind without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Syn,
    SynAck,
    Ack,
    Reading,
    Done,
}

/// Logical payload slot of a message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload {
    Id(i64),
    Value(f64),
    Empty,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Syn { .. } => MessageKind::Syn,
            Message::SynAck { .. } => MessageKind::SynAck,
            Message::Ack { .. } => MessageKind::Ack,
            Message::Reading { .. } => MessageKind::Reading,
            Message::Done => MessageKind::Done,
        }
    }

    pub fn payload(&self) -> Payload {
        match *self {
            Message::Syn { worker_id } | Message::Ack { worker_id } => Payload::Id(worker_id.0),
            Message::SynAck { assigned_index } => Payload::Id(i64::from(assigned_index)),
            Message::Reading { value } => Payload::Value(value),
            Message::Done => Payload::Empty,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::Syn => "SYN",
            MessageKind::SynAck => "SYN_ACK",
            MessageKind::Ack => "ACK",
            MessageKind::Reading => "READING",
            MessageKind::Done => "DONE",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.payload() {
            Payload::Id(id) => write!(f, "{}: {}", self.kind(), id),
            Payload::Value(v) => write!(f, "{}: {:.4}", self.kind(), v),
            Payload::Empty => write!(f, "{}", self.kind()),
        }
    }
}
