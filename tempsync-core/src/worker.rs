//! Worker state machine: register with the coordinator, then answer every
//! broadcast with an updated local reading until DONE.

use crate::averaging;
use crate::identity::WorkerId;
use crate::protocol::{Message, MessageKind};

/// Seed temperatures per worker class.
pub const DEFAULT_SEED_TABLE: [f64; 4] = [100.0, 22.0, 50.0, 40.0];

/// Seed for `class` in `table`; classes outside the table start at 0.
pub fn seed_for(table: &[f64], class: usize) -> f64 {
    table.get(class).copied().unwrap_or(0.0)
}

/// Where the worker's initial local value comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum SeedSource {
    /// Known up front.
    Fixed(f64),
    /// Looked up in the table by the index the coordinator assigns in SYN_ACK.
    FromAssignedIndex(Vec<f64>),
}

impl SeedSource {
    fn resolve(&self, assigned_index: u32) -> f64 {
        match self {
            SeedSource::Fixed(v) => *v,
            SeedSource::FromAssignedIndex(table) => seed_for(table, assigned_index as usize),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Init,
    Registering,
    AwaitingSynAck,
    Registered,
    Participating,
    Terminated,
}

/// What the host should do after a message was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    /// SYN_ACK received: open the outbound channel, then call [`Worker::acknowledge`].
    Registered { assigned_index: u32, seed: f64 },
    /// Send this message back to the coordinator.
    Reply(Message),
    /// DONE received; stop.
    Finished,
    /// Message of a kind not expected now; discarded.
    Ignored(MessageKind),
}

pub struct Worker {
    id: WorkerId,
    seed: SeedSource,
    phase: WorkerPhase,
    local: Option<f64>,
    assigned_index: Option<u32>,
    rounds: u64,
}

impl Worker {
    pub fn new(id: WorkerId, seed: SeedSource) -> Self {
        let local = match seed {
            SeedSource::Fixed(v) => Some(v),
            SeedSource::FromAssignedIndex(_) => None,
        };
        Self {
            id,
            seed,
            phase: WorkerPhase::Init,
            local,
            assigned_index: None,
            rounds: 0,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn phase(&self) -> WorkerPhase {
        self.phase
    }

    /// Current local estimate; `None` until the seed is known.
    pub fn local(&self) -> Option<f64> {
        self.local
    }

    pub fn assigned_index(&self) -> Option<u32> {
        self.assigned_index
    }

    /// Broadcasts answered so far.
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    pub fn is_terminated(&self) -> bool {
        self.phase == WorkerPhase::Terminated
    }

    /// The SYN announcing this worker. Safe to re-send while waiting for SYN_ACK.
    pub fn syn(&self) -> Message {
        Message::Syn { worker_id: self.id }
    }

    /// Start registering; returns the SYN to send on the coordinator's well-known channel.
    pub fn begin_registration(&mut self) -> Result<Message, WorkerError> {
        self.expect_phase(WorkerPhase::Init)?;
        self.phase = WorkerPhase::Registering;
        Ok(self.syn())
    }

    /// SYN is on its way; wait for SYN_ACK.
    pub fn syn_sent(&mut self) -> Result<(), WorkerError> {
        self.expect_phase(WorkerPhase::Registering)?;
        self.phase = WorkerPhase::AwaitingSynAck;
        Ok(())
    }

    /// Handle a message from the coordinator.
    pub fn on_message(&mut self, msg: Message) -> Result<Reaction, WorkerError> {
        match (self.phase, msg) {
            (WorkerPhase::AwaitingSynAck, Message::SynAck { assigned_index }) => {
                let seed = self.local.unwrap_or_else(|| self.seed.resolve(assigned_index));
                self.local = Some(seed);
                self.assigned_index = Some(assigned_index);
                self.phase = WorkerPhase::Registered;
                Ok(Reaction::Registered {
                    assigned_index,
                    seed,
                })
            }
            (WorkerPhase::Participating, Message::Reading { value }) => {
                let local = self.local.ok_or(WorkerError::MissingSeed)?;
                let next = averaging::local_update(local, value);
                self.local = Some(next);
                self.rounds += 1;
                Ok(Reaction::Reply(Message::Reading { value: next }))
            }
            (WorkerPhase::Participating, Message::Done) => {
                self.phase = WorkerPhase::Terminated;
                Ok(Reaction::Finished)
            }
            (WorkerPhase::AwaitingSynAck | WorkerPhase::Participating, other) => {
                Ok(Reaction::Ignored(other.kind()))
            }
            (phase, other) => Err(WorkerError::WrongPhase {
                phase,
                kind: other.kind(),
            }),
        }
    }

    /// Outbound channel is open: returns the ACK and the first reading, in send order.
    pub fn acknowledge(&mut self) -> Result<[Message; 2], WorkerError> {
        if self.phase != WorkerPhase::Registered {
            return Err(WorkerError::NotRegistered(self.phase));
        }
        let local = self.local.ok_or(WorkerError::MissingSeed)?;
        self.phase = WorkerPhase::Participating;
        Ok([
            Message::Ack { worker_id: self.id },
            Message::Reading { value: local },
        ])
    }

    /// Stop from any phase (interrupt or fatal error).
    pub fn terminate(&mut self) {
        self.phase = WorkerPhase::Terminated;
    }

    fn expect_phase(&self, expected: WorkerPhase) -> Result<(), WorkerError> {
        if self.phase != expected {
            return Err(WorkerError::UnexpectedPhase {
                expected,
                actual: self.phase,
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum WorkerError {
    #[error("{kind} received while {phase:?}")]
    WrongPhase { phase: WorkerPhase, kind: MessageKind },
    #[error("operation needs phase {expected:?}, worker is {actual:?}")]
    UnexpectedPhase {
        expected: WorkerPhase,
        actual: WorkerPhase,
    },
    #[error("cannot acknowledge while {0:?}")]
    NotRegistered(WorkerPhase),
    #[error("local value has no seed")]
    MissingSeed,
}
