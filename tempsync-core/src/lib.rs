//! Temperature-averaging coordination protocol.
//! Host-driven: no I/O; host passes received messages in and sends the messages it gets back.

pub mod averaging;
pub mod coordinator;
pub mod identity;
pub mod protocol;
pub mod wire;
pub mod worker;

pub use coordinator::{
    Coordinator, CoordinatorError, CoordinatorParams, CoordinatorPhase, CoordinatorReport,
    RoundOutcome, WorkerRecord,
};
pub use identity::WorkerId;
pub use protocol::{
    coordinator_to_worker_channel, worker_to_coordinator_channel, Message, MessageKind, Payload,
    COORDINATOR_CHANNEL, DEFAULT_QUEUE_CAPACITY,
};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
pub use worker::{Reaction, SeedSource, Worker, WorkerError, WorkerPhase};
