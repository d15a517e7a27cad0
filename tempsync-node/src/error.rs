use tempsync_core::{CoordinatorError, MessageKind, WorkerError, WorkerId};

use crate::channel::ChannelError;

/// Failure of a coordinator or worker run. All of these end the process with a non-zero status.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("channel setup failed: {0}")]
    Setup(#[source] ChannelError),
    #[error("send failed: {0}")]
    Send(#[source] ChannelError),
    #[error("receive failed: {0}")]
    Receive(#[source] ChannelError),
    #[error("no {waiting_for} after {attempts} attempts")]
    HandshakeTimeout {
        waiting_for: MessageKind,
        attempts: u32,
    },
    #[error("round {round} timed out waiting for workers {missing:?}")]
    RoundTimeout { round: u64, missing: Vec<WorkerId> },
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl NodeError {
    /// True for failures of the channel layer itself (setup, send, receive).
    pub fn is_fatal_channel(&self) -> bool {
        matches!(
            self,
            NodeError::Setup(_) | NodeError::Send(_) | NodeError::Receive(_)
        )
    }
}
