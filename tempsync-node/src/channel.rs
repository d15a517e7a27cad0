//! Named, directional, FIFO channels between coordinator and workers.

use async_trait::async_trait;
use tempsync_core::{FrameEncodeError, Message};

/// Opens named channels. Read-only opens create the channel and are idempotent
/// within one hub (and its clones): opening the same name again yields another
/// handle on the same queue. A hub that does not own the channel may get
/// [`ChannelError::InUse`] instead, e.g. a second process on the same socket directory.
/// Write-only opens fail with [`ChannelError::NotFound`] until a reader created the channel.
#[async_trait]
pub trait ChannelHub: Send + Sync {
    type Sender: ChannelSender + 'static;
    type Receiver: ChannelReceiver + 'static;

    async fn open_read(&self, name: &str) -> Result<Self::Receiver, ChannelError>;

    async fn open_write(&self, name: &str) -> Result<Self::Sender, ChannelError>;
}

/// Write end. `send` waits while the queue is full.
#[async_trait]
pub trait ChannelSender: Send {
    fn name(&self) -> &str;

    async fn send(&mut self, msg: &Message) -> Result<(), ChannelError>;

    /// Release the handle. Closing twice is a no-op; dropping the handle closes it too.
    fn close(&mut self);
}

/// Read end. `recv` waits until a message arrives or the channel fails.
#[async_trait]
pub trait ChannelReceiver: Send {
    fn name(&self) -> &str;

    async fn recv(&mut self) -> Result<Message, ChannelError>;

    /// Non-blocking receive: `Ok(None)` means nothing could be taken right now. That is
    /// either an empty queue or another handle on the same queue blocked in `recv`,
    /// which masks messages that are already pending.
    fn try_recv(&mut self) -> Result<Option<Message>, ChannelError>;

    /// Release the handle. Closing twice is a no-op; dropping the handle closes it too.
    fn close(&mut self);
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {0} does not exist")]
    NotFound(String),
    #[error("channel {0} is owned by another process")]
    InUse(String),
    #[error("channel {0} is closed")]
    Closed(String),
    #[error("channel {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("channel {name}: {source}")]
    Encode {
        name: String,
        #[source]
        source: FrameEncodeError,
    },
}

impl ChannelError {
    pub(crate) fn io(name: &str, source: std::io::Error) -> Self {
        ChannelError::Io {
            name: name.to_string(),
            source,
        }
    }
}
