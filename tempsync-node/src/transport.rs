//! Cross-process channels over Unix domain sockets.
//!
//! Each channel name maps to one socket file under the runtime directory. The reader binds it
//! and funnels length-prefixed frames from every connected writer into one bounded queue, so a
//! channel behaves like a named mailbox: many writers, FIFO per writer, back-pressure when full.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use tempsync_core::wire::{self, LEN_SIZE};
use tempsync_core::{encode_frame, Message};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::channel::{ChannelError, ChannelHub, ChannelReceiver, ChannelSender};

/// Socket-backed channel hub rooted at a runtime directory shared by all processes.
#[derive(Clone)]
pub struct SocketHub {
    dir: PathBuf,
    capacity: usize,
    mailboxes: Arc<Mutex<HashMap<String, Weak<Mailbox>>>>,
}

impl SocketHub {
    pub fn new(dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            dir: dir.into(),
            capacity: capacity.max(1),
            mailboxes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[cfg(test)]
    pub fn with_default_capacity(dir: impl Into<PathBuf>) -> Self {
        Self::new(dir, tempsync_core::DEFAULT_QUEUE_CAPACITY)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Socket file backing `name`: `/temperature-server` → `<dir>/temperature-server.sock`.
    pub fn socket_path(&self, name: &str) -> PathBuf {
        let file = name.trim_start_matches('/').replace('/', "_");
        self.dir.join(format!("{}.sock", file))
    }

    fn live_mailbox(&self, name: &str) -> Option<Arc<Mailbox>> {
        self.mailboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .and_then(Weak::upgrade)
    }

    async fn bind(&self, name: &str) -> Result<Arc<Mailbox>, ChannelError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ChannelError::io(name, e))?;
        let path = self.socket_path(name);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            if UnixStream::connect(&path).await.is_ok() {
                return Err(ChannelError::InUse(name.to_string()));
            }
            debug!(path = %path.display(), "removing stale socket");
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| ChannelError::io(name, e))?;
        }
        let listener = UnixListener::bind(&path).map_err(|e| ChannelError::io(name, e))?;
        let (tx, rx) = mpsc::channel(self.capacity);
        let accept = tokio::spawn(accept_loop(listener, tx, name.to_string()));
        Ok(Arc::new(Mailbox {
            path,
            rx: tokio::sync::Mutex::new(rx),
            accept,
        }))
    }
}

/// Bound socket plus the queue its connections feed. Unbinds when the last reader handle drops.
struct Mailbox {
    path: PathBuf,
    rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    accept: JoinHandle<()>,
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.accept.abort();
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove socket");
            }
        }
    }
}

async fn accept_loop(listener: UnixListener, tx: mpsc::Sender<Message>, name: String) {
    // Dropping the set (task abort) stops every connection reader.
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    conns.spawn(forward_frames(stream, tx.clone(), name.clone()));
                }
                Err(e) => {
                    warn!(channel = %name, error = %e, "accept failed");
                    break;
                }
            },
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
        }
    }
}

/// Read frames from one writer until EOF and push them into the mailbox queue.
async fn forward_frames(mut stream: UnixStream, tx: mpsc::Sender<Message>, name: String) {
    loop {
        let mut len_buf = [0u8; LEN_SIZE];
        if stream.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = match wire::frame_len(len_buf) {
            Ok(len) => len,
            Err(e) => {
                warn!(channel = %name, error = %e, "dropping writer");
                break;
            }
        };
        let mut payload = vec![0u8; len];
        if stream.read_exact(&mut payload).await.is_err() {
            break;
        }
        let msg = match wire::decode_payload(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(channel = %name, error = %e, "discarding undecodable frame");
                continue;
            }
        };
        if tx.send(msg).await.is_err() {
            break;
        }
    }
}

#[async_trait]
impl ChannelHub for SocketHub {
    type Sender = SocketSender;
    type Receiver = SocketReceiver;

    async fn open_read(&self, name: &str) -> Result<SocketReceiver, ChannelError> {
        let mailbox = match self.live_mailbox(name) {
            Some(m) => m,
            None => {
                let m = self.bind(name).await?;
                self.mailboxes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(name.to_string(), Arc::downgrade(&m));
                m
            }
        };
        Ok(SocketReceiver {
            name: name.to_string(),
            mailbox: Some(mailbox),
        })
    }

    async fn open_write(&self, name: &str) -> Result<SocketSender, ChannelError> {
        let path = self.socket_path(name);
        let stream = UnixStream::connect(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                ChannelError::NotFound(name.to_string())
            }
            _ => ChannelError::io(name, e),
        })?;
        Ok(SocketSender {
            name: name.to_string(),
            stream: Some(stream),
        })
    }
}

pub struct SocketSender {
    name: String,
    stream: Option<UnixStream>,
}

#[async_trait]
impl ChannelSender for SocketSender {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&mut self, msg: &Message) -> Result<(), ChannelError> {
        let frame = encode_frame(msg).map_err(|source| ChannelError::Encode {
            name: self.name.clone(),
            source,
        })?;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ChannelError::Closed(self.name.clone()))?;
        let written = async {
            stream.write_all(&frame).await?;
            stream.flush().await
        }
        .await;
        written.map_err(|e| match e.kind() {
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => {
                ChannelError::Closed(self.name.clone())
            }
            _ => ChannelError::io(&self.name, e),
        })
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

pub struct SocketReceiver {
    name: String,
    mailbox: Option<Arc<Mailbox>>,
}

#[async_trait]
impl ChannelReceiver for SocketReceiver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&mut self) -> Result<Message, ChannelError> {
        let mailbox = self
            .mailbox
            .as_ref()
            .ok_or_else(|| ChannelError::Closed(self.name.clone()))?;
        let mut rx = mailbox.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| ChannelError::Closed(self.name.clone()))
    }

    fn try_recv(&mut self) -> Result<Option<Message>, ChannelError> {
        let mailbox = self
            .mailbox
            .as_ref()
            .ok_or_else(|| ChannelError::Closed(self.name.clone()))?;
        let Ok(mut rx) = mailbox.rx.try_lock() else {
            return Ok(None);
        };
        match rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ChannelError::Closed(self.name.clone())),
        }
    }

    fn close(&mut self) {
        self.mailbox = None;
    }
}
