//! In-process channels: a registry of bounded queues keyed by name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tempsync_core::{Message, DEFAULT_QUEUE_CAPACITY};
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::channel::{ChannelError, ChannelHub, ChannelReceiver, ChannelSender};

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>;

struct Queue {
    tx: mpsc::Sender<Message>,
    rx: SharedReceiver,
}

/// Channel hub for roles running as tasks of one process. Clones share the registry,
/// and a queue lives as long as the hub, like a named message queue.
#[derive(Clone)]
pub struct MemoryHub {
    queues: Arc<Mutex<HashMap<String, Queue>>>,
    capacity: usize,
}

impl MemoryHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[async_trait]
impl ChannelHub for MemoryHub {
    type Sender = MemorySender;
    type Receiver = MemoryReceiver;

    async fn open_read(&self, name: &str) -> Result<MemoryReceiver, ChannelError> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = queues.entry(name.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.capacity);
            Queue {
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            }
        });
        Ok(MemoryReceiver {
            name: name.to_string(),
            rx: Some(queue.rx.clone()),
        })
    }

    async fn open_write(&self, name: &str) -> Result<MemorySender, ChannelError> {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = queues
            .get(name)
            .ok_or_else(|| ChannelError::NotFound(name.to_string()))?;
        Ok(MemorySender {
            name: name.to_string(),
            tx: Some(queue.tx.clone()),
        })
    }
}

pub struct MemorySender {
    name: String,
    tx: Option<mpsc::Sender<Message>>,
}

#[async_trait]
impl ChannelSender for MemorySender {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&mut self, msg: &Message) -> Result<(), ChannelError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| ChannelError::Closed(self.name.clone()))?;
        tx.send(*msg)
            .await
            .map_err(|_| ChannelError::Closed(self.name.clone()))
    }

    fn close(&mut self) {
        self.tx = None;
    }
}

pub struct MemoryReceiver {
    name: String,
    rx: Option<SharedReceiver>,
}

#[async_trait]
impl ChannelReceiver for MemoryReceiver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&mut self) -> Result<Message, ChannelError> {
        let rx = self
            .rx
            .as_ref()
            .ok_or_else(|| ChannelError::Closed(self.name.clone()))?;
        let mut rx = rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| ChannelError::Closed(self.name.clone()))
    }

    fn try_recv(&mut self) -> Result<Option<Message>, ChannelError> {
        let rx = self
            .rx
            .as_ref()
            .ok_or_else(|| ChannelError::Closed(self.name.clone()))?;
        // Another handle blocked in recv owns the queue for now.
        let Ok(mut rx) = rx.try_lock() else {
            return Ok(None);
        };
        match rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ChannelError::Closed(self.name.clone())),
        }
    }

    fn close(&mut self) {
        self.rx = None;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempsync_core::WorkerId;

    use super::*;

    #[tokio::test]
    async fn fifo_per_channel() {
        let hub = MemoryHub::default();
        let mut rx = hub.open_read("/q").await.unwrap();
        let mut tx = hub.open_write("/q").await.unwrap();
        for i in 0..5 {
            tx.send(&Message::Syn { worker_id: WorkerId(i) }).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap(), Message::Syn { worker_id: WorkerId(i) });
        }
        assert_eq!(rx.try_recv().unwrap(), None);
    }

    #[tokio::test]
    async fn write_open_needs_existing_channel() {
        let hub = MemoryHub::default();
        assert!(matches!(
            hub.open_write("/missing").await,
            Err(ChannelError::NotFound(n)) if n == "/missing"
        ));
    }

    #[tokio::test]
    async fn read_open_is_idempotent() {
        let hub = MemoryHub::default();
        let mut first = hub.open_read("/q").await.unwrap();
        let mut second = hub.open_read("/q").await.unwrap();
        let mut tx = hub.open_write("/q").await.unwrap();
        tx.send(&Message::Done).await.unwrap();
        tx.send(&Message::Reading { value: 1.0 }).await.unwrap();
        assert_eq!(second.recv().await.unwrap(), Message::Done);
        assert_eq!(first.recv().await.unwrap(), Message::Reading { value: 1.0 });
    }

    #[tokio::test]
    async fn try_recv_yields_while_another_handle_waits() {
        let hub = MemoryHub::default();
        let mut waiting = hub.open_read("/q").await.unwrap();
        let mut polling = hub.open_read("/q").await.unwrap();
        let waiter = tokio::spawn(async move { waiting.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(polling.try_recv().unwrap(), None);
        let mut tx = hub.open_write("/q").await.unwrap();
        tx.send(&Message::Done).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), Message::Done);
        assert_eq!(polling.try_recv().unwrap(), None);
    }

    #[tokio::test]
    async fn full_queue_blocks_sender() {
        let hub = MemoryHub::new(2);
        let mut rx = hub.open_read("/q").await.unwrap();
        let mut tx = hub.open_write("/q").await.unwrap();
        tx.send(&Message::Done).await.unwrap();
        tx.send(&Message::Done).await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), tx.send(&Message::Done)).await;
        assert!(blocked.is_err(), "third send should wait for room");
        rx.recv().await.unwrap();
        tx.send(&Message::Done).await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let hub = MemoryHub::default();
        let mut rx = hub.open_read("/q").await.unwrap();
        let mut tx = hub.open_write("/q").await.unwrap();
        rx.close();
        rx.close();
        tx.close();
        tx.close();
        assert!(matches!(rx.recv().await, Err(ChannelError::Closed(_))));
        assert!(matches!(tx.send(&Message::Done).await, Err(ChannelError::Closed(_))));
        // The queue itself outlives its handles.
        assert!(hub.open_write("/q").await.is_ok());
    }
}
