//! Transport-facing write side of a connection.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::event::PushEvent;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("sink closed")]
    Closed,

    /// The reader is not keeping up.
    #[error("sink buffer full")]
    Full,

    #[error("write failed: {0}")]
    Write(String),
}

/// Something a connection actor can write events into.
///
/// The actor owns the sink exclusively, so implementations need no
/// internal locking.
#[async_trait]
pub trait EventSink: Send + 'static {
    async fn write(&mut self, event: &PushEvent) -> Result<(), SinkError>;

    /// Release the underlying transport. Called once, after the last write.
    async fn close(&mut self) {}
}

/// Sink that forwards events into a tokio channel.
///
/// The routing layer holds the receiver and turns it into an SSE body or
/// WebSocket frames. Writes never wait: dropping the receiver, or letting
/// `buffer` events pile up unread, makes the next write fail, which
/// unregisters the connection.
#[derive(Debug)]
pub struct ChannelSink {
    tx: Option<mpsc::Sender<PushEvent>>,
}

impl ChannelSink {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PushEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx: Some(tx) }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn write(&mut self, event: &PushEvent) -> Result<(), SinkError> {
        let tx = self.tx.as_ref().ok_or(SinkError::Closed)?;
        tx.try_send(event.clone()).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Full,
            TrySendError::Closed(_) => SinkError::Closed,
        })
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}
