//! Per-connection actor.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use basket_core::{ConnectionId, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Notify};

use crate::bus::{BusMetrics, Registry};
use crate::event::PushEvent;
use crate::sink::{EventSink, SinkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Server-sent events
    Stream,
    /// WebSocket
    Socket,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Stream => "stream",
            Transport::Socket => "socket",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub transport: Transport,
    pub created_at: Timestamp,
}

pub(crate) type Ack = oneshot::Sender<Result<(), SinkError>>;

pub(crate) struct Delivery {
    pub event: Arc<PushEvent>,
    pub ack: Option<Ack>,
}

/// Registry-side handle. Cloning it only clones the command sender.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    pub info: ConnectionInfo,
    /// Distinguishes this registration from a later one under the same id.
    pub generation: u64,
    pub tx: mpsc::Sender<Delivery>,
    pub closer: Arc<Notify>,
}

impl ConnectionHandle {
    /// Ask the actor to close its sink, interrupting a write in progress.
    /// A no-op if it already stopped.
    pub fn close(&self) {
        self.closer.notify_one();
    }
}

pub(crate) struct ConnectionActor {
    pub id: ConnectionId,
    pub generation: u64,
    pub sink: Box<dyn EventSink>,
    pub rx: mpsc::Receiver<Delivery>,
    pub closer: Arc<Notify>,
    pub registry: Weak<Registry>,
    pub metrics: Arc<BusMetrics>,
}

impl ConnectionActor {
    pub async fn run(mut self) {
        let mut failed = false;

        loop {
            let delivery = tokio::select! {
                biased;
                _ = self.closer.notified() => break,
                next = self.rx.recv() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let result = tokio::select! {
                biased;
                _ = self.closer.notified() => {
                    if let Some(ack) = delivery.ack {
                        let _ = ack.send(Err(SinkError::Closed));
                    }
                    break;
                }
                result = self.sink.write(&delivery.event) => result,
            };

            match &result {
                Ok(()) => {
                    self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        connection_id = %self.id,
                        event = %delivery.event.name,
                        error = %e,
                        "Failed to deliver event, closing connection"
                    );
                    failed = true;
                }
            }
            if let Some(ack) = delivery.ack {
                let _ = ack.send(result);
            }
            if failed {
                break;
            }
        }

        // Later deliveries are refused; their acks resolve as closed.
        self.rx.close();
        self.sink.close().await;

        if failed {
            if let Some(registry) = self.registry.upgrade() {
                registry.remove_generation(&self.id, self.generation, "failed write");
            }
        }
        tracing::debug!(connection_id = %self.id, failed, "Connection actor stopped");
    }
}
