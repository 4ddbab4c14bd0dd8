//! Connection registry and event fan-out.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use basket_core::{system_clock, ConnectionId, DeliveryError, SharedClock};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::connection::{ConnectionActor, ConnectionHandle, ConnectionInfo, Delivery, Transport};
use crate::event::PushEvent;
use crate::sink::EventSink;

/// Events waiting for one connection's actor before it counts as stalled.
pub const DEFAULT_COMMAND_BUFFER: usize = 64;

/// How long a targeted notify waits for the sink write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-connection bounds. A connection that exceeds either is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusLimits {
    pub command_buffer: usize,
    pub write_timeout: Duration,
}

impl Default for BusLimits {
    fn default() -> Self {
        Self {
            command_buffer: DEFAULT_COMMAND_BUFFER,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct BusMetrics {
    pub registered: AtomicU64,
    pub unregistered: AtomicU64,
    /// Successful sink writes
    pub delivered: AtomicU64,
    /// Failed sink writes; each one also closes its connection
    pub dropped: AtomicU64,
}

impl BusMetrics {
    pub fn snapshot(&self) -> BusSnapshot {
        BusSnapshot {
            registered: self.registered.load(Ordering::Relaxed),
            unregistered: self.unregistered.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusSnapshot {
    pub registered: u64,
    pub unregistered: u64,
    pub delivered: u64,
    pub dropped: u64,
}

/// Live connections, in total and per transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStats {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
}

// ============================================================================
// REGISTRY
// ============================================================================

pub(crate) struct Registry {
    connections: DashMap<ConnectionId, ConnectionHandle>,
    next_generation: AtomicU64,
    metrics: Arc<BusMetrics>,
    limits: BusLimits,
    clock: SharedClock,
}

impl Registry {
    /// Remove `id` only if it still belongs to the registration `generation`,
    /// and close it.
    pub(crate) fn remove_generation(&self, id: &str, generation: u64, cause: &str) -> bool {
        match self
            .connections
            .remove_if(id, |_, handle| handle.generation == generation)
        {
            Some((_, handle)) => {
                handle.close();
                self.metrics.unregistered.fetch_add(1, Ordering::Relaxed);
                tracing::info!(connection_id = %id, cause, "Connection unregistered");
                true
            }
            None => false,
        }
    }

    /// Drop a connection that stopped keeping up.
    fn drop_stalled(&self, id: &str, generation: u64, cause: &str) {
        self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(connection_id = %id, cause, "Connection stalled, closing");
        self.remove_generation(id, generation, cause);
    }
}

/// Process-wide registry of client connections.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct NotificationBus {
    registry: Arc<Registry>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(system_clock())
    }
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("connections", &self.registry.connections.len())
            .finish()
    }
}

impl NotificationBus {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_limits(clock, BusLimits::default())
    }

    pub fn with_limits(clock: SharedClock, limits: BusLimits) -> Self {
        Self {
            registry: Arc::new(Registry {
                connections: DashMap::new(),
                next_generation: AtomicU64::new(0),
                metrics: Arc::new(BusMetrics::default()),
                limits,
                clock,
            }),
        }
    }

    pub fn limits(&self) -> BusLimits {
        self.registry.limits
    }

    /// Register `sink` under `id` and start its actor.
    ///
    /// An existing connection with the same id is replaced and closed.
    /// Must be called from within a tokio runtime.
    pub fn register_connection(
        &self,
        id: impl Into<ConnectionId>,
        sink: impl EventSink,
        transport: Transport,
    ) -> ConnectionInfo {
        let id = id.into();
        let generation = self.registry.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.registry.limits.command_buffer.max(1));
        let closer = Arc::new(Notify::new());
        let info = ConnectionInfo {
            id: id.clone(),
            transport,
            created_at: self.registry.clock.now(),
        };

        let handle = ConnectionHandle {
            info: info.clone(),
            generation,
            tx,
            closer: Arc::clone(&closer),
        };
        if let Some(previous) = self.registry.connections.insert(id.clone(), handle) {
            previous.close();
            tracing::debug!(connection_id = %id, "Replaced existing connection");
        }

        tokio::spawn(
            ConnectionActor {
                id: id.clone(),
                generation,
                sink: Box::new(sink),
                rx,
                closer,
                registry: Arc::downgrade(&self.registry),
                metrics: Arc::clone(&self.registry.metrics),
            }
            .run(),
        );

        self.registry.metrics.registered.fetch_add(1, Ordering::Relaxed);
        tracing::info!(connection_id = %id, transport = %transport, "Connection registered");
        info
    }

    /// Remove `id` and close its sink. Returns whether it was registered.
    pub fn unregister(&self, id: &str) -> bool {
        match self.registry.connections.remove(id) {
            Some((_, handle)) => {
                handle.close();
                self.registry.metrics.unregistered.fetch_add(1, Ordering::Relaxed);
                tracing::info!(connection_id = %id, "Connection unregistered");
                true
            }
            None => false,
        }
    }

    /// Deliver `event` to `target`, or to every connection when `target` is
    /// `None`.
    ///
    /// A targeted send waits for that single write, at most
    /// [`BusLimits::write_timeout`], and reports its outcome. A broadcast
    /// only hands the event to each connection and returns how many
    /// accepted it; failures there surface as unregistrations. Either way a
    /// connection whose queue is full or whose write times out is dropped.
    pub async fn notify(&self, event: PushEvent, target: Option<&str>) -> Result<usize, DeliveryError> {
        let event = Arc::new(event);
        match target {
            Some(id) => self.send_to(id, event).await.map(|()| 1),
            None => Ok(self.broadcast(event)),
        }
    }

    async fn send_to(&self, id: &str, event: Arc<PushEvent>) -> Result<(), DeliveryError> {
        // Clone the sender out so no map guard is held across the await.
        let (tx, generation) = self
            .registry
            .connections
            .get(id)
            .map(|handle| (handle.tx.clone(), handle.generation))
            .ok_or_else(|| DeliveryError::ConnectionNotFound {
                connection_id: id.to_string(),
            })?;

        let failed = |reason: &str| DeliveryError::WriteFailed {
            connection_id: id.to_string(),
            reason: reason.to_string(),
        };
        let closed = || DeliveryError::ConnectionClosed {
            connection_id: id.to_string(),
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        match tx.try_send(Delivery {
            event,
            ack: Some(ack_tx),
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.registry.drop_stalled(id, generation, "queue full");
                return Err(failed("queue full"));
            }
            Err(TrySendError::Closed(_)) => return Err(closed()),
        }

        match tokio::time::timeout(self.registry.limits.write_timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(failed(&e.to_string())),
            Ok(Err(_)) => Err(closed()),
            Err(_) => {
                self.registry.drop_stalled(id, generation, "write timed out");
                Err(failed("write timed out"))
            }
        }
    }

    fn broadcast(&self, event: Arc<PushEvent>) -> usize {
        let targets: Vec<_> = self
            .registry
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.generation, entry.tx.clone()))
            .collect();

        let mut accepted = 0;
        for (id, generation, tx) in targets {
            let delivery = Delivery {
                event: Arc::clone(&event),
                ack: None,
            };
            match tx.try_send(delivery) {
                Ok(()) => accepted += 1,
                Err(TrySendError::Full(_)) => self.registry.drop_stalled(&id, generation, "queue full"),
                Err(TrySendError::Closed(_)) => {}
            }
        }
        tracing::debug!(event = %event.name, receivers = accepted, "Broadcast event");
        accepted
    }

    /// Close every connection. Used on shutdown.
    pub fn close_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self
            .registry
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.iter().filter(|id| self.unregister(id)).count()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.registry.connections.contains_key(id)
    }

    pub fn connection(&self, id: &str) -> Option<ConnectionInfo> {
        self.registry
            .connections
            .get(id)
            .map(|handle| handle.info.clone())
    }

    pub fn len(&self) -> usize {
        self.registry.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.connections.is_empty()
    }

    pub fn stats(&self) -> BusStats {
        let mut by_type = BTreeMap::new();
        for entry in self.registry.connections.iter() {
            *by_type
                .entry(entry.info.transport.as_str().to_string())
                .or_insert(0) += 1;
        }
        BusStats {
            total: by_type.values().sum(),
            by_type,
        }
    }

    pub fn metrics(&self) -> BusSnapshot {
        self.registry.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{ChannelSink, SinkError};
    use std::time::Duration;
    use async_trait::async_trait;

    struct BrokenPipe;

    #[async_trait]
    impl EventSink for BrokenPipe {
        async fn write(&mut self, _event: &PushEvent) -> Result<(), SinkError> {
            Err(SinkError::Write("broken pipe".into()))
        }
    }

    /// Transport that accepts a write and never finishes it.
    struct Stalled;

    #[async_trait]
    impl EventSink for Stalled {
        async fn write(&mut self, _event: &PushEvent) -> Result<(), SinkError> {
            std::future::pending().await
        }
    }

    fn event(name: &str) -> PushEvent {
        PushEvent::new(name, serde_json::json!({"n": name}))
    }

    async fn wait_until_gone(bus: &NotificationBus, id: &str) {
        for _ in 0..100 {
            if !bus.contains(id) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("connection {id} was never removed");
    }

    #[tokio::test]
    async fn test_targeted_notify_reaches_only_target() {
        let bus = NotificationBus::default();
        let (a, mut rx_a) = ChannelSink::new(8);
        let (b, mut rx_b) = ChannelSink::new(8);
        bus.register_connection("a", a, Transport::Stream);
        bus.register_connection("b", b, Transport::Socket);

        assert_eq!(bus.notify(event("hello"), Some("a")).await, Ok(1));
        assert_eq!(rx_a.recv().await.unwrap().name, "hello");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone() {
        let bus = NotificationBus::default();
        let (a, mut rx_a) = ChannelSink::new(8);
        let (b, mut rx_b) = ChannelSink::new(8);
        bus.register_connection("a", a, Transport::Stream);
        bus.register_connection("b", b, Transport::Stream);

        assert_eq!(bus.notify(event("all"), None).await, Ok(2));
        assert_eq!(rx_a.recv().await.unwrap().name, "all");
        assert_eq!(rx_b.recv().await.unwrap().name, "all");
    }

    #[tokio::test]
    async fn test_unknown_target_is_not_found() {
        let bus = NotificationBus::default();
        assert_eq!(
            bus.notify(event("x"), Some("ghost")).await,
            Err(DeliveryError::ConnectionNotFound {
                connection_id: "ghost".into()
            })
        );
    }

    #[tokio::test]
    async fn test_failed_targeted_write_unregisters() {
        let bus = NotificationBus::default();
        bus.register_connection("dead", BrokenPipe, Transport::Socket);

        let err = bus.notify(event("x"), Some("dead")).await.unwrap_err();
        assert!(matches!(err, DeliveryError::WriteFailed { .. }));
        wait_until_gone(&bus, "dead").await;
        assert_eq!(bus.metrics().dropped, 1);
        assert_eq!(bus.metrics().unregistered, 1);
    }

    #[tokio::test]
    async fn test_failed_broadcast_write_only_drops_that_connection() {
        let bus = NotificationBus::default();
        let (ok, mut rx) = ChannelSink::new(8);
        bus.register_connection("ok", ok, Transport::Stream);
        bus.register_connection("dead", BrokenPipe, Transport::Socket);

        assert_eq!(bus.notify(event("all"), None).await, Ok(2));
        assert_eq!(rx.recv().await.unwrap().name, "all");
        wait_until_gone(&bus, "dead").await;
        assert!(bus.contains("ok"));
    }

    #[tokio::test]
    async fn test_dropped_receiver_unregisters_on_next_write() {
        let bus = NotificationBus::default();
        let (sink, rx) = ChannelSink::new(8);
        bus.register_connection("gone", sink, Transport::Stream);
        drop(rx);

        assert!(bus.notify(event("x"), Some("gone")).await.is_err());
        wait_until_gone(&bus, "gone").await;
    }

    #[tokio::test]
    async fn test_unregister_closes_sink() {
        let bus = NotificationBus::default();
        let (sink, mut rx) = ChannelSink::new(8);
        bus.register_connection("a", sink, Transport::Stream);

        assert!(bus.unregister("a"));
        assert!(!bus.unregister("a"));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_reregister_replaces_and_closes_previous() {
        let bus = NotificationBus::default();
        let (old, mut old_rx) = ChannelSink::new(8);
        let (new, mut new_rx) = ChannelSink::new(8);
        bus.register_connection("a", old, Transport::Stream);
        bus.register_connection("a", new, Transport::Socket);

        assert_eq!(old_rx.recv().await, None);
        assert_eq!(bus.len(), 1);
        assert_eq!(bus.connection("a").unwrap().transport, Transport::Socket);

        bus.notify(event("x"), Some("a")).await.unwrap();
        assert_eq!(new_rx.recv().await.unwrap().name, "x");
    }

    #[tokio::test]
    async fn test_stale_generation_cannot_remove_new_registration() {
        let bus = NotificationBus::default();
        let (first, _rx1) = ChannelSink::new(8);
        let (second, _rx2) = ChannelSink::new(8);
        bus.register_connection("a", first, Transport::Stream);
        bus.register_connection("a", second, Transport::Stream);

        assert!(!bus.registry.remove_generation("a", 0, "test"));
        assert!(bus.contains("a"));
        assert!(bus.registry.remove_generation("a", 1, "test"));
        assert!(!bus.contains("a"));
    }

    #[tokio::test]
    async fn test_stats_by_transport() {
        let bus = NotificationBus::default();
        for (id, transport) in [
            ("a", Transport::Stream),
            ("b", Transport::Stream),
            ("c", Transport::Socket),
        ] {
            let (sink, _rx) = ChannelSink::new(1);
            bus.register_connection(id, sink, transport);
        }

        let stats = bus.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_type.get("stream"), Some(&2));
        assert_eq!(stats.by_type.get("socket"), Some(&1));

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["byType"]["stream"], 2);
        assert_eq!(bus.close_all(), 3);
        assert!(bus.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unread_channel_does_not_block_targeted_notify() {
        let bus = NotificationBus::default();
        let (sink, _rx) = ChannelSink::new(1);
        bus.register_connection("idle", sink, Transport::Stream);

        assert_eq!(bus.notify(event("first"), Some("idle")).await, Ok(1));

        let second = tokio::time::timeout(
            Duration::from_secs(2),
            bus.notify(event("second"), Some("idle")),
        )
        .await
        .expect("notify returns while the reader is idle");
        assert!(matches!(second, Err(DeliveryError::WriteFailed { .. })));
        wait_until_gone(&bus, "idle").await;
        assert_eq!(bus.metrics().dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_times_out_and_unregisters() {
        let limits = BusLimits {
            write_timeout: Duration::from_millis(200),
            ..BusLimits::default()
        };
        let bus = NotificationBus::with_limits(system_clock(), limits);
        bus.register_connection("slow", Stalled, Transport::Socket);

        let started = tokio::time::Instant::now();
        let err = bus.notify(event("x"), Some("slow")).await.unwrap_err();

        assert_eq!(
            err,
            DeliveryError::WriteFailed {
                connection_id: "slow".into(),
                reason: "write timed out".into(),
            }
        );
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!bus.contains("slow"));
        assert_eq!(bus.metrics().dropped, 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_connection_on_broadcast() {
        let limits = BusLimits {
            command_buffer: 2,
            ..BusLimits::default()
        };
        let bus = NotificationBus::with_limits(system_clock(), limits);
        let (ok, mut rx) = ChannelSink::new(64);
        bus.register_connection("ok", ok, Transport::Stream);
        bus.register_connection("slow", Stalled, Transport::Socket);

        for n in 0..8 {
            bus.notify(event(&format!("e{n}")), None).await.unwrap();
            rx.recv().await.unwrap();
        }

        wait_until_gone(&bus, "slow").await;
        assert!(bus.contains("ok"));
        assert_eq!(bus.metrics().dropped, 1);
        assert_eq!(bus.notify(event("after"), None).await, Ok(1));
    }
}
