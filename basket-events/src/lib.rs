//! BASKET Events - Push Notifications
//!
//! Registry of live client connections and best-effort delivery of named
//! events to one connection or to all of them.
//!
//! # Architecture
//!
//! Every registered connection runs as a small actor task that owns its
//! [`EventSink`]. The bus only holds a bounded command channel per
//! connection id. When a write fails the actor closes its sink and removes
//! its own entry, so a broken pipe never lingers in the registry. A
//! connection whose queue fills up, or whose targeted write outlasts
//! [`BusLimits::write_timeout`], is dropped the same way; notifying never
//! blocks on a slow reader.
//!
//! ```text
//! notify(event, Some(id)) ──▶ actor(id) ──▶ sink.write ──▶ ack
//! notify(event, None)     ──▶ actor(*)  ──▶ sink.write      (fire-and-forget)
//! ```
//!
//! Nothing is queued for a connection that is not registered, and nothing
//! survives a process restart.

mod bus;
mod connection;
mod event;
mod sink;

pub use bus::{
    BusLimits, BusMetrics, BusSnapshot, BusStats, NotificationBus, DEFAULT_COMMAND_BUFFER,
    DEFAULT_WRITE_TIMEOUT,
};
pub use connection::{ConnectionInfo, Transport};
pub use event::{PushEvent, SearchUpdate, SEARCH_UPDATED_EVENT};
pub use sink::{ChannelSink, EventSink, SinkError};
