//! Host firewall monitor core.
//!
//! Packets arrive on kernel queues ([`source`]), are wrapped as [`packet::PacketRecord`]s and
//! dispatched to policy callbacks by the [`observer::QueueObserver`], one thread per queue.
//! Callbacks hand events to the [`sink::EventSink`] through the sharded
//! [`queue::EventQueueManager`], and the sink appends them to the event log.

pub mod error;
pub mod identity;
pub mod observer;
pub mod packet;
pub mod queue;
pub mod sink;
pub mod source;
pub mod stats;

pub use error::{ConfigurationError, FirewallError, PacketError, SinkError};
pub use observer::{create_observer, PacketCallback, QueueObserver, Subscription};
pub use packet::{PacketRecord, Protocol, Verdict};
pub use queue::EventQueueManager;
pub use sink::{EventEmitter, EventSink, SinkMessage, SinkOptions};
