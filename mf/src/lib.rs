//! msgfabric - the message fabric shared by agent daemons
//!
//! Two transports coexist: best-effort pub/sub channels for low-latency
//! wake-ups, and durable consumer-group streams for at-least-once delivery.
//! On top of the same broker live the per-agent work queues with atomic
//! claim/ack/recover semantics.
//!
//! The [`Broker`] trait is the seam to the real broker; [`MemoryBroker`]
//! implements it in-process for tests and single-node development.

pub mod broker;
pub mod channels;
pub mod error;
pub mod memory;
pub mod queue;
pub mod stream;

pub use broker::{Broker, StreamEntry, Subscription};
pub use error::FabricError;
pub use memory::MemoryBroker;
pub use queue::{Claimed, TaskQueue};
pub use stream::StreamConsumer;
