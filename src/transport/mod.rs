//! Transport implementations
//!
//! The memory transport is always available (brokerless). The AMQP transport
//! needs the `transport-lapin` feature.

#[cfg(feature = "transport-lapin")]
mod amqp;
mod memory;

#[cfg(feature = "transport-lapin")]
pub use amqp::{LapinChannel, LapinConnection, LapinDriver};
pub use memory::{BrokerStats, MemoryBroker, MemoryChannel, MemoryConnection};
