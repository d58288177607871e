//! Reconnect control loop
//!
//! [`Supervisor::run`] walks a [`Lifecycle`] through
//! `Disconnected → Connecting → Open → Draining → Closing → Disconnected`,
//! deciding after every session whether to stop, retry or give up.

mod lifecycle;
mod policy;
mod runner;
mod state;

pub use lifecycle::{ConsumerService, ConsumerSpec, Lifecycle, DEFAULT_DRAIN_TIMEOUT};
pub use policy::{MaxRetries, RetryPolicy, DEFAULT_RETRY_INTERVAL};
pub use runner::{RunExit, Supervisor};
pub use state::LinkState;
