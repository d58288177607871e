//! Session lifecycle driven by the reconnect loop

use crate::client::ConnectionParameters;
use crate::connection::{BrokerConnection, ConsumeOptions, Driver, Handler};
use crate::{Error, ErrorKind, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Default wait for the first event in each drain call
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// One broker session, as seen by the reconnect loop.
///
/// The loop calls `connect`, then `register`, then `drain` repeatedly until it
/// fails, and finally `close` exactly once per session.
#[async_trait]
pub trait Lifecycle: Send {
    /// Open a fresh connection
    async fn connect(&mut self) -> Result<()>;

    /// Register every handler on the open connection
    async fn register(&mut self) -> Result<()>;

    /// Process one batch of events.
    ///
    /// Runs to completion; the loop checks for shutdown between calls, so an
    /// idle drain should wait or yield rather than return at once.
    async fn drain(&mut self) -> Result<()>;

    /// Tear the session down (best effort)
    async fn close(&mut self);
}

/// A handler bound to a queue
#[derive(Clone)]
pub struct ConsumerSpec {
    /// Queue to consume from
    pub queue: String,
    /// Callback for each delivery
    pub handler: Handler,
    /// Subscription options
    pub options: ConsumeOptions,
}

impl ConsumerSpec {
    /// Bind `handler` to `queue` with default options
    pub fn new(queue: impl Into<String>, handler: Handler) -> Self {
        Self {
            queue: queue.into(),
            handler,
            options: ConsumeOptions::default(),
        }
    }

    /// Set the subscription options
    pub fn options(mut self, options: ConsumeOptions) -> Self {
        self.options = options;
        self
    }
}

impl std::fmt::Debug for ConsumerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerSpec")
            .field("queue", &self.queue)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// The standard lifecycle: one [`BrokerConnection`] per session, the same
/// consumers registered on each.
pub struct ConsumerService<D: Driver> {
    driver: D,
    params: Arc<ConnectionParameters>,
    consumers: Vec<ConsumerSpec>,
    drain_timeout: Duration,
    connection: Option<BrokerConnection<D>>,
}

impl<D: Driver> ConsumerService<D> {
    /// Create a service with no consumers
    pub fn new(driver: D, params: Arc<ConnectionParameters>) -> Self {
        Self {
            driver,
            params,
            consumers: Vec::new(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            connection: None,
        }
    }

    /// Add a consumer registered on every session
    pub fn consumer(mut self, spec: ConsumerSpec) -> Self {
        self.consumers.push(spec);
        self
    }

    /// Set how long each drain call waits for the first event.
    ///
    /// A zero timeout polls: each drain only handles what is already buffered
    /// and yields to the runtime when nothing was.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Connection of the current session, if any
    pub fn connection(&self) -> Option<&BrokerConnection<D>> {
        self.connection.as_ref()
    }

    /// The driver
    pub fn driver(&self) -> &D {
        &self.driver
    }
}

#[async_trait]
impl<D: Driver> Lifecycle for ConsumerService<D> {
    async fn connect(&mut self) -> Result<()> {
        if let Some(mut stale) = self.connection.take() {
            stale.close().await;
        }
        self.connection = Some(BrokerConnection::connect(&self.driver, &self.params).await?);
        Ok(())
    }

    async fn register(&mut self) -> Result<()> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| Error::Registration("no open connection".into()))?;
        for spec in &self.consumers {
            connection
                .register_handler(&spec.queue, spec.handler.clone(), spec.options.clone())
                .await?;
        }
        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| Error::Connection("no open connection".into()))?;
        match connection.drain_events(self.drain_timeout).await {
            // Nothing waited on, give the runtime a turn
            Ok(0) if self.drain_timeout.is_zero() => tokio::task::yield_now().await,
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::Timeout => {}
            Err(e) => return Err(e),
        }

        if !self.consumers.is_empty() && connection.consumers().is_empty() {
            return Err(Error::Connection(
                "every consumer was cancelled by the broker".into(),
            ));
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
        }
    }
}
