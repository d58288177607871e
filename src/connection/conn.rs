//! Core connection type

use super::tls::TlsMaterial;
use super::transport::{
    ConsumeOptions, Disposition, Driver, DriverChannel, DriverConnection, Handler, Inbound,
    NegotiatedSecurity,
};
use crate::client::ConnectionParameters;
use crate::metrics::labels;
use crate::{Error, ErrorKind, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::Instrument;

type ChannelOf<D> = <<D as Driver>::Connection as DriverConnection>::Channel;

/// Identifies one registered handler
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerHandle {
    consumer_tag: String,
    queue: String,
}

impl ConsumerHandle {
    /// Consumer tag assigned by the broker
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Queue the handler consumes from
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

struct Registered {
    handler: Handler,
    queue: String,
    no_ack: bool,
}

/// Handles in registration order plus the handler table
#[derive(Default)]
struct Registry {
    consumers: Vec<ConsumerHandle>,
    handlers: HashMap<String, Registered>,
}

impl Registry {
    fn insert(&mut self, handle: ConsumerHandle, handler: Handler, no_ack: bool) {
        self.handlers.insert(
            handle.consumer_tag.clone(),
            Registered {
                handler,
                queue: handle.queue.clone(),
                no_ack,
            },
        );
        self.consumers.push(handle);
    }

    fn remove(&mut self, consumer_tag: &str) -> Option<ConsumerHandle> {
        self.handlers.remove(consumer_tag);
        let pos = self
            .consumers
            .iter()
            .position(|h| h.consumer_tag == consumer_tag)?;
        Some(self.consumers.remove(pos))
    }

    fn clear(&mut self) {
        self.consumers.clear();
        self.handlers.clear();
    }

    /// Run one inbound event; returns the number of deliveries handled
    async fn dispatch<C: DriverChannel>(&mut self, channel: &mut C, inbound: Inbound) -> Result<usize> {
        match inbound {
            Inbound::Delivery(delivery) => {
                let Some(registered) = self.handlers.get(&delivery.consumer_tag) else {
                    tracing::warn!(
                        consumer_tag = %delivery.consumer_tag,
                        delivery_tag = delivery.delivery_tag,
                        "delivery for unknown consumer, requeueing"
                    );
                    crate::metrics::counters::delivery_unroutable();
                    channel.reject(delivery.delivery_tag, true).await?;
                    return Ok(0);
                };

                let disposition = (registered.handler)(&delivery);
                crate::metrics::counters::delivery_handled(&registered.queue, disposition.as_str());

                if !registered.no_ack {
                    match disposition {
                        Disposition::Ack => channel.ack(delivery.delivery_tag).await?,
                        Disposition::Requeue => channel.reject(delivery.delivery_tag, true).await?,
                        Disposition::Reject => channel.reject(delivery.delivery_tag, false).await?,
                    }
                }
                Ok(1)
            }
            Inbound::Cancelled { consumer_tag } => {
                if let Some(handle) = self.remove(&consumer_tag) {
                    tracing::info!(
                        consumer_tag = %consumer_tag,
                        queue = %handle.queue,
                        "consumer cancelled by broker"
                    );
                    crate::metrics::counters::consumer_cancelled(&handle.queue, labels::ORIGIN_BROKER);
                }
                Ok(0)
            }
        }
    }
}

/// A managed broker connection: one transport connection, one channel and the
/// consumers registered on it.
///
/// A new instance is created for every connect attempt and is never reused
/// after [`close`](Self::close).
pub struct BrokerConnection<D: Driver> {
    connection: Option<D::Connection>,
    channel: Option<ChannelOf<D>>,
    registry: Registry,
    security: NegotiatedSecurity,
}

impl<D: Driver> BrokerConnection<D> {
    /// Open a transport connection and one channel on it.
    ///
    /// TLS material is loaded first when the parameters enable TLS. The driver
    /// connect is bounded by the configured connect timeout. If the channel
    /// cannot be opened, the transport connection is closed before the error is
    /// returned.
    ///
    /// # Errors
    ///
    /// `Connection`, `Security`, `Socket` or `Timeout` errors; all of them are
    /// retryable.
    pub async fn connect(driver: &D, params: &ConnectionParameters) -> Result<Self> {
        let started = Instant::now();
        crate::metrics::counters::connect_attempted(params.server());

        let result = async {
            let tls = params
                .tls()
                .map(|options| TlsMaterial::load(options, params.server()))
                .transpose()?;

            let connecting = driver.connect(params, tls.as_ref());
            let connection = match params.connect_timeout() {
                Some(limit) => tokio::time::timeout(limit, connecting)
                    .await
                    .map_err(|_| Error::Timeout(limit))??,
                None => connecting.await?,
            };
            let mut pending = HalfOpen(Some(connection));
            let channel = match pending.open_channel().await {
                Ok(channel) => channel,
                Err(e) => {
                    pending.close().await;
                    return Err(e);
                }
            };
            let connection = pending.release()?;

            let security = connection.security();
            tracing::info!(security = %security, "connection established");

            Ok(Self {
                connection: Some(connection),
                channel: Some(channel),
                registry: Registry::default(),
                security,
            })
        }
        .instrument(tracing::info_span!(
            "connect",
            server = %params.server(),
            port = params.port(),
            vhost = %params.virtual_host()
        ))
        .await;

        match &result {
            Ok(conn) => {
                crate::metrics::counters::connect_succeeded(params.server(), conn.security.as_label());
                crate::metrics::histograms::connect_duration(
                    params.server(),
                    started.elapsed().as_millis() as u64,
                );
            }
            Err(e) => crate::metrics::counters::connect_failed(params.server(), e.kind().as_str()),
        }

        result
    }

    /// Security negotiated for this connection
    pub fn security(&self) -> &NegotiatedSecurity {
        &self.security
    }

    /// Whether the connection has not been closed
    pub fn is_open(&self) -> bool {
        self.channel.is_some() && self.connection.is_some()
    }

    /// Registered consumers, in registration order
    pub fn consumers(&self) -> &[ConsumerHandle] {
        &self.registry.consumers
    }

    /// Subscribe `handler` to `queue`.
    ///
    /// Applies the prefetch count first when one is set.
    ///
    /// # Errors
    ///
    /// `Registration` if the queue name is empty or the connection is closed;
    /// otherwise whatever the channel reports.
    pub async fn register_handler(
        &mut self,
        queue: &str,
        handler: Handler,
        options: ConsumeOptions,
    ) -> Result<ConsumerHandle> {
        if queue.is_empty() {
            return Err(Error::Registration("queue name must not be empty".into()));
        }
        let channel = self.channel.as_mut().ok_or_else(|| {
            Error::Registration(format!("cannot consume from '{}': connection is closed", queue))
        })?;

        if let Some(prefetch) = options.prefetch_count {
            channel.qos(prefetch).await?;
        }
        let consumer_tag = channel.consume(queue, &options).await?;

        let handle = ConsumerHandle {
            consumer_tag,
            queue: queue.to_string(),
        };
        self.registry.insert(handle.clone(), handler, options.no_ack);

        tracing::debug!(queue = %queue, consumer_tag = %handle.consumer_tag, "consumer registered");
        crate::metrics::counters::consumer_registered(queue);
        Ok(handle)
    }

    /// Cancel one handler and forget it.
    ///
    /// # Errors
    ///
    /// `Registration` if the handle is unknown or the connection is closed.
    pub async fn unregister(&mut self, handle: &ConsumerHandle) -> Result<()> {
        let channel = self.channel.as_mut().ok_or_else(|| {
            Error::Registration("cannot cancel consumer: connection is closed".into())
        })?;
        if !self.registry.handlers.contains_key(&handle.consumer_tag) {
            return Err(Error::Registration(format!(
                "unknown consumer '{}'",
                handle.consumer_tag
            )));
        }

        channel.cancel(&handle.consumer_tag).await?;
        self.registry.remove(&handle.consumer_tag);
        crate::metrics::counters::consumer_cancelled(&handle.queue, labels::ORIGIN_CLIENT);
        Ok(())
    }

    /// Dispatch pending broker events to their handlers.
    ///
    /// With a zero `timeout` this only processes what is already buffered and
    /// returns as soon as nothing is pending. With a positive `timeout` it waits
    /// up to that long for the first event, then processes whatever else is
    /// buffered.
    ///
    /// Malformed frames are logged and dropped; the connection stays usable.
    /// Deliveries for consumer tags with no handler are requeued. Broker-side
    /// cancellations remove the consumer from the registry.
    ///
    /// Returns the number of deliveries passed to handlers.
    ///
    /// # Errors
    ///
    /// `Timeout` if `timeout` is positive and nothing arrived, `Connection` if
    /// the connection is closed, otherwise whatever the channel reports.
    pub async fn drain_events(&mut self, timeout: Duration) -> Result<usize> {
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| Error::Connection("connection is closed".into()))?;
        let mut dispatched = 0;

        if !timeout.is_zero() {
            let first = tokio::time::timeout(timeout, channel.next_inbound())
                .await
                .map_err(|_| Error::Timeout(timeout))?;
            match first {
                Ok(inbound) => dispatched += self.registry.dispatch(channel, inbound).await?,
                Err(e) if e.kind() == ErrorKind::FrameDecode => malformed_frame(&e),
                Err(e) => return Err(e),
            }
        }

        loop {
            match channel.try_next_inbound() {
                Ok(Some(inbound)) => dispatched += self.registry.dispatch(channel, inbound).await?,
                Ok(None) => break,
                Err(e) if e.kind() == ErrorKind::FrameDecode => malformed_frame(&e),
                Err(e) => return Err(e),
            }
        }

        crate::metrics::histograms::drain_batch_size(dispatched);
        Ok(dispatched)
    }

    /// Tear the connection down.
    ///
    /// Cancels every consumer in registration order, closes the channel, closes
    /// the transport connection and clears the registry. Each step is best
    /// effort: failures are logged and the next step still runs. Calling this
    /// again is a no-op.
    pub async fn close(&mut self) {
        if let Some(channel) = self.channel.as_mut() {
            for handle in &self.registry.consumers {
                if let Err(e) = channel.cancel(&handle.consumer_tag).await {
                    tracing::warn!(
                        consumer_tag = %handle.consumer_tag,
                        queue = %handle.queue,
                        error = %e,
                        "failed to cancel consumer"
                    );
                }
            }
        }

        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                tracing::warn!(error = %e, "failed to close channel");
            }
        }

        if let Some(mut connection) = self.connection.take() {
            match connection.close().await {
                Ok(()) => crate::metrics::counters::connection_closed(),
                Err(e) => tracing::warn!(error = %e, "failed to close connection"),
            }
        }

        self.registry.clear();
    }
}

impl<D: Driver> std::fmt::Debug for BrokerConnection<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("open", &self.is_open())
            .field("security", &self.security)
            .field("consumers", &self.registry.consumers)
            .finish()
    }
}

/// A transport connection whose channel is not open yet.
///
/// Dropped while still holding the connection (the connect future was
/// cancelled mid-handshake), it closes the connection on a spawned task.
struct HalfOpen<C: DriverConnection>(Option<C>);

impl<C: DriverConnection> HalfOpen<C> {
    async fn open_channel(&mut self) -> Result<C::Channel> {
        match self.0.as_mut() {
            Some(connection) => connection.open_channel().await,
            None => Err(Error::Connection("connection is closed".into())),
        }
    }

    async fn close(&mut self) {
        if let Some(mut connection) = self.0.take() {
            if let Err(e) = connection.close().await {
                tracing::warn!(error = %e, "failed to close connection after channel error");
            }
        }
    }

    /// Hand the connection over once its channel is open
    fn release(mut self) -> Result<C> {
        self.0
            .take()
            .ok_or_else(|| Error::Connection("connection is closed".into()))
    }
}

impl<C: DriverConnection> Drop for HalfOpen<C> {
    fn drop(&mut self) {
        let Some(mut connection) = self.0.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("connect cancelled outside a runtime, dropping connection unclosed");
            return;
        };
        runtime.spawn(async move {
            match connection.close().await {
                Ok(()) => crate::metrics::counters::connection_closed(),
                Err(e) => tracing::warn!(error = %e, "failed to close half-open connection"),
            }
        });
    }
}

fn malformed_frame(e: &Error) {
    tracing::warn!(error = %e, "dropping malformed frame");
    crate::metrics::counters::frame_decode_error();
}
