//! Transport abstraction
//!
//! A broker-protocol library plugs in by implementing [`Driver`],
//! [`DriverConnection`] and [`DriverChannel`]. Everything above this seam works
//! in terms of deliveries, dispositions and tagged errors.

use super::tls::TlsMaterial;
use crate::client::ConnectionParameters;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Security actually negotiated by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiatedSecurity {
    /// Unencrypted connection
    Plain,
    /// TLS connection, with the protocol version when the transport reports it
    Tls {
        /// e.g. "TLSv1.3"
        version: Option<String>,
    },
}

impl NegotiatedSecurity {
    /// Short label used in metrics
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Tls { .. } => "tls",
        }
    }
}

impl std::fmt::Display for NegotiatedSecurity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain => write!(f, "plain"),
            Self::Tls { version: Some(v) } => write!(f, "tls ({})", v),
            Self::Tls { version: None } => write!(f, "tls"),
        }
    }
}

/// A message delivered to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Consumer the broker delivered to
    pub consumer_tag: String,
    /// Channel-scoped delivery tag, used to ack or reject
    pub delivery_tag: u64,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key used at publish time
    pub routing_key: String,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
    /// Message payload
    pub body: Bytes,
}

/// Something the broker sent on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A message for one of our consumers
    Delivery(Delivery),
    /// The broker cancelled a consumer (queue deleted, node failover)
    Cancelled {
        /// Tag of the cancelled consumer
        consumer_tag: String,
    },
}

/// What to do with a delivery once its handler has run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; remove from the queue
    Ack,
    /// Put back on the queue for another attempt
    Requeue,
    /// Drop (or dead-letter, if the queue is set up for it)
    Reject,
}

impl Disposition {
    /// Short label used in metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Requeue => "requeue",
            Self::Reject => "reject",
        }
    }
}

/// Message handler callback
pub type Handler = Arc<dyn Fn(&Delivery) -> Disposition + Send + Sync>;

/// Wrap a closure as a [`Handler`]
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Delivery) -> Disposition + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Subscription options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumeOptions {
    /// Maximum unacknowledged deliveries on the channel (None = broker default)
    pub prefetch_count: Option<u16>,
    /// Broker considers deliveries acknowledged on send
    pub no_ack: bool,
    /// Request exclusive access to the queue
    pub exclusive: bool,
    /// Consumer tag to request (None = transport generated)
    pub consumer_tag: Option<String>,
}

impl ConsumeOptions {
    /// Set the prefetch count
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = Some(count);
        self
    }

    /// Enable or disable automatic acknowledgement
    pub fn no_ack(mut self, no_ack: bool) -> Self {
        self.no_ack = no_ack;
        self
    }

    /// Enable or disable exclusive consumption
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Request a specific consumer tag
    pub fn consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }
}

/// Opens transport connections to a broker
#[async_trait]
pub trait Driver: Send + Sync {
    /// Live transport connection
    type Connection: DriverConnection;

    /// Open a transport connection, including TLS and authentication.
    ///
    /// `tls` is `Some` exactly when the parameters enable TLS.
    async fn connect(
        &self,
        params: &ConnectionParameters,
        tls: Option<&TlsMaterial>,
    ) -> Result<Self::Connection>;
}

/// A live transport connection
#[async_trait]
pub trait DriverConnection: Send + 'static {
    /// Channel opened on this connection
    type Channel: DriverChannel;

    /// Security negotiated during the handshake
    fn security(&self) -> NegotiatedSecurity;

    /// Open a channel
    async fn open_channel(&mut self) -> Result<Self::Channel>;

    /// Close the connection
    async fn close(&mut self) -> Result<()>;
}

/// A channel on a transport connection
#[async_trait]
pub trait DriverChannel: Send {
    /// Limit unacknowledged deliveries on this channel
    async fn qos(&mut self, prefetch_count: u16) -> Result<()>;

    /// Subscribe to a queue, returning the consumer tag
    async fn consume(&mut self, queue: &str, options: &ConsumeOptions) -> Result<String>;

    /// Cancel a consumer
    async fn cancel(&mut self, consumer_tag: &str) -> Result<()>;

    /// Acknowledge a delivery
    async fn ack(&mut self, delivery_tag: u64) -> Result<()>;

    /// Reject a delivery, optionally putting it back on its queue
    async fn reject(&mut self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// Wait for the next inbound event.
    ///
    /// Must be cancel safe: dropping the future before it completes loses no
    /// event.
    async fn next_inbound(&mut self) -> Result<Inbound>;

    /// Next inbound event if one is already buffered
    fn try_next_inbound(&mut self) -> Result<Option<Inbound>>;

    /// Close the channel
    async fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_display() {
        assert_eq!(NegotiatedSecurity::Plain.to_string(), "plain");
        assert_eq!(
            NegotiatedSecurity::Tls {
                version: Some("TLSv1.3".into())
            }
            .to_string(),
            "tls (TLSv1.3)"
        );
        assert_eq!(NegotiatedSecurity::Tls { version: None }.as_label(), "tls");
    }

    #[test]
    fn test_consume_options_from_json() {
        let options: ConsumeOptions =
            serde_json::from_str(r#"{"prefetch_count": 10, "exclusive": true}"#).unwrap();
        assert_eq!(options.prefetch_count, Some(10));
        assert!(options.exclusive);
        assert!(!options.no_ack);
        assert!(options.consumer_tag.is_none());
    }

    #[test]
    fn test_handler_wraps_closure() {
        let h = handler(|d: &Delivery| {
            if d.redelivered {
                Disposition::Reject
            } else {
                Disposition::Ack
            }
        });
        let delivery = Delivery {
            consumer_tag: "c".into(),
            delivery_tag: 1,
            exchange: String::new(),
            routing_key: "q".into(),
            redelivered: true,
            body: Bytes::from_static(b"x"),
        };
        assert_eq!(h(&delivery), Disposition::Reject);
    }
}
