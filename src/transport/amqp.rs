//! AMQP 0-9-1 driver on top of `lapin`
//!
//! Each consumer's delivery stream is forwarded by a spawned task into one
//! queue per channel, so the connection sees a single ordered inbound feed.

use crate::client::{AuthMechanism, ConnectionParameters};
use crate::connection::{
    ConsumeOptions, Delivery, Driver, DriverChannel, DriverConnection, Inbound,
    NegotiatedSecurity, TlsMaterial, VerifyMode,
};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicQosOptions,
    BasicRejectOptions,
};
use lapin::tcp::{OwnedIdentity, OwnedTLSConfig};
use lapin::types::FieldTable;
use lapin::ConnectionProperties;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const REPLY_SUCCESS: u16 = 200;

/// Passthrough options understood by the AMQP URI
const URI_OPTIONS: &[&str] = &["heartbeat", "channel_max", "frame_max"];

/// [`Driver`] for RabbitMQ and other AMQP 0-9-1 brokers
#[derive(Debug, Clone, Default)]
pub struct LapinDriver;

impl LapinDriver {
    /// Create the driver
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for LapinDriver {
    type Connection = LapinConnection;

    async fn connect(
        &self,
        params: &ConnectionParameters,
        tls: Option<&TlsMaterial>,
    ) -> Result<LapinConnection> {
        let uri = amqp_uri(params);
        let properties = ConnectionProperties::default()
            .with_connection_name(params.connection_name().to_string().into());

        let mut tls_config = OwnedTLSConfig::default();
        if let Some(material) = tls {
            if material.verify() == VerifyMode::None {
                tracing::warn!("verify_none is not supported by the AMQP driver, verifying peer");
            }
            if material.server_name() != params.server() {
                tracing::warn!(
                    server_name = %material.server_name(),
                    "custom TLS server name is not supported by the AMQP driver, using host"
                );
            }
            tls_config.cert_chain = material.ca_pem().map(str::to_string);
            tls_config.identity = material.identity().map(|identity| OwnedIdentity::PKCS8 {
                pem: identity.cert_pem().to_vec(),
                key: identity.key_pem().to_vec(),
            });
        }

        let connection = lapin::Connection::connect_with_config(&uri, properties, tls_config)
            .await
            .map_err(map_error)?;

        Ok(LapinConnection {
            connection,
            security: if params.uses_tls() {
                NegotiatedSecurity::Tls { version: None }
            } else {
                NegotiatedSecurity::Plain
            },
        })
    }
}

/// Live AMQP connection
pub struct LapinConnection {
    connection: lapin::Connection,
    security: NegotiatedSecurity,
}

#[async_trait]
impl DriverConnection for LapinConnection {
    type Channel = LapinChannel;

    fn security(&self) -> NegotiatedSecurity {
        self.security.clone()
    }

    async fn open_channel(&mut self) -> Result<LapinChannel> {
        let channel = self.connection.create_channel().await.map_err(map_error)?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(LapinChannel {
            channel,
            tx,
            rx,
            forwarders: HashMap::new(),
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(map_error)
    }
}

/// AMQP channel
pub struct LapinChannel {
    channel: lapin::Channel,
    tx: mpsc::UnboundedSender<Result<Inbound>>,
    rx: mpsc::UnboundedReceiver<Result<Inbound>>,
    forwarders: HashMap<String, JoinHandle<()>>,
}

#[async_trait]
impl DriverChannel for LapinChannel {
    async fn qos(&mut self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(map_error)
    }

    async fn consume(&mut self, queue: &str, options: &ConsumeOptions) -> Result<String> {
        let consume_options = BasicConsumeOptions {
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            ..Default::default()
        };
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                options.consumer_tag.as_deref().unwrap_or(""),
                consume_options,
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;

        let consumer_tag = consumer.tag().as_str().to_string();
        let tx = self.tx.clone();
        let tag = consumer_tag.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(item) = consumer.next().await {
                let event = item.map_err(map_error).map(|delivery| {
                    Inbound::Delivery(Delivery {
                        consumer_tag: tag.clone(),
                        delivery_tag: delivery.delivery_tag,
                        exchange: delivery.exchange.as_str().to_string(),
                        routing_key: delivery.routing_key.as_str().to_string(),
                        redelivered: delivery.redelivered,
                        body: Bytes::from(delivery.data),
                    })
                });
                if tx.send(event).is_err() {
                    return;
                }
            }
            let _ = tx.send(Ok(Inbound::Cancelled { consumer_tag: tag }));
        });
        self.forwarders.insert(consumer_tag.clone(), forwarder);

        Ok(consumer_tag)
    }

    async fn cancel(&mut self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(map_error)?;
        self.forwarders.remove(consumer_tag);
        Ok(())
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(map_error)
    }

    async fn reject(&mut self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(map_error)
    }

    async fn next_inbound(&mut self) -> Result<Inbound> {
        match self.rx.recv().await {
            Some(event) => event,
            None => Err(Error::Connection("channel closed".into())),
        }
    }

    fn try_next_inbound(&mut self) -> Result<Option<Inbound>> {
        match self.rx.try_recv() {
            Ok(event) => event.map(Some),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(Error::Connection("channel closed".into()))
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        for (_, forwarder) in self.forwarders.drain() {
            forwarder.abort();
        }
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(map_error)
    }
}

impl Drop for LapinChannel {
    fn drop(&mut self) {
        for (_, forwarder) in self.forwarders.drain() {
            forwarder.abort();
        }
    }
}

/// Build the AMQP URI lapin connects with
fn amqp_uri(params: &ConnectionParameters) -> String {
    let scheme = if params.uses_tls() { "amqps" } else { "amqp" };
    let host = if params.server().contains(':') {
        format!("[{}]", params.server())
    } else {
        params.server().to_string()
    };

    let mut uri = format!(
        "{}://{}:{}@{}:{}/{}",
        scheme,
        encode_component(params.user()),
        encode_component(params.password()),
        host,
        params.port(),
        encode_component(params.virtual_host())
    );

    let mut query: Vec<String> = Vec::new();
    if params.auth_mechanism() == AuthMechanism::External {
        query.push("auth_mechanism=external".into());
    } else if params.auth_mechanism() == AuthMechanism::Amqplain {
        query.push("auth_mechanism=amqplain".into());
    }
    for key in URI_OPTIONS {
        if let Some(value) = params.options().get(*key) {
            query.push(format!("{}={}", key, encode_component(value)));
        }
    }
    if let Some(timeout) = params.connect_timeout() {
        query.push(format!("connection_timeout={}", timeout.as_millis()));
    }

    if !query.is_empty() {
        uri.push('?');
        uri.push_str(&query.join("&"));
    }
    uri
}

fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Classify a lapin error
fn map_error(e: lapin::Error) -> Error {
    let detail = e.to_string();
    match e {
        lapin::Error::IOError(io) => {
            let lowered = detail.to_ascii_lowercase();
            if lowered.contains("tls") || lowered.contains("certificate") {
                Error::Security(detail)
            } else {
                Error::Io(std::io::Error::new(io.kind(), detail))
            }
        }
        lapin::Error::ParsingError(_) => Error::FrameDecode(detail),
        _ if detail.contains("ACCESS_REFUSED") || detail.contains("authentication") => {
            Error::Security(detail)
        }
        _ => Error::Connection(detail),
    }
}
