//! In-process broker
//!
//! Queues, round-robin consumers, acks and requeues, all in memory, plus
//! hooks to make the broker misbehave. Every handle shares the same state, so a
//! test can keep one clone to publish and inject faults while the connection
//! under test uses another.

use crate::client::{AuthMechanism, ConnectionParameters};
use crate::connection::{
    ConsumeOptions, Delivery, Driver, DriverChannel, DriverConnection, Inbound,
    NegotiatedSecurity, TlsMaterial,
};
use crate::{Error, ErrorKind, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// TLS version the memory broker reports
const TLS_VERSION: &str = "TLSv1.3";

/// Counters kept by a [`MemoryBroker`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Connect calls, successful or not
    pub connect_attempts: u64,
    /// Connections accepted
    pub connections_opened: u64,
    /// Connections closed by the client
    pub connections_closed: u64,
    /// Channels opened
    pub channels_opened: u64,
    /// Channels closed by the client
    pub channels_closed: u64,
    /// Consumers started
    pub consumers_started: u64,
    /// Consumers cancelled by the client
    pub cancels: u64,
    /// Deliveries acknowledged
    pub acks: u64,
    /// Deliveries rejected (with or without requeue)
    pub rejects: u64,
    /// Messages published
    pub published: u64,
}

#[derive(Debug, Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    body: Bytes,
    redelivered: bool,
}

struct Consumer {
    tag: String,
    channel: u64,
    no_ack: bool,
}

#[derive(Default)]
struct Queue {
    backlog: VecDeque<Message>,
    consumers: Vec<Consumer>,
    next: usize,
}

enum Event {
    Inbound(Inbound),
    Malformed(String),
    Failed(ErrorKind, String),
}

impl Event {
    fn into_result(self) -> Result<Inbound> {
        match self {
            Event::Inbound(inbound) => Ok(inbound),
            Event::Malformed(detail) => Err(Error::FrameDecode(detail)),
            Event::Failed(kind, detail) => Err(Error::from_kind(kind, detail)),
        }
    }
}

struct ChannelState {
    connection: u64,
    tx: mpsc::UnboundedSender<Event>,
    prefetch: u16,
    next_delivery_tag: u64,
    unacked: HashMap<u64, (String, Message)>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    channels: HashMap<u64, ChannelState>,
    connections: HashSet<u64>,
    next_id: u64,
    credentials: Option<(String, String)>,
    connect_failures: VecDeque<ErrorKind>,
    refuse: Option<ErrorKind>,
    channel_failures: VecDeque<ErrorKind>,
    cancel_failures: u32,
    stats: BrokerStats,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_mut(&mut self, id: u64) -> Result<&mut ChannelState> {
        self.channels
            .get_mut(&id)
            .ok_or_else(|| Error::Connection("channel is closed".into()))
    }

    /// Hand backlog messages to eligible consumers, round robin
    fn dispatch(&mut self, queue_name: &str) {
        let State {
            queues, channels, ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        while !queue.backlog.is_empty() && !queue.consumers.is_empty() {
            let n = queue.consumers.len();
            let chosen = (0..n).map(|offset| (queue.next + offset) % n).find(|&idx| {
                let consumer = &queue.consumers[idx];
                channels.get(&consumer.channel).map_or(false, |ch| {
                    consumer.no_ack || ch.prefetch == 0 || ch.unacked.len() < ch.prefetch as usize
                })
            });
            let Some(idx) = chosen else {
                break;
            };
            queue.next = (idx + 1) % n;

            let Some(message) = queue.backlog.pop_front() else {
                break;
            };
            let consumer = &queue.consumers[idx];
            let Some(channel) = channels.get_mut(&consumer.channel) else {
                break;
            };

            channel.next_delivery_tag += 1;
            let delivery_tag = channel.next_delivery_tag;
            let delivery = Delivery {
                consumer_tag: consumer.tag.clone(),
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                body: message.body.clone(),
            };
            if !consumer.no_ack {
                channel
                    .unacked
                    .insert(delivery_tag, (queue_name.to_string(), message));
            }
            let _ = channel.tx.send(Event::Inbound(Inbound::Delivery(delivery)));
        }
    }

    fn requeue(&mut self, queue: &str, mut message: Message) {
        message.redelivered = true;
        self.queues
            .entry(queue.to_string())
            .or_default()
            .backlog
            .push_front(message);
    }

    /// Drop a channel: its consumers go away and unacked messages return
    fn remove_channel(&mut self, id: u64) -> Option<ChannelState> {
        let mut channel = self.channels.remove(&id)?;
        let mut touched: Vec<String> = Vec::new();

        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.channel != id);
            if queue.consumers.len() != before {
                touched.push(name.clone());
            }
        }

        let mut unacked: Vec<_> = channel.unacked.drain().collect();
        // Highest tag first so push_front restores delivery order
        unacked.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, (queue, message)) in unacked {
            self.requeue(&queue, message);
            if !touched.contains(&queue) {
                touched.push(queue);
            }
        }

        for queue in touched {
            self.dispatch(&queue);
        }
        Some(channel)
    }

    fn broadcast(&self, make: impl Fn() -> Event) {
        for channel in self.channels.values() {
            let _ = channel.tx.send(make());
        }
    }
}

/// An in-process broker and its [`Driver`].
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    /// A broker accepting any credentials
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept password logins with these credentials
    pub fn with_credentials(self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.lock().credentials = Some((user.into(), password.into()));
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a queue if it does not exist
    pub fn declare_queue(&self, name: &str) {
        self.lock().queues.entry(name.to_string()).or_default();
    }

    /// Publish a message to `queue` through the default exchange
    pub fn publish(&self, queue: &str, body: impl Into<Bytes>) {
        let mut state = self.lock();
        state.stats.published += 1;
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .backlog
            .push_back(Message {
                exchange: String::new(),
                routing_key: queue.to_string(),
                body: body.into(),
                redelivered: false,
            });
        state.dispatch(queue);
    }

    /// Messages waiting in `queue` (not yet delivered)
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.backlog.len())
    }

    /// Consumers subscribed to `queue`
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    /// Deliveries awaiting ack across all channels
    pub fn unacked_count(&self) -> usize {
        self.lock().channels.values().map(|c| c.unacked.len()).sum()
    }

    /// Open client connections
    pub fn live_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// Counters so far
    pub fn stats(&self) -> BrokerStats {
        self.lock().stats
    }

    /// Fail the next `count` connect calls with errors of `kind`
    pub fn fail_next_connects(&self, count: usize, kind: ErrorKind) {
        let mut state = self.lock();
        state.connect_failures.extend(std::iter::repeat(kind).take(count));
    }

    /// Fail every connect call with `kind` until [`accept_connects`](Self::accept_connects)
    pub fn refuse_connects(&self, kind: ErrorKind) {
        self.lock().refuse = Some(kind);
    }

    /// Stop refusing connects
    pub fn accept_connects(&self) {
        self.lock().refuse = None;
    }

    /// Fail the next channel open with `kind`
    pub fn fail_next_channel_open(&self, kind: ErrorKind) {
        self.lock().channel_failures.push_back(kind);
    }

    /// Fail the next `count` consumer cancels
    pub fn fail_next_cancels(&self, count: u32) {
        self.lock().cancel_failures += count;
    }

    /// Drop every client connection as a broker restart would
    pub fn sever(&self) {
        let mut state = self.lock();
        state.broadcast(|| {
            Event::Failed(
                ErrorKind::Connection,
                "CONNECTION_FORCED - broker forced connection closure".into(),
            )
        });
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.remove_channel(id);
        }
        state.connections.clear();
    }

    /// Send a frame the client cannot decode on every channel
    pub fn inject_malformed_frame(&self) {
        self.lock()
            .broadcast(|| Event::Malformed("unexpected frame type 0x09 on channel".into()));
    }

    /// Interrupt every client waiting for events
    pub fn interrupt(&self) {
        self.lock()
            .broadcast(|| Event::Failed(ErrorKind::Interrupted, "interrupted".into()));
    }

    /// Delete a queue, notifying its consumers; pending messages are lost
    pub fn delete_queue(&self, name: &str) {
        let mut state = self.lock();
        let Some(queue) = state.queues.remove(name) else {
            return;
        };
        for consumer in queue.consumers {
            if let Some(channel) = state.channels.get(&consumer.channel) {
                let _ = channel.tx.send(Event::Inbound(Inbound::Cancelled {
                    consumer_tag: consumer.tag,
                }));
            }
        }
    }
}

#[async_trait]
impl Driver for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(
        &self,
        params: &ConnectionParameters,
        tls: Option<&TlsMaterial>,
    ) -> Result<MemoryConnection> {
        let mut state = self.lock();
        state.stats.connect_attempts += 1;

        if let Some(kind) = state.connect_failures.pop_front() {
            return Err(Error::from_kind(kind, "injected connect failure"));
        }
        if let Some(kind) = state.refuse {
            return Err(Error::from_kind(kind, "broker refused connection"));
        }

        match params.auth_mechanism() {
            AuthMechanism::External => {
                if tls.and_then(TlsMaterial::identity).is_none() {
                    return Err(Error::Security(
                        "EXTERNAL authentication requires a client certificate".into(),
                    ));
                }
            }
            AuthMechanism::Plain | AuthMechanism::Amqplain => {
                if let Some((user, password)) = &state.credentials {
                    if params.user() != user.as_str() || params.password() != password.as_str() {
                        return Err(Error::Security(format!(
                            "ACCESS_REFUSED - login refused for user '{}'",
                            params.user()
                        )));
                    }
                }
            }
        }

        let id = state.next_id();
        state.connections.insert(id);
        state.stats.connections_opened += 1;

        Ok(MemoryConnection {
            broker: self.clone(),
            id,
            security: match tls {
                Some(_) => NegotiatedSecurity::Tls {
                    version: Some(TLS_VERSION.into()),
                },
                None => NegotiatedSecurity::Plain,
            },
        })
    }
}

/// Client connection to a [`MemoryBroker`]
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    security: NegotiatedSecurity,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("security", &self.security)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DriverConnection for MemoryConnection {
    type Channel = MemoryChannel;

    fn security(&self) -> NegotiatedSecurity {
        self.security.clone()
    }

    async fn open_channel(&mut self) -> Result<MemoryChannel> {
        let mut state = self.broker.lock();
        if !state.connections.contains(&self.id) {
            return Err(Error::Connection("connection is closed".into()));
        }
        if let Some(kind) = state.channel_failures.pop_front() {
            return Err(Error::from_kind(kind, "injected channel open failure"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                tx,
                prefetch: 0,
                next_delivery_tag: 0,
                unacked: HashMap::new(),
            },
        );
        state.stats.channels_opened += 1;

        Ok(MemoryChannel {
            broker: self.broker.clone(),
            id,
            rx,
        })
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.broker.lock();
        if !state.connections.remove(&self.id) {
            return Err(Error::Connection("connection already closed".into()));
        }
        let owned: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, ch)| ch.connection == self.id)
            .map(|(id, _)| *id)
            .collect();
        for id in owned {
            state.remove_channel(id);
        }
        state.stats.connections_closed += 1;
        Ok(())
    }
}

/// Channel on a [`MemoryConnection`]
pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    rx: mpsc::UnboundedReceiver<Event>,
}

#[async_trait]
impl DriverChannel for MemoryChannel {
    async fn qos(&mut self, prefetch_count: u16) -> Result<()> {
        let mut state = self.broker.lock();
        state.channel_mut(self.id)?.prefetch = prefetch_count;
        Ok(())
    }

    async fn consume(&mut self, queue: &str, options: &ConsumeOptions) -> Result<String> {
        let mut state = self.broker.lock();
        state.channel_mut(self.id)?;

        let tag = match &options.consumer_tag {
            Some(tag) => tag.clone(),
            None => generate_consumer_tag(),
        };
        let entry = state.queues.entry(queue.to_string()).or_default();
        if entry
            .consumers
            .iter()
            .any(|c| c.channel == self.id && c.tag == tag)
        {
            return Err(Error::Registration(format!(
                "consumer tag '{}' already in use",
                tag
            )));
        }
        entry.consumers.push(Consumer {
            tag: tag.clone(),
            channel: self.id,
            no_ack: options.no_ack,
        });
        state.stats.consumers_started += 1;
        state.dispatch(queue);
        Ok(tag)
    }

    async fn cancel(&mut self, consumer_tag: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.channel_mut(self.id)?;
        if state.cancel_failures > 0 {
            state.cancel_failures -= 1;
            return Err(Error::Connection(format!(
                "injected failure cancelling '{}'",
                consumer_tag
            )));
        }

        let id = self.id;
        let found = state.queues.values_mut().any(|queue| {
            let before = queue.consumers.len();
            queue
                .consumers
                .retain(|c| !(c.channel == id && c.tag == consumer_tag));
            queue.consumers.len() != before
        });
        if !found {
            return Err(Error::Registration(format!(
                "unknown consumer tag '{}'",
                consumer_tag
            )));
        }
        state.stats.cancels += 1;
        Ok(())
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<()> {
        let mut state = self.broker.lock();
        let (queue, _) = state
            .channel_mut(self.id)?
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| unknown_delivery_tag(delivery_tag))?;
        state.stats.acks += 1;
        state.dispatch(&queue);
        Ok(())
    }

    async fn reject(&mut self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.broker.lock();
        let (queue, message) = state
            .channel_mut(self.id)?
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| unknown_delivery_tag(delivery_tag))?;
        state.stats.rejects += 1;
        if requeue {
            state.requeue(&queue, message);
        }
        state.dispatch(&queue);
        Ok(())
    }

    async fn next_inbound(&mut self) -> Result<Inbound> {
        match self.rx.recv().await {
            Some(event) => event.into_result(),
            None => Err(Error::Connection("channel closed by broker".into())),
        }
    }

    fn try_next_inbound(&mut self) -> Result<Option<Inbound>> {
        match self.rx.try_recv() {
            Ok(event) => event.into_result().map(Some),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(Error::Connection("channel closed by broker".into()))
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.broker.lock();
        if state.remove_channel(self.id).is_none() {
            return Err(Error::Connection("channel already closed".into()));
        }
        state.stats.channels_closed += 1;
        Ok(())
    }
}

fn unknown_delivery_tag(delivery_tag: u64) -> Error {
    Error::Connection(format!(
        "PRECONDITION_FAILED - unknown delivery tag {}",
        delivery_tag
    ))
}

fn generate_consumer_tag() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(22)
        .map(char::from)
        .collect();
    format!("amq.ctag-{}", suffix)
}
