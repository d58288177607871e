//! Reconnect loop tests against the in-process broker

use async_trait::async_trait;
use broker_tether::connection::{
    handler, Delivery, Disposition, Driver, DriverConnection, NegotiatedSecurity, TlsMaterial,
};
use broker_tether::supervisor::{
    ConsumerService, ConsumerSpec, LinkState, MaxRetries, RetryPolicy, RunExit, Supervisor,
};
use broker_tether::transport::{MemoryBroker, MemoryChannel};
use broker_tether::{ConnectionParameters, ErrorKind, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const FAST_RETRY: Duration = Duration::from_millis(10);

fn service(broker: &MemoryBroker, count: Arc<AtomicUsize>) -> ConsumerService<MemoryBroker> {
    ConsumerService::new(broker.clone(), Arc::new(ConnectionParameters::default()))
        .consumer(ConsumerSpec::new(
            "jobs",
            handler(move |_: &Delivery| {
                count.fetch_add(1, Ordering::SeqCst);
                Disposition::Ack
            }),
        ))
        .drain_timeout(Duration::from_millis(20))
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

#[tokio::test]
async fn test_gives_up_after_max_retries() {
    let broker = MemoryBroker::new();
    broker.refuse_connects(ErrorKind::Connection);

    let mut supervisor = Supervisor::new(
        service(&broker, Arc::new(AtomicUsize::new(0))),
        RetryPolicy::limited(3, FAST_RETRY),
    );
    let exit = supervisor.run().await;

    assert_eq!(exit, RunExit::RetriesExhausted);
    // First attempt plus three retries
    assert_eq!(broker.stats().connect_attempts, 4);
    assert_eq!(supervisor.state(), LinkState::Disconnected);
}

#[tokio::test]
async fn test_zero_retries_means_one_attempt() {
    let broker = MemoryBroker::new();
    broker.refuse_connects(ErrorKind::Socket);

    let mut supervisor = Supervisor::new(
        service(&broker, Arc::new(AtomicUsize::new(0))),
        RetryPolicy::limited(0, FAST_RETRY),
    );
    assert_eq!(supervisor.run().await, RunExit::RetriesExhausted);
    assert_eq!(broker.stats().connect_attempts, 1);
}

#[tokio::test]
async fn test_negative_sentinel_retries_until_connected() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(5, ErrorKind::Security);

    let policy = RetryPolicy {
        max_retries: MaxRetries::from_sentinel(-1),
        retry_interval: FAST_RETRY,
    };
    let mut supervisor = Supervisor::new(service(&broker, Arc::new(AtomicUsize::new(0))), policy);
    let mut states = supervisor.subscribe();
    let shutdown = supervisor.shutdown_token();
    let run = tokio::spawn(async move { supervisor.run().await });

    states
        .wait_for(|s| *s == LinkState::Draining)
        .await
        .expect("state channel");
    shutdown.cancel();

    assert_eq!(run.await.unwrap(), RunExit::Stopped);
    assert_eq!(broker.stats().connect_attempts, 6);
    assert_eq!(broker.stats().connections_closed, 1);
}

#[tokio::test]
async fn test_budget_resets_after_successful_connect() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(2, ErrorKind::Connection);

    let mut supervisor = Supervisor::new(
        service(&broker, Arc::new(AtomicUsize::new(0))),
        RetryPolicy::limited(2, FAST_RETRY),
    );
    let mut states = supervisor.subscribe();
    let run = tokio::spawn(async move { supervisor.run().await });

    states
        .wait_for(|s| *s == LinkState::Draining)
        .await
        .expect("state channel");
    broker.refuse_connects(ErrorKind::Connection);
    broker.sever();

    assert_eq!(run.await.unwrap(), RunExit::RetriesExhausted);
    // 2 failures, 1 success, then a fresh budget of 2 retries after the sever
    assert_eq!(broker.stats().connect_attempts, 5);
}

#[tokio::test]
async fn test_interrupt_while_draining_stops_promptly() {
    let broker = MemoryBroker::new();
    let mut supervisor = Supervisor::new(
        service(&broker, Arc::new(AtomicUsize::new(0))),
        RetryPolicy::unlimited(Duration::from_secs(60)),
    );
    let mut states = supervisor.subscribe();
    let run = tokio::spawn(async move { supervisor.run().await });

    states
        .wait_for(|s| *s == LinkState::Draining)
        .await
        .expect("state channel");
    broker.interrupt();

    let exit = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("interrupt must not wait out the retry interval")
        .unwrap();
    assert_eq!(exit, RunExit::Stopped);

    let stats = broker.stats();
    assert_eq!(stats.connect_attempts, 1);
    assert_eq!(stats.connections_closed, 1);
    assert_eq!(stats.cancels, 1);
}

#[tokio::test]
async fn test_shutdown_during_retry_wait() {
    let broker = MemoryBroker::new();
    broker.refuse_connects(ErrorKind::Connection);

    let mut supervisor = Supervisor::new(
        service(&broker, Arc::new(AtomicUsize::new(0))),
        RetryPolicy::unlimited(Duration::from_secs(60)),
    );
    let shutdown = supervisor.shutdown_token();
    let run = tokio::spawn(async move { supervisor.run().await });

    let observer = broker.clone();
    eventually("first connect attempt", || observer.stats().connect_attempts >= 1).await;
    shutdown.cancel();

    let exit = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("shutdown must cut the retry wait short")
        .unwrap();
    assert_eq!(exit, RunExit::Stopped);
    assert_eq!(broker.stats().connect_attempts, 1);
}

#[tokio::test]
async fn test_unclassified_failure_aborts() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(1, ErrorKind::Unclassified);

    let mut supervisor = Supervisor::new(
        service(&broker, Arc::new(AtomicUsize::new(0))),
        RetryPolicy::unlimited(FAST_RETRY),
    );
    assert_eq!(supervisor.run().await, RunExit::Aborted);
    assert_eq!(broker.stats().connect_attempts, 1);
}

#[tokio::test]
async fn test_registration_failure_aborts_and_closes() {
    let broker = MemoryBroker::new();
    let service = ConsumerService::new(broker.clone(), Arc::new(ConnectionParameters::default()))
        .consumer(ConsumerSpec::new("", handler(|_: &Delivery| Disposition::Ack)));

    let mut supervisor = Supervisor::new(service, RetryPolicy::unlimited(FAST_RETRY));
    assert_eq!(supervisor.run().await, RunExit::Aborted);

    let stats = broker.stats();
    assert_eq!(stats.connect_attempts, 1);
    assert_eq!(stats.connections_closed, 1);
    assert_eq!(broker.live_connections(), 0);
}

#[tokio::test]
async fn test_consumption_resumes_after_reconnect() {
    let broker = MemoryBroker::new();
    let count = Arc::new(AtomicUsize::new(0));
    let mut supervisor = Supervisor::new(
        service(&broker, count.clone()),
        RetryPolicy::unlimited(FAST_RETRY),
    );
    let shutdown = supervisor.shutdown_token();
    let run = tokio::spawn(async move { supervisor.run().await });

    broker.publish("jobs", "before");
    let seen = count.clone();
    eventually("first delivery", || seen.load(Ordering::SeqCst) == 1).await;

    broker.sever();
    broker.publish("jobs", "after");
    let seen = count.clone();
    eventually("delivery after reconnect", || seen.load(Ordering::SeqCst) == 2).await;

    shutdown.cancel();
    assert_eq!(run.await.unwrap(), RunExit::Stopped);
    assert_eq!(broker.stats().connections_opened, 2);
    assert_eq!(broker.queue_depth("jobs"), 0);
}

#[tokio::test]
async fn test_malformed_frames_do_not_reconnect() {
    let broker = MemoryBroker::new();
    let count = Arc::new(AtomicUsize::new(0));
    let mut supervisor = Supervisor::new(
        service(&broker, count.clone()),
        RetryPolicy::unlimited(FAST_RETRY),
    );
    let mut states = supervisor.subscribe();
    let shutdown = supervisor.shutdown_token();
    let run = tokio::spawn(async move { supervisor.run().await });

    states
        .wait_for(|s| *s == LinkState::Draining)
        .await
        .expect("state channel");
    broker.inject_malformed_frame();
    broker.publish("jobs", "still-flowing");

    let seen = count.clone();
    eventually("delivery after malformed frame", || seen.load(Ordering::SeqCst) == 1).await;
    shutdown.cancel();

    assert_eq!(run.await.unwrap(), RunExit::Stopped);
    assert_eq!(broker.stats().connect_attempts, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn test_zero_drain_timeout_still_observes_shutdown() {
    let broker = MemoryBroker::new();
    let service = service(&broker, Arc::new(AtomicUsize::new(0))).drain_timeout(Duration::ZERO);
    let mut supervisor = Supervisor::new(service, RetryPolicy::unlimited(FAST_RETRY));
    let mut states = supervisor.subscribe();
    let shutdown = supervisor.shutdown_token();
    let run = tokio::spawn(async move { supervisor.run().await });

    states
        .wait_for(|s| *s == LinkState::Draining)
        .await
        .expect("state channel");
    shutdown.cancel();

    let exit = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("polling drain must yield to the runtime")
        .unwrap();
    assert_eq!(exit, RunExit::Stopped);
    assert_eq!(broker.live_connections(), 0);
}

#[tokio::test]
async fn test_shutdown_mid_batch_still_acks_handled_deliveries() {
    let broker = MemoryBroker::new();
    for i in 0..3 {
        broker.publish("jobs", format!("job-{}", i));
    }

    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    let service = ConsumerService::new(broker.clone(), Arc::new(ConnectionParameters::default()))
        .consumer(ConsumerSpec::new(
            "jobs",
            handler(move |_: &Delivery| {
                stop.cancel();
                Disposition::Ack
            }),
        ))
        .drain_timeout(Duration::from_millis(20));

    let mut supervisor =
        Supervisor::new(service, RetryPolicy::unlimited(FAST_RETRY)).with_shutdown(shutdown);
    assert_eq!(supervisor.run().await, RunExit::Stopped);

    let stats = broker.stats();
    assert_eq!(stats.acks, 3);
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queue_depth("jobs"), 0);
}

#[tokio::test]
async fn test_losing_every_consumer_cycles_the_session() {
    let broker = MemoryBroker::new();
    let mut supervisor = Supervisor::new(
        service(&broker, Arc::new(AtomicUsize::new(0))),
        RetryPolicy::unlimited(FAST_RETRY),
    );
    let mut states = supervisor.subscribe();
    let shutdown = supervisor.shutdown_token();
    let run = tokio::spawn(async move { supervisor.run().await });

    states
        .wait_for(|s| *s == LinkState::Draining)
        .await
        .expect("state channel");
    broker.delete_queue("jobs");

    let observer = broker.clone();
    eventually("consumer re-registered on a new connection", || {
        observer.stats().connections_opened == 2 && observer.consumer_count("jobs") == 1
    })
    .await;
    shutdown.cancel();

    assert_eq!(run.await.unwrap(), RunExit::Stopped);
    assert_eq!(broker.live_connections(), 0);
}

/// Completes the handshake, then never opens a channel
#[derive(Clone, Default)]
struct StalledChannelDriver {
    connected: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

struct StalledConnection {
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Driver for StalledChannelDriver {
    type Connection = StalledConnection;

    async fn connect(
        &self,
        _params: &ConnectionParameters,
        _tls: Option<&TlsMaterial>,
    ) -> Result<StalledConnection> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(StalledConnection {
            closed: self.closed.clone(),
        })
    }
}

#[async_trait]
impl DriverConnection for StalledConnection {
    type Channel = MemoryChannel;

    fn security(&self) -> NegotiatedSecurity {
        NegotiatedSecurity::Plain
    }

    async fn open_channel(&mut self) -> Result<MemoryChannel> {
        std::future::pending().await
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_shutdown_during_channel_open_closes_transport() {
    let driver = StalledChannelDriver::default();
    let service = ConsumerService::new(driver.clone(), Arc::new(ConnectionParameters::default()))
        .consumer(ConsumerSpec::new("jobs", handler(|_: &Delivery| Disposition::Ack)));
    let mut supervisor = Supervisor::new(service, RetryPolicy::unlimited(FAST_RETRY));
    let shutdown = supervisor.shutdown_token();
    let run = tokio::spawn(async move { supervisor.run().await });

    let connected = driver.connected.clone();
    eventually("transport handshake", || connected.load(Ordering::SeqCst)).await;
    shutdown.cancel();

    let exit = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("shutdown must not wait for the channel")
        .unwrap();
    assert_eq!(exit, RunExit::Stopped);

    let closed = driver.closed.clone();
    eventually("half-open connection closed", || closed.load(Ordering::SeqCst)).await;
}
