//! Consume from an in-process broker that drops the connection mid-stream.
//!
//! Run with: cargo run --example consume
//!
//! Set RUST_LOG=broker_tether=debug for connection-level detail.

use broker_tether::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CONFIG: &str = r#"{
    "server": "localhost",
    "virtual_host": "/",
    "connection_name": "consume-demo",
    "options": { "heartbeat": "30" }
}"#;

const MESSAGES: usize = 10;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "broker_tether=info,consume=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let overrides: Overrides = serde_json::from_str(CONFIG)?;
    let params = Arc::new(ConnectionParameters::new(overrides)?);
    tracing::info!(?params, "resolved connection parameters");

    let broker = MemoryBroker::new();
    let processed = Arc::new(AtomicUsize::new(0));
    let counter = processed.clone();

    let service = ConsumerService::new(broker.clone(), params)
        .consumer(
            ConsumerSpec::new(
                "jobs",
                handler(move |delivery: &Delivery| {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    tracing::info!(
                        n,
                        redelivered = delivery.redelivered,
                        body = %String::from_utf8_lossy(&delivery.body),
                        "processed"
                    );
                    Disposition::Ack
                }),
            )
            .options(ConsumeOptions::default().prefetch_count(4)),
        )
        .drain_timeout(Duration::from_millis(200));

    let mut supervisor = Supervisor::new(service, RetryPolicy::limited(5, Duration::from_secs(1)));
    let shutdown = supervisor.shutdown_token();
    let run = tokio::spawn(async move { supervisor.run().await });

    for i in 0..MESSAGES {
        broker.publish("jobs", format!("job-{}", i));
        tokio::time::sleep(Duration::from_millis(100)).await;
        if i == MESSAGES / 2 {
            tracing::warn!("simulating broker restart");
            broker.sever();
        }
    }

    while processed.load(Ordering::SeqCst) < MESSAGES {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    shutdown.cancel();

    let exit = run.await?;
    tracing::info!(exit = exit.as_str(), stats = ?broker.stats(), "done");
    Ok(())
}
