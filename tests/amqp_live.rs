//! Integration tests for the AMQP driver
//!
//! These tests require a running RabbitMQ instance with the default `guest`
//! account and `--features transport-lapin`.

#![cfg(feature = "transport-lapin")]

use broker_tether::connection::{handler, BrokerConnection, ConsumeOptions, Delivery, Disposition};
use broker_tether::transport::LapinDriver;
use broker_tether::{ConnectionParameters, ErrorKind, Overrides};
use std::time::Duration;

#[tokio::test]
#[ignore] // Requires RabbitMQ running
async fn test_connect_and_close() {
    let params = ConnectionParameters::default();
    let mut conn = BrokerConnection::connect(&LapinDriver::new(), &params)
        .await
        .expect("connect");
    assert!(conn.is_open());

    conn.close().await;
    assert!(!conn.is_open());
}

#[tokio::test]
#[ignore] // Requires RabbitMQ running
async fn test_consume_from_missing_queue_fails() {
    let params = ConnectionParameters::default();
    let mut conn = BrokerConnection::connect(&LapinDriver::new(), &params)
        .await
        .expect("connect");

    let result = conn
        .register_handler(
            "broker-tether-does-not-exist",
            handler(|_: &Delivery| Disposition::Ack),
            ConsumeOptions::default(),
        )
        .await;
    assert!(result.is_err());
    conn.close().await;
}

#[tokio::test]
#[ignore] // Requires RabbitMQ running
async fn test_wrong_password_is_security_error() {
    let params =
        ConnectionParameters::new(Overrides::new().user("guest").password("not-the-password"))
            .unwrap();
    let err = BrokerConnection::connect(&LapinDriver::new(), &params)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Security);
}

#[tokio::test]
#[ignore] // Requires nothing listening on the port
async fn test_refused_port_is_retryable() {
    let params = ConnectionParameters::new(
        Overrides::new()
            .port(1)
            .connect_timeout(Duration::from_secs(2)),
    )
    .unwrap();
    let err = BrokerConnection::connect(&LapinDriver::new(), &params)
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "unexpected error: {:?}", err);
}
