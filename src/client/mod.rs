//! Client configuration
//!
//! [`ConnectionParameters`] are resolved once from [`Overrides`] (built in
//! code, deserialized from a config file, or parsed from an AMQP URL) and
//! shared read-only afterwards.

mod connection_string;
mod params;

pub use params::{
    is_local_host, AuthMechanism, ConnectionParameters, Overrides, TlsChoice, DEFAULT_SERVER,
    DEFAULT_VHOST, LOCAL_PASSWORD, LOCAL_USER, PLAIN_PORT, REMOTE_PASSWORD, REMOTE_USER, TLS_PORT,
};
