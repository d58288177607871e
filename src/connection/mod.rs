//! Connection management
//!
//! This module handles:
//! * The transport seam a broker-protocol library plugs into
//! * The managed connection lifecycle (connect, register, drain, close)
//! * TLS configuration and material loading

mod conn;
pub(crate) mod tls;
mod transport;

pub use conn::{BrokerConnection, ConsumerHandle};
pub use tls::{parse_server_name, ClientIdentity, TlsMaterial, TlsOptions, VerifyMode};
pub use transport::{
    handler, ConsumeOptions, Delivery, Disposition, Driver, DriverChannel, DriverConnection,
    Handler, Inbound, NegotiatedSecurity,
};
