//! Connection parameters and their defaulting rules

use crate::connection::TlsOptions;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

/// Default broker host
pub const DEFAULT_SERVER: &str = "localhost";

/// Default port for plain connections
pub const PLAIN_PORT: u16 = 5672;

/// Default port for TLS connections
pub const TLS_PORT: u16 = 5671;

/// Default virtual host
pub const DEFAULT_VHOST: &str = "/";

/// Identity used against loopback brokers
pub const LOCAL_USER: &str = "guest";
/// Password used against loopback brokers
pub const LOCAL_PASSWORD: &str = "guest";

/// Identity used against remote brokers
pub const REMOTE_USER: &str = "service";
/// Password used against remote brokers (expected to be overridden)
pub const REMOTE_PASSWORD: &str = "";

/// SASL authentication mechanism
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMechanism {
    /// SASL PLAIN (user/password)
    #[default]
    Plain,
    /// RabbitMQ AMQPLAIN (user/password)
    Amqplain,
    /// SASL EXTERNAL (client certificate)
    External,
}

impl AuthMechanism {
    /// Whether this mechanism authenticates with user/password
    pub fn is_password_based(&self) -> bool {
        matches!(self, Self::Plain | Self::Amqplain)
    }
}

impl std::fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain => write!(f, "PLAIN"),
            Self::Amqplain => write!(f, "AMQPLAIN"),
            Self::External => write!(f, "EXTERNAL"),
        }
    }
}

impl std::str::FromStr for AuthMechanism {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" => Ok(Self::Plain),
            "amqplain" => Ok(Self::Amqplain),
            "external" => Ok(Self::External),
            _ => Err(Error::Config(format!(
                "invalid auth mechanism '{}': expected plain, amqplain, or external",
                s
            ))),
        }
    }
}

/// TLS switch: either a plain on/off flag or full options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TlsChoice {
    /// `true` = TLS with default options, `false` = plain
    Flag(bool),
    /// TLS with explicit options
    Options(TlsOptions),
}

/// Optional inputs to [`ConnectionParameters::configure`].
///
/// Every field left unset is filled in by the defaulting rules: loopback hosts
/// get a plain transport and the `guest` identity, every other host gets TLS
/// and the remote identity.
///
/// # Examples
///
/// ```ignore
/// let overrides = Overrides::new()
///     .server("broker.example.com")
///     .user("ingest")
///     .password("s3cret")
///     .option("heartbeat", "30");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Overrides {
    /// Broker host
    pub server: Option<String>,
    /// Broker port
    pub port: Option<u16>,
    /// Username
    pub user: Option<String>,
    /// Password
    pub password: Option<String>,
    /// Virtual host
    pub virtual_host: Option<String>,
    /// TLS flag or options
    pub tls: Option<TlsChoice>,
    /// Authentication mechanism
    pub auth_mechanism: Option<AuthMechanism>,
    /// Connection timeout
    #[serde(skip)]
    pub connect_timeout: Option<Duration>,
    /// Client-provided connection name
    pub connection_name: Option<String>,
    /// Protocol-specific passthrough options
    pub options: BTreeMap<String, String>,
}

impl Overrides {
    /// Empty overrides (all defaults)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the broker host
    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    /// Set the broker port
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the username
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the virtual host
    pub fn virtual_host(mut self, vhost: impl Into<String>) -> Self {
        self.virtual_host = Some(vhost.into());
        self
    }

    /// Enable or disable TLS with default options
    pub fn use_tls(mut self, enabled: bool) -> Self {
        self.tls = Some(TlsChoice::Flag(enabled));
        self
    }

    /// Enable TLS with explicit options
    pub fn tls(mut self, options: TlsOptions) -> Self {
        self.tls = Some(TlsChoice::Options(options));
        self
    }

    /// Set the authentication mechanism
    pub fn auth_mechanism(mut self, mechanism: AuthMechanism) -> Self {
        self.auth_mechanism = Some(mechanism);
        self
    }

    /// Set the connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the client-provided connection name
    pub fn connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    /// Add a protocol passthrough option
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// Resolved broker connection parameters.
///
/// Built once at startup with [`ConnectionParameters::new`] or
/// [`ConnectionParameters::configure`] and shared read-only (typically behind
/// an `Arc`) with every connection and supervisor.
#[derive(Clone, PartialEq)]
pub struct ConnectionParameters {
    server: String,
    port: u16,
    user: String,
    password: String,
    virtual_host: String,
    tls: Option<TlsOptions>,
    auth_mechanism: AuthMechanism,
    connect_timeout: Option<Duration>,
    connection_name: String,
    options: BTreeMap<String, String>,
}

impl ConnectionParameters {
    /// Resolve overrides into parameters.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a configured CA bundle, client certificate or
    /// client key cannot be opened for reading.
    pub fn new(overrides: Overrides) -> Result<Self> {
        let server = overrides
            .server
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER.to_string());
        let local = is_local_host(&server);

        let tls = match overrides.tls {
            Some(TlsChoice::Flag(true)) => Some(TlsOptions::default()),
            Some(TlsChoice::Flag(false)) => None,
            Some(TlsChoice::Options(options)) => Some(options),
            None if local => None,
            None => Some(TlsOptions::default()),
        };

        if let Some(options) = &tls {
            options.check_readable()?;
        }

        let port = overrides
            .port
            .unwrap_or(if tls.is_some() { TLS_PORT } else { PLAIN_PORT });

        let (default_user, default_password) = if local {
            (LOCAL_USER, LOCAL_PASSWORD)
        } else {
            (REMOTE_USER, REMOTE_PASSWORD)
        };

        let client_cert = tls.as_ref().map_or(false, TlsOptions::has_client_cert);
        let auth_mechanism = match overrides.auth_mechanism {
            _ if client_cert => AuthMechanism::External,
            Some(mechanism) => mechanism,
            None => AuthMechanism::default(),
        };
        if auth_mechanism == AuthMechanism::External && !client_cert {
            tracing::warn!(
                server = %server,
                "EXTERNAL authentication configured without a client certificate"
            );
        }

        Ok(Self {
            server,
            port,
            user: overrides.user.unwrap_or_else(|| default_user.to_string()),
            password: overrides
                .password
                .unwrap_or_else(|| default_password.to_string()),
            virtual_host: overrides
                .virtual_host
                .unwrap_or_else(|| DEFAULT_VHOST.to_string()),
            tls,
            auth_mechanism,
            connect_timeout: overrides.connect_timeout,
            connection_name: overrides
                .connection_name
                .unwrap_or_else(default_connection_name),
            options: overrides.options,
        })
    }

    /// Parse parameters from an `amqp://` or `amqps://` URL.
    pub fn from_url(url: &str) -> Result<Self> {
        Self::new(Overrides::from_url(url)?)
    }

    /// Replace these parameters with the resolution of `overrides`.
    ///
    /// The replacement is atomic: on error `self` is left untouched.
    pub fn configure(&mut self, overrides: Overrides) -> Result<()> {
        *self = Self::new(overrides)?;
        Ok(())
    }

    /// Broker host
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Broker port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Username
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Password
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Virtual host
    pub fn virtual_host(&self) -> &str {
        &self.virtual_host
    }

    /// TLS options (None = plain transport)
    pub fn tls(&self) -> Option<&TlsOptions> {
        self.tls.as_ref()
    }

    /// Whether TLS is enabled
    pub fn uses_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Authentication mechanism
    pub fn auth_mechanism(&self) -> AuthMechanism {
        self.auth_mechanism
    }

    /// Connection timeout
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Client-provided connection name
    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    /// Protocol passthrough options
    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    /// Whether the broker host is a loopback address
    pub fn is_local(&self) -> bool {
        is_local_host(&self.server)
    }
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            port: PLAIN_PORT,
            user: LOCAL_USER.to_string(),
            password: LOCAL_PASSWORD.to_string(),
            virtual_host: DEFAULT_VHOST.to_string(),
            tls: None,
            auth_mechanism: AuthMechanism::default(),
            connect_timeout: None,
            connection_name: default_connection_name(),
            options: BTreeMap::new(),
        }
    }
}

impl std::fmt::Debug for ConnectionParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParameters")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("virtual_host", &self.virtual_host)
            .field("tls", &self.tls)
            .field("auth_mechanism", &self.auth_mechanism)
            .field("connect_timeout", &self.connect_timeout)
            .field("connection_name", &self.connection_name)
            .field("options", &self.options)
            .finish()
    }
}

/// Whether `host` names the local machine
pub fn is_local_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

fn default_connection_name() -> String {
    format!("broker-tether:{}", whoami::username())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tls::tests::{pem_file, CERT_PEM, KEY_PEM};

    #[test]
    fn test_local_hosts_default_to_plain_guest() {
        for host in ["localhost", "127.0.0.1"] {
            let params = ConnectionParameters::new(Overrides::new().server(host)).unwrap();
            assert!(!params.uses_tls(), "{} should default to plain", host);
            assert_eq!(params.port(), PLAIN_PORT);
            assert_eq!(params.user(), LOCAL_USER);
            assert_eq!(params.password(), LOCAL_PASSWORD);
        }
    }

    #[test]
    fn test_remote_host_defaults_to_tls() {
        let params =
            ConnectionParameters::new(Overrides::new().server("broker.example.com")).unwrap();
        assert!(params.uses_tls());
        assert_eq!(params.port(), TLS_PORT);
        assert_eq!(params.user(), REMOTE_USER);
        assert_eq!(params.password(), REMOTE_PASSWORD);
        assert_eq!(params.auth_mechanism(), AuthMechanism::Plain);
        assert_eq!(params.virtual_host(), "/");
    }

    #[test]
    fn test_explicit_overrides_win() {
        let params = ConnectionParameters::new(
            Overrides::new()
                .server("localhost")
                .use_tls(true)
                .user("ingest")
                .password("pw"),
        )
        .unwrap();
        assert!(params.uses_tls());
        assert_eq!(params.port(), TLS_PORT);
        assert_eq!(params.user(), "ingest");
        assert_eq!(params.password(), "pw");

        let params = ConnectionParameters::new(
            Overrides::new()
                .server("broker.example.com")
                .use_tls(false)
                .port(15672),
        )
        .unwrap();
        assert!(!params.uses_tls());
        assert_eq!(params.port(), 15672);
    }

    #[test]
    fn test_client_cert_forces_external_auth() {
        let cert = pem_file(CERT_PEM);
        let key = pem_file(KEY_PEM);
        let params = ConnectionParameters::new(
            Overrides::new()
                .server("broker.example.com")
                .auth_mechanism(AuthMechanism::Plain)
                .tls(
                    TlsOptions::default()
                        .client_cert(cert.path())
                        .client_key(key.path()),
                ),
        )
        .unwrap();
        assert_eq!(params.auth_mechanism(), AuthMechanism::External);
    }

    #[test]
    fn test_unreadable_file_does_not_mutate_params() {
        let mut params =
            ConnectionParameters::new(Overrides::new().server("broker.example.com")).unwrap();
        let before = params.clone();

        let err = params
            .configure(
                Overrides::new()
                    .server("other.example.com")
                    .tls(TlsOptions::default().ca_bundle("/nonexistent/ca.pem")),
            )
            .unwrap_err();

        assert!(matches!(err, Error::Config(_)));
        assert_eq!(params, before);
    }

    #[test]
    fn test_configure_is_idempotent() {
        let mut params = ConnectionParameters::default();
        let overrides = Overrides::new().server("broker.example.com").option("heartbeat", "30");
        params.configure(overrides.clone()).unwrap();
        let first = params.clone();
        params.configure(overrides).unwrap();
        assert_eq!(params, first);
        assert_eq!(params.options().get("heartbeat"), Some(&"30".to_string()));
    }

    #[test]
    fn test_default_matches_empty_overrides() {
        let resolved = ConnectionParameters::new(Overrides::new()).unwrap();
        assert_eq!(resolved, ConnectionParameters::default());
    }

    #[test]
    fn test_is_local_host() {
        assert!(is_local_host("localhost"));
        assert!(is_local_host("LOCALHOST"));
        assert!(is_local_host("127.0.0.1"));
        assert!(is_local_host("::1"));
        assert!(is_local_host("[::1]"));
        assert!(!is_local_host("broker.example.com"));
        assert!(!is_local_host("10.0.0.5"));
    }

    #[test]
    fn test_debug_redacts_password() {
        let params =
            ConnectionParameters::new(Overrides::new().password("hunter2")).unwrap();
        let debug_str = format!("{:?}", params);
        assert!(debug_str.contains("<redacted>"));
        assert!(!debug_str.contains("hunter2"));
    }

    #[test]
    fn test_overrides_deserialize_tls_flag_or_options() {
        let overrides: Overrides =
            serde_json::from_str(r#"{"server": "mq.internal", "tls": false}"#).unwrap();
        assert_eq!(overrides.tls, Some(TlsChoice::Flag(false)));

        let overrides: Overrides = serde_json::from_str(
            r#"{"tls": {"verify": "verify_none", "server_name": "mq"}, "auth_mechanism": "amqplain"}"#,
        )
        .unwrap();
        match overrides.tls {
            Some(TlsChoice::Options(ref tls)) => {
                assert_eq!(tls.verify, crate::connection::VerifyMode::None);
                assert_eq!(tls.server_name.as_deref(), Some("mq"));
            }
            ref other => panic!("expected TLS options, got {:?}", other),
        }
        assert_eq!(overrides.auth_mechanism, Some(AuthMechanism::Amqplain));
    }

    #[test]
    fn test_auth_mechanism_from_str() {
        assert_eq!("PLAIN".parse::<AuthMechanism>().unwrap(), AuthMechanism::Plain);
        assert_eq!("external".parse::<AuthMechanism>().unwrap(), AuthMechanism::External);
        assert!("scram".parse::<AuthMechanism>().is_err());
        assert_eq!(AuthMechanism::External.to_string(), "EXTERNAL");
    }
}
