//! Client configuration
//!
//! Loaded from a TOML file. Every section except the endpoint name has
//! defaults, so a minimal file only names the endpoint and one server:
//!
//! ```toml
//! endpoint = "gw-0001"
//!
//! [[servers]]
//! short_server_id = 101
//! uri = "coaps://lwm2m.example.net:5684"
//!
//! [servers.security]
//! mode = "psk"
//! identity = "gw-0001"
//! key = "000102030405060708090a0b0c0d0e0f"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lwm2m_coap::block::MAX_SZX;
use lwm2m_coap::{Security, TransmissionParams};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ClientError, Result};

/// Top level client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Endpoint client name sent with Register and Bootstrap-Request
    pub endpoint: String,
    /// Local address used when no bearer is configured
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Registration lifetime in seconds, unless a server entry overrides it
    #[serde(default = "default_lifetime")]
    pub lifetime: u32,
    #[serde(default = "default_binding")]
    pub binding: String,
    /// Factory provisioned LwM2M servers, in failover order
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<BootstrapConfig>,
    #[serde(default)]
    pub transmission: TransmissionConfig,
    #[serde(default)]
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub observation: ObservationConfig,
    /// Network interfaces usable for server traffic
    #[serde(default)]
    pub bearers: Vec<BearerConfig>,
    #[serde(default)]
    pub update: UpdateConfig,
    /// Block size exponent for block-wise transfers (block size `2^(szx+4)`)
    #[serde(default = "default_block_szx")]
    pub block_szx: u8,
    /// Bound on a host read source or execute action, in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

fn default_lifetime() -> u32 {
    300
}

fn default_binding() -> String {
    "U".to_string()
}

fn default_block_szx() -> u8 {
    MAX_SZX
}

fn default_read_timeout_ms() -> u64 {
    2000
}

impl ClientConfig {
    /// Load and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: ClientConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(ClientError::Config("endpoint name must not be empty".into()));
        }
        if self.servers.is_empty() && self.bootstrap.is_none() {
            return Err(ClientError::Config(
                "at least one server or a bootstrap server is required".into(),
            ));
        }
        if self.block_szx > MAX_SZX {
            return Err(ClientError::Config(format!(
                "block_szx {} out of range 0..={}",
                self.block_szx, MAX_SZX
            )));
        }
        if self.lifetime == 0 {
            return Err(ClientError::Config("lifetime must be positive".into()));
        }
        for server in &self.servers {
            let uri = ServerUri::parse(&server.uri)?;
            server.security.to_security()?;
            check_scheme(&uri, &server.security, &server.uri)?;
        }
        if let Some(bs) = &self.bootstrap {
            let uri = ServerUri::parse(&bs.uri)?;
            bs.security.to_security()?;
            check_scheme(&uri, &bs.security, &bs.uri)?;
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

fn check_scheme(uri: &ServerUri, security: &SecurityConfig, raw: &str) -> Result<()> {
    match (uri.secure, security) {
        (true, SecurityConfig::NoSec) => Err(ClientError::Config(format!(
            "{} needs a PSK security section",
            raw
        ))),
        (false, SecurityConfig::Psk { .. }) => Err(ClientError::Config(format!(
            "{} is not a coaps:// URI but has PSK credentials",
            raw
        ))),
        _ => Ok(()),
    }
}

// =============================================================================
// Servers
// =============================================================================

/// A provisioned LwM2M server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub short_server_id: u16,
    /// `coap://host[:port]` or `coaps://host[:port]`
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifetime: Option<u32>,
    #[serde(default)]
    pub security: SecurityConfig,
    /// Seconds the server stays disabled after executing Disable
    #[serde(default = "default_disable_timeout")]
    pub disable_timeout: u32,
}

fn default_disable_timeout() -> u32 {
    86400
}

/// Bootstrap server account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    pub uri: String,
    #[serde(default)]
    pub security: SecurityConfig,
    /// Seconds to wait for Bootstrap-Finish after the request was accepted
    #[serde(default = "default_bootstrap_timeout")]
    pub timeout_secs: u64,
}

fn default_bootstrap_timeout() -> u64 {
    120
}

/// Credentials for a server connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SecurityConfig {
    #[default]
    NoSec,
    Psk {
        identity: String,
        /// Hex encoded key
        key: String,
    },
}

impl SecurityConfig {
    pub fn to_security(&self) -> Result<Security> {
        match self {
            SecurityConfig::NoSec => Ok(Security::NoSec),
            SecurityConfig::Psk { identity, key } => {
                let key = hex::decode(key.trim())
                    .map_err(|e| ClientError::Config(format!("invalid PSK key: {}", e)))?;
                if identity.is_empty() || key.is_empty() {
                    return Err(ClientError::Config(
                        "PSK identity and key must not be empty".into(),
                    ));
                }
                Ok(Security::Psk {
                    identity: identity.as_bytes().to_vec(),
                    key,
                })
            }
        }
    }
}

/// Parsed server URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUri {
    pub secure: bool,
    pub host: String,
    pub port: u16,
}

impl ServerUri {
    pub const COAP_PORT: u16 = 5683;
    pub const COAPS_PORT: u16 = 5684;

    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri)
            .map_err(|e| ClientError::Config(format!("invalid server URI {:?}: {}", uri, e)))?;
        let secure = match url.scheme() {
            "coap" => false,
            "coaps" => true,
            other => {
                return Err(ClientError::Config(format!(
                    "unsupported server URI scheme {:?}",
                    other
                )))
            }
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ClientError::Config(format!("server URI {:?} has no host", uri)))?;
        let port = url
            .port()
            .unwrap_or(if secure { Self::COAPS_PORT } else { Self::COAP_PORT });
        Ok(Self {
            secure,
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
        })
    }
}

// =============================================================================
// Transmission
// =============================================================================

/// CoAP transmission parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransmissionConfig {
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_ack_random_factor")]
    pub ack_random_factor: f64,
    #[serde(default = "default_max_retransmit")]
    pub max_retransmit: u32,
    #[serde(default = "default_exchange_lifetime")]
    pub exchange_lifetime_secs: u64,
    #[serde(default = "default_non_lifetime")]
    pub non_lifetime_secs: u64,
}

fn default_ack_timeout_ms() -> u64 {
    2000
}

fn default_ack_random_factor() -> f64 {
    1.5
}

fn default_max_retransmit() -> u32 {
    4
}

fn default_exchange_lifetime() -> u64 {
    247
}

fn default_non_lifetime() -> u64 {
    145
}

impl Default for TransmissionConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
            ack_random_factor: default_ack_random_factor(),
            max_retransmit: default_max_retransmit(),
            exchange_lifetime_secs: default_exchange_lifetime(),
            non_lifetime_secs: default_non_lifetime(),
        }
    }
}

impl TransmissionConfig {
    pub fn to_params(&self) -> TransmissionParams {
        TransmissionParams {
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            ack_random_factor: self.ack_random_factor.max(1.0),
            max_retransmit: self.max_retransmit,
            exchange_lifetime: Duration::from_secs(self.exchange_lifetime_secs),
            non_lifetime: Duration::from_secs(self.non_lifetime_secs),
        }
    }
}

// =============================================================================
// Registration
// =============================================================================

/// Retry and renewal policy for registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Register attempts on one bearer before moving to the next
    #[serde(default = "default_attempts_per_bearer")]
    pub attempts_per_bearer: u32,
    /// First retry delay on the same bearer, doubled per failed attempt
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: u64,
    /// Wait in ServerUnreachable before starting over
    #[serde(default = "default_unreachable_retry")]
    pub unreachable_retry_secs: u64,
    /// Seconds before lifetime expiry to send the Update.
    /// Defaults to 10% of the lifetime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_margin_secs: Option<u32>,
}

fn default_attempts_per_bearer() -> u32 {
    2
}

fn default_retry_delay() -> u64 {
    5
}

fn default_max_retry_delay() -> u64 {
    60
}

fn default_unreachable_retry() -> u64 {
    300
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            attempts_per_bearer: default_attempts_per_bearer(),
            retry_delay_secs: default_retry_delay(),
            max_retry_delay_secs: default_max_retry_delay(),
            unreachable_retry_secs: default_unreachable_retry(),
            update_margin_secs: None,
        }
    }
}

// =============================================================================
// Observation
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationConfig {
    /// Default minimum period written to new Server instances
    #[serde(default)]
    pub default_pmin: u32,
    /// Default maximum period; absent means notify on change only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_pmax: Option<u32>,
    /// How often observed values are re-read to detect changes
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// Send notifications as confirmable messages
    #[serde(default)]
    pub confirmable: bool,
}

fn default_sample_interval_ms() -> u64 {
    5000
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            default_pmin: 0,
            default_pmax: None,
            sample_interval_ms: default_sample_interval_ms(),
            confirmable: false,
        }
    }
}

// =============================================================================
// Bearers
// =============================================================================

/// A network interface the client may bind to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BearerConfig {
    /// Interface name for logs, e.g. "eth0"
    pub name: String,
    /// Bearer code as used by the Bearer Selection object (e.g. 41 Ethernet, 21 WLAN)
    pub bearer: i64,
    /// Local address of the interface
    pub bind: SocketAddr,
}

// =============================================================================
// Update
// =============================================================================

/// Firmware and software update settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Staged packages and job markers live here
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// Executable applying a firmware package, given the package path
    #[serde(default = "default_firmware_updater")]
    pub firmware_updater: PathBuf,
    /// Executable installing a verified software package, given the package path
    #[serde(default = "default_software_updater")]
    pub software_updater: PathBuf,
    /// Archive tool used to unpack software packages
    #[serde(default = "default_extractor")]
    pub extractor: PathBuf,
    /// Updater exit code meaning "new client staged, restart me"
    #[serde(default = "default_restart_exit_code")]
    pub restart_exit_code: i32,
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
    /// Largest package accepted through a Block1 push
    #[serde(default = "default_max_push_size")]
    pub max_push_size: usize,
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("/var/lib/lwm2md")
}

fn default_firmware_updater() -> PathBuf {
    PathBuf::from("/usr/libexec/lwm2md/firmware-update")
}

fn default_software_updater() -> PathBuf {
    PathBuf::from("/usr/libexec/lwm2md/software-update")
}

fn default_extractor() -> PathBuf {
    PathBuf::from("tar")
}

fn default_restart_exit_code() -> i32 {
    10
}

fn default_download_timeout() -> u64 {
    900
}

fn default_max_push_size() -> usize {
    64 * 1024 * 1024
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            firmware_updater: default_firmware_updater(),
            software_updater: default_software_updater(),
            extractor: default_extractor(),
            restart_exit_code: default_restart_exit_code(),
            download_timeout_secs: default_download_timeout(),
            max_push_size: default_max_push_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MINIMAL: &str = r#"
        endpoint = "gw-0001"

        [[servers]]
        short_server_id = 101
        uri = "coap://127.0.0.1"
    "#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = ClientConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.endpoint, "gw-0001");
        assert_eq!(config.lifetime, 300);
        assert_eq!(config.binding, "U");
        assert_eq!(config.block_szx, 6);
        assert_eq!(config.update.restart_exit_code, 10);
        assert_eq!(config.registration.attempts_per_bearer, 2);
        assert_eq!(config.servers[0].security, SecurityConfig::NoSec);
        assert_eq!(config.servers[0].disable_timeout, 86400);
        let params = config.transmission.to_params();
        assert_eq!(params.ack_timeout, Duration::from_secs(2));
        assert_eq!(params.max_retransmit, 4);
    }

    #[test]
    fn test_psk_server_and_bearers() {
        let config = ClientConfig::from_toml(
            r#"
            endpoint = "gw-0002"
            lifetime = 600

            [[servers]]
            short_server_id = 1
            uri = "coaps://lwm2m.example.net"
            lifetime = 120
            [servers.security]
            mode = "psk"
            identity = "gw-0002"
            key = "0a0b0c"

            [[bearers]]
            name = "eth0"
            bearer = 41
            bind = "192.168.1.10:0"

            [[bearers]]
            name = "wlan0"
            bearer = 21
            bind = "10.0.0.5:0"
            "#,
        )
        .unwrap();
        assert_eq!(config.servers[0].lifetime, Some(120));
        assert_eq!(
            config.servers[0].security.to_security().unwrap(),
            Security::Psk {
                identity: b"gw-0002".to_vec(),
                key: vec![0x0a, 0x0b, 0x0c],
            }
        );
        assert_eq!(config.bearers.len(), 2);
        assert_eq!(config.bearers[1].bearer, 21);
    }

    #[test]
    fn test_validation_failures() {
        assert!(ClientConfig::from_toml("endpoint = \"x\"").is_err());
        assert!(ClientConfig::from_toml(
            r#"
            endpoint = "x"
            [[servers]]
            short_server_id = 1
            uri = "coaps://example.net"
            "#
        )
        .is_err());
        assert!(ClientConfig::from_toml(
            r#"
            endpoint = "x"
            [[servers]]
            short_server_id = 1
            uri = "http://example.net"
            "#
        )
        .is_err());
        assert!(ClientConfig::from_toml(
            r#"
            endpoint = "x"
            block_szx = 7
            [[servers]]
            short_server_id = 1
            uri = "coap://example.net"
            "#
        )
        .is_err());
        assert!(ClientConfig::from_toml(
            r#"
            endpoint = "x"
            [[servers]]
            short_server_id = 1
            uri = "coaps://example.net"
            [servers.security]
            mode = "psk"
            identity = "x"
            key = "zz"
            "#
        )
        .is_err());
    }

    #[test]
    fn test_server_uri_parsing() {
        assert_eq!(
            ServerUri::parse("coaps://lwm2m.example.net").unwrap(),
            ServerUri {
                secure: true,
                host: "lwm2m.example.net".into(),
                port: 5684
            }
        );
        assert_eq!(ServerUri::parse("coap://10.1.2.3:15683").unwrap().port, 15683);
        assert_eq!(ServerUri::parse("coap://[::1]:5683").unwrap().host, "::1");
        assert!(ServerUri::parse("coap://").is_err());
        assert!(ServerUri::parse("udp://host").is_err());
    }
}
