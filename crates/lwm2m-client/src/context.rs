//! Client context
//!
//! Owns the object registry and the active registration session for the
//! lifetime of the engine. Security (0) and Server (1) instances are the
//! source of truth for server accounts: they start from the configuration
//! and are rewritten by a bootstrap server.

use lwm2m_coap::Security;
use lwm2m_core::objects::{bearer, device, firmware, security, server, software};
use lwm2m_core::{Registry, ResourceSet, ResourceValue, Value};
use tracing::{debug, warn};

use crate::config::{ClientConfig, SecurityConfig, ServerUri};
use crate::error::Result;

/// A server account resolved from objects 0 and 1
#[derive(Debug, Clone, PartialEq)]
pub struct ServerTarget {
    /// Zero for the bootstrap server
    pub short_server_id: u16,
    pub security_instance: u16,
    pub server_instance: Option<u16>,
    pub uri: ServerUri,
    pub security: Security,
    pub lifetime: u32,
    pub binding: String,
    pub disable_timeout: u32,
    pub default_pmin: Option<u32>,
    pub default_pmax: Option<u32>,
    /// Seconds to wait before a bootstrap request
    pub hold_off: u32,
}

/// Registration with one server, created by a successful Register
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub short_server_id: u16,
    /// Location-Path returned for the registration, e.g. `["rd", "5a3f"]`
    pub location: Vec<String>,
    pub lifetime: u32,
    /// Object links sent with the last Register or Update
    pub links: String,
    pub bearer: String,
}

impl Session {
    pub fn location_path(&self) -> String {
        self.location.join("/")
    }
}

pub struct ClientContext {
    pub config: ClientConfig,
    pub registry: Registry,
    pub session: Option<Session>,
}

impl ClientContext {
    /// Build the context and provision the client-side objects
    pub fn new(config: ClientConfig) -> Result<Self> {
        let registry = Registry::standard().with_read_timeout(config.read_timeout());
        let mut context = Self {
            config,
            registry,
            session: None,
        };
        context.provision()?;
        Ok(context)
    }

    fn provision(&mut self) -> Result<()> {
        let mut next_security = 0u16;
        if let Some(bs) = self.config.bootstrap.clone() {
            let resources = security_instance(&bs.uri, true, &bs.security, None)?;
            self.registry.add_instance(security::ID, next_security, resources)?;
            next_security += 1;
        }
        for (index, entry) in self.config.servers.clone().iter().enumerate() {
            let resources = security_instance(
                &entry.uri,
                false,
                &entry.security,
                Some(entry.short_server_id),
            )?;
            self.registry.add_instance(security::ID, next_security, resources)?;
            next_security += 1;

            let lifetime = entry.lifetime.unwrap_or(self.config.lifetime);
            let mut resources: ResourceSet = [
                (server::SHORT_SERVER_ID, single(entry.short_server_id as i64)),
                (server::LIFETIME, single(lifetime as i64)),
                (server::DISABLE_TIMEOUT, single(entry.disable_timeout as i64)),
                (server::NOTIFICATION_STORING, single(false)),
                (server::BINDING, single(self.config.binding.clone())),
            ]
            .into_iter()
            .collect();
            if self.config.observation.default_pmin > 0 {
                resources.insert(
                    server::DEFAULT_MIN_PERIOD,
                    single(self.config.observation.default_pmin as i64),
                );
            }
            if let Some(pmax) = self.config.observation.default_pmax {
                resources.insert(server::DEFAULT_MAX_PERIOD, single(pmax as i64));
            }
            self.registry.add_instance(server::ID, index as u16, resources)?;
        }

        self.registry.add_instance(
            device::ID,
            0,
            [
                (device::SUPPORTED_BINDINGS, single("U")),
                (device::ERROR_CODE, ResourceValue::multiple([Value::Integer(0)])),
            ]
            .into_iter()
            .collect(),
        )?;

        self.registry.add_instance(
            firmware::ID,
            0,
            [
                (firmware::PACKAGE_URI, single(String::new())),
                (firmware::STATE, single(firmware::STATE_IDLE)),
                (firmware::UPDATE_RESULT, single(firmware::RESULT_INITIAL)),
                (
                    firmware::PROTOCOL_SUPPORT,
                    ResourceValue::multiple(
                        [
                            firmware::PROTOCOL_COAP,
                            firmware::PROTOCOL_COAPS,
                            firmware::PROTOCOL_HTTP,
                            firmware::PROTOCOL_HTTPS,
                        ]
                        .map(Value::Integer),
                    ),
                ),
                (firmware::DELIVERY_METHOD, single(firmware::DELIVERY_BOTH)),
            ]
            .into_iter()
            .collect(),
        )?;

        self.registry.add_instance(
            software::ID,
            0,
            [
                (software::PKG_NAME, single("lwm2md")),
                (software::PKG_VERSION, single(env!("CARGO_PKG_VERSION"))),
                (software::UPDATE_STATE, single(software::STATE_INITIAL)),
                (software::UPDATE_RESULT, single(software::RESULT_INITIAL)),
                (software::ACTIVATION_STATE, single(false)),
            ]
            .into_iter()
            .collect(),
        )?;

        let preferred: Vec<Value> = if self.config.bearers.is_empty() {
            vec![Value::Integer(bearer::BEARER_AUTO)]
        } else {
            self.config
                .bearers
                .iter()
                .map(|b| Value::Integer(b.bearer))
                .collect()
        };
        self.registry.add_instance(
            bearer::ID,
            0,
            [(bearer::PREFERRED_BEARER, ResourceValue::multiple(preferred))]
                .into_iter()
                .collect(),
        )?;
        debug!(
            servers = self.config.servers.len(),
            bootstrap = self.config.bootstrap.is_some(),
            "Objects provisioned"
        );
        Ok(())
    }

    // =========================================================================
    // Server accounts
    // =========================================================================

    /// Usable LwM2M server accounts, in Security instance order
    pub fn servers(&self) -> Vec<ServerTarget> {
        self.registry
            .instance_ids(security::ID)
            .into_iter()
            .filter(|i| !self.bool_value(security::ID, *i, security::BOOTSTRAP_SERVER))
            .filter_map(|i| self.target(i))
            .collect()
    }

    pub fn bootstrap_server(&self) -> Option<ServerTarget> {
        self.registry
            .instance_ids(security::ID)
            .into_iter()
            .filter(|i| self.bool_value(security::ID, *i, security::BOOTSTRAP_SERVER))
            .find_map(|i| self.target(i))
    }

    pub fn has_valid_server(&self) -> bool {
        !self.servers().is_empty()
    }

    pub fn server_instance(&self, short_server_id: u16) -> Option<u16> {
        self.registry.instance_ids(server::ID).into_iter().find(|i| {
            self.int_value(server::ID, *i, server::SHORT_SERVER_ID) == Some(short_server_id as i64)
        })
    }

    /// Preferred Communications Bearer codes, highest priority first
    pub fn preferred_bearers(&self) -> Vec<i64> {
        match self.registry.value(bearer::ID, 0, bearer::PREFERRED_BEARER) {
            Some(ResourceValue::Multiple(values)) => {
                values.values().filter_map(Value::as_integer).collect()
            }
            Some(ResourceValue::Single(value)) => value.as_integer().into_iter().collect(),
            None => Vec::new(),
        }
    }

    fn target(&self, instance: u16) -> Option<ServerTarget> {
        let raw_uri = self
            .registry
            .value(security::ID, instance, security::SERVER_URI)
            .and_then(ResourceValue::as_single)
            .and_then(Value::as_str)?;
        let uri = match ServerUri::parse(raw_uri) {
            Ok(uri) => uri,
            Err(e) => {
                warn!(instance, error = %e, "Skipping security instance");
                return None;
            }
        };
        let mode = self
            .int_value(security::ID, instance, security::SECURITY_MODE)
            .unwrap_or(security::MODE_NOSEC);
        let security = match mode {
            security::MODE_NOSEC => Security::NoSec,
            security::MODE_PSK => Security::Psk {
                identity: self.bytes_value(security::ID, instance, security::PUBLIC_KEY_OR_IDENTITY),
                key: self.bytes_value(security::ID, instance, security::SECRET_KEY),
            },
            other => {
                warn!(instance, mode = other, "Unsupported security mode");
                return None;
            }
        };
        let bootstrap = self.bool_value(security::ID, instance, security::BOOTSTRAP_SERVER);
        let short_server_id = if bootstrap {
            0
        } else {
            self.int_value(security::ID, instance, security::SHORT_SERVER_ID)
                .and_then(|v| u16::try_from(v).ok())?
        };
        let server_instance = (!bootstrap)
            .then(|| self.server_instance(short_server_id))
            .flatten();
        if !bootstrap && server_instance.is_none() {
            debug!(instance, short_server_id, "Security instance has no server instance");
            return None;
        }
        let server_int = |resource: u16| {
            server_instance
                .and_then(|i| self.int_value(server::ID, i, resource))
                .and_then(|v| u32::try_from(v).ok())
        };
        let binding = server_instance
            .and_then(|i| self.registry.value(server::ID, i, server::BINDING))
            .and_then(ResourceValue::as_single)
            .and_then(Value::as_str)
            .unwrap_or("U")
            .to_string();

        Some(ServerTarget {
            short_server_id,
            security_instance: instance,
            server_instance,
            uri,
            security,
            lifetime: server_int(server::LIFETIME)
                .filter(|l| *l > 0)
                .unwrap_or(self.config.lifetime),
            binding,
            disable_timeout: server_int(server::DISABLE_TIMEOUT).unwrap_or(86400),
            default_pmin: server_int(server::DEFAULT_MIN_PERIOD),
            default_pmax: server_int(server::DEFAULT_MAX_PERIOD),
            hold_off: self
                .int_value(security::ID, instance, security::CLIENT_HOLD_OFF_TIME)
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(0),
        })
    }

    fn int_value(&self, object: u16, instance: u16, resource: u16) -> Option<i64> {
        self.registry
            .value(object, instance, resource)
            .and_then(ResourceValue::as_single)
            .and_then(Value::as_integer)
    }

    fn bool_value(&self, object: u16, instance: u16, resource: u16) -> bool {
        self.registry
            .value(object, instance, resource)
            .and_then(ResourceValue::as_single)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn bytes_value(&self, object: u16, instance: u16, resource: u16) -> Vec<u8> {
        self.registry
            .value(object, instance, resource)
            .and_then(ResourceValue::as_single)
            .and_then(Value::as_bytes)
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    }
}

fn single(value: impl Into<Value>) -> ResourceValue {
    ResourceValue::single(value)
}

fn security_instance(
    uri: &str,
    bootstrap: bool,
    credentials: &SecurityConfig,
    short_server_id: Option<u16>,
) -> Result<ResourceSet> {
    let (mode, identity, key) = match credentials.to_security()? {
        Security::NoSec => (security::MODE_NOSEC, Vec::new(), Vec::new()),
        Security::Psk { identity, key } => (security::MODE_PSK, identity, key),
    };
    let mut resources: ResourceSet = [
        (security::SERVER_URI, single(uri.to_string())),
        (security::BOOTSTRAP_SERVER, single(bootstrap)),
        (security::SECURITY_MODE, single(mode)),
        (security::PUBLIC_KEY_OR_IDENTITY, ResourceValue::Single(Value::Opaque(identity))),
        (security::SERVER_PUBLIC_KEY, ResourceValue::Single(Value::Opaque(Vec::new()))),
        (security::SECRET_KEY, ResourceValue::Single(Value::Opaque(key))),
    ]
    .into_iter()
    .collect();
    if let Some(id) = short_server_id {
        resources.insert(security::SHORT_SERVER_ID, single(id as i64));
    }
    Ok(resources)
}
