//! Security object (0)

use crate::definition::{ObjectDefinition, Operations::ReadWrite, ResourceDefinition as R};
use crate::value::DataKind as K;

pub const ID: u16 = 0;

pub const SERVER_URI: u16 = 0;
pub const BOOTSTRAP_SERVER: u16 = 1;
pub const SECURITY_MODE: u16 = 2;
pub const PUBLIC_KEY_OR_IDENTITY: u16 = 3;
pub const SERVER_PUBLIC_KEY: u16 = 4;
pub const SECRET_KEY: u16 = 5;
pub const SHORT_SERVER_ID: u16 = 10;
pub const CLIENT_HOLD_OFF_TIME: u16 = 11;
pub const BOOTSTRAP_ACCOUNT_TIMEOUT: u16 = 12;

/// Security mode resource values
pub const MODE_PSK: i64 = 0;
pub const MODE_RPK: i64 = 1;
pub const MODE_CERTIFICATE: i64 = 2;
pub const MODE_NOSEC: i64 = 3;

pub static DEFINITION: ObjectDefinition = ObjectDefinition {
    id: ID,
    name: "LWM2M Security",
    multiple: true,
    mandatory: true,
    resources: &[
        R::new(SERVER_URI, "LWM2M Server URI", K::String, ReadWrite).mandatory(),
        R::new(BOOTSTRAP_SERVER, "Bootstrap-Server", K::Boolean, ReadWrite).mandatory(),
        R::new(SECURITY_MODE, "Security Mode", K::Integer, ReadWrite).mandatory(),
        R::new(PUBLIC_KEY_OR_IDENTITY, "Public Key or Identity", K::Opaque, ReadWrite).mandatory(),
        R::new(SERVER_PUBLIC_KEY, "Server Public Key", K::Opaque, ReadWrite).mandatory(),
        R::new(SECRET_KEY, "Secret Key", K::Opaque, ReadWrite).mandatory(),
        R::new(6, "SMS Security Mode", K::Integer, ReadWrite),
        R::new(7, "SMS Binding Key Parameters", K::Opaque, ReadWrite),
        R::new(8, "SMS Binding Secret Key(s)", K::Opaque, ReadWrite),
        R::new(9, "LwM2M Server SMS Number", K::String, ReadWrite),
        R::new(SHORT_SERVER_ID, "Short Server ID", K::Integer, ReadWrite),
        R::new(CLIENT_HOLD_OFF_TIME, "Client Hold Off Time", K::Integer, ReadWrite),
        R::new(BOOTSTRAP_ACCOUNT_TIMEOUT, "Bootstrap-Server Account Timeout", K::Integer, ReadWrite),
    ],
};
