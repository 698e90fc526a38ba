//! WLAN connectivity object (12)
//!
//! Profiles are created and deleted by the server; applying a profile to the
//! host network stack is an [`InstanceHook`](crate::registry::InstanceHook).

use crate::definition::{
    ObjectDefinition,
    Operations::{Read, ReadWrite, Write},
    ResourceDefinition as R,
};
use crate::value::DataKind as K;

pub const ID: u16 = 12;

pub const INTERFACE_NAME: u16 = 0;
pub const ENABLE: u16 = 1;
pub const RADIO_ENABLED: u16 = 2;
pub const STATUS: u16 = 3;
pub const BSSID: u16 = 4;
pub const SSID: u16 = 5;
pub const BROADCAST_SSID: u16 = 6;
pub const BEACON_ENABLED: u16 = 7;
pub const MODE: u16 = 8;
pub const CHANNEL: u16 = 9;
pub const AUTO_CHANNEL: u16 = 10;
pub const SUPPORTED_CHANNELS: u16 = 11;
pub const CHANNELS_IN_USE: u16 = 12;
pub const REGULATORY_DOMAIN: u16 = 13;
pub const STANDARD: u16 = 14;
pub const AUTHENTICATION_MODE: u16 = 15;
pub const ENCRYPTION_MODE: u16 = 16;
pub const WPA_PRE_SHARED_KEY: u16 = 17;
pub const WPA_KEY_PHRASE: u16 = 18;
pub const TOTAL_BYTES_SENT: u16 = 33;
pub const TOTAL_BYTES_RECEIVED: u16 = 34;
pub const TOTAL_PACKETS_SENT: u16 = 35;
pub const TOTAL_PACKETS_RECEIVED: u16 = 36;
pub const TRANSMIT_ERRORS: u16 = 37;
pub const RECEIVE_ERRORS: u16 = 38;

pub const MODE_ACCESS_POINT: i64 = 0;
pub const MODE_CLIENT: i64 = 1;

pub const AUTH_NONE: i64 = 0;
pub const AUTH_PSK: i64 = 1;
pub const AUTH_EAP: i64 = 2;

pub static DEFINITION: ObjectDefinition = ObjectDefinition {
    id: ID,
    name: "WLAN connectivity",
    multiple: true,
    mandatory: false,
    resources: &[
        R::new(INTERFACE_NAME, "Interface name", K::String, ReadWrite).mandatory(),
        R::new(ENABLE, "Enable", K::Boolean, ReadWrite).mandatory(),
        R::new(RADIO_ENABLED, "Radio Enabled", K::Integer, ReadWrite),
        R::new(STATUS, "Status", K::Integer, Read).mandatory(),
        R::new(BSSID, "BSSID", K::String, Read).mandatory(),
        R::new(SSID, "SSID", K::String, ReadWrite).mandatory(),
        R::new(BROADCAST_SSID, "Broadcast SSID", K::Boolean, ReadWrite),
        R::new(BEACON_ENABLED, "Beacon Enabled", K::Boolean, ReadWrite),
        R::new(MODE, "Mode", K::Integer, ReadWrite).mandatory(),
        R::new(CHANNEL, "Channel", K::Integer, ReadWrite).mandatory(),
        R::new(AUTO_CHANNEL, "Auto Channel", K::Boolean, ReadWrite),
        R::new(SUPPORTED_CHANNELS, "Supported Channels", K::Integer, ReadWrite).multiple(),
        R::new(CHANNELS_IN_USE, "Channels In Use", K::Integer, ReadWrite).multiple(),
        R::new(REGULATORY_DOMAIN, "Regulatory Domain", K::String, ReadWrite),
        R::new(STANDARD, "Standard", K::Integer, ReadWrite).mandatory(),
        R::new(AUTHENTICATION_MODE, "Authentication Mode", K::Integer, ReadWrite).mandatory(),
        R::new(ENCRYPTION_MODE, "Encryption Mode", K::Integer, ReadWrite),
        R::new(WPA_PRE_SHARED_KEY, "WPA Pre Shared Key", K::String, Write),
        R::new(WPA_KEY_PHRASE, "WPA Key Phrase", K::String, Write),
        R::new(TOTAL_BYTES_SENT, "Total Bytes Sent", K::Integer, Read),
        R::new(TOTAL_BYTES_RECEIVED, "Total Bytes Received", K::Integer, Read),
        R::new(TOTAL_PACKETS_SENT, "Total Packets Sent", K::Integer, Read),
        R::new(TOTAL_PACKETS_RECEIVED, "Total Packets Received", K::Integer, Read),
        R::new(TRANSMIT_ERRORS, "Transmit Errors", K::Integer, Read),
        R::new(RECEIVE_ERRORS, "Receive Errors", K::Integer, Read),
    ],
};
