//! APN Connection Profile object (11)

use crate::definition::{
    ObjectDefinition,
    Operations::{Read, ReadWrite},
    ResourceDefinition as R,
};
use crate::value::DataKind as K;

pub const ID: u16 = 11;

pub const PROFILE_NAME: u16 = 0;
pub const APN: u16 = 1;
pub const AUTO_SELECT: u16 = 2;
pub const ENABLE_STATUS: u16 = 3;
pub const AUTHENTICATION_TYPE: u16 = 4;
pub const USER_NAME: u16 = 5;
pub const SECRET: u16 = 6;
pub const RECONNECT_SCHEDULE: u16 = 7;
pub const VALIDITY: u16 = 8;
pub const CONNECTION_ESTABLISHMENT_TIME: u16 = 9;
pub const CONNECTION_ESTABLISHMENT_RESULT: u16 = 10;
pub const CONNECTION_REJECT_CAUSE: u16 = 11;
pub const CONNECTION_END_TIME: u16 = 12;
pub const TOTAL_BYTES_SENT: u16 = 13;
pub const TOTAL_BYTES_RECEIVED: u16 = 14;
pub const IP_ADDRESS: u16 = 15;
pub const PREFIX_LENGTH: u16 = 16;
pub const SUBNET_MASK: u16 = 17;
pub const GATEWAY: u16 = 18;
pub const PRIMARY_DNS: u16 = 19;
pub const SECONDARY_DNS: u16 = 20;
pub const QCI: u16 = 21;
pub const VENDOR_EXTENSIONS: u16 = 22;
pub const TOTAL_PACKETS_SENT: u16 = 23;
pub const PDN_TYPE: u16 = 24;
pub const APN_RATE_CONTROL: u16 = 25;

pub const AUTH_PAP: i64 = 0;
pub const AUTH_CHAP: i64 = 1;
pub const AUTH_PAP_OR_CHAP: i64 = 2;
pub const AUTH_NONE: i64 = 3;

pub static DEFINITION: ObjectDefinition = ObjectDefinition {
    id: ID,
    name: "APN connection profile",
    multiple: true,
    mandatory: false,
    resources: &[
        R::new(PROFILE_NAME, "Profile name", K::String, ReadWrite).mandatory(),
        R::new(APN, "APN", K::String, ReadWrite),
        R::new(AUTO_SELECT, "Auto select APN by device", K::Boolean, ReadWrite),
        R::new(ENABLE_STATUS, "Enable status", K::Boolean, ReadWrite),
        R::new(AUTHENTICATION_TYPE, "Authentication Type", K::Integer, ReadWrite).mandatory(),
        R::new(USER_NAME, "User Name", K::String, ReadWrite),
        R::new(SECRET, "Secret", K::String, ReadWrite),
        R::new(RECONNECT_SCHEDULE, "Reconnect Schedule", K::String, ReadWrite),
        R::new(VALIDITY, "Validity (MCC, MNC)", K::String, ReadWrite).multiple(),
        R::new(CONNECTION_ESTABLISHMENT_TIME, "Connection establishment time", K::Time, Read).multiple(),
        R::new(CONNECTION_ESTABLISHMENT_RESULT, "Connection establishment result", K::Integer, Read)
            .multiple(),
        R::new(CONNECTION_REJECT_CAUSE, "Connection establishment reject cause", K::Integer, Read)
            .multiple(),
        R::new(CONNECTION_END_TIME, "Connection end time", K::Time, Read).multiple(),
        R::new(TOTAL_BYTES_SENT, "TotalBytesSent", K::Integer, Read),
        R::new(TOTAL_BYTES_RECEIVED, "TotalBytesReceived", K::Integer, Read),
        R::new(IP_ADDRESS, "IP address", K::String, ReadWrite).multiple(),
        R::new(PREFIX_LENGTH, "Prefix length", K::String, ReadWrite).multiple(),
        R::new(SUBNET_MASK, "Subnet mask", K::String, ReadWrite).multiple(),
        R::new(GATEWAY, "Gateway", K::String, ReadWrite).multiple(),
        R::new(PRIMARY_DNS, "Primary DNS address", K::String, ReadWrite).multiple(),
        R::new(SECONDARY_DNS, "Secondary DNS address", K::String, ReadWrite).multiple(),
        R::new(QCI, "QCI", K::Integer, Read),
        R::new(VENDOR_EXTENSIONS, "Vendor specific extensions", K::ObjLink, Read),
        R::new(TOTAL_PACKETS_SENT, "TotalPacketsSent", K::Integer, Read),
        R::new(PDN_TYPE, "PDN Type", K::Integer, ReadWrite),
        R::new(APN_RATE_CONTROL, "APN Rate Control", K::Integer, Read),
    ],
};
