//! Connectivity Monitoring object (4)

use crate::definition::{ObjectDefinition, Operations::Read, ResourceDefinition as R};
use crate::value::DataKind as K;

pub const ID: u16 = 4;

pub const NETWORK_BEARER: u16 = 0;
pub const AVAILABLE_NETWORK_BEARER: u16 = 1;
pub const RADIO_SIGNAL_STRENGTH: u16 = 2;
pub const LINK_QUALITY: u16 = 3;
pub const IP_ADDRESSES: u16 = 4;
pub const ROUTER_IP_ADDRESSES: u16 = 5;
pub const LINK_UTILIZATION: u16 = 6;
pub const APN: u16 = 7;
pub const CELL_ID: u16 = 8;
pub const SMNC: u16 = 9;
pub const SMCC: u16 = 10;
pub const SIGNAL_SNR: u16 = 11;
pub const LAC: u16 = 12;
pub const COVERAGE_ENHANCEMENT_LEVEL: u16 = 13;

/// Network bearer codes
pub const BEARER_GSM: i64 = 0;
pub const BEARER_WCDMA: i64 = 2;
pub const BEARER_LTE_TDD: i64 = 5;
pub const BEARER_LTE_FDD: i64 = 6;
pub const BEARER_NB_IOT: i64 = 7;
pub const BEARER_WLAN: i64 = 21;
pub const BEARER_ETHERNET: i64 = 41;

pub static DEFINITION: ObjectDefinition = ObjectDefinition {
    id: ID,
    name: "Connectivity Monitoring",
    multiple: false,
    mandatory: false,
    resources: &[
        R::new(NETWORK_BEARER, "Network Bearer", K::Integer, Read).mandatory(),
        R::new(AVAILABLE_NETWORK_BEARER, "Available Network Bearer", K::Integer, Read)
            .multiple()
            .mandatory(),
        R::new(RADIO_SIGNAL_STRENGTH, "Radio Signal Strength", K::Integer, Read).mandatory(),
        R::new(LINK_QUALITY, "Link Quality", K::Integer, Read),
        R::new(IP_ADDRESSES, "IP Addresses", K::String, Read)
            .multiple()
            .mandatory(),
        R::new(ROUTER_IP_ADDRESSES, "Router IP Addresses", K::String, Read).multiple(),
        R::new(LINK_UTILIZATION, "Link Utilization", K::Integer, Read),
        R::new(APN, "APN", K::String, Read).multiple(),
        R::new(CELL_ID, "Cell ID", K::Integer, Read),
        R::new(SMNC, "SMNC", K::Integer, Read),
        R::new(SMCC, "SMCC", K::Integer, Read),
        R::new(SIGNAL_SNR, "SignalSNR", K::Integer, Read),
        R::new(LAC, "LAC", K::Integer, Read),
        R::new(COVERAGE_ENHANCEMENT_LEVEL, "Coverage Enhancement Level", K::Integer, Read),
    ],
};
