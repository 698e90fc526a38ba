//! Bearer Selection object (13)

use crate::definition::{
    ObjectDefinition,
    Operations::{Read, ReadWrite},
    ResourceDefinition as R,
};
use crate::value::DataKind as K;

pub const ID: u16 = 13;

pub const PREFERRED_BEARER: u16 = 0;
pub const ACCEPTABLE_RSSI_GSM: u16 = 1;
pub const ACCEPTABLE_RSCP_UMTS: u16 = 2;
pub const ACCEPTABLE_RSRP_LTE: u16 = 3;
pub const ACCEPTABLE_RSSI_EV_DO: u16 = 4;
pub const CELL_LOCK_LIST: u16 = 5;
pub const OPERATOR_LIST: u16 = 6;
pub const OPERATOR_LIST_MODE: u16 = 7;
pub const AVAILABLE_PLMNS: u16 = 8;

/// Preferred bearer value letting the client use every interface
pub const BEARER_AUTO: i64 = 0;

pub static DEFINITION: ObjectDefinition = ObjectDefinition {
    id: ID,
    name: "Bearer selection",
    multiple: false,
    mandatory: false,
    resources: &[
        R::new(PREFERRED_BEARER, "Preferred Communications Bearer", K::Integer, ReadWrite).multiple(),
        R::new(ACCEPTABLE_RSSI_GSM, "Acceptable RSSI (GSM)", K::Integer, ReadWrite),
        R::new(ACCEPTABLE_RSCP_UMTS, "Acceptable RSCP (UMTS)", K::Integer, ReadWrite),
        R::new(ACCEPTABLE_RSRP_LTE, "Acceptable RSRP (LTE)", K::Integer, ReadWrite),
        R::new(ACCEPTABLE_RSSI_EV_DO, "Acceptable RSSI (1xEV-DO)", K::Integer, ReadWrite),
        R::new(CELL_LOCK_LIST, "Cell lock list", K::String, ReadWrite),
        R::new(OPERATOR_LIST, "Operator list", K::String, ReadWrite),
        R::new(OPERATOR_LIST_MODE, "Operator list mode", K::Boolean, ReadWrite),
        R::new(AVAILABLE_PLMNS, "List of available PLMNs", K::String, Read),
    ],
};
