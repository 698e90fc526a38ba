//! Cellular Connectivity object (10)

use crate::definition::{
    ObjectDefinition,
    Operations::{Read, ReadWrite},
    ResourceDefinition as R,
};
use crate::value::DataKind as K;

pub const ID: u16 = 10;

pub const SMSC_ADDRESS: u16 = 0;
pub const DISABLE_RADIO_PERIOD: u16 = 1;
pub const MODULE_ACTIVATION_CODE: u16 = 2;
pub const VENDOR_EXTENSIONS: u16 = 3;
pub const PSM_TIMER: u16 = 4;
pub const ACTIVE_TIMER: u16 = 5;
pub const SERVING_PLMN_RATE_CONTROL: u16 = 6;
pub const EDRX_IU: u16 = 7;
pub const EDRX_WB_S1: u16 = 8;
pub const EDRX_NB_S1: u16 = 9;
pub const EDRX_A_GB: u16 = 10;
pub const ACTIVATED_PROFILE_NAMES: u16 = 11;

pub static DEFINITION: ObjectDefinition = ObjectDefinition {
    id: ID,
    name: "Cellular connectivity",
    multiple: false,
    mandatory: false,
    resources: &[
        R::new(SMSC_ADDRESS, "SMSC address", K::String, ReadWrite),
        R::new(DISABLE_RADIO_PERIOD, "Disable radio period", K::Integer, ReadWrite),
        R::new(MODULE_ACTIVATION_CODE, "Module activation code", K::String, ReadWrite),
        R::new(VENDOR_EXTENSIONS, "Vendor specific extensions", K::ObjLink, Read),
        R::new(PSM_TIMER, "PSM Timer", K::Integer, ReadWrite),
        R::new(ACTIVE_TIMER, "Active Timer", K::Integer, ReadWrite),
        R::new(SERVING_PLMN_RATE_CONTROL, "Serving PLMN Rate control", K::Integer, Read),
        R::new(EDRX_IU, "eDRX parameters for Iu mode", K::Opaque, ReadWrite),
        R::new(EDRX_WB_S1, "eDRX parameters for WB-S1 mode", K::Opaque, ReadWrite),
        R::new(EDRX_NB_S1, "eDRX parameters for NB-S1 mode", K::Opaque, ReadWrite),
        R::new(EDRX_A_GB, "eDRX parameters for A/Gb mode", K::Opaque, ReadWrite),
        R::new(ACTIVATED_PROFILE_NAMES, "Activated Profile Names", K::ObjLink, Read)
            .multiple()
            .mandatory(),
    ],
};
