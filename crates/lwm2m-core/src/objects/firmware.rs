//! Firmware Update object (5)

use crate::definition::{
    ObjectDefinition,
    Operations::{Read, ReadWrite, Write},
    ResourceDefinition as R,
};
use crate::value::DataKind as K;

pub const ID: u16 = 5;

pub const PACKAGE: u16 = 0;
pub const PACKAGE_URI: u16 = 1;
pub const UPDATE: u16 = 2;
pub const STATE: u16 = 3;
pub const UPDATE_RESULT: u16 = 5;
pub const PKG_NAME: u16 = 6;
pub const PKG_VERSION: u16 = 7;
pub const PROTOCOL_SUPPORT: u16 = 8;
pub const DELIVERY_METHOD: u16 = 9;

pub const STATE_IDLE: i64 = 0;
pub const STATE_DOWNLOADING: i64 = 1;
pub const STATE_DOWNLOADED: i64 = 2;
pub const STATE_UPDATING: i64 = 3;

pub const RESULT_INITIAL: i64 = 0;
pub const RESULT_SUCCESS: i64 = 1;
pub const RESULT_NOT_ENOUGH_FLASH: i64 = 2;
pub const RESULT_OUT_OF_RAM: i64 = 3;
pub const RESULT_CONNECTION_LOST: i64 = 4;
pub const RESULT_INTEGRITY_FAILURE: i64 = 5;
pub const RESULT_UNSUPPORTED_PACKAGE: i64 = 6;
pub const RESULT_INVALID_URI: i64 = 7;
pub const RESULT_UPDATE_FAILED: i64 = 8;
pub const RESULT_UNSUPPORTED_PROTOCOL: i64 = 9;

pub const PROTOCOL_COAP: i64 = 0;
pub const PROTOCOL_COAPS: i64 = 1;
pub const PROTOCOL_HTTP: i64 = 2;
pub const PROTOCOL_HTTPS: i64 = 3;

pub const DELIVERY_PULL: i64 = 0;
pub const DELIVERY_PUSH: i64 = 1;
pub const DELIVERY_BOTH: i64 = 2;

pub static DEFINITION: ObjectDefinition = ObjectDefinition {
    id: ID,
    name: "Firmware Update",
    multiple: false,
    mandatory: false,
    resources: &[
        R::new(PACKAGE, "Package", K::Opaque, Write).mandatory(),
        R::new(PACKAGE_URI, "Package URI", K::String, ReadWrite).mandatory(),
        R::execute(UPDATE, "Update").mandatory(),
        R::new(STATE, "State", K::Integer, Read).mandatory(),
        R::new(UPDATE_RESULT, "Update Result", K::Integer, Read).mandatory(),
        R::new(PKG_NAME, "PkgName", K::String, Read),
        R::new(PKG_VERSION, "PkgVersion", K::String, Read),
        R::new(PROTOCOL_SUPPORT, "Firmware Update Protocol Support", K::Integer, Read).multiple(),
        R::new(DELIVERY_METHOD, "Firmware Update Delivery Method", K::Integer, Read).mandatory(),
    ],
};
