//! Software Management object (9)

use crate::definition::{
    ObjectDefinition,
    Operations::{Read, ReadWrite, Write},
    ResourceDefinition as R,
};
use crate::value::DataKind as K;

pub const ID: u16 = 9;

pub const PKG_NAME: u16 = 0;
pub const PKG_VERSION: u16 = 1;
pub const PACKAGE: u16 = 2;
pub const PACKAGE_URI: u16 = 3;
pub const INSTALL: u16 = 4;
pub const CHECKPOINT: u16 = 5;
pub const UNINSTALL: u16 = 6;
pub const UPDATE_STATE: u16 = 7;
pub const UPDATE_SUPPORTED_OBJECTS: u16 = 8;
pub const UPDATE_RESULT: u16 = 9;
pub const ACTIVATE: u16 = 10;
pub const DEACTIVATE: u16 = 11;
pub const ACTIVATION_STATE: u16 = 12;
pub const PACKAGE_SETTINGS: u16 = 13;
pub const USER_NAME: u16 = 14;
pub const PASSWORD: u16 = 15;

pub const STATE_INITIAL: i64 = 0;
pub const STATE_DOWNLOAD_STARTED: i64 = 1;
pub const STATE_DOWNLOADED: i64 = 2;
pub const STATE_DELIVERED: i64 = 3;
pub const STATE_INSTALLED: i64 = 4;

pub const RESULT_INITIAL: i64 = 0;
pub const RESULT_DOWNLOADING: i64 = 1;
pub const RESULT_INSTALLED: i64 = 2;
pub const RESULT_DOWNLOADED_VERIFIED: i64 = 3;
pub const RESULT_NOT_ENOUGH_STORAGE: i64 = 50;
pub const RESULT_OUT_OF_MEMORY: i64 = 51;
pub const RESULT_CONNECTION_LOST: i64 = 52;
pub const RESULT_INTEGRITY_FAILURE: i64 = 53;
pub const RESULT_UNSUPPORTED_PACKAGE: i64 = 54;
pub const RESULT_INVALID_URI: i64 = 56;
pub const RESULT_UPDATE_ERROR: i64 = 57;
pub const RESULT_INSTALL_FAILURE: i64 = 58;
pub const RESULT_UNINSTALL_FAILURE: i64 = 59;

pub static DEFINITION: ObjectDefinition = ObjectDefinition {
    id: ID,
    name: "LWM2M Software Management",
    multiple: true,
    mandatory: false,
    resources: &[
        R::new(PKG_NAME, "PkgName", K::String, Read).mandatory(),
        R::new(PKG_VERSION, "PkgVersion", K::String, Read).mandatory(),
        R::new(PACKAGE, "Package", K::Opaque, Write),
        R::new(PACKAGE_URI, "Package URI", K::String, Write),
        R::execute(INSTALL, "Install").mandatory(),
        R::new(CHECKPOINT, "Checkpoint", K::ObjLink, Read),
        R::execute(UNINSTALL, "Uninstall").mandatory(),
        R::new(UPDATE_STATE, "Update State", K::Integer, Read).mandatory(),
        R::new(UPDATE_SUPPORTED_OBJECTS, "Update Supported Objects", K::Boolean, ReadWrite),
        R::new(UPDATE_RESULT, "Update Result", K::Integer, Read).mandatory(),
        R::execute(ACTIVATE, "Activate").mandatory(),
        R::execute(DEACTIVATE, "Deactivate").mandatory(),
        R::new(ACTIVATION_STATE, "Activation State", K::Boolean, Read).mandatory(),
        R::new(PACKAGE_SETTINGS, "Package Settings", K::ObjLink, ReadWrite),
        R::new(USER_NAME, "User Name", K::String, Write),
        R::new(PASSWORD, "Password", K::String, Write),
    ],
};
