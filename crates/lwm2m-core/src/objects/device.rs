//! Device object (3)

use crate::definition::{
    ObjectDefinition,
    Operations::{Read, ReadWrite},
    ResourceDefinition as R,
};
use crate::value::DataKind as K;

pub const ID: u16 = 3;

pub const MANUFACTURER: u16 = 0;
pub const MODEL_NUMBER: u16 = 1;
pub const SERIAL_NUMBER: u16 = 2;
pub const FIRMWARE_VERSION: u16 = 3;
pub const REBOOT: u16 = 4;
pub const FACTORY_RESET: u16 = 5;
pub const AVAILABLE_POWER_SOURCES: u16 = 6;
pub const POWER_SOURCE_VOLTAGE: u16 = 7;
pub const POWER_SOURCE_CURRENT: u16 = 8;
pub const BATTERY_LEVEL: u16 = 9;
pub const MEMORY_FREE: u16 = 10;
pub const ERROR_CODE: u16 = 11;
pub const RESET_ERROR_CODE: u16 = 12;
pub const CURRENT_TIME: u16 = 13;
pub const UTC_OFFSET: u16 = 14;
pub const TIMEZONE: u16 = 15;
pub const SUPPORTED_BINDINGS: u16 = 16;
pub const DEVICE_TYPE: u16 = 17;
pub const HARDWARE_VERSION: u16 = 18;
pub const SOFTWARE_VERSION: u16 = 19;
pub const BATTERY_STATUS: u16 = 20;
pub const MEMORY_TOTAL: u16 = 21;

/// Available power source codes
pub const POWER_DC: i64 = 0;
pub const POWER_INTERNAL_BATTERY: i64 = 1;
pub const POWER_EXTERNAL_BATTERY: i64 = 2;
pub const POWER_ETHERNET: i64 = 4;
pub const POWER_USB: i64 = 5;

pub static DEFINITION: ObjectDefinition = ObjectDefinition {
    id: ID,
    name: "Device",
    multiple: false,
    mandatory: true,
    resources: &[
        R::new(MANUFACTURER, "Manufacturer", K::String, Read),
        R::new(MODEL_NUMBER, "Model Number", K::String, Read),
        R::new(SERIAL_NUMBER, "Serial Number", K::String, Read),
        R::new(FIRMWARE_VERSION, "Firmware Version", K::String, Read),
        R::execute(REBOOT, "Reboot").mandatory(),
        R::execute(FACTORY_RESET, "Factory Reset"),
        R::new(AVAILABLE_POWER_SOURCES, "Available Power Sources", K::Integer, Read).multiple(),
        R::new(POWER_SOURCE_VOLTAGE, "Power Source Voltage", K::Integer, Read).multiple(),
        R::new(POWER_SOURCE_CURRENT, "Power Source Current", K::Integer, Read).multiple(),
        R::new(BATTERY_LEVEL, "Battery Level", K::Integer, Read),
        R::new(MEMORY_FREE, "Memory Free", K::Integer, Read),
        R::new(ERROR_CODE, "Error Code", K::Integer, Read)
            .multiple()
            .mandatory(),
        R::execute(RESET_ERROR_CODE, "Reset Error Code"),
        R::new(CURRENT_TIME, "Current Time", K::Time, ReadWrite),
        R::new(UTC_OFFSET, "UTC Offset", K::String, ReadWrite),
        R::new(TIMEZONE, "Timezone", K::String, ReadWrite),
        R::new(SUPPORTED_BINDINGS, "Supported Binding and Modes", K::String, Read).mandatory(),
        R::new(DEVICE_TYPE, "Device Type", K::String, Read),
        R::new(HARDWARE_VERSION, "Hardware Version", K::String, Read),
        R::new(SOFTWARE_VERSION, "Software Version", K::String, Read),
        R::new(BATTERY_STATUS, "Battery Status", K::Integer, Read),
        R::new(MEMORY_TOTAL, "Memory Total", K::Integer, Read),
    ],
};
