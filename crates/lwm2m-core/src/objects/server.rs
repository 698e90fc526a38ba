//! Server object (1)

use crate::definition::{
    ObjectDefinition,
    Operations::{Read, ReadWrite},
    ResourceDefinition as R,
};
use crate::value::DataKind as K;

pub const ID: u16 = 1;

pub const SHORT_SERVER_ID: u16 = 0;
pub const LIFETIME: u16 = 1;
pub const DEFAULT_MIN_PERIOD: u16 = 2;
pub const DEFAULT_MAX_PERIOD: u16 = 3;
pub const DISABLE: u16 = 4;
pub const DISABLE_TIMEOUT: u16 = 5;
pub const NOTIFICATION_STORING: u16 = 6;
pub const BINDING: u16 = 7;
pub const REGISTRATION_UPDATE_TRIGGER: u16 = 8;

pub static DEFINITION: ObjectDefinition = ObjectDefinition {
    id: ID,
    name: "LwM2M Server",
    multiple: true,
    mandatory: true,
    resources: &[
        R::new(SHORT_SERVER_ID, "Short Server ID", K::Integer, Read).mandatory(),
        R::new(LIFETIME, "Lifetime", K::Integer, ReadWrite).mandatory(),
        R::new(DEFAULT_MIN_PERIOD, "Default Minimum Period", K::Integer, ReadWrite),
        R::new(DEFAULT_MAX_PERIOD, "Default Maximum Period", K::Integer, ReadWrite),
        R::execute(DISABLE, "Disable"),
        R::new(DISABLE_TIMEOUT, "Disable Timeout", K::Integer, ReadWrite),
        R::new(NOTIFICATION_STORING, "Notification Storing When Disabled or Offline", K::Boolean, ReadWrite)
            .mandatory(),
        R::new(BINDING, "Binding", K::String, ReadWrite).mandatory(),
        R::execute(REGISTRATION_UPDATE_TRIGGER, "Registration Update Trigger").mandatory(),
    ],
};
