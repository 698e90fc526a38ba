//! System Log object (10259)

use crate::definition::{
    ObjectDefinition,
    Operations::{Read, ReadWrite},
    ResourceDefinition as R,
};
use crate::value::DataKind as K;

pub const ID: u16 = 10259;

pub const NAME: u16 = 0;
pub const READ_ALL: u16 = 1;
pub const READ: u16 = 2;
pub const ENABLED: u16 = 3;
pub const CAPTURE_LEVEL: u16 = 4;

pub static DEFINITION: ObjectDefinition = ObjectDefinition {
    id: ID,
    name: "System Log",
    multiple: false,
    mandatory: false,
    resources: &[
        R::new(NAME, "Name", K::String, Read).mandatory(),
        R::new(READ_ALL, "Read All", K::Opaque, Read).mandatory(),
        R::new(READ, "Read", K::Opaque, Read).mandatory(),
        R::new(ENABLED, "Enabled", K::Boolean, ReadWrite),
        R::new(CAPTURE_LEVEL, "Capture Level", K::Integer, ReadWrite),
    ],
};
