//! Object and resource definitions
//!
//! Definitions are immutable and built at compile time, one `static` per
//! supported object (see [`crate::objects`]).

use crate::value::DataKind;

/// Operations a resource allows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operations {
    Read,
    Write,
    ReadWrite,
    Execute,
}

impl Operations {
    pub fn readable(&self) -> bool {
        matches!(self, Operations::Read | Operations::ReadWrite)
    }

    pub fn writable(&self) -> bool {
        matches!(self, Operations::Write | Operations::ReadWrite)
    }

    pub fn executable(&self) -> bool {
        matches!(self, Operations::Execute)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceDefinition {
    pub id: u16,
    pub name: &'static str,
    pub kind: DataKind,
    pub operations: Operations,
    /// Resource holds multiple resource instances
    pub multiple: bool,
    pub mandatory: bool,
}

impl ResourceDefinition {
    /// Optional single-instance resource
    pub const fn new(id: u16, name: &'static str, kind: DataKind, operations: Operations) -> Self {
        Self {
            id,
            name,
            kind,
            operations,
            multiple: false,
            mandatory: false,
        }
    }

    pub const fn multiple(self) -> Self {
        Self {
            multiple: true,
            ..self
        }
    }

    pub const fn mandatory(self) -> Self {
        Self {
            mandatory: true,
            ..self
        }
    }

    /// Execute-only resource
    pub const fn execute(id: u16, name: &'static str) -> Self {
        Self::new(id, name, DataKind::None, Operations::Execute)
    }
}

#[derive(Debug)]
pub struct ObjectDefinition {
    pub id: u16,
    pub name: &'static str,
    /// Object allows multiple instances
    pub multiple: bool,
    pub mandatory: bool,
    pub resources: &'static [ResourceDefinition],
}

impl ObjectDefinition {
    pub fn resource(&self, id: u16) -> Option<&ResourceDefinition> {
        self.resources.iter().find(|r| r.id == id)
    }
}
