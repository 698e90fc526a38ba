//! LwM2M object model
//!
//! This crate provides the data model shared by the client engine:
//! - Typed object and resource definitions for the supported standard objects
//! - The TLV binary codec used for multi-resource payloads
//! - The registry holding live object instances and dispatching
//!   read/write/execute/create/delete to injected capability handlers

pub mod definition;
pub mod error;
pub mod objects;
pub mod path;
pub mod registry;
pub mod tlv;
pub mod value;

pub use definition::{ObjectDefinition, Operations, ResourceDefinition};
pub use error::{CodecError, ObjectError, Result};
pub use path::Path;
pub use registry::{
    Access, ExecuteAction, FnSource, InstanceHook, ReadOutput, ReadSource, Registry, WriteMode,
};
pub use value::{DataKind, InstanceSet, ResourceSet, ResourceValue, Value};
