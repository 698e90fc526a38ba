//! LwM2M TLV codec (content format 11542)
//!
//! Each record starts with a type byte:
//!
//! ```text
//!  7 6   5    4 3   2 1 0
//! [kind][id16][len][len value]
//! ```
//!
//! - `kind`: 00 object instance, 01 resource instance, 10 multiple resource,
//!   11 resource with value
//! - `id16`: identifier is 16 bits instead of 8
//! - `len`: 0 means the value length is in bits 2-0, otherwise a 1, 2 or
//!   3 byte length field follows the identifier
//!
//! Decoding validates the whole payload against an [`ObjectDefinition`]
//! before returning anything, so a malformed record never yields a partial
//! result.

use std::collections::BTreeMap;

use crate::definition::{ObjectDefinition, ResourceDefinition};
use crate::error::CodecError;
use crate::value::{DataKind, ResourceSet, ResourceValue, Value};

/// Identifier kind carried in the type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlvKind {
    ObjectInstance,
    ResourceInstance,
    MultipleResource,
    Resource,
}

impl TlvKind {
    fn bits(self) -> u8 {
        match self {
            TlvKind::ObjectInstance => 0b00,
            TlvKind::ResourceInstance => 0b01,
            TlvKind::MultipleResource => 0b10,
            TlvKind::Resource => 0b11,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => TlvKind::ObjectInstance,
            0b01 => TlvKind::ResourceInstance,
            0b10 => TlvKind::MultipleResource,
            _ => TlvKind::Resource,
        }
    }
}

/// A raw record borrowed from the input buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub kind: TlvKind,
    pub id: u16,
    pub value: &'a [u8],
}

const MAX_LENGTH: usize = 0xFF_FFFF;

// =============================================================================
// Encoding
// =============================================================================

fn write_header(out: &mut Vec<u8>, kind: TlvKind, id: u16, len: usize) -> Result<(), CodecError> {
    if len > MAX_LENGTH {
        return Err(CodecError::TooLarge(len));
    }
    let mut type_byte = kind.bits() << 6;
    if id > 0xFF {
        type_byte |= 0b0010_0000;
    }
    let length_bytes = if len < 8 {
        type_byte |= len as u8;
        0
    } else if len <= 0xFF {
        type_byte |= 0b01 << 3;
        1
    } else if len <= 0xFFFF {
        type_byte |= 0b10 << 3;
        2
    } else {
        type_byte |= 0b11 << 3;
        3
    };
    out.push(type_byte);
    if id > 0xFF {
        out.extend_from_slice(&id.to_be_bytes());
    } else {
        out.push(id as u8);
    }
    let len_be = (len as u32).to_be_bytes();
    out.extend_from_slice(&len_be[4 - length_bytes..]);
    Ok(())
}

fn write_record(out: &mut Vec<u8>, kind: TlvKind, id: u16, value: &[u8]) -> Result<(), CodecError> {
    write_header(out, kind, id, value.len())?;
    out.extend_from_slice(value);
    Ok(())
}

/// Smallest big-endian two's complement encoding out of 1, 2, 4 or 8 bytes
fn encode_integer(v: i64) -> Vec<u8> {
    if let Ok(b) = i8::try_from(v) {
        b.to_be_bytes().to_vec()
    } else if let Ok(s) = i16::try_from(v) {
        s.to_be_bytes().to_vec()
    } else if let Ok(w) = i32::try_from(v) {
        w.to_be_bytes().to_vec()
    } else {
        v.to_be_bytes().to_vec()
    }
}

/// Raw value bytes for a scalar
pub fn encode_value(value: &Value) -> Vec<u8> {
    match value {
        Value::Integer(v) | Value::Time(v) => encode_integer(*v),
        Value::Float(v) => v.to_be_bytes().to_vec(),
        Value::String(s) => s.as_bytes().to_vec(),
        Value::Boolean(b) => vec![*b as u8],
        Value::Opaque(bytes) => bytes.clone(),
        Value::ObjLink(object, instance) => {
            let mut out = object.to_be_bytes().to_vec();
            out.extend_from_slice(&instance.to_be_bytes());
            out
        }
    }
}

/// Encode one resource record (single value or multiple-resource array)
pub fn encode_resource(id: u16, value: &ResourceValue) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    match value {
        ResourceValue::Single(v) => write_record(&mut out, TlvKind::Resource, id, &encode_value(v))?,
        ResourceValue::Multiple(instances) => {
            let mut inner = Vec::new();
            for (instance, v) in instances {
                write_record(&mut inner, TlvKind::ResourceInstance, *instance, &encode_value(v))?;
            }
            write_record(&mut out, TlvKind::MultipleResource, id, &inner)?;
        }
    }
    Ok(out)
}

/// Encode a bare resource list (no object-instance wrapper)
pub fn encode_resources(resources: &ResourceSet) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    for (id, value) in resources {
        out.extend(encode_resource(*id, value)?);
    }
    Ok(out)
}

/// Encode one object instance with its resources nested under it
pub fn encode_instance(instance: u16, resources: &ResourceSet) -> Result<Vec<u8>, CodecError> {
    let inner = encode_resources(resources)?;
    let mut out = Vec::with_capacity(inner.len() + 5);
    write_record(&mut out, TlvKind::ObjectInstance, instance, &inner)?;
    Ok(out)
}

/// Encode several object instances
pub fn encode_instances(instances: &BTreeMap<u16, ResourceSet>) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    for (id, resources) in instances {
        out.extend(encode_instance(*id, resources)?);
    }
    Ok(out)
}

// =============================================================================
// Decoding
// =============================================================================

fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], CodecError> {
    let available = buf.len() - *pos;
    if n > available {
        return Err(CodecError::Truncated {
            needed: n,
            available,
        });
    }
    let slice = &buf[*pos..*pos + n];
    *pos += n;
    Ok(slice)
}

/// Split a buffer into its top-level records
pub fn parse_records(buf: &[u8]) -> Result<Vec<Record<'_>>, CodecError> {
    let mut records = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let type_byte = take(buf, &mut pos, 1)?[0];
        let kind = TlvKind::from_bits(type_byte >> 6);
        let id = if type_byte & 0b0010_0000 != 0 {
            let b = take(buf, &mut pos, 2)?;
            u16::from_be_bytes([b[0], b[1]])
        } else {
            take(buf, &mut pos, 1)?[0] as u16
        };
        let length_type = (type_byte >> 3) & 0b11;
        let len = if length_type == 0 {
            (type_byte & 0b111) as usize
        } else {
            take(buf, &mut pos, length_type as usize)?
                .iter()
                .fold(0usize, |acc, b| (acc << 8) | *b as usize)
        };
        let value = take(buf, &mut pos, len)?;
        records.push(Record { kind, id, value });
    }
    Ok(records)
}

fn decode_integer(def: &ResourceDefinition, bytes: &[u8]) -> Result<i64, CodecError> {
    match bytes.len() {
        1 => Ok(i8::from_be_bytes([bytes[0]]) as i64),
        2 => Ok(i16::from_be_bytes([bytes[0], bytes[1]]) as i64),
        4 => Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64),
        8 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(bytes);
            Ok(i64::from_be_bytes(b))
        }
        len => Err(CodecError::InvalidLength {
            resource: def.id,
            kind: def.kind.as_str(),
            len,
        }),
    }
}

/// Decode raw value bytes according to the resource's declared kind
pub fn decode_value(def: &ResourceDefinition, bytes: &[u8]) -> Result<Value, CodecError> {
    let invalid_length = || CodecError::InvalidLength {
        resource: def.id,
        kind: def.kind.as_str(),
        len: bytes.len(),
    };
    match def.kind {
        DataKind::Integer => decode_integer(def, bytes).map(Value::Integer),
        DataKind::Time => decode_integer(def, bytes).map(Value::Time),
        DataKind::Float => match bytes.len() {
            4 => Ok(Value::Float(
                f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
            )),
            8 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(bytes);
                Ok(Value::Float(f64::from_be_bytes(b)))
            }
            _ => Err(invalid_length()),
        },
        DataKind::Boolean => match bytes {
            [0] => Ok(Value::Boolean(false)),
            [1] => Ok(Value::Boolean(true)),
            [_] => Err(CodecError::InvalidValue {
                resource: def.id,
                reason: format!("boolean byte {:#04x}", bytes[0]),
            }),
            _ => Err(invalid_length()),
        },
        DataKind::String => String::from_utf8(bytes.to_vec())
            .map(Value::String)
            .map_err(|_| CodecError::InvalidValue {
                resource: def.id,
                reason: "string is not valid UTF-8".to_string(),
            }),
        DataKind::Opaque => Ok(Value::Opaque(bytes.to_vec())),
        DataKind::ObjLink => match bytes {
            [a, b, c, d] => Ok(Value::ObjLink(
                u16::from_be_bytes([*a, *b]),
                u16::from_be_bytes([*c, *d]),
            )),
            _ => Err(invalid_length()),
        },
        DataKind::None => Err(CodecError::InvalidValue {
            resource: def.id,
            reason: "executable resources carry no value".to_string(),
        }),
    }
}

fn lookup<'d>(object: &'d ObjectDefinition, id: u16) -> Result<&'d ResourceDefinition, CodecError> {
    object.resource(id).ok_or(CodecError::UnknownResource {
        object: object.id,
        resource: id,
    })
}

fn decode_resource_record(
    object: &ObjectDefinition,
    record: &Record<'_>,
) -> Result<(u16, ResourceValue), CodecError> {
    let def = lookup(object, record.id)?;
    match record.kind {
        TlvKind::Resource => {
            if def.multiple {
                return Err(CodecError::UnexpectedRecord(format!(
                    "single value for multiple resource {}",
                    def.id
                )));
            }
            Ok((def.id, ResourceValue::Single(decode_value(def, record.value)?)))
        }
        TlvKind::MultipleResource => {
            if !def.multiple {
                return Err(CodecError::UnexpectedRecord(format!(
                    "resource instances for single resource {}",
                    def.id
                )));
            }
            let mut instances = BTreeMap::new();
            for inner in parse_records(record.value)? {
                if inner.kind != TlvKind::ResourceInstance {
                    return Err(CodecError::UnexpectedRecord(format!(
                        "{:?} inside multiple resource {}",
                        inner.kind, def.id
                    )));
                }
                instances.insert(inner.id, decode_value(def, inner.value)?);
            }
            Ok((def.id, ResourceValue::Multiple(instances)))
        }
        kind => Err(CodecError::UnexpectedRecord(format!(
            "{:?} where a resource was expected",
            kind
        ))),
    }
}

fn decode_resource_records(
    object: &ObjectDefinition,
    records: &[Record<'_>],
) -> Result<ResourceSet, CodecError> {
    let mut set = ResourceSet::new();
    for record in records {
        let (id, value) = decode_resource_record(object, record)?;
        set.insert(id, value);
    }
    Ok(set)
}

/// Decode a payload into object instances
///
/// Top-level object-instance records yield one entry each, with their id.
/// A bare list of resource records yields a single entry with no id.
pub fn decode_instances(
    bytes: &[u8],
    object: &ObjectDefinition,
) -> Result<Vec<(Option<u16>, ResourceSet)>, CodecError> {
    let records = parse_records(bytes)?;
    if records.iter().all(|r| r.kind == TlvKind::ObjectInstance) && !records.is_empty() {
        let mut out = Vec::with_capacity(records.len());
        for record in &records {
            let inner = parse_records(record.value)?;
            out.push((Some(record.id), decode_resource_records(object, &inner)?));
        }
        return Ok(out);
    }
    if records.iter().any(|r| r.kind == TlvKind::ObjectInstance) {
        return Err(CodecError::UnexpectedRecord(
            "object instance mixed with resources".to_string(),
        ));
    }
    Ok(vec![(None, decode_resource_records(object, &records)?)])
}

/// Decode a payload addressed at one instance
///
/// Accepts either bare resource records or a single object-instance wrapper
/// whose id must equal `instance` when given.
pub fn decode_resources(
    bytes: &[u8],
    object: &ObjectDefinition,
    instance: Option<u16>,
) -> Result<ResourceSet, CodecError> {
    let mut decoded = decode_instances(bytes, object)?;
    if decoded.len() != 1 {
        return Err(CodecError::UnexpectedRecord(format!(
            "{} object instances where one was expected",
            decoded.len()
        )));
    }
    let (id, set) = decoded.remove(0);
    if let (Some(found), Some(expected)) = (id, instance) {
        if found != expected {
            return Err(CodecError::UnexpectedRecord(format!(
                "object instance {} addressed as {}",
                found, expected
            )));
        }
    }
    Ok(set)
}

/// Decode a single resource payload (`/o/i/r` write)
pub fn decode_resource(
    bytes: &[u8],
    object: &ObjectDefinition,
    resource: u16,
) -> Result<ResourceValue, CodecError> {
    let set = decode_resources(bytes, object, None)?;
    match (set.len(), set.into_iter().next()) {
        (1, Some((id, value))) if id == resource => Ok(value),
        (_, Some((id, _))) => Err(CodecError::UnexpectedRecord(format!(
            "resource {} addressed as {}",
            id, resource
        ))),
        _ => Err(CodecError::UnexpectedRecord("empty payload".to_string())),
    }
}
