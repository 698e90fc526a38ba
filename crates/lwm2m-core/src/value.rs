//! Resource values

use std::collections::BTreeMap;
use std::fmt;

use crate::error::CodecError;

/// Data kinds a resource can be declared with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    Integer,
    Float,
    String,
    Boolean,
    Opaque,
    Time,
    ObjLink,
    /// Execute-only resources carry no value
    None,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Integer => "integer",
            DataKind::Float => "float",
            DataKind::String => "string",
            DataKind::Boolean => "boolean",
            DataKind::Opaque => "opaque",
            DataKind::Time => "time",
            DataKind::ObjLink => "objlnk",
            DataKind::None => "none",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single scalar value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Opaque(Vec<u8>),
    /// Seconds since the Unix epoch
    Time(i64),
    /// (object id, instance id)
    ObjLink(u16, u16),
}

impl Value {
    pub fn kind(&self) -> DataKind {
        match self {
            Value::Integer(_) => DataKind::Integer,
            Value::Float(_) => DataKind::Float,
            Value::String(_) => DataKind::String,
            Value::Boolean(_) => DataKind::Boolean,
            Value::Opaque(_) => DataKind::Opaque,
            Value::Time(_) => DataKind::Time,
            Value::ObjLink(..) => DataKind::ObjLink,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(v) | Value::Time(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Opaque(v) => Some(v),
            Value::String(v) => Some(v.as_bytes()),
            _ => None,
        }
    }

    /// Numeric view used by observation thresholds
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) | Value::Time(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Plain-text (content format 0) representation
    pub fn to_text(&self) -> String {
        match self {
            Value::Integer(v) | Value::Time(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::String(v) => v.clone(),
            Value::Boolean(v) => if *v { "1" } else { "0" }.to_string(),
            Value::Opaque(v) => String::from_utf8_lossy(v).into_owned(),
            Value::ObjLink(o, i) => format!("{}:{}", o, i),
        }
    }

    /// Parse a plain-text payload into a value of the given kind
    pub fn from_text(kind: DataKind, resource: u16, text: &str) -> Result<Value, CodecError> {
        let text = text.trim();
        let invalid = |reason: &str| CodecError::InvalidValue {
            resource,
            reason: format!("{} ({:?})", reason, text),
        };
        match kind {
            DataKind::Integer => text
                .parse()
                .map(Value::Integer)
                .map_err(|_| invalid("not an integer")),
            DataKind::Time => text
                .parse()
                .map(Value::Time)
                .map_err(|_| invalid("not a timestamp")),
            DataKind::Float => text
                .parse()
                .map(Value::Float)
                .map_err(|_| invalid("not a float")),
            DataKind::String => Ok(Value::String(text.to_string())),
            DataKind::Boolean => match text {
                "1" | "true" => Ok(Value::Boolean(true)),
                "0" | "false" => Ok(Value::Boolean(false)),
                _ => Err(invalid("not a boolean")),
            },
            DataKind::Opaque => Ok(Value::Opaque(text.as_bytes().to_vec())),
            DataKind::ObjLink => {
                let (o, i) = text.split_once(':').ok_or_else(|| invalid("not an objlnk"))?;
                let o = o.parse().map_err(|_| invalid("bad object id"))?;
                let i = i.parse().map_err(|_| invalid("bad instance id"))?;
                Ok(Value::ObjLink(o, i))
            }
            DataKind::None => Err(invalid("resource carries no value")),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// Value of one resource: a scalar or an ordered set of resource instances
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceValue {
    Single(Value),
    Multiple(BTreeMap<u16, Value>),
}

impl ResourceValue {
    pub fn single(v: impl Into<Value>) -> Self {
        ResourceValue::Single(v.into())
    }

    /// Multiple resource with instances numbered from 0
    pub fn multiple<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        ResourceValue::Multiple(
            values
                .into_iter()
                .enumerate()
                .map(|(i, v)| (i as u16, v.into()))
                .collect(),
        )
    }

    pub fn is_multiple(&self) -> bool {
        matches!(self, ResourceValue::Multiple(_))
    }

    pub fn as_single(&self) -> Option<&Value> {
        match self {
            ResourceValue::Single(v) => Some(v),
            ResourceValue::Multiple(_) => None,
        }
    }

    /// Check every contained scalar against a declared kind
    pub fn matches_kind(&self, kind: DataKind) -> bool {
        match self {
            ResourceValue::Single(v) => v.kind() == kind,
            ResourceValue::Multiple(m) => m.values().all(|v| v.kind() == kind),
        }
    }
}

/// Resource id -> value for one object instance
pub type ResourceSet = BTreeMap<u16, ResourceValue>;

/// Instance id -> resources for one object
pub type InstanceSet = BTreeMap<u16, ResourceSet>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_parsing() {
        assert_eq!(
            Value::from_text(DataKind::Integer, 1, "300").unwrap(),
            Value::Integer(300)
        );
        assert_eq!(
            Value::from_text(DataKind::Boolean, 1, "1").unwrap(),
            Value::Boolean(true)
        );
        assert_eq!(
            Value::from_text(DataKind::ObjLink, 1, "3:0").unwrap(),
            Value::ObjLink(3, 0)
        );
        assert!(Value::from_text(DataKind::Boolean, 1, "yes").is_err());
        assert!(Value::from_text(DataKind::Integer, 1, "12a").is_err());
    }

    #[test]
    fn test_text_rendering() {
        assert_eq!(Value::Boolean(false).to_text(), "0");
        assert_eq!(Value::ObjLink(1, 2).to_text(), "1:2");
        assert_eq!(Value::Time(1_600_000_000).to_text(), "1600000000");
    }

    #[test]
    fn test_multiple_numbering() {
        let v = ResourceValue::multiple([1i64, 5]);
        match v {
            ResourceValue::Multiple(m) => {
                assert_eq!(m.get(&0), Some(&Value::Integer(1)));
                assert_eq!(m.get(&1), Some(&Value::Integer(5)));
            }
            _ => panic!("expected multiple"),
        }
    }
}
