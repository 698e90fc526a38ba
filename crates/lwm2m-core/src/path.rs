//! `/{object}/{instance}/{resource}/{resource-instance}` paths

use std::fmt;
use std::str::FromStr;

use crate::error::ObjectError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path {
    pub object: u16,
    pub instance: Option<u16>,
    pub resource: Option<u16>,
    pub resource_instance: Option<u16>,
}

impl Path {
    pub fn object(object: u16) -> Self {
        Self {
            object,
            instance: None,
            resource: None,
            resource_instance: None,
        }
    }

    pub fn instance(object: u16, instance: u16) -> Self {
        Self {
            instance: Some(instance),
            ..Self::object(object)
        }
    }

    pub fn resource(object: u16, instance: u16, resource: u16) -> Self {
        Self {
            resource: Some(resource),
            ..Self::instance(object, instance)
        }
    }

    /// Parse URI-path segments, e.g. `["3", "0", "1"]`
    pub fn from_segments<S: AsRef<str>>(segments: &[S]) -> Result<Self, ObjectError> {
        if segments.is_empty() || segments.len() > 4 {
            return Err(ObjectError::BadRequest(format!(
                "invalid path depth {}",
                segments.len()
            )));
        }
        let mut ids = [None; 4];
        for (slot, segment) in ids.iter_mut().zip(segments) {
            let segment = segment.as_ref();
            let id = segment
                .parse::<u16>()
                .map_err(|_| ObjectError::BadRequest(format!("invalid path segment {:?}", segment)))?;
            *slot = Some(id);
        }
        Ok(Self {
            object: ids[0].unwrap_or_default(),
            instance: ids[1],
            resource: ids[2],
            resource_instance: ids[3],
        })
    }

    /// True when `other` is this path or lies below it
    pub fn contains(&self, other: &Path) -> bool {
        fn covers(outer: Option<u16>, inner: Option<u16>) -> bool {
            match outer {
                None => true,
                Some(id) => inner == Some(id),
            }
        }
        self.object == other.object
            && covers(self.instance, other.instance)
            && (self.instance.is_none() || covers(self.resource, other.resource))
            && (self.resource.is_none() || covers(self.resource_instance, other.resource_instance))
    }

    pub fn depth(&self) -> usize {
        1 + self.instance.is_some() as usize
            + self.resource.is_some() as usize
            + self.resource_instance.is_some() as usize
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.object)?;
        for id in [self.instance, self.resource, self.resource_instance]
            .into_iter()
            .flatten()
        {
            write!(f, "/{}", id)?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = ObjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<&str> = s.trim_matches('/').split('/').collect();
        Self::from_segments(&segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let p: Path = "/5/0/3".parse().unwrap();
        assert_eq!(p, Path::resource(5, 0, 3));
        assert_eq!(p.to_string(), "/5/0/3");
        assert_eq!(Path::object(12).to_string(), "/12");
        assert!("/a/0".parse::<Path>().is_err());
        assert!("/1/2/3/4/5".parse::<Path>().is_err());
    }

    #[test]
    fn test_contains() {
        let instance = Path::instance(12, 1);
        assert!(instance.contains(&Path::resource(12, 1, 0)));
        assert!(!instance.contains(&Path::resource(12, 2, 0)));
        assert!(Path::object(12).contains(&instance));
        assert!(!Path::resource(12, 1, 0).contains(&instance));
    }
}
