//! Standard object catalogue
//!
//! One module per supported object, each exporting its `ID`, resource id
//! constants and a `DEFINITION`.

pub mod apn;
pub mod bearer;
pub mod cellular;
pub mod connectivity;
pub mod device;
pub mod firmware;
pub mod security;
pub mod server;
pub mod software;
pub mod syslog;
pub mod wlan;

use crate::definition::ObjectDefinition;

/// Every object definition this client supports
pub fn catalogue() -> [&'static ObjectDefinition; 11] {
    [
        &security::DEFINITION,
        &server::DEFINITION,
        &device::DEFINITION,
        &connectivity::DEFINITION,
        &firmware::DEFINITION,
        &software::DEFINITION,
        &cellular::DEFINITION,
        &apn::DEFINITION,
        &wlan::DEFINITION,
        &bearer::DEFINITION,
        &syslog::DEFINITION,
    ]
}

pub fn find(id: u16) -> Option<&'static ObjectDefinition> {
    catalogue().into_iter().find(|d| d.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_catalogue_ids_unique() {
        let ids: HashSet<u16> = catalogue().iter().map(|d| d.id).collect();
        assert_eq!(ids.len(), catalogue().len());
    }

    #[test]
    fn test_resource_ids_unique_per_object() {
        for def in catalogue() {
            let ids: HashSet<u16> = def.resources.iter().map(|r| r.id).collect();
            assert_eq!(ids.len(), def.resources.len(), "object {}", def.id);
        }
    }

    #[test]
    fn test_lookup() {
        assert_eq!(find(10259).map(|d| d.name), Some("System Log"));
        assert!(find(7).is_none());
        let fw = find(firmware::ID).unwrap();
        assert!(fw.resource(firmware::UPDATE).unwrap().operations.executable());
        assert!(!fw.resource(firmware::STATE).unwrap().operations.writable());
    }
}
