//! Object registry
//!
//! Holds every [`ObjectDefinition`] and the live object instances, and
//! dispatches read/write/execute/create/delete purely by
//! (object, instance, resource) lookup. Host specific behaviour is injected
//! as capability handlers:
//! - [`ReadSource`]: computed value for a resource, queried at read time
//! - [`ExecuteAction`]: side effect of an executable resource
//! - [`InstanceHook`]: per-object validation and application of writes
//!
//! The registry is owned by a single event loop and takes `&mut self` for
//! mutations, so it carries no internal locking.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::definition::{ObjectDefinition, ResourceDefinition};
use crate::error::{ObjectError, Result};
use crate::objects::{self, security};
use crate::path::Path;
use crate::value::{DataKind, InstanceSet, ResourceSet, ResourceValue, Value};

/// Computed resource value, sourced from the host at read time
#[async_trait]
pub trait ReadSource: Send + Sync {
    async fn read(&self, instance: u16) -> Result<ResourceValue>;

    /// The value last read reached the server in full. Sources that hand
    /// out a one-shot snapshot release it here.
    async fn delivered(&self, _instance: u16) {}
}

/// Side effect bound to an executable resource
#[async_trait]
pub trait ExecuteAction: Send + Sync {
    async fn execute(&self, instance: u16, argument: &[u8]) -> Result<()>;
}

/// Per-object hook around instance changes
pub trait InstanceHook: Send + Sync {
    /// Called with the complete proposed instance before a write or create
    /// is committed. An error rejects the whole operation.
    fn validate(&self, _instance: u16, _resources: &ResourceSet) -> Result<()> {
        Ok(())
    }

    /// Called after a write or create has been committed
    fn applied(&self, _instance: u16, _resources: &ResourceSet) {}

    fn deleted(&self, _instance: u16) {}
}

/// [`ReadSource`] backed by a plain closure
pub struct FnSource<F>(F);

impl<F> FnSource<F>
where
    F: Fn(u16) -> Result<ResourceValue> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> ReadSource for FnSource<F>
where
    F: Fn(u16) -> Result<ResourceValue> + Send + Sync,
{
    async fn read(&self, instance: u16) -> Result<ResourceValue> {
        (self.0)(instance)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Omitted optional resources are cleared
    Replace,
    /// Omitted resources are left untouched
    PartialUpdate,
}

/// Who is performing an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Server,
    /// Bootstrap server writes ignore the per-resource operation flags
    Bootstrap,
}

/// Result of a read, shaped by the depth of the requested path
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutput {
    Object(InstanceSet),
    Instance(u16, ResourceSet),
    Resource(u16, ResourceValue),
    ResourceInstance(u16, u16, Value),
}

pub struct Registry {
    definitions: BTreeMap<u16, &'static ObjectDefinition>,
    instances: BTreeMap<u16, BTreeMap<u16, ResourceSet>>,
    sources: HashMap<(u16, u16), Arc<dyn ReadSource>>,
    actions: HashMap<(u16, u16), Arc<dyn ExecuteAction>>,
    hooks: HashMap<u16, Arc<dyn InstanceHook>>,
    read_timeout: Duration,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Empty registry with no object definitions
    pub fn new() -> Self {
        Self {
            definitions: BTreeMap::new(),
            instances: BTreeMap::new(),
            sources: HashMap::new(),
            actions: HashMap::new(),
            hooks: HashMap::new(),
            read_timeout: Duration::from_secs(2),
        }
    }

    /// Registry knowing every object of the standard catalogue
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for def in objects::catalogue() {
            registry.register_object(def);
        }
        registry
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn register_object(&mut self, def: &'static ObjectDefinition) {
        self.definitions.insert(def.id, def);
        self.instances.entry(def.id).or_default();
    }

    pub fn set_source(&mut self, object: u16, resource: u16, source: Arc<dyn ReadSource>) {
        self.sources.insert((object, resource), source);
    }

    pub fn set_action(&mut self, object: u16, resource: u16, action: Arc<dyn ExecuteAction>) {
        self.actions.insert((object, resource), action);
    }

    pub fn set_hook(&mut self, object: u16, hook: Arc<dyn InstanceHook>) {
        self.hooks.insert(object, hook);
    }

    // =========================================================================
    // Local (client side) access
    // =========================================================================

    pub fn definition(&self, object: u16) -> Option<&'static ObjectDefinition> {
        self.definitions.get(&object).copied()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &'static ObjectDefinition> + '_ {
        self.definitions.values().copied()
    }

    pub fn instance_ids(&self, object: u16) -> Vec<u16> {
        self.instances
            .get(&object)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn instance(&self, object: u16, instance: u16) -> Option<&ResourceSet> {
        self.instances.get(&object).and_then(|m| m.get(&instance))
    }

    /// Stored value of a resource, ignoring read sources and access flags
    pub fn value(&self, object: u16, instance: u16, resource: u16) -> Option<&ResourceValue> {
        self.instance(object, instance).and_then(|r| r.get(&resource))
    }

    /// Add or replace an instance without access checks
    pub fn add_instance(&mut self, object: u16, instance: u16, resources: ResourceSet) -> Result<()> {
        let def = self.require_definition(object)?;
        check_values(def, &resources, Access::Bootstrap)?;
        self.instances
            .entry(object)
            .or_default()
            .insert(instance, resources);
        Ok(())
    }

    /// Set one stored value without access checks
    ///
    /// Returns whether the value changed.
    pub fn set_value(
        &mut self,
        object: u16,
        instance: u16,
        resource: u16,
        value: ResourceValue,
    ) -> Result<bool> {
        let def = self.require_definition(object)?;
        let rdef = require_resource(def, resource)?;
        check_value(rdef, &value)?;
        let resources = self
            .instances
            .get_mut(&object)
            .and_then(|m| m.get_mut(&instance))
            .ok_or_else(|| ObjectError::NotFound(Path::instance(object, instance).to_string()))?;
        let changed = resources.get(&resource) != Some(&value);
        resources.insert(resource, value);
        Ok(changed)
    }

    /// Object/instance links for the Register payload
    ///
    /// The Security object is never announced.
    pub fn registration_links(&self) -> String {
        let mut links = Vec::new();
        for (object, instances) in &self.instances {
            if *object == security::ID {
                continue;
            }
            if instances.is_empty() {
                links.push(format!("</{}>", object));
            } else {
                for instance in instances.keys() {
                    links.push(format!("</{}/{}>", object, instance));
                }
            }
        }
        links.join(",")
    }

    // =========================================================================
    // Server operations
    // =========================================================================

    pub async fn read(&self, path: &Path) -> Result<ReadOutput> {
        let def = self.require_definition(path.object)?;
        let Some(instance) = path.instance else {
            let ids = self.instance_ids(path.object);
            if ids.len() > 1 {
                return Err(ObjectError::MethodNotAllowed(format!(
                    "{} has {} instances, read them individually",
                    path,
                    ids.len()
                )));
            }
            let mut out = InstanceSet::new();
            for id in ids {
                out.insert(id, self.read_instance(def, id).await?);
            }
            return Ok(ReadOutput::Object(out));
        };
        self.require_instance(path.object, instance)?;

        let Some(resource) = path.resource else {
            let resources = self.read_instance(def, instance).await?;
            return Ok(ReadOutput::Instance(instance, resources));
        };
        let rdef = require_resource(def, resource)?;
        if !rdef.operations.readable() {
            return Err(ObjectError::MethodNotAllowed(format!("{} is not readable", path)));
        }
        let value = self
            .resource_value(path.object, instance, rdef)
            .await?
            .ok_or_else(|| ObjectError::NotFound(path.to_string()))?;

        match (path.resource_instance, value) {
            (None, value) => Ok(ReadOutput::Resource(resource, value)),
            (Some(ri), ResourceValue::Multiple(mut values)) => values
                .remove(&ri)
                .map(|v| ReadOutput::ResourceInstance(resource, ri, v))
                .ok_or_else(|| ObjectError::NotFound(path.to_string())),
            (Some(_), ResourceValue::Single(_)) => Err(ObjectError::BadRequest(format!(
                "{} is not a multiple resource",
                path
            ))),
        }
    }

    async fn read_instance(&self, def: &ObjectDefinition, instance: u16) -> Result<ResourceSet> {
        let mut out = ResourceSet::new();
        for rdef in def.resources.iter().filter(|r| r.operations.readable()) {
            if let Some(value) = self.resource_value(def.id, instance, rdef).await? {
                out.insert(rdef.id, value);
            }
        }
        Ok(out)
    }

    async fn resource_value(
        &self,
        object: u16,
        instance: u16,
        rdef: &ResourceDefinition,
    ) -> Result<Option<ResourceValue>> {
        let Some(source) = self.sources.get(&(object, rdef.id)) else {
            return Ok(self.value(object, instance, rdef.id).cloned());
        };
        let path = Path::resource(object, instance, rdef.id);
        match tokio::time::timeout(self.read_timeout, source.read(instance)).await {
            Ok(Ok(value)) => {
                check_value(rdef, &value)?;
                Ok(Some(value))
            }
            Ok(Err(ObjectError::NotFound(_))) => Ok(None),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(path = %path, timeout_ms = self.read_timeout.as_millis() as u64, "Read source timed out");
                Err(ObjectError::Timeout(path.to_string()))
            }
        }
    }

    /// Report a completed read of `path` to the sources it covers
    pub async fn delivered(&self, path: &Path) {
        let Some(def) = self.definition(path.object) else {
            return;
        };
        let instances = match path.instance {
            Some(instance) => vec![instance],
            None => self.instance_ids(path.object),
        };
        for instance in instances {
            for rdef in def.resources.iter().filter(|r| path.resource.map_or(true, |id| id == r.id)) {
                if let Some(source) = self.sources.get(&(path.object, rdef.id)) {
                    source.delivered(instance).await;
                }
            }
        }
    }

    /// Write resources of an existing instance
    ///
    /// The whole write is validated before anything is committed. Returns
    /// the ids of resources whose value changed.
    pub fn write(
        &mut self,
        object: u16,
        instance: u16,
        values: ResourceSet,
        mode: WriteMode,
        access: Access,
    ) -> Result<Vec<u16>> {
        let def = self.require_definition(object)?;
        check_values(def, &values, access)?;
        let current = self
            .instance(object, instance)
            .ok_or_else(|| ObjectError::NotFound(Path::instance(object, instance).to_string()))?;

        let mut next: ResourceSet = match mode {
            WriteMode::PartialUpdate => current.clone(),
            WriteMode::Replace => current
                .iter()
                .filter(|(id, _)| {
                    def.resource(**id).map_or(true, |r| {
                        r.mandatory || (access == Access::Server && !r.operations.writable())
                    })
                })
                .map(|(id, v)| (*id, v.clone()))
                .collect(),
        };
        next.extend(values);

        if let Some(hook) = self.hooks.get(&object) {
            hook.validate(instance, &next)?;
        }

        let changed = changed_resources(current, &next);
        debug!(object, instance, ?mode, changed = ?changed, "Instance written");
        self.instances
            .entry(object)
            .or_default()
            .insert(instance, next);
        if let (Some(hook), Some(resources)) = (self.hooks.get(&object), self.instance(object, instance)) {
            hook.applied(instance, resources);
        }
        Ok(changed)
    }

    /// Create an instance of a multiple-instance object
    ///
    /// Without a requested id the new instance gets the highest existing id
    /// plus one.
    pub fn create(
        &mut self,
        object: u16,
        requested: Option<u16>,
        values: ResourceSet,
        access: Access,
    ) -> Result<u16> {
        let def = self.require_definition(object)?;
        if !def.multiple {
            return Err(ObjectError::BadRequest(format!(
                "object {} is single-instance",
                object
            )));
        }
        check_values(def, &values, access)?;
        let existing = self.instance_ids(object);
        let id = match requested {
            Some(id) if existing.contains(&id) => {
                return Err(ObjectError::BadRequest(format!(
                    "{} already exists",
                    Path::instance(object, id)
                )))
            }
            Some(id) => id,
            None => match existing.last() {
                Some(max) => max.checked_add(1).ok_or_else(|| {
                    ObjectError::BadRequest(format!("object {} has no free instance id", object))
                })?,
                None => 0,
            },
        };
        if let Some(hook) = self.hooks.get(&object) {
            hook.validate(id, &values)?;
        }
        self.instances.entry(object).or_default().insert(id, values);
        if let (Some(hook), Some(resources)) = (self.hooks.get(&object), self.instance(object, id)) {
            hook.applied(id, resources);
        }
        debug!(object, instance = id, "Instance created");
        Ok(id)
    }

    /// Delete an instance of a multiple-instance object
    pub fn delete(&mut self, object: u16, instance: u16) -> Result<()> {
        let def = self.require_definition(object)?;
        if !def.multiple {
            return Err(ObjectError::MethodNotAllowed(format!(
                "object {} is single-instance",
                object
            )));
        }
        self.require_instance(object, instance)?;
        self.remove_instance(object, instance);
        Ok(())
    }

    /// Bootstrap Delete of `/`, `/{object}` or `/{object}/{instance}`
    ///
    /// Deleting `/` clears the Security and Server objects. The bootstrap
    /// server's own Security instance is always kept. Returns the deleted
    /// instance paths.
    pub fn bootstrap_delete(&mut self, path: Option<&Path>) -> Result<Vec<Path>> {
        let targets: Vec<(u16, u16)> = match path {
            None => [security::ID, objects::server::ID]
                .into_iter()
                .flat_map(|o| self.instance_ids(o).into_iter().map(move |i| (o, i)))
                .collect(),
            Some(p) => {
                let def = self.require_definition(p.object)?;
                if !def.multiple {
                    return Err(ObjectError::BadRequest(format!(
                        "object {} cannot be deleted",
                        p.object
                    )));
                }
                match p.instance {
                    Some(i) => vec![(p.object, i)],
                    None => self
                        .instance_ids(p.object)
                        .into_iter()
                        .map(|i| (p.object, i))
                        .collect(),
                }
            }
        };

        let mut deleted = Vec::new();
        for (object, instance) in targets {
            if object == security::ID && self.is_bootstrap_security(instance) {
                continue;
            }
            if self.remove_instance(object, instance) {
                deleted.push(Path::instance(object, instance));
            }
        }
        Ok(deleted)
    }

    pub async fn execute(
        &self,
        object: u16,
        instance: u16,
        resource: u16,
        argument: &[u8],
    ) -> Result<()> {
        let def = self.require_definition(object)?;
        let rdef = require_resource(def, resource)?;
        let path = Path::resource(object, instance, resource);
        if !rdef.operations.executable() {
            return Err(ObjectError::MethodNotAllowed(format!("{} is not executable", path)));
        }
        self.require_instance(object, instance)?;
        let action = self
            .actions
            .get(&(object, resource))
            .ok_or_else(|| ObjectError::MethodNotAllowed(format!("{} has no action", path)))?;
        match tokio::time::timeout(self.read_timeout, action.execute(instance, argument)).await {
            Ok(result) => result,
            Err(_) => Err(ObjectError::Timeout(path.to_string())),
        }
    }

    /// Paths reported by Discover on `path`
    pub fn discover(&self, path: &Path) -> Result<Vec<Path>> {
        let def = self.require_definition(path.object)?;
        let mut out = Vec::new();
        match (path.instance, path.resource) {
            (None, _) => {
                out.push(Path::object(path.object));
                for instance in self.instance_ids(path.object) {
                    out.push(Path::instance(path.object, instance));
                    out.extend(self.present_resources(def, instance));
                }
            }
            (Some(instance), None) => {
                self.require_instance(path.object, instance)?;
                out.push(Path::instance(path.object, instance));
                out.extend(self.present_resources(def, instance));
            }
            (Some(instance), Some(resource)) => {
                self.require_instance(path.object, instance)?;
                require_resource(def, resource)?;
                out.push(Path::resource(path.object, instance, resource));
            }
        }
        Ok(out)
    }

    fn present_resources(&self, def: &ObjectDefinition, instance: u16) -> Vec<Path> {
        def.resources
            .iter()
            .filter(|r| {
                self.value(def.id, instance, r.id).is_some()
                    || self.sources.contains_key(&(def.id, r.id))
                    || self.actions.contains_key(&(def.id, r.id))
            })
            .map(|r| Path::resource(def.id, instance, r.id))
            .collect()
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn require_definition(&self, object: u16) -> Result<&'static ObjectDefinition> {
        self.definition(object)
            .ok_or_else(|| ObjectError::NotFound(Path::object(object).to_string()))
    }

    fn require_instance(&self, object: u16, instance: u16) -> Result<()> {
        self.instance(object, instance)
            .map(|_| ())
            .ok_or_else(|| ObjectError::NotFound(Path::instance(object, instance).to_string()))
    }

    fn remove_instance(&mut self, object: u16, instance: u16) -> bool {
        let removed = self
            .instances
            .get_mut(&object)
            .and_then(|m| m.remove(&instance))
            .is_some();
        if removed {
            if let Some(hook) = self.hooks.get(&object) {
                hook.deleted(instance);
            }
            debug!(object, instance, "Instance deleted");
        }
        removed
    }

    fn is_bootstrap_security(&self, instance: u16) -> bool {
        matches!(
            self.value(security::ID, instance, security::BOOTSTRAP_SERVER),
            Some(ResourceValue::Single(Value::Boolean(true)))
        )
    }
}

fn require_resource(def: &ObjectDefinition, resource: u16) -> Result<&ResourceDefinition> {
    def.resource(resource)
        .ok_or_else(|| ObjectError::NotFound(format!("/{}/*/{}", def.id, resource)))
}

fn check_value(rdef: &ResourceDefinition, value: &ResourceValue) -> Result<()> {
    if rdef.kind == DataKind::None {
        return Err(ObjectError::MethodNotAllowed(format!(
            "resource {} is executable",
            rdef.id
        )));
    }
    if value.is_multiple() != rdef.multiple {
        return Err(ObjectError::Value(format!(
            "resource {} multiplicity mismatch",
            rdef.id
        )));
    }
    if !value.matches_kind(rdef.kind) {
        return Err(ObjectError::Value(format!(
            "resource {} expects {}",
            rdef.id, rdef.kind
        )));
    }
    Ok(())
}

fn check_values(def: &ObjectDefinition, values: &ResourceSet, access: Access) -> Result<()> {
    for (id, value) in values {
        let rdef = require_resource(def, *id)?;
        if access == Access::Server && !rdef.operations.writable() {
            return Err(ObjectError::MethodNotAllowed(format!(
                "/{}/*/{} is not writable",
                def.id, id
            )));
        }
        check_value(rdef, value)?;
    }
    Ok(())
}

fn changed_resources(before: &ResourceSet, after: &ResourceSet) -> Vec<u16> {
    let mut ids: Vec<u16> = after
        .iter()
        .filter(|(id, v)| before.get(id) != Some(v))
        .map(|(id, _)| *id)
        .collect();
    ids.extend(before.keys().filter(|id| !after.contains_key(id)));
    ids.sort_unstable();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{device, server, wlan};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl Counter {
        fn bump(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn get(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn wlan_profile(ssid: &str) -> ResourceSet {
        let mut set = ResourceSet::new();
        set.insert(wlan::INTERFACE_NAME, ResourceValue::single("wlan0"));
        set.insert(wlan::ENABLE, ResourceValue::single(true));
        set.insert(wlan::SSID, ResourceValue::single(ssid));
        set.insert(wlan::MODE, ResourceValue::single(wlan::MODE_CLIENT));
        set.insert(wlan::CHANNEL, ResourceValue::single(6i64));
        set.insert(wlan::STANDARD, ResourceValue::single(1i64));
        set.insert(wlan::AUTHENTICATION_MODE, ResourceValue::single(wlan::AUTH_PSK));
        set
    }

    fn registry() -> Registry {
        let mut registry = Registry::standard();
        let mut dev = ResourceSet::new();
        dev.insert(device::MANUFACTURER, ResourceValue::single("Acme"));
        dev.insert(device::ERROR_CODE, ResourceValue::multiple([0i64]));
        dev.insert(device::SUPPORTED_BINDINGS, ResourceValue::single("U"));
        registry.add_instance(device::ID, 0, dev).unwrap();

        let mut srv = ResourceSet::new();
        srv.insert(server::SHORT_SERVER_ID, ResourceValue::single(1i64));
        srv.insert(server::LIFETIME, ResourceValue::single(300i64));
        srv.insert(server::DEFAULT_MIN_PERIOD, ResourceValue::single(1i64));
        srv.insert(server::NOTIFICATION_STORING, ResourceValue::single(false));
        srv.insert(server::BINDING, ResourceValue::single("U"));
        registry.add_instance(server::ID, 0, srv).unwrap();
        registry
    }

    #[tokio::test]
    async fn test_read_resource_and_instance() {
        let registry = registry();
        let out = registry.read(&Path::resource(3, 0, 0)).await.unwrap();
        assert_eq!(out, ReadOutput::Resource(0, ResourceValue::single("Acme")));

        match registry.read(&Path::instance(3, 0)).await.unwrap() {
            ReadOutput::Instance(0, set) => {
                assert!(set.contains_key(&device::MANUFACTURER));
                assert!(!set.contains_key(&device::MODEL_NUMBER));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_errors() {
        let registry = registry();
        assert!(matches!(
            registry.read(&Path::resource(3, 1, 0)).await,
            Err(ObjectError::NotFound(_))
        ));
        assert!(matches!(
            registry.read(&Path::resource(3, 0, 2)).await,
            Err(ObjectError::NotFound(_))
        ));
        assert!(matches!(
            registry.read(&Path::resource(3, 0, device::REBOOT)).await,
            Err(ObjectError::MethodNotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn test_object_read_with_several_instances_is_rejected() {
        let mut registry = registry();
        registry.create(wlan::ID, None, wlan_profile("a"), Access::Server).unwrap();
        assert!(matches!(
            registry.read(&Path::object(wlan::ID)).await,
            Ok(ReadOutput::Object(_))
        ));
        registry.create(wlan::ID, None, wlan_profile("b"), Access::Server).unwrap();
        assert!(matches!(
            registry.read(&Path::object(wlan::ID)).await,
            Err(ObjectError::MethodNotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn test_read_resource_instance() {
        let registry = registry();
        let out = registry
            .read(&"/3/0/11/0".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(out, ReadOutput::ResourceInstance(11, 0, Value::Integer(0)));
    }

    #[tokio::test]
    async fn test_read_source_and_timeout() {
        struct Slow;

        #[async_trait]
        impl ReadSource for Slow {
            async fn read(&self, _instance: u16) -> Result<ResourceValue> {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(ResourceValue::single(1i64))
            }
        }

        let mut registry = registry().with_read_timeout(Duration::from_millis(20));
        registry.set_source(
            device::ID,
            device::MEMORY_FREE,
            Arc::new(FnSource::new(|_| Ok(ResourceValue::single(4096i64)))),
        );
        registry.set_source(device::ID, device::BATTERY_LEVEL, Arc::new(Slow));

        assert_eq!(
            registry.read(&Path::resource(3, 0, 10)).await.unwrap(),
            ReadOutput::Resource(10, ResourceValue::single(4096i64))
        );
        assert!(matches!(
            registry.read(&Path::resource(3, 0, 9)).await,
            Err(ObjectError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_delivered_reaches_sources_under_path() {
        #[derive(Default)]
        struct Counting(std::sync::Mutex<Vec<u16>>);

        #[async_trait]
        impl ReadSource for Counting {
            async fn read(&self, _instance: u16) -> Result<ResourceValue> {
                Ok(ResourceValue::single(1i64))
            }

            async fn delivered(&self, instance: u16) {
                self.0.lock().unwrap().push(instance);
            }
        }

        let mut registry = registry();
        let source = Arc::new(Counting::default());
        registry.set_source(device::ID, device::MEMORY_FREE, source.clone());

        registry.delivered(&Path::resource(3, 0, device::MANUFACTURER)).await;
        assert!(source.0.lock().unwrap().is_empty());
        registry.delivered(&Path::resource(3, 0, device::MEMORY_FREE)).await;
        registry.delivered(&Path::instance(3, 0)).await;
        registry.delivered(&Path::object(3)).await;
        assert_eq!(*source.0.lock().unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn test_replace_and_partial_update_on_same_instance() {
        let mut registry = registry();

        let mut payload = ResourceSet::new();
        payload.insert(server::LIFETIME, ResourceValue::single(600i64));
        payload.insert(server::NOTIFICATION_STORING, ResourceValue::single(true));
        payload.insert(server::BINDING, ResourceValue::single("U"));

        // Partial update keeps the optional default min period
        registry
            .write(server::ID, 0, payload.clone(), WriteMode::PartialUpdate, Access::Server)
            .unwrap();
        assert_eq!(
            registry.value(server::ID, 0, server::DEFAULT_MIN_PERIOD),
            Some(&ResourceValue::single(1i64))
        );
        assert_eq!(
            registry.value(server::ID, 0, server::LIFETIME),
            Some(&ResourceValue::single(600i64))
        );

        // Replace clears it, but keeps the read-only short server id
        let changed = registry
            .write(server::ID, 0, payload, WriteMode::Replace, Access::Server)
            .unwrap();
        assert_eq!(changed, vec![server::DEFAULT_MIN_PERIOD]);
        assert_eq!(registry.value(server::ID, 0, server::DEFAULT_MIN_PERIOD), None);
        assert_eq!(
            registry.value(server::ID, 0, server::SHORT_SERVER_ID),
            Some(&ResourceValue::single(1i64))
        );
    }

    #[test]
    fn test_write_is_atomic() {
        let mut registry = registry();
        let mut payload = ResourceSet::new();
        payload.insert(server::LIFETIME, ResourceValue::single(10i64));
        payload.insert(server::SHORT_SERVER_ID, ResourceValue::single(9i64));

        let err = registry
            .write(server::ID, 0, payload, WriteMode::PartialUpdate, Access::Server)
            .unwrap_err();
        assert!(matches!(err, ObjectError::MethodNotAllowed(_)));
        assert_eq!(
            registry.value(server::ID, 0, server::LIFETIME),
            Some(&ResourceValue::single(300i64))
        );
    }

    #[test]
    fn test_write_type_mismatch() {
        let mut registry = registry();
        let mut payload = ResourceSet::new();
        payload.insert(server::LIFETIME, ResourceValue::single("long"));
        assert!(matches!(
            registry.write(server::ID, 0, payload, WriteMode::PartialUpdate, Access::Server),
            Err(ObjectError::Value(_))
        ));
    }

    #[test]
    fn test_bootstrap_write_bypasses_access() {
        let mut registry = registry();
        let mut payload = ResourceSet::new();
        payload.insert(server::SHORT_SERVER_ID, ResourceValue::single(7i64));
        registry
            .write(server::ID, 0, payload, WriteMode::PartialUpdate, Access::Bootstrap)
            .unwrap();
        assert_eq!(
            registry.value(server::ID, 0, server::SHORT_SERVER_ID),
            Some(&ResourceValue::single(7i64))
        );
    }

    #[test]
    fn test_create_and_delete() {
        let mut registry = registry();
        assert_eq!(
            registry.create(wlan::ID, None, wlan_profile("a"), Access::Server).unwrap(),
            0
        );
        assert_eq!(
            registry.create(wlan::ID, Some(5), wlan_profile("b"), Access::Server).unwrap(),
            5
        );
        assert_eq!(
            registry.create(wlan::ID, None, wlan_profile("c"), Access::Server).unwrap(),
            6
        );
        assert!(matches!(
            registry.create(wlan::ID, Some(5), wlan_profile("d"), Access::Server),
            Err(ObjectError::BadRequest(_))
        ));
        assert!(matches!(
            registry.create(device::ID, None, ResourceSet::new(), Access::Server),
            Err(ObjectError::BadRequest(_))
        ));

        registry.delete(wlan::ID, 5).unwrap();
        assert_eq!(registry.instance_ids(wlan::ID), vec![0, 6]);
        assert!(matches!(
            registry.delete(wlan::ID, 5),
            Err(ObjectError::NotFound(_))
        ));
        assert!(matches!(
            registry.delete(device::ID, 0),
            Err(ObjectError::MethodNotAllowed(_))
        ));
    }

    #[test]
    fn test_hook_validates_and_observes() {
        #[derive(Default)]
        struct Hook {
            applied: Counter,
            deleted: Counter,
        }

        impl InstanceHook for Hook {
            fn validate(&self, _instance: u16, resources: &ResourceSet) -> Result<()> {
                match resources.get(&wlan::SSID) {
                    Some(ResourceValue::Single(Value::String(s))) if !s.is_empty() => Ok(()),
                    _ => Err(ObjectError::BadRequest("SSID required".into())),
                }
            }

            fn applied(&self, _instance: u16, _resources: &ResourceSet) {
                self.applied.bump();
            }

            fn deleted(&self, _instance: u16) {
                self.deleted.bump();
            }
        }

        let hook = Arc::new(Hook::default());
        let mut registry = registry();
        registry.set_hook(wlan::ID, hook.clone());

        assert!(registry.create(wlan::ID, None, wlan_profile(""), Access::Server).is_err());
        assert!(registry.instance_ids(wlan::ID).is_empty());

        let id = registry.create(wlan::ID, None, wlan_profile("home"), Access::Server).unwrap();
        registry.delete(wlan::ID, id).unwrap();
        assert_eq!(hook.applied.get(), 1);
        assert_eq!(hook.deleted.get(), 1);
    }

    #[tokio::test]
    async fn test_execute() {
        struct Reboot(Counter);

        #[async_trait]
        impl ExecuteAction for Reboot {
            async fn execute(&self, _instance: u16, _argument: &[u8]) -> Result<()> {
                self.0.bump();
                Ok(())
            }
        }

        let mut registry = registry();
        let action = Arc::new(Reboot(Counter::default()));
        registry.set_action(device::ID, device::REBOOT, action.clone());

        registry.execute(3, 0, device::REBOOT, b"").await.unwrap();
        assert_eq!(action.0.get(), 1);
        assert!(matches!(
            registry.execute(3, 0, device::MANUFACTURER, b"").await,
            Err(ObjectError::MethodNotAllowed(_))
        ));
        assert!(matches!(
            registry.execute(3, 0, device::FACTORY_RESET, b"").await,
            Err(ObjectError::MethodNotAllowed(_))
        ));
        assert!(matches!(
            registry.execute(3, 4, device::REBOOT, b"").await,
            Err(ObjectError::NotFound(_))
        ));
    }

    #[test]
    fn test_bootstrap_delete_keeps_bootstrap_account() {
        let mut registry = registry();
        let mut bs = ResourceSet::new();
        bs.insert(security::SERVER_URI, ResourceValue::single("coap://bs:5683"));
        bs.insert(security::BOOTSTRAP_SERVER, ResourceValue::single(true));
        registry.add_instance(security::ID, 0, bs).unwrap();
        let mut dm = ResourceSet::new();
        dm.insert(security::SERVER_URI, ResourceValue::single("coap://dm:5683"));
        dm.insert(security::BOOTSTRAP_SERVER, ResourceValue::single(false));
        registry.add_instance(security::ID, 1, dm).unwrap();

        let deleted = registry.bootstrap_delete(None).unwrap();
        assert_eq!(deleted, vec![Path::instance(0, 1), Path::instance(1, 0)]);
        assert_eq!(registry.instance_ids(security::ID), vec![0]);
        assert_eq!(registry.instance_ids(device::ID), vec![0]);
    }

    #[test]
    fn test_registration_links_and_discover() {
        let registry = registry();
        let links = registry.registration_links();
        assert!(links.starts_with("</1/0>,</3/0>,</4>"));
        assert!(!links.contains("</0"));

        let paths = registry.discover(&Path::instance(3, 0)).unwrap();
        assert_eq!(paths[0], Path::instance(3, 0));
        assert!(paths.contains(&Path::resource(3, 0, device::MANUFACTURER)));
        assert!(!paths.contains(&Path::resource(3, 0, device::REBOOT)));
    }
}
