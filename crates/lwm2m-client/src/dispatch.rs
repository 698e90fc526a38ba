//! Inbound request handling
//!
//! Maps CoAP requests from the LwM2M or bootstrap server onto registry
//! operations, the observation manager and the update engine. Server
//! object executes that affect the session itself (Disable, Registration
//! Update Trigger) and Bootstrap-Finish are returned as [`FollowUp`]s so
//! the engine applies them after the response went out.

use std::collections::BTreeMap;
use std::time::Duration;

use lwm2m_coap::block::{slice_block, Block2Cache};
use lwm2m_coap::message::option;
use lwm2m_coap::{Block1Assembler, BlockOption, BlockOutcome, Code, ContentFormat, Message};
use lwm2m_core::objects::{firmware, security, server, software};
use lwm2m_core::{
    tlv, Access, DataKind, ObjectDefinition, ObjectError, Path, ReadOutput, Registry, ResourceSet,
    ResourceValue, Value, WriteMode,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::observe::{numeric_value, Attributes, ObservationManager};
use crate::update::{is_package_resource, is_update_resource, UpdateEngine};

const BLOCK1_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
const BLOCK2_LIFETIME: Duration = Duration::from_secs(120);

/// Who the request came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Peer {
    /// Management server we are registered with
    Registered,
    /// Bootstrap server during a bootstrap session
    Bootstrap,
    /// Management server before registration completed; Observe is refused
    Pending,
}

/// Transfer a cached Block2 body belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BodyKey {
    Read {
        peer: Peer,
        path: Path,
        accept: Option<u16>,
    },
    /// The server fetches the rest of a notification with plain GETs
    Notification {
        token: Vec<u8>,
        path: Path,
        content_format: u16,
    },
}

/// Work the engine performs once the response has been sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    /// Objects, lifetime or binding changed, or the trigger was executed
    RegistrationUpdate,
    Disable { server_instance: u16 },
    BootstrapFinished,
}

pub struct RequestContext<'a> {
    pub registry: &'a mut Registry,
    pub observations: &'a mut ObservationManager,
    pub updates: &'a mut UpdateEngine,
    pub peer: Peer,
    /// Default pmin/pmax of the current server
    pub defaults: Attributes,
    pub now: Instant,
}

impl RequestContext<'_> {
    fn mark(&mut self, changed: Vec<Path>) {
        for path in &changed {
            self.observations.mark_changed(path);
        }
    }

    fn access(&self) -> Access {
        match self.peer {
            Peer::Bootstrap => Access::Bootstrap,
            _ => Access::Server,
        }
    }
}

#[derive(Debug)]
pub struct Handled {
    pub response: Message,
    pub follow_ups: Vec<FollowUp>,
}

/// Encoded read result
#[derive(Debug, Clone, PartialEq)]
pub struct Representation {
    pub payload: Vec<u8>,
    pub content_format: u16,
    /// Numeric value for threshold attributes, single values only
    pub value: Option<f64>,
}

/// Read `path` and encode it for `accept`
pub async fn render(
    registry: &Registry,
    path: &Path,
    accept: Option<u16>,
) -> Result<Representation, ObjectError> {
    let output = registry.read(path).await?;
    let content_format = negotiate(accept, &output)?;
    let payload = encode(&output, content_format)?;
    Ok(Representation {
        payload,
        content_format,
        value: numeric_value(&output),
    })
}

/// Pick the response format for a read
///
/// Without Accept, multi-value reads are TLV, opaque values raw bytes and
/// every other single value plain text.
pub fn negotiate(accept: Option<u16>, output: &ReadOutput) -> Result<u16, ObjectError> {
    let single = match output {
        ReadOutput::Resource(_, ResourceValue::Single(v)) | ReadOutput::ResourceInstance(_, _, v) => {
            Some(v)
        }
        _ => None,
    };
    match (accept, single) {
        (Some(ContentFormat::TLV), _) | (None, None) => Ok(ContentFormat::TLV),
        (None, Some(Value::Opaque(_))) => Ok(ContentFormat::OPAQUE),
        (None, Some(_)) => Ok(ContentFormat::TEXT),
        (Some(ContentFormat::OPAQUE), Some(Value::Opaque(_))) => Ok(ContentFormat::OPAQUE),
        (Some(ContentFormat::TEXT), Some(v)) if !matches!(v, Value::Opaque(_)) => {
            Ok(ContentFormat::TEXT)
        }
        (Some(other), _) => Err(ObjectError::NotAcceptable(other)),
    }
}

fn encode(output: &ReadOutput, content_format: u16) -> Result<Vec<u8>, ObjectError> {
    if content_format != ContentFormat::TLV {
        return match output {
            ReadOutput::Resource(_, ResourceValue::Single(v)) | ReadOutput::ResourceInstance(_, _, v) => {
                Ok(raw_bytes(v))
            }
            _ => Err(ObjectError::NotAcceptable(content_format)),
        };
    }
    let bytes = match output {
        ReadOutput::Object(instances) => tlv::encode_instances(instances)?,
        ReadOutput::Instance(_, resources) => tlv::encode_resources(resources)?,
        ReadOutput::Resource(id, value) => tlv::encode_resource(*id, value)?,
        ReadOutput::ResourceInstance(id, ri, value) => {
            let single = ResourceValue::Multiple(BTreeMap::from([(*ri, value.clone())]));
            tlv::encode_resource(*id, &single)?
        }
    };
    Ok(bytes)
}

fn raw_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::Opaque(bytes) => bytes.clone(),
        other => other.to_text().into_bytes(),
    }
}

fn definition(registry: &Registry, object: u16) -> Result<&'static ObjectDefinition, ObjectError> {
    registry
        .definition(object)
        .ok_or_else(|| ObjectError::NotFound(Path::object(object).to_string()))
}

/// Decode a single-resource write payload
fn decode_resource_value(
    def: &ObjectDefinition,
    resource: u16,
    content_format: Option<u16>,
    body: &[u8],
) -> Result<ResourceValue, ObjectError> {
    let rdef = def
        .resource(resource)
        .ok_or_else(|| ObjectError::NotFound(format!("/{}/*/{}", def.id, resource)))?;
    let opaque = matches!(rdef.kind, DataKind::Opaque);
    let format = content_format.unwrap_or(if opaque {
        ContentFormat::OPAQUE
    } else {
        ContentFormat::TEXT
    });
    match format {
        ContentFormat::TLV => Ok(tlv::decode_resource(body, def, resource)?),
        ContentFormat::TEXT | ContentFormat::OPAQUE if rdef.multiple => Err(ObjectError::BadRequest(
            format!("resource {} is multiple, write it as TLV", resource),
        )),
        ContentFormat::TEXT => {
            let text = std::str::from_utf8(body)
                .map_err(|_| ObjectError::BadRequest("text payload is not UTF-8".to_string()))?;
            Ok(ResourceValue::Single(Value::from_text(rdef.kind, resource, text)?))
        }
        ContentFormat::OPAQUE if opaque => Ok(ResourceValue::Single(Value::Opaque(body.to_vec()))),
        other => Err(ObjectError::UnsupportedFormat(other)),
    }
}

fn decode_instance(
    def: &ObjectDefinition,
    instance: u16,
    content_format: Option<u16>,
    body: &[u8],
) -> Result<ResourceSet, ObjectError> {
    match content_format {
        None | Some(ContentFormat::TLV) => Ok(tlv::decode_resources(body, def, Some(instance))?),
        Some(other) => Err(ObjectError::UnsupportedFormat(other)),
    }
}

/// Writes the update engine takes instead of the registry
fn is_routed_write(object: u16, resource: u16) -> bool {
    is_package_resource(object, resource)
        || matches!(
            (object, resource),
            (firmware::ID, firmware::PACKAGE_URI) | (software::ID, software::PACKAGE_URI)
        )
}

fn error_response(request: &Message, err: &ObjectError) -> Message {
    let mut response = Message::response(request, Code(err.coap_code()));
    response.payload = err.to_string().into_bytes();
    response
}

enum Collected {
    Body(Vec<u8>, Option<BlockOption>),
    Responded(Message),
}

pub struct Dispatcher {
    block1: Block1Assembler,
    block2: Block2Cache<BodyKey>,
    szx: u8,
}

impl Dispatcher {
    pub fn new(max_push_size: usize, szx: u8) -> Self {
        Self {
            block1: Block1Assembler::new(max_push_size, BLOCK1_IDLE_TIMEOUT),
            block2: Block2Cache::new(BLOCK2_LIFETIME),
            szx,
        }
    }

    /// Drop stale block transfers
    pub fn expire(&mut self, now: Instant) {
        let dropped = self.block1.expire(now);
        if dropped > 0 {
            debug!(dropped, "Expired block1 transfers");
        }
        self.block2.expire(now);
    }

    pub async fn handle(&mut self, request: &Message, ctx: &mut RequestContext<'_>) -> Handled {
        let mut follow_ups = Vec::new();
        let response = match self.route(request, ctx, &mut follow_ups).await {
            Ok(response) => response,
            Err(e) => {
                debug!(code = %request.code, path = ?request.uri_path(), error = %e, "Request refused");
                error_response(request, &e)
            }
        };
        Handled {
            response,
            follow_ups,
        }
    }

    /// Put `payload` into `message`, block-wise when it exceeds one block
    ///
    /// Multi-block bodies are cached under `key` so later Block2 requests
    /// see the same snapshot. Returns true once the last block is out.
    pub fn shape_body(
        &mut self,
        message: &mut Message,
        key: BodyKey,
        payload: Vec<u8>,
        content_format: u16,
        requested: Option<BlockOption>,
        now: Instant,
    ) -> Result<bool, ObjectError> {
        message.set_content_format(content_format);
        let (num, szx) = match requested {
            Some(b) if b.szx > self.szx => (b.num << (b.szx - self.szx), self.szx),
            Some(b) => (b.num, b.szx),
            None => (0, self.szx),
        };
        if requested.is_none() && payload.len() <= 16usize << szx {
            message.payload = payload;
            return Ok(true);
        }
        let (chunk, more) = slice_block(&payload, num, szx)
            .map(|(chunk, more)| (chunk.to_vec(), more))
            .ok_or_else(|| ObjectError::BadRequest(format!("block {} out of range", num)))?;
        message.set_block2(BlockOption::new(num, more, szx));
        message.payload = chunk;
        if more {
            self.block2.store(key, payload, content_format, now);
        } else {
            self.block2.remove(&key);
        }
        Ok(!more)
    }

    async fn route(
        &mut self,
        request: &Message,
        ctx: &mut RequestContext<'_>,
        follow_ups: &mut Vec<FollowUp>,
    ) -> Result<Message, ObjectError> {
        let segments = request.uri_path();
        debug!(code = %request.code, path = ?segments, peer = ?ctx.peer, "Request");
        if segments.first().map(String::as_str) == Some("bs") {
            return bootstrap_finish(request, ctx, follow_ups);
        }
        if segments.iter().all(String::is_empty) {
            return self.root(request, ctx);
        }
        let path = Path::from_segments(&segments)?;
        if path.object == security::ID && ctx.peer != Peer::Bootstrap {
            return Err(ObjectError::Unauthorized(path.to_string()));
        }
        match request.code {
            Code::GET => self.get(request, path, ctx).await,
            Code::PUT => self.put(request, path, ctx, follow_ups).await,
            Code::POST => self.post(request, path, ctx, follow_ups).await,
            Code::DELETE => delete(request, path, ctx, follow_ups),
            other => Err(ObjectError::MethodNotAllowed(format!("method {}", other))),
        }
    }

    /// `/` only carries bootstrap operations
    fn root(&mut self, request: &Message, ctx: &mut RequestContext<'_>) -> Result<Message, ObjectError> {
        if ctx.peer != Peer::Bootstrap {
            return Err(ObjectError::MethodNotAllowed("/".to_string()));
        }
        match request.code {
            Code::DELETE => {
                let deleted = ctx.registry.bootstrap_delete(None)?;
                for path in &deleted {
                    ctx.observations.remove_under(path);
                }
                info!(count = deleted.len(), "Bootstrap delete of /");
                Ok(Message::response(request, Code::DELETED))
            }
            Code::GET if request.accept() == Some(ContentFormat::LINK_FORMAT) => {
                let mut links = vec!["</>;lwm2m=1.0".to_string()];
                let mut objects: Vec<u16> = ctx.registry.definitions().map(|d| d.id).collect();
                objects.sort_unstable();
                for object in objects {
                    let ids = ctx.registry.instance_ids(object);
                    if ids.is_empty() {
                        links.push(format!("<{}>", Path::object(object)));
                    }
                    links.extend(ids.into_iter().map(|i| format!("<{}>", Path::instance(object, i))));
                }
                let mut response = Message::response(request, Code::CONTENT);
                response.set_content_format(ContentFormat::LINK_FORMAT);
                response.payload = links.join(",").into_bytes();
                Ok(response)
            }
            other => Err(ObjectError::MethodNotAllowed(format!("method {} on /", other))),
        }
    }

    // =========================================================================
    // Read, Observe, Discover
    // =========================================================================

    async fn get(
        &mut self,
        request: &Message,
        path: Path,
        ctx: &mut RequestContext<'_>,
    ) -> Result<Message, ObjectError> {
        if request.accept() == Some(ContentFormat::LINK_FORMAT) {
            return discover(request, &path, ctx);
        }
        let block2 = request
            .block2()
            .transpose()
            .map_err(|e| ObjectError::BadRequest(e.to_string()))?;
        let accept = request.accept();
        let key = BodyKey::Read {
            peer: ctx.peer,
            path,
            accept,
        };
        let mut response = Message::response(request, Code::CONTENT);

        if let Some(block) = block2.filter(|b| b.num > 0) {
            let cached = self
                .block2
                .get(&key, ctx.now)
                .or_else(|| {
                    self.block2.find(ctx.now, |k| {
                        matches!(k, BodyKey::Notification { path: p, content_format, .. }
                            if *p == path && accept.map_or(true, |a| a == *content_format))
                    })
                })
                .map(|cached| (cached.payload.clone(), cached.content_format));
            if let Some((payload, content_format)) = cached {
                if self.shape_body(&mut response, key, payload, content_format, Some(block), ctx.now)? {
                    ctx.registry.delivered(&path).await;
                }
                return Ok(response);
            }
        }

        let rep = render(ctx.registry, &path, request.accept()).await?;
        match request.observe() {
            Some(0) if ctx.peer == Peer::Registered => {
                let sequence = ctx.observations.observe(
                    request.token.clone(),
                    path,
                    rep.content_format,
                    ctx.defaults,
                    rep.payload.clone(),
                    rep.value,
                    ctx.now,
                );
                info!(path = %path, token = ?request.token, "Observation started");
                response.set_observe(sequence);
            }
            Some(0) => debug!(path = %path, "Observe before registration, answering as a read"),
            Some(1) => {
                if !ctx.observations.cancel_token(&request.token) {
                    ctx.observations.cancel_path(&path);
                }
                info!(path = %path, "Observation cancelled by server");
            }
            _ => {}
        }
        if self.shape_body(&mut response, key, rep.payload, rep.content_format, block2, ctx.now)? {
            ctx.registry.delivered(&path).await;
        }
        Ok(response)
    }

    // =========================================================================
    // Write, Write-Attributes, Create, Execute
    // =========================================================================

    async fn put(
        &mut self,
        request: &Message,
        path: Path,
        ctx: &mut RequestContext<'_>,
        follow_ups: &mut Vec<FollowUp>,
    ) -> Result<Message, ObjectError> {
        let query = request.uri_query();
        if request.payload.is_empty() && request.block1().is_none() && !query.is_empty() {
            if ctx.peer == Peer::Bootstrap {
                return Err(ObjectError::MethodNotAllowed(format!(
                    "write-attributes on {} during bootstrap",
                    path
                )));
            }
            ctx.registry.discover(&path)?;
            ctx.observations.write_attributes(path, &query)?;
            return Ok(Message::response(request, Code::CHANGED));
        }

        let (body, echo) = match self.collect_body(request, &path, ctx).await? {
            Collected::Body(body, echo) => (body, echo),
            Collected::Responded(response) => return Ok(response),
        };
        let content_format = request.content_format();
        if ctx.peer == Peer::Bootstrap {
            bootstrap_write(path, content_format, &body, ctx)?;
        } else {
            write(path, content_format, body, WriteMode::Replace, ctx, follow_ups).await?;
        }
        let mut response = Message::response(request, Code::CHANGED);
        if let Some(block) = echo {
            response.set_block1(block);
        }
        Ok(response)
    }

    async fn post(
        &mut self,
        request: &Message,
        path: Path,
        ctx: &mut RequestContext<'_>,
        follow_ups: &mut Vec<FollowUp>,
    ) -> Result<Message, ObjectError> {
        let (body, echo) = match self.collect_body(request, &path, ctx).await? {
            Collected::Body(body, echo) => (body, echo),
            Collected::Responded(response) => return Ok(response),
        };
        let content_format = request.content_format();
        let mut response = match (path.instance, path.resource) {
            (None, _) => create(request, path, content_format, &body, ctx, follow_ups)?,
            (Some(_), None) => {
                write(path, content_format, body, WriteMode::PartialUpdate, ctx, follow_ups).await?;
                Message::response(request, Code::CHANGED)
            }
            (Some(instance), Some(resource)) => {
                execute(path, instance, resource, &body, ctx, follow_ups).await?;
                Message::response(request, Code::CHANGED)
            }
        };
        if let Some(block) = echo {
            response.set_block1(block);
        }
        Ok(response)
    }

    /// Request body, reassembled when sent block-wise
    ///
    /// Block1 pushes to a package resource drive the update job: the first
    /// block starts it and a broken transfer fails it.
    async fn collect_body(
        &mut self,
        request: &Message,
        path: &Path,
        ctx: &mut RequestContext<'_>,
    ) -> Result<Collected, ObjectError> {
        let Some(block) = request.block1() else {
            return Ok(Collected::Body(request.payload.clone(), None));
        };
        let block = block.map_err(|e| ObjectError::BadRequest(e.to_string()))?;
        let package = match (path.instance, path.resource) {
            (Some(instance), Some(resource)) if is_package_resource(path.object, resource) => Some(instance),
            _ => None,
        };

        if let (Some(instance), 0) = (package, block.num) {
            let changed = ctx.updates.push_started(ctx.registry, path.object, instance).await?;
            ctx.mark(changed);
        }
        match self.block1.accept(&request.token, block, &request.payload, ctx.now) {
            Ok(BlockOutcome::Continue(next)) => {
                let mut response = Message::response(request, Code::CONTINUE);
                response.set_block1(next);
                Ok(Collected::Responded(response))
            }
            Ok(BlockOutcome::Complete(body)) => {
                debug!(path = %path, bytes = body.len(), "Block1 transfer complete");
                Ok(Collected::Body(body, Some(BlockOption::new(block.num, false, block.szx))))
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Block1 transfer aborted");
                if let Some(instance) = package {
                    let changed = ctx.updates.push_failed(ctx.registry, path.object, instance).await;
                    ctx.mark(changed);
                }
                let mut response = Message::response(request, e.code());
                response.payload = e.to_string().into_bytes();
                Ok(Collected::Responded(response))
            }
        }
    }
}

fn bootstrap_finish(
    request: &Message,
    ctx: &mut RequestContext<'_>,
    follow_ups: &mut Vec<FollowUp>,
) -> Result<Message, ObjectError> {
    if request.code != Code::POST || ctx.peer != Peer::Bootstrap {
        return Err(ObjectError::MethodNotAllowed("/bs".to_string()));
    }
    info!("Bootstrap-Finish received");
    follow_ups.push(FollowUp::BootstrapFinished);
    Ok(Message::response(request, Code::CHANGED))
}

fn discover(
    request: &Message,
    path: &Path,
    ctx: &mut RequestContext<'_>,
) -> Result<Message, ObjectError> {
    let links: Vec<String> = ctx
        .registry
        .discover(path)?
        .iter()
        .map(|p| {
            let attrs = ctx
                .observations
                .attributes_at(p)
                .map(Attributes::to_link_params)
                .unwrap_or_default();
            format!("<{}>{}", p, attrs)
        })
        .collect();
    let mut response = Message::response(request, Code::CONTENT);
    response.set_content_format(ContentFormat::LINK_FORMAT);
    response.payload = links.join(",").into_bytes();
    Ok(response)
}

async fn write(
    path: Path,
    content_format: Option<u16>,
    body: Vec<u8>,
    mode: WriteMode,
    ctx: &mut RequestContext<'_>,
    follow_ups: &mut Vec<FollowUp>,
) -> Result<(), ObjectError> {
    let Some(instance) = path.instance else {
        return Err(ObjectError::MethodNotAllowed(format!("write to object {}", path)));
    };
    if path.resource_instance.is_some() {
        return Err(ObjectError::MethodNotAllowed(format!("write to {}", path)));
    }
    if ctx.registry.instance(path.object, instance).is_none() {
        return Err(ObjectError::NotFound(Path::instance(path.object, instance).to_string()));
    }
    let def = definition(ctx.registry, path.object)?;

    let (values, mode, partial) = match path.resource {
        Some(resource) => {
            if is_package_resource(path.object, resource) && content_format != Some(ContentFormat::TLV) {
                let changed = ctx.updates.push_completed(ctx.registry, path.object, instance, body).await?;
                ctx.mark(changed);
                return Ok(());
            }
            let value = decode_resource_value(def, resource, content_format, &body)?;
            (ResourceSet::from([(resource, value)]), WriteMode::PartialUpdate, true)
        }
        None => (decode_instance(def, instance, content_format, &body)?, mode, false),
    };

    let (routed, values): (ResourceSet, ResourceSet) = values
        .into_iter()
        .partition(|(id, _)| is_routed_write(path.object, *id));

    if !values.is_empty() || !partial {
        let changed = ctx.registry.write(path.object, instance, values, mode, ctx.access())?;
        for id in changed {
            ctx.observations.mark_changed(&Path::resource(path.object, instance, id));
            if path.object == server::ID && matches!(id, server::LIFETIME | server::BINDING) {
                follow_ups.push(FollowUp::RegistrationUpdate);
            }
        }
    }

    for (resource, value) in routed {
        let ResourceValue::Single(value) = value else {
            return Err(ObjectError::BadRequest(format!("resource {} is not multiple", resource)));
        };
        let changed = if is_package_resource(path.object, resource) {
            ctx.updates
                .push_completed(ctx.registry, path.object, instance, raw_bytes(&value))
                .await?
        } else {
            ctx.updates
                .write_uri(ctx.registry, path.object, instance, &raw_bytes(&value))
                .await?
        };
        ctx.mark(changed);
    }
    Ok(())
}

/// Bootstrap-Write creates missing instances and overwrites the resources
/// it carries
fn bootstrap_write(
    path: Path,
    content_format: Option<u16>,
    body: &[u8],
    ctx: &mut RequestContext<'_>,
) -> Result<(), ObjectError> {
    let def = definition(ctx.registry, path.object)?;
    let writes: Vec<(u16, ResourceSet)> = match (path.instance, path.resource) {
        (None, _) => {
            if !matches!(content_format, None | Some(ContentFormat::TLV)) {
                return Err(ObjectError::UnsupportedFormat(content_format.unwrap_or_default()));
            }
            tlv::decode_instances(body, def)?
                .into_iter()
                .map(|(id, values)| {
                    let id = id
                        .or((!def.multiple).then_some(0))
                        .ok_or_else(|| ObjectError::BadRequest(format!("{} needs instance ids", path)))?;
                    Ok((id, values))
                })
                .collect::<Result<_, ObjectError>>()?
        }
        (Some(instance), None) => vec![(instance, decode_instance(def, instance, content_format, body)?)],
        (Some(instance), Some(resource)) => {
            let value = decode_resource_value(def, resource, content_format, body)?;
            vec![(instance, ResourceSet::from([(resource, value)]))]
        }
    };

    for (instance, values) in writes {
        info!(object = path.object, instance, resources = values.len(), "Bootstrap write");
        if ctx.registry.instance(path.object, instance).is_some() {
            ctx.registry
                .write(path.object, instance, values, WriteMode::PartialUpdate, Access::Bootstrap)?;
        } else if def.multiple {
            ctx.registry
                .create(path.object, Some(instance), values, Access::Bootstrap)?;
        } else {
            ctx.registry.add_instance(path.object, instance, values)?;
        }
    }
    Ok(())
}

fn create(
    request: &Message,
    path: Path,
    content_format: Option<u16>,
    body: &[u8],
    ctx: &mut RequestContext<'_>,
    follow_ups: &mut Vec<FollowUp>,
) -> Result<Message, ObjectError> {
    if let Some(other) = content_format.filter(|cf| *cf != ContentFormat::TLV) {
        return Err(ObjectError::UnsupportedFormat(other));
    }
    let def = definition(ctx.registry, path.object)?;
    let mut decoded = tlv::decode_instances(body, def)?;
    if decoded.len() != 1 {
        return Err(ObjectError::BadRequest(format!(
            "create carries {} instances",
            decoded.len()
        )));
    }
    let (requested, values) = decoded.remove(0);
    let access = ctx.access();
    let id = ctx.registry.create(path.object, requested, values, access)?;
    info!(path = %Path::instance(path.object, id), "Instance created");

    ctx.observations.mark_changed(&Path::object(path.object));
    if ctx.peer == Peer::Registered {
        follow_ups.push(FollowUp::RegistrationUpdate);
    }
    let mut response = Message::response(request, Code::CREATED);
    response.add_option(option::LOCATION_PATH, path.object.to_string().into_bytes());
    response.add_option(option::LOCATION_PATH, id.to_string().into_bytes());
    Ok(response)
}

async fn execute(
    path: Path,
    instance: u16,
    resource: u16,
    argument: &[u8],
    ctx: &mut RequestContext<'_>,
    follow_ups: &mut Vec<FollowUp>,
) -> Result<(), ObjectError> {
    if path.resource_instance.is_some() {
        return Err(ObjectError::MethodNotAllowed(format!("execute on {}", path)));
    }
    if ctx.registry.instance(path.object, instance).is_none() {
        return Err(ObjectError::NotFound(Path::instance(path.object, instance).to_string()));
    }
    info!(path = %path, "Execute");
    if path.object == server::ID {
        match resource {
            server::DISABLE => {
                follow_ups.push(FollowUp::Disable {
                    server_instance: instance,
                });
                return Ok(());
            }
            server::REGISTRATION_UPDATE_TRIGGER => {
                follow_ups.push(FollowUp::RegistrationUpdate);
                return Ok(());
            }
            _ => {}
        }
    }
    if is_update_resource(path.object, resource) {
        let changed = ctx
            .updates
            .execute(ctx.registry, path.object, instance, resource)
            .await?;
        ctx.mark(changed);
        return Ok(());
    }
    ctx.registry.execute(path.object, instance, resource, argument).await
}

fn delete(
    request: &Message,
    path: Path,
    ctx: &mut RequestContext<'_>,
    follow_ups: &mut Vec<FollowUp>,
) -> Result<Message, ObjectError> {
    if ctx.peer == Peer::Bootstrap {
        if path.resource.is_some() {
            return Err(ObjectError::BadRequest(format!("bootstrap delete of {}", path)));
        }
        let deleted = ctx.registry.bootstrap_delete(Some(&path))?;
        for p in &deleted {
            ctx.observations.remove_under(p);
        }
        info!(path = %path, count = deleted.len(), "Bootstrap delete");
        return Ok(Message::response(request, Code::DELETED));
    }
    let (Some(instance), None) = (path.instance, path.resource) else {
        return Err(ObjectError::MethodNotAllowed(format!("delete of {}", path)));
    };
    ctx.registry.delete(path.object, instance)?;
    ctx.observations.remove_under(&path);
    info!(path = %path, "Instance deleted");
    follow_ups.push(FollowUp::RegistrationUpdate);
    Ok(Message::response(request, Code::DELETED))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::context::ClientContext;
    use crate::update::{Collaborators, NetFetcher, ProcessUpdater, TarExtractor, UpdateSettings};
    use lwm2m_coap::{MessageType, TransmissionParams};
    use async_trait::async_trait;
    use lwm2m_core::objects::device;
    use lwm2m_core::ReadSource;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const CONFIG: &str = r#"
endpoint = "gw-0001"

[[servers]]
short_server_id = 101
uri = "coap://127.0.0.1"
"#;

    struct Fixture {
        _staging: tempfile::TempDir,
        context: ClientContext,
        observations: ObservationManager,
        updates: UpdateEngine,
        dispatcher: Dispatcher,
        peer: Peer,
    }

    impl Fixture {
        fn new() -> Self {
            let staging = tempfile::tempdir().unwrap();
            let context = ClientContext::new(ClientConfig::from_toml(CONFIG).unwrap()).unwrap();
            let fetcher = NetFetcher::new(
                Duration::from_secs(5),
                TransmissionParams::default(),
                6,
                "0.0.0.0:0".parse().unwrap(),
                None,
            )
            .unwrap();
            let collaborators = Collaborators {
                fetcher: Arc::new(fetcher),
                firmware_updater: Arc::new(ProcessUpdater::new("true")),
                software_updater: Arc::new(ProcessUpdater::new("true")),
                extractor: Arc::new(TarExtractor::new("tar")),
            };
            let settings = UpdateSettings {
                staging_dir: staging.path().to_path_buf(),
                restart_exit_code: 10,
                download_timeout: Duration::from_secs(5),
            };
            let (updates, _rx) = UpdateEngine::new(settings, collaborators);
            Self {
                _staging: staging,
                context,
                observations: ObservationManager::new(Duration::from_secs(1)),
                updates,
                dispatcher: Dispatcher::new(4096, 2),
                peer: Peer::Registered,
            }
        }

        async fn send(&mut self, request: Message) -> Handled {
            let mut ctx = RequestContext {
                registry: &mut self.context.registry,
                observations: &mut self.observations,
                updates: &mut self.updates,
                peer: self.peer,
                defaults: Attributes::default(),
                now: Instant::now(),
            };
            self.dispatcher.handle(&request, &mut ctx).await
        }
    }

    fn request(code: Code, path: &str) -> Message {
        let mut msg = Message::request(code, path);
        msg.token = vec![0xA1];
        msg.message_id = 7;
        msg
    }

    #[tokio::test]
    async fn test_read_single_resource_as_text() {
        let mut fx = Fixture::new();
        let handled = fx.send(request(Code::GET, "3/0/16")).await;
        assert_eq!(handled.response.code, Code::CONTENT);
        assert_eq!(handled.response.mtype, MessageType::Acknowledgement);
        assert_eq!(handled.response.content_format(), Some(ContentFormat::TEXT));
        assert_eq!(handled.response.payload, b"U");
    }

    #[tokio::test]
    async fn test_read_unsupported_accept() {
        let mut fx = Fixture::new();
        let mut req = request(Code::GET, "3/0/16");
        req.set_uint_option(option::ACCEPT, u32::from(ContentFormat::JSON));
        let handled = fx.send(req).await;
        assert_eq!(handled.response.code, Code::NOT_ACCEPTABLE);
    }

    #[tokio::test]
    async fn test_security_object_hidden_from_server() {
        let mut fx = Fixture::new();
        let handled = fx.send(request(Code::GET, "0/0")).await;
        assert_eq!(handled.response.code, Code::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_write_lifetime_requests_update() {
        let mut fx = Fixture::new();
        let mut req = request(Code::PUT, "1/0/1");
        req.set_content_format(ContentFormat::TEXT);
        req.payload = b"900".to_vec();
        let handled = fx.send(req).await;
        assert_eq!(handled.response.code, Code::CHANGED);
        assert_eq!(handled.follow_ups, vec![FollowUp::RegistrationUpdate]);
        assert_eq!(
            fx.context.registry.value(server::ID, 0, server::LIFETIME),
            Some(&ResourceValue::single(900i64))
        );
    }

    #[tokio::test]
    async fn test_write_text_to_multiple_resource_rejected() {
        let mut fx = Fixture::new();
        let mut req = request(Code::PUT, "3/0/11");
        req.set_content_format(ContentFormat::TEXT);
        req.payload = b"1".to_vec();
        let handled = fx.send(req).await;
        assert_eq!(handled.response.code, Code::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_write_unsupported_format() {
        let mut fx = Fixture::new();
        let mut req = request(Code::PUT, "1/0/1");
        req.set_content_format(ContentFormat::JSON);
        req.payload = b"{}".to_vec();
        let handled = fx.send(req).await;
        assert_eq!(handled.response.code, Code::UNSUPPORTED_CONTENT_FORMAT);
    }

    #[tokio::test]
    async fn test_observe_only_when_registered() {
        let mut fx = Fixture::new();
        fx.peer = Peer::Pending;
        let mut req = request(Code::GET, "3/0/16");
        req.set_observe(0);
        let handled = fx.send(req.clone()).await;
        assert_eq!(handled.response.code, Code::CONTENT);
        assert_eq!(handled.response.observe(), None);
        assert!(fx.observations.is_empty());

        fx.peer = Peer::Registered;
        let handled = fx.send(req).await;
        assert_eq!(handled.response.observe(), Some(0));
        assert_eq!(fx.observations.len(), 1);

        let mut cancel = request(Code::GET, "3/0/16");
        cancel.set_observe(1);
        fx.send(cancel).await;
        assert!(fx.observations.is_empty());
    }

    #[tokio::test]
    async fn test_write_attributes_and_discover() {
        let mut fx = Fixture::new();
        let mut req = request(Code::PUT, "3/0/16");
        req.add_uri_query("pmin=10");
        req.add_uri_query("pmax=60");
        let handled = fx.send(req).await;
        assert_eq!(handled.response.code, Code::CHANGED);

        let mut req = request(Code::GET, "3/0/16");
        req.set_uint_option(option::ACCEPT, u32::from(ContentFormat::LINK_FORMAT));
        let handled = fx.send(req).await;
        assert_eq!(handled.response.content_format(), Some(ContentFormat::LINK_FORMAT));
        assert_eq!(
            String::from_utf8(handled.response.payload).unwrap(),
            "</3/0/16>;pmin=10;pmax=60"
        );
    }

    #[tokio::test]
    async fn test_execute_server_trigger_is_deferred() {
        let mut fx = Fixture::new();
        let handled = fx.send(request(Code::POST, "1/0/8")).await;
        assert_eq!(handled.response.code, Code::CHANGED);
        assert_eq!(handled.follow_ups, vec![FollowUp::RegistrationUpdate]);

        let handled = fx.send(request(Code::POST, "1/0/4")).await;
        assert_eq!(handled.follow_ups, vec![FollowUp::Disable { server_instance: 0 }]);
    }

    #[tokio::test]
    async fn test_execute_without_action() {
        let mut fx = Fixture::new();
        let handled = fx.send(request(Code::POST, "3/0/4")).await;
        assert_eq!(handled.response.code, Code::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_firmware_update_without_package() {
        let mut fx = Fixture::new();
        let handled = fx.send(request(Code::POST, "5/0/2")).await;
        assert_eq!(handled.response.code, Code::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_block1_push_out_of_order() {
        let mut fx = Fixture::new();
        let mut first = request(Code::PUT, "5/0/0");
        first.set_content_format(ContentFormat::OPAQUE);
        first.set_block1(BlockOption::new(0, true, 0));
        first.payload = vec![1; 16];
        let handled = fx.send(first).await;
        assert_eq!(handled.response.code, Code::CONTINUE);
        assert_eq!(
            fx.context.registry.value(firmware::ID, 0, firmware::STATE),
            Some(&ResourceValue::single(1i64))
        );

        let mut skipped = request(Code::PUT, "5/0/0");
        skipped.set_content_format(ContentFormat::OPAQUE);
        skipped.set_block1(BlockOption::new(2, false, 0));
        skipped.payload = vec![1; 4];
        let handled = fx.send(skipped).await;
        assert_eq!(handled.response.code, Code::REQUEST_ENTITY_INCOMPLETE);
        assert_eq!(
            fx.context.registry.value(firmware::ID, 0, firmware::STATE),
            Some(&ResourceValue::single(0i64))
        );
    }

    #[tokio::test]
    async fn test_large_read_is_block_wise() {
        let mut fx = Fixture::new();
        fx.context
            .registry
            .set_value(device::ID, 0, device::SUPPORTED_BINDINGS, ResourceValue::single("U".repeat(100)))
            .unwrap();
        let handled = fx.send(request(Code::GET, "3/0/16")).await;
        let block = handled.response.block2().unwrap().unwrap();
        assert_eq!((block.num, block.more, block.szx), (0, true, 2));
        assert_eq!(handled.response.payload.len(), 64);

        let mut next = request(Code::GET, "3/0/16");
        next.set_block2(BlockOption::new(1, false, 2));
        let handled = fx.send(next).await;
        let block = handled.response.block2().unwrap().unwrap();
        assert_eq!((block.num, block.more), (1, false));
        assert_eq!(handled.response.payload.len(), 36);
    }

    fn block_request(num: u32, accept: Option<u16>) -> Message {
        let mut req = request(Code::GET, "3/0/16");
        if let Some(accept) = accept {
            req.set_uint_option(option::ACCEPT, u32::from(accept));
        }
        if num > 0 {
            req.set_block2(BlockOption::new(num, false, 2));
        }
        req
    }

    fn set_bindings(fx: &mut Fixture, value: String) {
        fx.context
            .registry
            .set_value(device::ID, 0, device::SUPPORTED_BINDINGS, ResourceValue::single(value))
            .unwrap();
    }

    #[tokio::test]
    async fn test_notification_does_not_replace_read_transfer() {
        let mut fx = Fixture::new();
        set_bindings(&mut fx, "U".repeat(100));
        let first = fx.send(block_request(0, None)).await;
        assert_eq!(first.response.payload, b"U".repeat(64));

        let path = Path::resource(device::ID, 0, device::SUPPORTED_BINDINGS);
        let mut notification = Message::new(MessageType::NonConfirmable, Code::CONTENT);
        let complete = fx
            .dispatcher
            .shape_body(
                &mut notification,
                BodyKey::Notification {
                    token: vec![0xB2],
                    path,
                    content_format: ContentFormat::TEXT,
                },
                b"V".repeat(100),
                ContentFormat::TEXT,
                None,
                Instant::now(),
            )
            .unwrap();
        assert!(!complete);

        let rest = fx.send(block_request(1, None)).await;
        assert_eq!(rest.response.payload, b"U".repeat(36));
    }

    #[tokio::test]
    async fn test_block_transfer_follows_accept() {
        let mut fx = Fixture::new();
        set_bindings(&mut fx, "U".repeat(100));
        let first = fx.send(block_request(0, Some(ContentFormat::TLV))).await;
        assert_eq!(first.response.content_format(), Some(ContentFormat::TLV));

        let rest = fx.send(block_request(1, Some(ContentFormat::TEXT))).await;
        assert_eq!(rest.response.content_format(), Some(ContentFormat::TEXT));
        assert_eq!(rest.response.payload, b"U".repeat(36));
    }

    #[tokio::test]
    async fn test_notification_rest_fetched_by_get() {
        let mut fx = Fixture::new();
        set_bindings(&mut fx, "U".repeat(100));
        let path = Path::resource(device::ID, 0, device::SUPPORTED_BINDINGS);
        let mut notification = Message::new(MessageType::Confirmable, Code::CONTENT);
        fx.dispatcher
            .shape_body(
                &mut notification,
                BodyKey::Notification {
                    token: vec![0xB2],
                    path,
                    content_format: ContentFormat::TEXT,
                },
                b"V".repeat(100),
                ContentFormat::TEXT,
                None,
                Instant::now(),
            )
            .unwrap();

        let rest = fx.send(block_request(1, None)).await;
        assert_eq!(rest.response.payload, b"V".repeat(36));
    }

    #[tokio::test]
    async fn test_source_told_after_last_block() {
        #[derive(Default)]
        struct Snapshot(parking_lot::Mutex<usize>);

        #[async_trait]
        impl ReadSource for Snapshot {
            async fn read(&self, _instance: u16) -> lwm2m_core::Result<ResourceValue> {
                Ok(ResourceValue::single("U".repeat(100)))
            }

            async fn delivered(&self, _instance: u16) {
                *self.0.lock() += 1;
            }
        }

        let mut fx = Fixture::new();
        let source = Arc::new(Snapshot::default());
        fx.context
            .registry
            .set_source(device::ID, device::SUPPORTED_BINDINGS, source.clone());

        fx.send(block_request(0, None)).await;
        assert_eq!(*source.0.lock(), 0);
        fx.send(block_request(1, None)).await;
        assert_eq!(*source.0.lock(), 1);

        fx.send(request(Code::GET, "3/0/0")).await;
        assert_eq!(*source.0.lock(), 1);
    }

    #[tokio::test]
    async fn test_create_and_delete_instance() {
        let mut fx = Fixture::new();
        let mut values = ResourceSet::new();
        values.insert(server::LIFETIME, ResourceValue::single(300i64));
        values.insert(server::NOTIFICATION_STORING, ResourceValue::single(false));
        values.insert(server::BINDING, ResourceValue::single("U"));
        let mut req = request(Code::POST, "1");
        req.set_content_format(ContentFormat::TLV);
        req.payload = tlv::encode_instance(5, &values).unwrap();
        let handled = fx.send(req).await;
        assert_eq!(handled.response.code, Code::CREATED);
        assert_eq!(handled.response.location_path(), vec!["1", "5"]);
        assert_eq!(fx.context.registry.instance_ids(server::ID), vec![0, 5]);

        let handled = fx.send(request(Code::DELETE, "1/5")).await;
        assert_eq!(handled.response.code, Code::DELETED);
        assert_eq!(handled.follow_ups, vec![FollowUp::RegistrationUpdate]);
        assert_eq!(fx.context.registry.instance_ids(server::ID), vec![0]);
    }

    #[tokio::test]
    async fn test_bootstrap_session() {
        let mut fx = Fixture::new();
        let handled = fx.send(request(Code::POST, "bs")).await;
        assert_eq!(handled.response.code, Code::METHOD_NOT_ALLOWED);

        fx.peer = Peer::Bootstrap;
        let handled = fx.send(request(Code::DELETE, "")).await;
        assert_eq!(handled.response.code, Code::DELETED);
        assert!(fx.context.registry.instance_ids(server::ID).is_empty());

        let mut values = ResourceSet::new();
        values.insert(security::SERVER_URI, ResourceValue::single("coap://lwm2m.example.net"));
        values.insert(security::BOOTSTRAP_SERVER, ResourceValue::single(false));
        values.insert(security::SECURITY_MODE, ResourceValue::single(security::MODE_NOSEC));
        values.insert(security::SHORT_SERVER_ID, ResourceValue::single(7i64));
        let mut req = request(Code::PUT, "0/3");
        req.set_content_format(ContentFormat::TLV);
        req.payload = tlv::encode_resources(&values).unwrap();
        let handled = fx.send(req).await;
        assert_eq!(handled.response.code, Code::CHANGED);
        assert_eq!(
            fx.context.registry.value(security::ID, 3, security::SHORT_SERVER_ID),
            Some(&ResourceValue::single(7i64))
        );

        let handled = fx.send(request(Code::POST, "bs")).await;
        assert_eq!(handled.response.code, Code::CHANGED);
        assert_eq!(handled.follow_ups, vec![FollowUp::BootstrapFinished]);
    }
}
