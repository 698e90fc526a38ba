//! Client event loop
//!
//! One task owns the context, the registration machine, the observation
//! manager and the update engine. It multiplexes received datagrams, the
//! CoAP retransmission timers, the registration timer, notification
//! deadlines and update task completions. Connecting and reading the
//! socket run as spawned tasks that report back over a channel tagged with
//! a connection generation, so results from a torn down association are
//! dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lwm2m_coap::{
    create_transport, Code, ContentFormat, DatagramTransport, Endpoint, EndpointEvent, Message,
    MessageType, RequestId, TransmissionParams, TransportError, TransportTarget,
};
use lwm2m_core::objects::server;
use lwm2m_core::{Path, ResourceValue, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bearer::{self, BearerCandidate};
use crate::context::{ClientContext, ServerTarget, Session};
use crate::dispatch::{render, BodyKey, Dispatcher, FollowUp, Peer, Representation, RequestContext};
use crate::error::Result;
use crate::observe::{Attributes, ObservationManager};
use crate::registration::{Action, ConnectPlan, RegistrationMachine, UpdateOutcome};
use crate::update::{Collaborators, TaskEvent, UpdateEngine, UpdateSettings};

/// Opens datagram associations to servers
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        target: &TransportTarget,
        params: &TransmissionParams,
    ) -> std::result::Result<Arc<dyn DatagramTransport>, TransportError>;
}

/// UDP and DTLS-PSK sockets
pub struct NetConnector;

#[async_trait]
impl Connector for NetConnector {
    async fn connect(
        &self,
        target: &TransportTarget,
        params: &TransmissionParams,
    ) -> std::result::Result<Arc<dyn DatagramTransport>, TransportError> {
        create_transport(target, params).await
    }
}

#[derive(Debug)]
enum Command {
    Shutdown,
    TriggerUpdate,
}

/// Control handle for a running [`Engine`]
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    /// Deregister and stop the loop
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    /// Send a Registration Update now
    pub fn trigger_update(&self) {
        let _ = self.tx.send(Command::TriggerUpdate);
    }
}

/// Why [`Engine::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Stopped,
    /// A software update staged a new client; the supervisor restarts us
    RestartRequested,
}

enum LoopEvent {
    Connected {
        generation: u64,
        result: std::result::Result<Arc<dyn DatagramTransport>, TransportError>,
    },
    Datagram {
        generation: u64,
        bytes: Vec<u8>,
    },
    ReceiveFailed {
        generation: u64,
        error: TransportError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exchange {
    BootstrapRequest,
    Register,
    Update,
    Deregister,
}

/// Register or Update waiting for its response
struct Proposal {
    lifetime: u32,
    links: String,
}

pub struct Engine {
    context: ClientContext,
    machine: RegistrationMachine,
    observations: ObservationManager,
    updates: UpdateEngine,
    update_events: mpsc::UnboundedReceiver<TaskEvent>,
    dispatcher: Dispatcher,
    endpoint: Endpoint,
    params: TransmissionParams,
    connector: Arc<dyn Connector>,

    transport: Option<Arc<dyn DatagramTransport>>,
    connecting: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    generation: u64,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
    events_rx: mpsc::UnboundedReceiver<LoopEvent>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,

    timer: Option<Instant>,
    exchanges: HashMap<RequestId, Exchange>,
    proposal: Option<Proposal>,
    /// An Update was asked for while another one was in flight
    update_wanted: bool,
    restart: bool,
    stopped: bool,
}

impl Engine {
    pub fn new(context: ClientContext, collaborators: Collaborators, connector: Arc<dyn Connector>) -> Self {
        let config = &context.config;
        let params = config.transmission.to_params();
        let machine = RegistrationMachine::new(
            config.registration.clone(),
            config
                .bootstrap
                .as_ref()
                .map_or(Duration::from_secs(60), |b| Duration::from_secs(b.timeout_secs)),
        );
        let observations =
            ObservationManager::new(Duration::from_millis(config.observation.sample_interval_ms));
        let (updates, update_events) = UpdateEngine::new(UpdateSettings::from(config), collaborators);
        let dispatcher = Dispatcher::new(config.update.max_push_size, config.block_szx);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            endpoint: Endpoint::new(params.clone()),
            context,
            machine,
            observations,
            updates,
            update_events,
            dispatcher,
            params,
            connector,
            transport: None,
            connecting: None,
            reader: None,
            generation: 0,
            events_tx,
            events_rx,
            commands_tx,
            commands_rx,
            timer: None,
            exchanges: HashMap::new(),
            proposal: None,
            update_wanted: false,
            restart: false,
            stopped: false,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            tx: self.commands_tx.clone(),
        }
    }

    pub fn context(&self) -> &ClientContext {
        &self.context
    }

    /// Drive the client until it stops
    pub async fn run(mut self) -> Result<ExitReason> {
        tokio::fs::create_dir_all(self.updates.staging_dir()).await?;
        let restored = self.updates.restore(&mut self.context.registry).await;
        self.mark_changed(&restored);

        info!(endpoint = %self.context.config.endpoint, "Client starting");
        let plan = self.plan();
        let actions = self.machine.start(plan);
        self.apply(actions).await;

        while !self.stopped {
            let deadline = self.next_deadline();
            tokio::select! {
                Some(command) = self.commands_rx.recv() => self.on_command(command).await,
                Some(event) = self.events_rx.recv() => self.on_loop_event(event).await,
                Some(task) = self.update_events.recv() => {
                    let changed = self.updates.on_task_event(&mut self.context.registry, task).await;
                    self.mark_changed(&changed);
                    self.check_restart().await;
                }
                _ = sleep_until(deadline) => self.on_tick().await,
            }
        }

        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        let reason = if self.restart {
            ExitReason::RestartRequested
        } else {
            ExitReason::Stopped
        };
        info!(?reason, "Client stopped");
        Ok(reason)
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut deadlines = vec![self.endpoint.next_deadline(), self.timer];
        if self.machine.is_registered() {
            deadlines.push(self.observations.next_deadline());
        }
        deadlines.into_iter().flatten().min()
    }

    fn plan(&self) -> ConnectPlan {
        let preferred = self.context.preferred_bearers();
        ConnectPlan {
            servers: self.context.servers(),
            bootstrap: self.context.bootstrap_server(),
            bearers: bearer::candidates(&preferred, &self.context.config.bearers, self.context.config.bind),
        }
    }

    fn mark_changed(&mut self, changed: &[Path]) {
        for path in changed {
            self.observations.mark_changed(path);
        }
    }

    // =========================================================================
    // Loop inputs
    // =========================================================================

    async fn on_command(&mut self, command: Command) {
        debug!(?command, "Command");
        let actions = match command {
            Command::Shutdown => self.machine.shutdown(),
            Command::TriggerUpdate => self.request_update(),
        };
        self.apply(actions).await;
    }

    async fn on_loop_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Connected { generation, result } => {
                if generation != self.generation {
                    if let Ok(stale) = result {
                        let _ = stale.close().await;
                    }
                    return;
                }
                self.connecting = None;
                let actions = match result {
                    Ok(transport) => {
                        info!(
                            peer = ?transport.peer(),
                            secure = transport.is_secure(),
                            "Connected"
                        );
                        self.endpoint.reset();
                        self.spawn_reader(transport.clone());
                        self.transport = Some(transport);
                        self.machine.on_connected()
                    }
                    Err(e) => {
                        warn!(error = %e, "Connect failed");
                        self.machine.on_connect_failed()
                    }
                };
                self.apply(actions).await;
            }
            LoopEvent::Datagram { generation, bytes } => {
                if generation != self.generation {
                    return;
                }
                let events = self.endpoint.handle(&bytes, Instant::now());
                self.on_endpoint_events(events).await;
            }
            LoopEvent::ReceiveFailed { generation, error } => {
                if generation != self.generation {
                    return;
                }
                warn!(error = %error, "Receive failed");
                self.close().await;
                let actions = self.machine.on_connection_lost();
                self.apply(actions).await;
            }
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        let events = self.endpoint.poll(now);
        self.on_endpoint_events(events).await;

        if self.timer.is_some_and(|t| t <= now) {
            self.timer = None;
            let actions = self.machine.on_timer();
            self.apply(actions).await;
        }
        if self.machine.is_registered() {
            self.notify_due(now).await;
        }
        self.dispatcher.expire(now);
    }

    async fn on_endpoint_events(&mut self, events: Vec<EndpointEvent>) {
        for event in events {
            match event {
                EndpointEvent::Transmit(bytes) => self.transmit(bytes).await,
                EndpointEvent::Request(request) => self.on_request(request).await,
                EndpointEvent::Response { id, message } => self.on_response(id, message).await,
                EndpointEvent::Failed { id, error } => self.on_failed(id, error).await,
                EndpointEvent::Reset { token } | EndpointEvent::Undelivered { token } => {
                    if self.observations.cancel_token(&token) {
                        info!(token = ?token, "Observation ended by the server");
                    }
                }
            }
        }
    }

    // =========================================================================
    // Server requests
    // =========================================================================

    async fn on_request(&mut self, request: Message) {
        let peer = if self.machine.is_bootstrapping() {
            Peer::Bootstrap
        } else if self.machine.is_registered() {
            Peer::Registered
        } else {
            Peer::Pending
        };
        let defaults = self.server_defaults();
        let now = Instant::now();
        let handled = {
            let mut ctx = RequestContext {
                registry: &mut self.context.registry,
                observations: &mut self.observations,
                updates: &mut self.updates,
                peer,
                defaults,
                now,
            };
            self.dispatcher.handle(&request, &mut ctx).await
        };
        let bytes = self.endpoint.respond(&request, handled.response, now);
        self.transmit(bytes).await;

        for follow_up in handled.follow_ups {
            let actions = match follow_up {
                FollowUp::RegistrationUpdate => self.request_update(),
                FollowUp::Disable { server_instance } => {
                    let timeout = self.disable_timeout(server_instance);
                    self.machine.disable(timeout)
                }
                FollowUp::BootstrapFinished => {
                    if !self.context.has_valid_server() {
                        warn!("Bootstrap finished without a usable server account");
                    }
                    self.machine.on_bootstrap_finished()
                }
            };
            self.apply(actions).await;
        }
        self.check_restart().await;
    }

    /// Default pmin/pmax from the Server instance of the current session
    fn server_defaults(&self) -> Attributes {
        let Some(instance) = self
            .machine
            .current_server()
            .and_then(|s| self.context.server_instance(s.short_server_id))
        else {
            return Attributes::default();
        };
        let period = |resource| {
            self.server_int(instance, resource)
                .and_then(|v| u32::try_from(v).ok())
        };
        Attributes {
            pmin: period(server::DEFAULT_MIN_PERIOD),
            pmax: period(server::DEFAULT_MAX_PERIOD),
            ..Attributes::default()
        }
    }

    fn server_int(&self, instance: u16, resource: u16) -> Option<i64> {
        self.context
            .registry
            .value(server::ID, instance, resource)
            .and_then(ResourceValue::as_single)
            .and_then(Value::as_integer)
    }

    fn disable_timeout(&self, server_instance: u16) -> Duration {
        let secs = self
            .server_int(server_instance, server::DISABLE_TIMEOUT)
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(86400);
        Duration::from_secs(secs)
    }

    fn request_update(&mut self) -> Vec<Action> {
        if self.exchanges.values().any(|e| *e == Exchange::Update) {
            self.update_wanted = true;
            return Vec::new();
        }
        self.machine.trigger_update()
    }

    async fn check_restart(&mut self) {
        if self.updates.take_restart_request() {
            info!("Restart requested by the software updater");
            self.restart = true;
            let actions = self.machine.shutdown();
            self.apply(actions).await;
        }
    }

    // =========================================================================
    // Actions
    // =========================================================================

    async fn apply(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            debug!(?action, "Registration action");
            match action {
                Action::Connect { server, bearer } => self.connect(server, bearer).await,
                Action::SendBootstrapRequest => queue.extend(self.send_bootstrap_request().await),
                Action::SendRegister => queue.extend(self.send_register().await),
                Action::SendUpdate => queue.extend(self.send_update().await),
                Action::SendDeregister => queue.extend(self.send_deregister().await),
                Action::SetTimer(after) => self.timer = Some(Instant::now() + after),
                Action::CancelTimer => self.timer = None,
                Action::CancelObservations => self.observations.clear(),
                Action::Close => self.close().await,
                Action::Replan => {
                    let plan = self.plan();
                    queue.extend(self.machine.start(plan));
                }
                Action::Stop => self.stopped = true,
            }
        }
    }

    async fn connect(&mut self, server: ServerTarget, bearer: BearerCandidate) {
        self.close().await;
        let generation = self.generation;
        let target = TransportTarget {
            host: server.uri.host.clone(),
            port: server.uri.port,
            bind: bearer.bind,
            security: server.security.clone(),
        };
        let connector = self.connector.clone();
        let params = self.params.clone();
        let tx = self.events_tx.clone();
        self.connecting = Some(tokio::spawn(async move {
            let result = connector.connect(&target, &params).await;
            let _ = tx.send(LoopEvent::Connected { generation, result });
        }));
    }

    fn spawn_reader(&mut self, transport: Arc<dyn DatagramTransport>) {
        let generation = self.generation;
        let tx = self.events_tx.clone();
        self.reader = Some(tokio::spawn(async move {
            loop {
                match transport.recv().await {
                    Ok(bytes) => {
                        if tx.send(LoopEvent::Datagram { generation, bytes }).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        let _ = tx.send(LoopEvent::ReceiveFailed { generation, error });
                        break;
                    }
                }
            }
        }));
    }

    /// Tear down the association; events from it are ignored from now on
    async fn close(&mut self) {
        self.generation += 1;
        for task in [self.connecting.take(), self.reader.take()].into_iter().flatten() {
            task.abort();
        }
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!(error = %e, "Close failed");
            }
            debug!("Connection closed");
        }
        self.endpoint.reset();
        self.exchanges.clear();
        self.proposal = None;
    }

    async fn transmit(&mut self, bytes: Vec<u8>) {
        let Some(transport) = &self.transport else {
            debug!(len = bytes.len(), "Dropping datagram, not connected");
            return;
        };
        if let Err(e) = transport.send(&bytes).await {
            warn!(error = %e, "Send failed");
        }
    }

    /// Queue a request on the endpoint; false when there is no connection
    async fn send(&mut self, message: Message, exchange: Exchange) -> bool {
        if self.transport.is_none() {
            return false;
        }
        let (id, bytes) = self.endpoint.send_request(message, Instant::now());
        self.exchanges.insert(id, exchange);
        self.transmit(bytes).await;
        true
    }

    // =========================================================================
    // Registration interface
    // =========================================================================

    async fn send_bootstrap_request(&mut self) -> Vec<Action> {
        let mut message = Message::request(Code::POST, "bs");
        message.add_uri_query(&format!("ep={}", self.context.config.endpoint));
        if !self.send(message, Exchange::BootstrapRequest).await {
            return self.machine.on_bootstrap_failed();
        }
        info!(endpoint = %self.context.config.endpoint, "Bootstrap-Request sent");
        Vec::new()
    }

    async fn send_register(&mut self) -> Vec<Action> {
        let Some(server) = self.machine.current_server().cloned() else {
            return self.machine.on_register_failed();
        };
        let lifetime = self.lifetime_of(&server);
        let links = self.context.registry.registration_links();
        let mut message = Message::request(Code::POST, "rd");
        message.add_uri_query(&format!("ep={}", self.context.config.endpoint));
        message.add_uri_query(&format!("lt={}", lifetime));
        message.add_uri_query("lwm2m=1.0");
        message.add_uri_query(&format!("b={}", server.binding));
        message.set_content_format(ContentFormat::LINK_FORMAT);
        message.payload = links.clone().into_bytes();
        if !self.send(message, Exchange::Register).await {
            return self.machine.on_register_failed();
        }
        info!(server = server.short_server_id, lifetime, "Register sent");
        self.proposal = Some(Proposal { lifetime, links });
        Vec::new()
    }

    async fn send_update(&mut self) -> Vec<Action> {
        let (Some(session), Some(server)) = (self.context.session.clone(), self.machine.current_server().cloned())
        else {
            return self.machine.on_update_result(UpdateOutcome::NotFound);
        };
        let lifetime = self.lifetime_of(&server);
        let links = self.context.registry.registration_links();
        let mut message = Message::request(Code::POST, &session.location_path());
        if lifetime != session.lifetime {
            message.add_uri_query(&format!("lt={}", lifetime));
        }
        if links != session.links {
            message.set_content_format(ContentFormat::LINK_FORMAT);
            message.payload = links.clone().into_bytes();
        }
        if !self.send(message, Exchange::Update).await {
            return self.machine.on_update_result(UpdateOutcome::Failed);
        }
        debug!(location = %session.location_path(), lifetime, "Update sent");
        self.proposal = Some(Proposal { lifetime, links });
        Vec::new()
    }

    async fn send_deregister(&mut self) -> Vec<Action> {
        let Some(session) = self.context.session.take() else {
            return self.machine.on_deregistered();
        };
        let message = Message::request(Code::DELETE, &session.location_path());
        if !self.send(message, Exchange::Deregister).await {
            return self.machine.on_deregistered();
        }
        info!(location = %session.location_path(), "Deregister sent");
        Vec::new()
    }

    /// Lifetime currently written in the server's Server instance
    fn lifetime_of(&self, server: &ServerTarget) -> u32 {
        self.context
            .server_instance(server.short_server_id)
            .and_then(|i| self.server_int(i, server::LIFETIME))
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v > 0)
            .unwrap_or(server.lifetime)
    }

    async fn on_response(&mut self, id: RequestId, message: Message) {
        let Some(exchange) = self.exchanges.remove(&id) else {
            debug!(%id, code = %message.code, "Response to a forgotten request");
            return;
        };
        debug!(%id, ?exchange, code = %message.code, "Response");
        let actions = match exchange {
            Exchange::BootstrapRequest if message.code == Code::CHANGED => {
                info!("Bootstrap-Request accepted");
                self.machine.on_bootstrap_accepted()
            }
            Exchange::BootstrapRequest => {
                warn!(code = %message.code, "Bootstrap-Request rejected");
                self.machine.on_bootstrap_failed()
            }
            Exchange::Register if message.code == Code::CREATED => self.registered(message),
            Exchange::Register => {
                warn!(code = %message.code, "Register rejected");
                self.machine.on_register_failed()
            }
            Exchange::Update => self.updated(message.code),
            Exchange::Deregister => {
                info!(code = %message.code, "Deregistered");
                self.machine.on_deregistered()
            }
        };
        self.apply(actions).await;
    }

    fn registered(&mut self, message: Message) -> Vec<Action> {
        let location = message.location_path();
        let (Some(proposal), Some(server), Some(bearer)) = (
            self.proposal.take(),
            self.machine.current_server().cloned(),
            self.machine.current_bearer().cloned(),
        ) else {
            return self.machine.on_register_failed();
        };
        if location.is_empty() {
            warn!("Register response carries no Location-Path");
            return self.machine.on_register_failed();
        }
        let session = Session {
            short_server_id: server.short_server_id,
            location,
            lifetime: proposal.lifetime,
            links: proposal.links,
            bearer: bearer.name,
        };
        info!(
            server = session.short_server_id,
            location = %session.location_path(),
            lifetime = session.lifetime,
            bearer = %session.bearer,
            "Registered"
        );
        let lifetime = session.lifetime;
        self.context.session = Some(session);
        self.machine.on_registered(lifetime)
    }

    fn updated(&mut self, code: Code) -> Vec<Action> {
        let proposal = self.proposal.take();
        let outcome = if code == Code::CHANGED {
            if let (Some(proposal), Some(session)) = (proposal, self.context.session.as_mut()) {
                session.lifetime = proposal.lifetime;
                session.links = proposal.links;
                self.machine.set_lifetime(proposal.lifetime);
            }
            UpdateOutcome::Success
        } else if code == Code::NOT_FOUND {
            self.context.session = None;
            UpdateOutcome::NotFound
        } else {
            warn!(code = %code, "Update rejected");
            UpdateOutcome::Failed
        };
        let mut actions = self.machine.on_update_result(outcome);
        if outcome == UpdateOutcome::Success && std::mem::take(&mut self.update_wanted) {
            actions.extend(self.machine.trigger_update());
        }
        actions
    }

    async fn on_failed(&mut self, id: RequestId, error: TransportError) {
        let Some(exchange) = self.exchanges.remove(&id) else {
            return;
        };
        warn!(%id, ?exchange, error = %error, "Request failed");
        self.proposal = None;
        let actions = match exchange {
            Exchange::BootstrapRequest => self.machine.on_bootstrap_failed(),
            Exchange::Register => self.machine.on_register_failed(),
            Exchange::Update => self.machine.on_update_result(UpdateOutcome::Failed),
            Exchange::Deregister => self.machine.on_deregistered(),
        };
        self.apply(actions).await;
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    async fn notify_due(&mut self, now: Instant) {
        for token in self.observations.due(now) {
            let Some((path, content_format)) = self
                .observations
                .get(&token)
                .map(|o| (o.path, o.content_format))
            else {
                continue;
            };
            match render(&self.context.registry, &path, Some(content_format)).await {
                Ok(rep) => {
                    if let Some(sequence) = self.observations.evaluate(&token, &rep.payload, rep.value, now) {
                        self.notify(token, path, sequence, rep, now).await;
                    }
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Observed value unreadable, ending observation");
                    self.observations.cancel_token(&token);
                    let mut message = Message::new(self.notification_type(), Code(e.coap_code()));
                    message.token = token;
                    let bytes = self.endpoint.send_message(message, now);
                    self.transmit(bytes).await;
                }
            }
        }
    }

    async fn notify(&mut self, token: Vec<u8>, path: Path, sequence: u32, rep: Representation, now: Instant) {
        let mut message = Message::new(self.notification_type(), Code::CONTENT);
        message.token = token.clone();
        message.set_observe(sequence);
        let key = BodyKey::Notification {
            token,
            path,
            content_format: rep.content_format,
        };
        let complete = match self.dispatcher.shape_body(
            &mut message,
            key,
            rep.payload,
            rep.content_format,
            None,
            now,
        ) {
            Ok(complete) => complete,
            Err(e) => {
                error!(path = %path, error = %e, "Dropping notification");
                return;
            }
        };
        debug!(path = %path, sequence, len = message.payload.len(), "Notify");
        let bytes = self.endpoint.send_message(message, now);
        self.transmit(bytes).await;
        if complete {
            self.context.registry.delivered(&path).await;
        }
    }

    fn notification_type(&self) -> MessageType {
        if self.context.config.observation.confirmable {
            MessageType::Confirmable
        } else {
            MessageType::NonConfirmable
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
