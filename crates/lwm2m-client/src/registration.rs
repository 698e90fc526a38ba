//! Registration and bootstrap state machine
//!
//! Pure state machine: every input returns the [`Action`]s the engine has
//! to perform (open a connection, send a request, arm the timer). Nothing
//! here does I/O, so retry ordering is testable step by step.
//!
//! ```text
//! Bootstrapping -> Registering -> Registered <-> Updating
//!        |              |             |
//!        +--------------+-> ServerUnreachable
//!                                     v
//!                     Deregistering -> Disabled | Stopped
//! ```

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bearer::BearerCandidate;
use crate::config::RegistrationConfig;
use crate::context::ServerTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Idle,
    Bootstrapping,
    Registering,
    Registered,
    /// Registration Update in flight
    Updating,
    Deregistering,
    /// Server executed Disable, waiting for the disable timeout
    Disabled,
    ServerUnreachable,
    Stopped,
}

impl RegistrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationState::Idle => "idle",
            RegistrationState::Bootstrapping => "bootstrapping",
            RegistrationState::Registering => "registering",
            RegistrationState::Registered => "registered",
            RegistrationState::Updating => "updating",
            RegistrationState::Deregistering => "deregistering",
            RegistrationState::Disabled => "disabled",
            RegistrationState::ServerUnreachable => "server_unreachable",
            RegistrationState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work requested from the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Drop any current association and open one to `server` over `bearer`
    Connect {
        server: ServerTarget,
        bearer: BearerCandidate,
    },
    SendBootstrapRequest,
    SendRegister,
    SendUpdate,
    SendDeregister,
    /// Arm the single state machine timer, replacing any armed one
    SetTimer(Duration),
    CancelTimer,
    CancelObservations,
    /// Close the current association
    Close,
    /// Re-read server accounts and call [`RegistrationMachine::start`]
    Replan,
    /// Terminal: leave the event loop
    Stop,
}

/// Servers and bearers to work through, in priority order
#[derive(Debug, Clone, Default)]
pub struct ConnectPlan {
    pub servers: Vec<ServerTarget>,
    pub bootstrap: Option<ServerTarget>,
    pub bearers: Vec<BearerCandidate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    HoldOff,
    Retry,
    Lifetime,
    BootstrapFinish,
    Disable,
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterDeregister {
    Stop,
    Disable(Duration),
}

/// Outcome of a Registration Update request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Success,
    /// 4.04: the server forgot the registration
    NotFound,
    /// Timeout or any other error response
    Failed,
}

/// Seconds before lifetime expiry at which the Update is sent
///
/// The margin defaults to a tenth of the lifetime, is at least one second
/// and never more than half the lifetime.
pub fn update_delay(lifetime: u32, margin: Option<u32>) -> Duration {
    let margin = margin.unwrap_or(lifetime / 10).max(1).min(lifetime / 2);
    Duration::from_secs(u64::from(lifetime.saturating_sub(margin).max(1)))
}

pub struct RegistrationMachine {
    config: RegistrationConfig,
    bootstrap_timeout: Duration,
    state: RegistrationState,
    plan: ConnectPlan,
    server_index: usize,
    bearer_index: usize,
    /// Failed attempts on the current server and bearer
    attempts: u32,
    timer: Option<Timer>,
    after_deregister: AfterDeregister,
    /// A bootstrap completed since the last unreachable back-off
    bootstrapped: bool,
    lifetime: u32,
}

impl RegistrationMachine {
    pub fn new(config: RegistrationConfig, bootstrap_timeout: Duration) -> Self {
        Self {
            config,
            bootstrap_timeout,
            state: RegistrationState::Idle,
            plan: ConnectPlan::default(),
            server_index: 0,
            bearer_index: 0,
            attempts: 0,
            timer: None,
            after_deregister: AfterDeregister::Stop,
            bootstrapped: false,
            lifetime: 0,
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    pub fn is_registered(&self) -> bool {
        matches!(
            self.state,
            RegistrationState::Registered | RegistrationState::Updating
        )
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.state == RegistrationState::Bootstrapping
    }

    /// Server currently targeted, the bootstrap server while bootstrapping
    pub fn current_server(&self) -> Option<&ServerTarget> {
        if self.is_bootstrapping() {
            self.plan.bootstrap.as_ref()
        } else {
            self.plan.servers.get(self.server_index)
        }
    }

    pub fn current_bearer(&self) -> Option<&BearerCandidate> {
        self.plan.bearers.get(self.bearer_index)
    }

    fn enter(&mut self, next: RegistrationState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Registration state");
            self.state = next;
        }
    }

    fn arm(&mut self, timer: Timer, after: Duration) -> Action {
        self.timer = Some(timer);
        Action::SetTimer(after)
    }

    // =========================================================================
    // Inputs
    // =========================================================================

    /// Begin with a fresh set of accounts
    pub fn start(&mut self, plan: ConnectPlan) -> Vec<Action> {
        if self.state == RegistrationState::Stopped {
            return Vec::new();
        }
        self.plan = plan;
        if self.plan.bearers.is_empty() {
            warn!("No bearer available");
            return self.unreachable();
        }
        self.server_index = 0;
        self.bearer_index = 0;
        self.attempts = 0;

        if !self.plan.servers.is_empty() {
            self.enter(RegistrationState::Registering);
            return self.connect();
        }
        let hold_off = match &self.plan.bootstrap {
            Some(bs) if !self.bootstrapped => Some(bs.hold_off),
            _ => None,
        };
        match hold_off {
            Some(hold_off) => {
                self.enter(RegistrationState::Bootstrapping);
                if hold_off > 0 {
                    info!(hold_off, "Waiting before bootstrap");
                    return vec![self.arm(Timer::HoldOff, Duration::from_secs(u64::from(hold_off)))];
                }
                self.connect()
            }
            None => {
                warn!("No usable LwM2M server account");
                self.unreachable()
            }
        }
    }

    pub fn on_connected(&mut self) -> Vec<Action> {
        match self.state {
            RegistrationState::Bootstrapping => vec![Action::SendBootstrapRequest],
            RegistrationState::Registering => vec![Action::SendRegister],
            _ => Vec::new(),
        }
    }

    /// Connect or handshake failure
    pub fn on_connect_failed(&mut self) -> Vec<Action> {
        match self.state {
            RegistrationState::Bootstrapping | RegistrationState::Registering => self.retry(),
            _ => Vec::new(),
        }
    }

    /// The association dropped underneath an established session
    pub fn on_connection_lost(&mut self) -> Vec<Action> {
        match self.state {
            RegistrationState::Registered | RegistrationState::Updating => {
                warn!("Connection lost, registering again");
                self.enter(RegistrationState::Registering);
                let mut actions = vec![Action::CancelTimer, Action::CancelObservations];
                actions.extend(self.connect());
                actions
            }
            RegistrationState::Bootstrapping | RegistrationState::Registering => self.retry(),
            RegistrationState::Deregistering => self.on_deregistered(),
            _ => Vec::new(),
        }
    }

    /// Lifetime the next renewal is scheduled from
    pub fn set_lifetime(&mut self, lifetime: u32) {
        self.lifetime = lifetime;
    }

    pub fn on_register_failed(&mut self) -> Vec<Action> {
        if self.state != RegistrationState::Registering {
            return Vec::new();
        }
        self.retry()
    }

    pub fn on_registered(&mut self, lifetime: u32) -> Vec<Action> {
        if self.state != RegistrationState::Registering {
            return Vec::new();
        }
        self.attempts = 0;
        self.lifetime = lifetime;
        self.enter(RegistrationState::Registered);
        vec![self.arm(Timer::Lifetime, update_delay(lifetime, self.config.update_margin_secs))]
    }

    pub fn on_update_result(&mut self, outcome: UpdateOutcome) -> Vec<Action> {
        if self.state != RegistrationState::Updating {
            return Vec::new();
        }
        match outcome {
            UpdateOutcome::Success => {
                self.enter(RegistrationState::Registered);
                vec![self.arm(
                    Timer::Lifetime,
                    update_delay(self.lifetime, self.config.update_margin_secs),
                )]
            }
            UpdateOutcome::NotFound => {
                info!("Registration no longer known to the server, registering again");
                self.enter(RegistrationState::Registering);
                vec![Action::CancelObservations, Action::SendRegister]
            }
            UpdateOutcome::Failed => {
                warn!("Registration update failed, reconnecting");
                self.enter(RegistrationState::Registering);
                let mut actions = vec![Action::CancelObservations];
                actions.extend(self.connect());
                actions
            }
        }
    }

    /// Send an Update now (lifetime or object set changed, or trigger)
    pub fn trigger_update(&mut self) -> Vec<Action> {
        if self.state != RegistrationState::Registered {
            return Vec::new();
        }
        self.enter(RegistrationState::Updating);
        vec![Action::CancelTimer, Action::SendUpdate]
    }

    pub fn on_bootstrap_accepted(&mut self) -> Vec<Action> {
        if self.state != RegistrationState::Bootstrapping {
            return Vec::new();
        }
        self.attempts = 0;
        vec![self.arm(Timer::BootstrapFinish, self.bootstrap_timeout)]
    }

    pub fn on_bootstrap_failed(&mut self) -> Vec<Action> {
        if self.state != RegistrationState::Bootstrapping {
            return Vec::new();
        }
        self.retry()
    }

    pub fn on_bootstrap_finished(&mut self) -> Vec<Action> {
        if self.state != RegistrationState::Bootstrapping {
            return Vec::new();
        }
        info!("Bootstrap finished");
        self.bootstrapped = true;
        self.timer = None;
        vec![Action::CancelTimer, Action::Close, Action::Replan]
    }

    /// Server executed Disable on its Server instance
    pub fn disable(&mut self, timeout: Duration) -> Vec<Action> {
        if !self.is_registered() {
            return Vec::new();
        }
        self.after_deregister = AfterDeregister::Disable(timeout);
        self.enter(RegistrationState::Deregistering);
        vec![Action::CancelTimer, Action::SendDeregister]
    }

    pub fn shutdown(&mut self) -> Vec<Action> {
        self.after_deregister = AfterDeregister::Stop;
        if self.is_registered() {
            self.enter(RegistrationState::Deregistering);
            return vec![Action::CancelTimer, Action::SendDeregister];
        }
        if self.state == RegistrationState::Deregistering {
            return Vec::new();
        }
        self.stop()
    }

    /// Deregister completed; failures are not retried
    pub fn on_deregistered(&mut self) -> Vec<Action> {
        if self.state != RegistrationState::Deregistering {
            return Vec::new();
        }
        match self.after_deregister {
            AfterDeregister::Stop => self.stop(),
            AfterDeregister::Disable(timeout) => {
                info!(timeout_secs = timeout.as_secs(), "Server disabled");
                self.enter(RegistrationState::Disabled);
                vec![
                    Action::CancelObservations,
                    Action::Close,
                    self.arm(Timer::Disable, timeout),
                ]
            }
        }
    }

    pub fn on_timer(&mut self) -> Vec<Action> {
        let Some(timer) = self.timer.take() else {
            return Vec::new();
        };
        match (timer, self.state) {
            (Timer::HoldOff | Timer::Retry, RegistrationState::Bootstrapping)
            | (Timer::Retry, RegistrationState::Registering) => self.connect(),
            (Timer::Lifetime, RegistrationState::Registered) => {
                self.enter(RegistrationState::Updating);
                vec![Action::SendUpdate]
            }
            (Timer::BootstrapFinish, RegistrationState::Bootstrapping) => {
                warn!("Bootstrap server did not finish in time");
                self.unreachable()
            }
            (Timer::Disable, RegistrationState::Disabled) => vec![Action::Replan],
            (Timer::Unreachable, RegistrationState::ServerUnreachable) => {
                self.bootstrapped = false;
                vec![Action::Replan]
            }
            (timer, state) => {
                debug!(?timer, %state, "Ignoring stale timer");
                Vec::new()
            }
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn connect(&mut self) -> Vec<Action> {
        let target = match (self.current_server(), self.current_bearer()) {
            (Some(server), Some(bearer)) => Some((server.clone(), bearer.clone())),
            _ => None,
        };
        let Some((server, bearer)) = target else {
            return self.unreachable();
        };
        info!(
            server = server.short_server_id,
            host = %server.uri.host,
            bearer = %bearer.name,
            attempt = self.attempts + 1,
            "Connecting"
        );
        vec![Action::Connect { server, bearer }]
    }

    /// Next attempt: same bearer with back-off, then the next bearer, then
    /// the next server
    fn retry(&mut self) -> Vec<Action> {
        self.attempts += 1;
        let mut actions = vec![Action::Close];
        if self.attempts < self.config.attempts_per_bearer.max(1) {
            let delay = self.backoff(self.attempts);
            debug!(attempt = self.attempts, delay_secs = delay.as_secs(), "Retrying");
            actions.push(self.arm(Timer::Retry, delay));
            return actions;
        }

        self.attempts = 0;
        self.bearer_index += 1;
        if self.bearer_index >= self.plan.bearers.len() {
            self.bearer_index = 0;
            let servers = if self.is_bootstrapping() {
                1
            } else {
                self.plan.servers.len()
            };
            self.server_index += 1;
            if self.server_index >= servers {
                actions.extend(self.unreachable());
                return actions;
            }
            info!(server_index = self.server_index, "Failing over to next server");
        } else if let Some(bearer) = self.current_bearer() {
            info!(bearer = %bearer.name, "Switching bearer");
        }
        let delay = Duration::from_secs(self.config.retry_delay_secs);
        actions.push(self.arm(Timer::Retry, delay));
        actions
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_delay_secs.max(1);
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_secs(base.saturating_mul(factor).min(self.config.max_retry_delay_secs.max(base)))
    }

    fn unreachable(&mut self) -> Vec<Action> {
        warn!(
            retry_secs = self.config.unreachable_retry_secs,
            "Server unreachable on every bearer"
        );
        self.server_index = 0;
        self.bearer_index = 0;
        self.attempts = 0;
        self.enter(RegistrationState::ServerUnreachable);
        vec![
            Action::CancelObservations,
            Action::Close,
            self.arm(
                Timer::Unreachable,
                Duration::from_secs(self.config.unreachable_retry_secs),
            ),
        ]
    }

    fn stop(&mut self) -> Vec<Action> {
        self.timer = None;
        self.enter(RegistrationState::Stopped);
        vec![
            Action::CancelTimer,
            Action::CancelObservations,
            Action::Close,
            Action::Stop,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerUri;
    use lwm2m_coap::Security;
    use pretty_assertions::assert_eq;

    fn server(id: u16, host: &str) -> ServerTarget {
        ServerTarget {
            short_server_id: id,
            security_instance: id,
            server_instance: Some(id),
            uri: ServerUri {
                secure: false,
                host: host.to_string(),
                port: 5683,
            },
            security: Security::NoSec,
            lifetime: 300,
            binding: "U".into(),
            disable_timeout: 60,
            default_pmin: None,
            default_pmax: None,
            hold_off: 0,
        }
    }

    fn bearer(name: &str) -> BearerCandidate {
        BearerCandidate {
            name: name.into(),
            bearer: 0,
            bind: "0.0.0.0:0".parse().unwrap(),
        }
    }

    fn config() -> RegistrationConfig {
        RegistrationConfig {
            attempts_per_bearer: 2,
            retry_delay_secs: 5,
            max_retry_delay_secs: 60,
            unreachable_retry_secs: 300,
            update_margin_secs: None,
        }
    }

    fn connect_target(actions: &[Action]) -> Option<(u16, String)> {
        actions.iter().find_map(|a| match a {
            Action::Connect { server, bearer } => Some((server.short_server_id, bearer.name.clone())),
            _ => None,
        })
    }

    #[test]
    fn test_update_delay() {
        assert_eq!(update_delay(300, None), Duration::from_secs(270));
        assert_eq!(update_delay(5, None), Duration::from_secs(4));
        assert_eq!(update_delay(100, Some(80)), Duration::from_secs(50));
        assert_eq!(update_delay(1, None), Duration::from_secs(1));
    }

    #[test]
    fn test_bearer_cycling_in_priority_order() {
        let mut machine = RegistrationMachine::new(config(), Duration::from_secs(60));
        let mut actions = machine.start(ConnectPlan {
            servers: vec![server(101, "a"), server(102, "b")],
            bootstrap: None,
            bearers: vec![bearer("eth0"), bearer("wwan0")],
        });

        let mut visited = Vec::new();
        loop {
            if let Some(target) = connect_target(&actions) {
                visited.push(target);
                actions = machine.on_connected();
                assert_eq!(actions, vec![Action::SendRegister]);
                actions = machine.on_register_failed();
            }
            if machine.state() == RegistrationState::ServerUnreachable {
                break;
            }
            assert!(matches!(actions.last(), Some(Action::SetTimer(_))));
            actions = machine.on_timer();
        }

        let expected: Vec<(u16, String)> = [
            (101, "eth0"),
            (101, "eth0"),
            (101, "wwan0"),
            (101, "wwan0"),
            (102, "eth0"),
            (102, "eth0"),
            (102, "wwan0"),
            (102, "wwan0"),
        ]
        .into_iter()
        .map(|(id, name)| (id, name.to_string()))
        .collect();
        assert_eq!(visited, expected);
        assert_eq!(
            actions.last(),
            Some(&Action::SetTimer(Duration::from_secs(300)))
        );
        assert_eq!(machine.on_timer(), vec![Action::Replan]);
    }

    #[test]
    fn test_lifetime_update_and_stale_registration() {
        let mut machine = RegistrationMachine::new(config(), Duration::from_secs(60));
        machine.start(ConnectPlan {
            servers: vec![server(101, "a")],
            bootstrap: None,
            bearers: vec![bearer("eth0")],
        });
        machine.on_connected();
        assert_eq!(
            machine.on_registered(300),
            vec![Action::SetTimer(Duration::from_secs(270))]
        );
        assert!(machine.is_registered());

        assert_eq!(machine.on_timer(), vec![Action::SendUpdate]);
        assert_eq!(machine.state(), RegistrationState::Updating);
        assert_eq!(
            machine.on_update_result(UpdateOutcome::NotFound),
            vec![Action::CancelObservations, Action::SendRegister]
        );
        assert_eq!(machine.state(), RegistrationState::Registering);
        machine.on_registered(300);

        machine.trigger_update();
        let actions = machine.on_update_result(UpdateOutcome::Failed);
        assert_eq!(connect_target(&actions), Some((101, "eth0".to_string())));
    }

    #[test]
    fn test_bootstrap_then_replan() {
        let mut machine = RegistrationMachine::new(config(), Duration::from_secs(60));
        let plan = ConnectPlan {
            servers: Vec::new(),
            bootstrap: Some(server(0, "bs")),
            bearers: vec![bearer("eth0")],
        };
        let actions = machine.start(plan.clone());
        assert_eq!(machine.state(), RegistrationState::Bootstrapping);
        assert_eq!(connect_target(&actions), Some((0, "eth0".to_string())));
        assert_eq!(machine.on_connected(), vec![Action::SendBootstrapRequest]);
        assert_eq!(
            machine.on_bootstrap_accepted(),
            vec![Action::SetTimer(Duration::from_secs(60))]
        );
        assert_eq!(
            machine.on_bootstrap_finished(),
            vec![Action::CancelTimer, Action::Close, Action::Replan]
        );

        // Bootstrap provisioned nothing usable
        machine.start(plan);
        assert_eq!(machine.state(), RegistrationState::ServerUnreachable);
    }

    #[test]
    fn test_bootstrap_timeout_is_unreachable() {
        let mut machine = RegistrationMachine::new(config(), Duration::from_secs(60));
        machine.start(ConnectPlan {
            servers: Vec::new(),
            bootstrap: Some(server(0, "bs")),
            bearers: vec![bearer("eth0")],
        });
        machine.on_connected();
        machine.on_bootstrap_accepted();
        machine.on_timer();
        assert_eq!(machine.state(), RegistrationState::ServerUnreachable);
    }

    #[test]
    fn test_disable_and_shutdown() {
        let mut machine = RegistrationMachine::new(config(), Duration::from_secs(60));
        machine.start(ConnectPlan {
            servers: vec![server(101, "a")],
            bootstrap: None,
            bearers: vec![bearer("eth0")],
        });
        machine.on_connected();
        machine.on_registered(300);

        let actions = machine.disable(Duration::from_secs(60));
        assert_eq!(actions, vec![Action::CancelTimer, Action::SendDeregister]);
        let actions = machine.on_deregistered();
        assert_eq!(machine.state(), RegistrationState::Disabled);
        assert_eq!(actions.last(), Some(&Action::SetTimer(Duration::from_secs(60))));
        assert_eq!(machine.on_timer(), vec![Action::Replan]);

        // Not registered: shutdown stops at once
        let actions = machine.shutdown();
        assert_eq!(actions.last(), Some(&Action::Stop));
        assert_eq!(machine.state(), RegistrationState::Stopped);
        assert!(machine
            .start(ConnectPlan {
                servers: vec![server(101, "a")],
                bootstrap: None,
                bearers: vec![bearer("eth0")],
            })
            .is_empty());
    }

    #[test]
    fn test_shutdown_deregisters_first() {
        let mut machine = RegistrationMachine::new(config(), Duration::from_secs(60));
        machine.start(ConnectPlan {
            servers: vec![server(101, "a")],
            bootstrap: None,
            bearers: vec![bearer("eth0")],
        });
        machine.on_connected();
        machine.on_registered(300);
        assert_eq!(
            machine.shutdown(),
            vec![Action::CancelTimer, Action::SendDeregister]
        );
        assert_eq!(machine.on_deregistered().last(), Some(&Action::Stop));
    }
}
