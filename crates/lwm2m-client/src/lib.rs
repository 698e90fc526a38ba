//! LwM2M client engine
//!
//! - [`config`]: TOML configuration with defaults
//! - [`context`]: client objects provisioned from configuration and the
//!   server accounts resolved from objects 0 and 1
//! - [`registration`]: bootstrap and registration state machine
//! - [`observe`]: notification attributes and observation scheduling
//! - [`dispatch`]: Device Management and Bootstrap interface requests
//! - [`update`]: firmware (5) and software (9) update jobs
//! - [`engine`]: the event loop tying these to a CoAP endpoint

pub mod bearer;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod observe;
pub mod registration;
pub mod update;

pub use config::ClientConfig;
pub use context::{ClientContext, ServerTarget, Session};
pub use engine::{Connector, Engine, EngineHandle, ExitReason, NetConnector};
pub use error::{ClientError, Result, UpdateError};
pub use registration::{RegistrationMachine, RegistrationState};
pub use update::{Collaborators, UpdateEngine, UpdateSettings};
