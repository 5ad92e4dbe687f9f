//! Orchestration core for running untrusted REPL code in isolated contexts.
//!
//! Short, interactively submitted code fragments run inside an isolation
//! context that talks to the controller only through messages. This crate
//! owns the lifecycle of that context, the wire protocol, the watchdog
//! guarding contexts that cannot be interrupted, and the publish/subscribe
//! layer tying them together.
//!
//! # Architecture Overview
//!
//! - **Event bus**: synchronous publish/subscribe keyed by event name
//! - **Context loader**: creation and teardown of in-process frame surfaces
//! - **Isolation context**: one live worker process or frame, republishing inbound messages
//! - **Session**: language loading, evaluation, input strategies and the watchdog
//! - **Guest runtime**: the isolated side of the protocol and its engines
//! - **Configuration system**: YAML configuration with environment overrides

pub mod config;
pub mod context_loader;
pub mod errors;
pub mod event_bus;
pub mod guest;
pub mod input;
pub mod isolation;
pub mod language;
pub mod protocol;
pub mod session;
pub mod watchdog;
pub mod worker;

pub use config::{ConfigLoader, ReplboxConfig};
pub use context_loader::ContextLoader;
pub use errors::{EvaluationError, SandboxError};
pub use event_bus::{EventBus, SubscriptionId};
pub use guest::{Engine, EngineCatalog, GuestRuntime};
pub use input::{InputProvider, InputStrategy};
pub use isolation::{BackendKind, IsolationContext};
pub use language::{EnvironmentTable, LanguageRegistry, LanguageSpec, PayloadRef};
pub use protocol::Message;
pub use session::{Session, SessionBuilder, SessionStatus};
pub use watchdog::{TimeoutPolicy, Watchdog};
