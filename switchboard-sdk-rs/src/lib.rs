pub mod agent;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod llm;
pub mod logger;
pub mod persistence;
pub mod prompts;
pub mod router;
pub mod runner;
pub mod scenario;
pub mod session;
pub mod tools;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::{Agent, CompositeAgent, DelegationPolicy, LeafAgent};
pub use config::OrchestratorConfig;
pub use error::{ErrorKind, OrchestrationError};
pub use events::{Event, EventPayload};
pub use router::Router;
pub use runner::{RunStream, Runner};
pub use session::{SessionState, StateMap, StateValue};
