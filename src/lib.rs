pub mod actor;
pub mod agent_client;
pub mod channels;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod provisioner;
pub mod reconciler;
pub mod routing;
pub mod sandbox_api;
pub mod store;
pub mod thread_entity;

#[cfg(test)]
mod testutil;

/// Convenience re-exports for wiring the orchestrator's main components.
///
/// ```rust,ignore
/// use sandboxrelay::prelude::*;
/// ```
pub mod prelude {
    pub use crate::actor::ActorMap;
    pub use crate::agent_client::{AgentClient, HttpAgentClient};
    pub use crate::collaborators::{
        CommonFields, History, InboundEvent, Inbox, Outbox, OutboundAction, Threads, TurnRouter,
    };
    pub use crate::config::{load_config, load_default_config, AppConfig};
    pub use crate::error::OrchestratorError;
    pub use crate::pipeline::{IngressDedup, TurnPipeline};
    pub use crate::provisioner::Provisioner;
    pub use crate::reconciler::Reconciler;
    pub use crate::routing::HeuristicTurnRouter;
    pub use crate::sandbox_api::{HttpSandboxAPI, SandboxAPI};
    pub use crate::store::{SessionRecord, SessionStatus, SessionStore, SqliteSessionStore};
    pub use crate::thread_entity::ThreadEntity;
}
