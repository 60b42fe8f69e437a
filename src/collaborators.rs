//! External collaborator traits the core depends on but does not implement:
//! chat-platform ingress/egress, thread resolution, history rehydration, and
//! turn routing. Reference implementations exist for all of them (the
//! `channels-discord` feature's `DiscordChannel` covers `Inbox`/`Outbox`/
//! `Threads`/`History`; `routing::HeuristicTurnRouter` covers `TurnRouter`),
//! but a deployment against a different chat platform or routing classifier
//! supplies its own implementation instead; tests supply hand-written
//! in-memory fakes behind the same traits.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;

use crate::error::OrchestratorError;

/// A platform-agnostic inbound message, either scoped to an existing thread
/// or to a channel that may not have a thread yet.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    ThreadMessage(ThreadMessage),
    ChannelMessage(ChannelMessage),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommonFields {
    pub message_id: String,
    pub channel_id: String,
    pub guild_id: String,
    pub author_id: String,
    pub author_is_bot: bool,
    pub mentions_everyone: bool,
    pub mentioned_user_ids: Vec<String>,
    pub mentioned_role_ids: Vec<String>,
    pub bot_user_id: String,
    pub bot_role_id: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThreadMessage {
    pub common: CommonFields,
    pub thread_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub common: CommonFields,
}

impl InboundEvent {
    pub fn common(&self) -> &CommonFields {
        match self {
            InboundEvent::ThreadMessage(m) => &m.common,
            InboundEvent::ChannelMessage(m) => &m.common,
        }
    }

    pub fn thread_id(&self) -> Option<&str> {
        match self {
            InboundEvent::ThreadMessage(m) => Some(&m.thread_id),
            InboundEvent::ChannelMessage(_) => None,
        }
    }
}

/// An outbound side effect published back to the chat platform.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundAction {
    Send { thread_id: String, text: String },
    Reply { thread_id: String, text: String },
    Typing { thread_id: String },
}

/// A lazy, possibly-infinite source of [`InboundEvent`]s.
#[async_trait]
pub trait Inbox: Send + Sync {
    /// Fetch the next batch of events (empty when temporarily drained; the
    /// caller polls again).
    async fn poll(&self) -> Result<Vec<InboundEvent>, OrchestratorError>;
}

/// Publishes outbound actions and runs typing-pulse scopes.
#[async_trait]
pub trait Outbox: Send + Sync {
    async fn publish(&self, action: OutboundAction) -> Result<(), OrchestratorError>;

    /// Run `body`, emitting a `Typing` pulse on `thread_id` at a fixed
    /// cadence until `body` completes (successfully or not). The pulse fiber
    /// is interrupted on every exit path.
    async fn with_typing(
        &self,
        thread_id: &str,
        body: Pin<Box<dyn Future<Output = Result<String, OrchestratorError>> + Send + '_>>,
    ) -> Result<String, OrchestratorError>;
}

/// Resolves channel-level events to a thread, idempotently per message id.
#[async_trait]
pub trait Threads: Send + Sync {
    async fn ensure(
        &self,
        event: &ChannelMessage,
        suggested_name: &str,
    ) -> Result<(String, String), OrchestratorError>;
}

/// Reconstructs prior conversation context when the agent session has been
/// swapped out from under a thread.
#[async_trait]
pub trait History: Send + Sync {
    async fn rehydrate(&self, thread_id: &str, latest_user_text: &str) -> Result<String, OrchestratorError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub should_respond: bool,
    pub reason: String,
}

/// Classifies whether an unmentioned thread message should be answered, and
/// names new threads created from a channel message.
#[async_trait]
pub trait TurnRouter: Send + Sync {
    async fn should_respond(&self, common: &CommonFields) -> Result<RoutingDecision, OrchestratorError>;

    async fn generate_thread_name(&self, content: &str) -> Result<String, OrchestratorError>;
}
