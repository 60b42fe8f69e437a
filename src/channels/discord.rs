//! Reference Discord channel adapter.
//!
//! Requires the `channels-discord` Cargo feature:
//!
//! ```sh
//! cargo build --features channels-discord
//! cargo test  --features channels-discord -- channels::discord
//! ```
//!
//! # Architecture
//!
//! ```text
//!  Discord Gateway (WebSocket)  ──────────▶  EventHandler::message
//!                                                    │
//!                                        allowed_guild_ids / channel_ids check
//!                                                    │
//!                                    mpsc::UnboundedSender<InboundEvent>
//!                                                    │
//!                                          DiscordChannel::poll (Inbox)
//!                                                    │
//!                                              TurnPipeline
//! ```
//!
//! `DiscordChannel` is the single concrete implementation of [`Inbox`],
//! [`Outbox`], and [`Threads`] this crate ships. Outbound sends and the
//! typing-indicator pulse go over the HTTP API; inbound events arrive over
//! the gateway and are buffered in an unbounded channel, drained by `poll`.
//!
//! # Discord Developer Portal setup
//!
//! 1. Go to <https://discord.com/developers/applications>
//! 2. Create a New Application → Bot
//! 3. Copy the Bot Token
//! 4. Under "Privileged Gateway Intents" enable **Message Content Intent**
//! 5. Use OAuth2 URL Generator to invite the bot with `bot` + `Send Messages`
//!    + `Create Public Threads` scopes
//!
//! # Security
//!
//! Only guild IDs and channel IDs on the allow-lists are forwarded to the
//! pipeline. Unknown sources, and messages authored by bots, are silently
//! ignored. Empty allow-lists mean "allow all".

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{info, warn};

pub use crate::config::DiscordConfig;
use crate::collaborators::{
    ChannelMessage, CommonFields, History, InboundEvent, Inbox, Outbox, OutboundAction,
    ThreadMessage, Threads,
};
use crate::error::OrchestratorError;

/// A [`Inbox`]/[`Outbox`]/[`Threads`] implementation backed by the Discord
/// bot API via serenity. The gateway connection delivers messages; the HTTP
/// API sends them and creates threads.
pub struct DiscordChannel {
    allowed_guild_ids: Vec<String>,
    allowed_channel_ids: Vec<String>,
    inbound_tx: mpsc::UnboundedSender<InboundEvent>,
    inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<InboundEvent>>,
    /// Channel ids known to be threads this adapter created or has already
    /// seen a message in. Not persisted: after a restart, the first message
    /// in an existing thread is misclassified as a channel message once,
    /// then the thread is remembered for the rest of the process lifetime.
    known_thread_ids: StdMutex<HashSet<String>>,
    /// `messageId -> (threadId, channelId)`, so a redelivered channel event
    /// resolves to the thread already created for it instead of a new one.
    thread_cache: StdMutex<std::collections::HashMap<String, (String, String)>>,
    typing_pulse_interval: Duration,
    #[cfg(feature = "channels-discord")]
    http: std::sync::Arc<serenity::http::Http>,
    #[cfg(feature = "channels-discord")]
    bot_user_id: StdMutex<Option<String>>,
}

impl DiscordChannel {
    /// `typing_pulse_interval_ms` should track
    /// [`crate::config::PipelineConfig::typing_pulse_interval_ms`] so the
    /// indicator refreshes faster than Discord's own ~10s typing timeout.
    pub fn new(config: DiscordConfig, typing_pulse_interval_ms: u64) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            allowed_guild_ids: config.allowed_guild_ids,
            allowed_channel_ids: config.allowed_channel_ids,
            inbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            known_thread_ids: StdMutex::new(HashSet::new()),
            thread_cache: StdMutex::new(std::collections::HashMap::new()),
            typing_pulse_interval: Duration::from_millis(typing_pulse_interval_ms),
            #[cfg(feature = "channels-discord")]
            http: std::sync::Arc::new(serenity::http::Http::new(&config.bot_token)),
            #[cfg(feature = "channels-discord")]
            bot_user_id: StdMutex::new(None),
        }
    }

    /// Check whether `guild_id` passes the allow-list (empty = allow all).
    pub fn is_guild_allowed(&self, guild_id: &str) -> bool {
        self.allowed_guild_ids.is_empty() || self.allowed_guild_ids.iter().any(|id| id == guild_id)
    }

    /// Check whether `channel_id` passes the allow-list (empty = allow all).
    pub fn is_channel_allowed(&self, channel_id: &str) -> bool {
        self.allowed_channel_ids.is_empty()
            || self.allowed_channel_ids.iter().any(|id| id == channel_id)
    }

    fn remember_thread(&self, thread_id: &str) {
        self.known_thread_ids.lock().unwrap().insert(thread_id.to_string());
    }

    fn is_known_thread(&self, channel_id: &str) -> bool {
        self.known_thread_ids.lock().unwrap().contains(channel_id)
    }

    /// Connect to the gateway and run until disconnected. Intended to be
    /// driven by a long-lived task alongside [`crate::pipeline::TurnPipeline::run`].
    #[cfg(feature = "channels-discord")]
    pub async fn connect(self: std::sync::Arc<Self>, bot_token: &str) -> Result<(), OrchestratorError> {
        use serenity::all::ClientBuilder;
        use serenity::model::channel::Message;
        use serenity::model::gateway::Ready;
        use serenity::prelude::*;

        struct Handler {
            channel: std::sync::Arc<DiscordChannel>,
        }

        #[serenity::async_trait]
        impl EventHandler for Handler {
            async fn ready(&self, _ctx: Context, ready: Ready) {
                *self.channel.bot_user_id.lock().unwrap() = Some(ready.user.id.to_string());
                info!(bot = %ready.user.name, "discord: gateway connected");
            }

            async fn message(&self, _ctx: Context, msg: Message) {
                if msg.author.bot {
                    return;
                }

                let guild_id = msg.guild_id.map(|g| g.to_string()).unwrap_or_default();
                if !guild_id.is_empty() && !self.channel.is_guild_allowed(&guild_id) {
                    return;
                }
                let channel_id = msg.channel_id.to_string();
                if !self.channel.is_channel_allowed(&channel_id) {
                    return;
                }

                let bot_user_id = self
                    .channel
                    .bot_user_id
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_default();

                let common = CommonFields {
                    message_id: msg.id.to_string(),
                    channel_id: channel_id.clone(),
                    guild_id,
                    author_id: msg.author.id.to_string(),
                    author_is_bot: msg.author.bot,
                    mentions_everyone: msg.mention_everyone,
                    mentioned_user_ids: msg.mentions.iter().map(|u| u.id.to_string()).collect(),
                    mentioned_role_ids: msg.mention_roles.iter().map(|r| r.to_string()).collect(),
                    bot_user_id,
                    bot_role_id: None,
                    content: msg.content.clone(),
                };

                let event = if self.channel.is_known_thread(&channel_id) {
                    InboundEvent::ThreadMessage(ThreadMessage {
                        thread_id: channel_id,
                        common,
                    })
                } else {
                    InboundEvent::ChannelMessage(ChannelMessage { common })
                };

                if self.channel.inbound_tx.send(event).is_err() {
                    warn!("discord: inbound channel closed, dropping message");
                }
            }
        }

        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;

        let mut client = ClientBuilder::new(bot_token, intents)
            .event_handler(Handler { channel: self })
            .await
            .map_err(|e| OrchestratorError::Routing(format!("discord: failed to build client: {e}")))?;

        client
            .start()
            .await
            .map_err(|e| OrchestratorError::Routing(format!("discord: gateway error: {e}")))
    }

    #[cfg(feature = "channels-discord")]
    fn parse_channel_id(&self, thread_id: &str) -> Result<serenity::model::id::ChannelId, OrchestratorError> {
        thread_id
            .parse::<u64>()
            .map(serenity::model::id::ChannelId::new)
            .map_err(|_| OrchestratorError::Routing(format!("invalid discord channel id '{thread_id}'")))
    }
}

#[async_trait]
impl Inbox for DiscordChannel {
    async fn poll(&self) -> Result<Vec<InboundEvent>, OrchestratorError> {
        let mut rx = self.inbound_rx.lock().await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        Ok(events)
    }
}

#[async_trait]
impl Outbox for DiscordChannel {
    #[cfg(feature = "channels-discord")]
    async fn publish(&self, action: OutboundAction) -> Result<(), OrchestratorError> {
        match action {
            OutboundAction::Send { thread_id, text } | OutboundAction::Reply { thread_id, text } => {
                let channel_id = self.parse_channel_id(&thread_id)?;
                channel_id
                    .say(&self.http, text)
                    .await
                    .map_err(|e| OrchestratorError::Routing(format!("discord send error: {e}")))?;
                Ok(())
            }
            OutboundAction::Typing { thread_id } => {
                let channel_id = self.parse_channel_id(&thread_id)?;
                channel_id
                    .broadcast_typing(&self.http)
                    .await
                    .map_err(|e| OrchestratorError::Routing(format!("discord typing error: {e}")))
            }
        }
    }

    #[cfg(not(feature = "channels-discord"))]
    async fn publish(&self, _action: OutboundAction) -> Result<(), OrchestratorError> {
        Err(OrchestratorError::Routing(
            "discord channel not compiled (missing `channels-discord` feature)".into(),
        ))
    }

    #[cfg(feature = "channels-discord")]
    async fn with_typing(
        &self,
        thread_id: &str,
        body: Pin<Box<dyn Future<Output = Result<String, OrchestratorError>> + Send + '_>>,
    ) -> Result<String, OrchestratorError> {
        let channel_id = self.parse_channel_id(thread_id)?;
        let http = self.http.clone();
        let interval = self.typing_pulse_interval;
        let pulse = tokio::spawn(async move {
            loop {
                let _ = channel_id.broadcast_typing(&http).await;
                tokio::time::sleep(interval).await;
            }
        });
        let result = body.await;
        pulse.abort();
        result
    }

    #[cfg(not(feature = "channels-discord"))]
    async fn with_typing(
        &self,
        _thread_id: &str,
        body: Pin<Box<dyn Future<Output = Result<String, OrchestratorError>> + Send + '_>>,
    ) -> Result<String, OrchestratorError> {
        body.await
    }
}

#[async_trait]
impl Threads for DiscordChannel {
    #[cfg(feature = "channels-discord")]
    async fn ensure(
        &self,
        event: &ChannelMessage,
        suggested_name: &str,
    ) -> Result<(String, String), OrchestratorError> {
        let message_id = event.common.message_id.clone();
        if let Some(cached) = self.thread_cache.lock().unwrap().get(&message_id).cloned() {
            return Ok(cached);
        }

        let channel_id = self.parse_channel_id(&event.common.channel_id)?;
        let parent_message_id = message_id
            .parse::<u64>()
            .map(serenity::model::id::MessageId::new)
            .map_err(|_| OrchestratorError::ThreadEnsure {
                status: None,
                message: format!("invalid discord message id '{message_id}'"),
            })?;

        let builder = serenity::builder::CreateThread::new(suggested_name);
        let thread = channel_id
            .create_thread_from_message(&self.http, parent_message_id, builder)
            .await
            .map_err(|e| OrchestratorError::ThreadEnsure {
                status: None,
                message: format!("discord thread creation failed: {e}"),
            })?;

        let thread_id = thread.id.to_string();
        self.remember_thread(&thread_id);
        let result = (thread_id, event.common.channel_id.clone());
        self.thread_cache
            .lock()
            .unwrap()
            .insert(message_id, result.clone());
        Ok(result)
    }

    #[cfg(not(feature = "channels-discord"))]
    async fn ensure(
        &self,
        _event: &ChannelMessage,
        _suggested_name: &str,
    ) -> Result<(String, String), OrchestratorError> {
        Err(OrchestratorError::ThreadEnsure {
            status: None,
            message: "discord channel not compiled (missing `channels-discord` feature)".into(),
        })
    }
}

/// How many prior messages `History::rehydrate` fetches from the thread.
#[cfg(feature = "channels-discord")]
const HISTORY_FETCH_LIMIT: u8 = 50;

#[async_trait]
impl History for DiscordChannel {
    /// Fetch the thread's recent messages (oldest first) and append
    /// `latest_user_text` as the final line, giving the agent session a
    /// plain-text transcript to resume from.
    #[cfg(feature = "channels-discord")]
    async fn rehydrate(&self, thread_id: &str, latest_user_text: &str) -> Result<String, OrchestratorError> {
        let channel_id = self.parse_channel_id(thread_id)?;
        let builder = serenity::builder::GetMessages::new().limit(HISTORY_FETCH_LIMIT);
        let messages = channel_id
            .messages(&self.http, builder)
            .await
            .map_err(|e| OrchestratorError::History(format!("discord history fetch failed: {e}")))?;

        let mut lines: Vec<String> = messages
            .into_iter()
            .rev()
            .filter(|m| !m.content.trim().is_empty())
            .map(|m| format!("{}: {}", m.author.name, m.content))
            .collect();
        lines.push(format!("user: {latest_user_text}"));
        Ok(lines.join("\n"))
    }

    #[cfg(not(feature = "channels-discord"))]
    async fn rehydrate(&self, _thread_id: &str, _latest_user_text: &str) -> Result<String, OrchestratorError> {
        Err(OrchestratorError::History(
            "discord channel not compiled (missing `channels-discord` feature)".into(),
        ))
    }
}
