//! Ingests platform events, dedupes, routes, resolves the target thread,
//! intercepts plain-text commands, and dispatches everything else to
//! [`ThreadEntity`] under a typing-indicator scope with bounded retry.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use crate::collaborators::{
    CommonFields, InboundEvent, Inbox, Outbox, OutboundAction, Threads, TurnRouter,
};
use crate::config::PipelineConfig;
use crate::error::OrchestratorError;
use crate::store::SessionStore;
use crate::thread_entity::{SendInput, ThreadEntity};

const GENERIC_FAILURE: &str = "Something went wrong. Please try again in a moment.";
const RECOVERY_NOTICE: &str = "*Session changed state, recovering...*";

/// Bounded FIFO-eviction set over message ids; `dedup` returns `true` on
/// first observation of an id, `false` thereafter until it ages out.
pub struct IngressDedup {
    capacity: usize,
    inner: StdMutex<(HashSet<String>, VecDeque<String>)>,
}

impl IngressDedup {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: StdMutex::new((HashSet::new(), VecDeque::new())),
        }
    }

    /// Returns `true` iff `id` has not been seen within the current window.
    pub fn dedup(&self, id: &str) -> bool {
        let mut guard = self.inner.lock().unwrap();
        let (seen, order) = &mut *guard;
        if !seen.insert(id.to_string()) {
            return false;
        }
        order.push_back(id.to_string());
        if order.len() > self.capacity {
            if let Some(evicted) = order.pop_front() {
                seen.remove(&evicted);
            }
        }
        true
    }
}

enum Command {
    Status,
    Recreate,
}

fn parse_command(content: &str) -> Option<Command> {
    match content.trim() {
        "!status" => Some(Command::Status),
        "!reset" | "!recreate" => Some(Command::Recreate),
        _ => None,
    }
}

fn dispatch_key(event: &InboundEvent, common: &CommonFields) -> String {
    match event {
        InboundEvent::ThreadMessage(m) => format!("thread:{}", m.thread_id),
        InboundEvent::ChannelMessage(_) => format!("channel:{}", common.channel_id),
    }
}

pub struct TurnPipeline {
    inbox: Arc<dyn Inbox>,
    outbox: Arc<dyn Outbox>,
    threads: Arc<dyn Threads>,
    router: Arc<dyn TurnRouter>,
    store: Arc<dyn SessionStore>,
    thread_entity: Arc<ThreadEntity>,
    dedup: IngressDedup,
    config: PipelineConfig,
}

impl TurnPipeline {
    pub fn new(
        inbox: Arc<dyn Inbox>,
        outbox: Arc<dyn Outbox>,
        threads: Arc<dyn Threads>,
        router: Arc<dyn TurnRouter>,
        store: Arc<dyn SessionStore>,
        thread_entity: Arc<ThreadEntity>,
        config: PipelineConfig,
    ) -> Self {
        let dedup = IngressDedup::new(config.dedup_capacity);
        Self {
            inbox,
            outbox,
            threads,
            router,
            store,
            thread_entity,
            dedup,
            config,
        }
    }

    /// Poll the inbox forever, spawning one unordered fiber per event.
    /// Concurrent events collide only when they share a ThreadKey, in which
    /// case ActorMap serializes them.
    pub async fn run(self: Arc<Self>) -> Result<(), OrchestratorError> {
        loop {
            let events = match self.inbox.poll().await {
                Ok(events) => events,
                Err(e) => {
                    warn!(error = %e, "inbox poll failed, retrying after a short delay");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };

            if events.is_empty() {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }

            for event in events {
                let pipeline = self.clone();
                tokio::spawn(async move {
                    pipeline.handle_event(event).await;
                });
            }
        }
    }

    async fn handle_event(&self, event: InboundEvent) {
        let message_id = event.common().message_id.clone();
        if !self.dedup.dedup(&message_id) {
            return;
        }

        let mut attempt: u32 = 0;
        loop {
            match self.process_event(&event).await {
                Ok(()) => return,
                Err(e) => {
                    if !e.retriable() {
                        if let Some(thread_id) = event.thread_id() {
                            let _ = self
                                .outbox
                                .publish(OutboundAction::Reply {
                                    thread_id: thread_id.to_string(),
                                    text: GENERIC_FAILURE.to_string(),
                                })
                                .await;
                        }
                        error!(error = %e, message_id = %message_id, "turn pipeline event failed, not retriable");
                        return;
                    }

                    if attempt >= self.config.retry_max_extra_attempts {
                        error!(error = %e, message_id = %message_id, attempt, "turn pipeline event retries exhausted");
                        return;
                    }

                    let delay = Duration::from_millis(self.config.retry_base_delay_ms)
                        * 2u32.saturating_pow(attempt);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    #[instrument(skip(self, event), fields(message_id = %event.common().message_id))]
    async fn process_event(&self, event: &InboundEvent) -> Result<(), OrchestratorError> {
        let common = event.common().clone();
        if !self.should_respond(event, &common).await? {
            return Ok(());
        }

        let key = dispatch_key(event, &common);
        let (thread_id, channel_id) = self.resolve_target(event, &common).await?;

        if let Some(command) = parse_command(&common.content) {
            return self.handle_command(command, &key, &thread_id).await;
        }

        self.dispatch(&key, &thread_id, &channel_id, &common.guild_id, &common.content)
            .await
    }

    async fn should_respond(
        &self,
        event: &InboundEvent,
        common: &CommonFields,
    ) -> Result<bool, OrchestratorError> {
        if common.author_is_bot || common.mentions_everyone || common.content.trim().is_empty() {
            return Ok(false);
        }

        let mentioned = common.mentioned_user_ids.iter().any(|id| id == &common.bot_user_id)
            || common
                .bot_role_id
                .as_ref()
                .map(|role| common.mentioned_role_ids.contains(role))
                .unwrap_or(false);

        match event {
            InboundEvent::ChannelMessage(_) => Ok(mentioned),
            InboundEvent::ThreadMessage(m) => {
                if mentioned {
                    return Ok(true);
                }
                if !self.store.has_tracked(&m.thread_id).await? {
                    return Ok(false);
                }
                let decision = self.router.should_respond(common).await?;
                Ok(decision.should_respond)
            }
        }
    }

    async fn resolve_target(
        &self,
        event: &InboundEvent,
        common: &CommonFields,
    ) -> Result<(String, String), OrchestratorError> {
        match event {
            InboundEvent::ThreadMessage(m) => Ok((m.thread_id.clone(), common.channel_id.clone())),
            InboundEvent::ChannelMessage(m) => {
                let suggested_name = self.router.generate_thread_name(&common.content).await?;
                self.threads.ensure(m, &suggested_name).await
            }
        }
    }

    async fn handle_command(
        &self,
        command: Command,
        key: &str,
        thread_id: &str,
    ) -> Result<(), OrchestratorError> {
        match command {
            Command::Status => {
                let status = self.thread_entity.status(key, thread_id).await?;
                let text = match status {
                    Some(record) => format!(
                        "status: {} (sandbox {}, session {})",
                        record.status, record.sandbox_id, record.agent_session_id
                    ),
                    None => "status: no session tracked for this thread".to_string(),
                };
                self.outbox
                    .publish(OutboundAction::Reply {
                        thread_id: thread_id.to_string(),
                        text,
                    })
                    .await
            }
            Command::Recreate => {
                self.thread_entity.recreate(key, thread_id).await?;
                self.outbox
                    .publish(OutboundAction::Reply {
                        thread_id: thread_id.to_string(),
                        text: "Session recreated. Send a message to start a new sandbox.".to_string(),
                    })
                    .await
            }
        }
    }

    async fn dispatch(
        &self,
        key: &str,
        thread_id: &str,
        channel_id: &str,
        guild_id: &str,
        text: &str,
    ) -> Result<(), OrchestratorError> {
        let thread_entity = self.thread_entity.clone();
        let key_owned = key.to_string();
        let input = SendInput {
            thread_id: thread_id.to_string(),
            channel_id: channel_id.to_string(),
            guild_id: guild_id.to_string(),
            text: text.to_string(),
        };

        let recovered_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let recovered_flag_writer = recovered_flag.clone();
        let body: Pin<Box<dyn Future<Output = Result<String, OrchestratorError>> + Send + '_>> =
            Box::pin(async move {
                let output = thread_entity.send(&key_owned, input).await?;
                if output.recovered {
                    info!(thread_id = %output.session.thread_id, "sandbox recovered mid-send");
                    recovered_flag_writer.store(true, std::sync::atomic::Ordering::SeqCst);
                }
                Ok(output.text)
            });

        let reply_text = self.outbox.with_typing(thread_id, body).await?;

        if recovered_flag.load(std::sync::atomic::Ordering::SeqCst) {
            self.outbox
                .publish(OutboundAction::Send {
                    thread_id: thread_id.to_string(),
                    text: RECOVERY_NOTICE.to_string(),
                })
                .await?;
        }

        self.outbox
            .publish(OutboundAction::Reply {
                thread_id: thread_id.to_string(),
                text: reply_text,
            })
            .await
    }
}
