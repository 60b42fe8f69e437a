//! Generic per-key serialized actor registry.
//!
//! Each key owns exactly one spawned task draining an mpsc queue of jobs in
//! submission order; different keys make progress concurrently. This is the
//! FIFO-per-conversation primitive the rest of the crate is built on top of.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A unit of work submitted to a single key's queue. Erases the job's result
/// type by reporting through an internally-owned oneshot.
type Job<S> = Box<dyn FnOnce(&mut Option<S>) -> BoxFuture<'static, ()> + Send>;

/// Options accepted by [`ActorMap::run`].
#[derive(Debug, Clone, Copy)]
pub struct RunOpts {
    /// Whether this job resets the key's idle timer. Bookkeeping reads that
    /// don't represent real activity should pass `touch: false`.
    pub touch: bool,
}

impl Default for RunOpts {
    fn default() -> Self {
        Self { touch: true }
    }
}

/// Error returned to a caller whose job never ran because the actor was
/// removed first.
#[derive(Debug, thiserror::Error)]
#[error("actor job cancelled")]
pub struct Cancelled;

enum ControlMsg<S> {
    Job(Job<S>, bool),
    CancelIdle,
}

struct ActorHandle<S> {
    tx: mpsc::UnboundedSender<ControlMsg<S>>,
    shutdown: Arc<tokio::sync::Notify>,
}

/// Construction-time hooks for an [`ActorMap`].
pub struct ActorMapOptions<S> {
    pub load: Option<Box<dyn Fn(&str) -> BoxFuture<'static, Option<S>> + Send + Sync>>,
    pub save: Option<Box<dyn Fn(&str, &S) -> BoxFuture<'static, ()> + Send + Sync>>,
    pub idle_timeout: Option<Duration>,
    pub on_idle: Option<Box<dyn Fn(&str) -> BoxFuture<'static, ()> + Send + Sync>>,
}

impl<S> Default for ActorMapOptions<S> {
    fn default() -> Self {
        Self {
            load: None,
            save: None,
            idle_timeout: None,
            on_idle: None,
        }
    }
}

/// A generic keyed-actor registry over `Key = String` and optional
/// per-key `State = S`.
pub struct ActorMap<S> {
    actors: Mutex<HashMap<String, ActorHandle<S>>>,
    options: Arc<ActorMapOptions<S>>,
}

impl<S> ActorMap<S>
where
    S: Send + 'static,
{
    pub fn new(options: ActorMapOptions<S>) -> Self {
        Self {
            actors: Mutex::new(HashMap::new()),
            options: Arc::new(options),
        }
    }

    /// Enqueue `work` onto `key`'s FIFO queue and await its completion.
    /// `work` receives a mutable reference to the key's lazily-loaded state.
    pub async fn run<F, Fut, A, E>(&self, key: &str, work: F, opts: RunOpts) -> Result<A, E>
    where
        F: FnOnce(&mut Option<S>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<A, E>> + Send + 'static,
        A: Send + 'static,
        E: Send + From<Cancelled> + 'static,
    {
        let tx = self.ensure_actor(key).await;
        let (reply_tx, reply_rx) = oneshot::channel::<Result<A, E>>();

        let job: Job<S> = Box::new(move |state: &mut Option<S>| {
            let fut = work(state);
            Box::pin(async move {
                let result = fut.await;
                let _ = reply_tx.send(result);
            })
        });

        if tx.send(ControlMsg::Job(job, opts.touch)).is_err() {
            return Err(Cancelled.into());
        }

        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(Cancelled.into()),
        }
    }

    /// Stop the idle timer for `key` without removing the actor.
    pub async fn cancel_idle(&self, key: &str) {
        let actors = self.actors.lock().await;
        if let Some(handle) = actors.get(key) {
            let _ = handle.tx.send(ControlMsg::CancelIdle);
        }
    }

    /// Cancel all pending work for `key`, shut its queue down, and forget the
    /// actor. A subsequent `run` recreates it from scratch, including
    /// `load`.
    pub async fn remove(&self, key: &str) {
        let mut actors = self.actors.lock().await;
        if let Some(handle) = actors.remove(key) {
            handle.shutdown.notify_one();
        }
    }

    /// Cancel and forget every actor; used on process shutdown.
    pub async fn clear(&self) {
        let mut actors = self.actors.lock().await;
        for (_, handle) in actors.drain() {
            handle.shutdown.notify_one();
        }
    }

    async fn ensure_actor(&self, key: &str) -> mpsc::UnboundedSender<ControlMsg<S>> {
        let mut actors = self.actors.lock().await;
        if let Some(handle) = actors.get(key) {
            return handle.tx.clone();
        }

        let (tx, rx) = mpsc::unbounded_channel::<ControlMsg<S>>();
        let shutdown = Arc::new(tokio::sync::Notify::new());
        let key_owned = key.to_owned();
        let options = self.options.clone();

        tokio::spawn(run_actor_loop(key_owned, rx, shutdown.clone(), options));

        actors.insert(
            key.to_owned(),
            ActorHandle {
                tx: tx.clone(),
                shutdown,
            },
        );
        tx
    }
}

async fn run_actor_loop<S>(
    key: String,
    mut rx: mpsc::UnboundedReceiver<ControlMsg<S>>,
    shutdown: Arc<tokio::sync::Notify>,
    options: Arc<ActorMapOptions<S>>,
) where
    S: Send + 'static,
{
    let mut state: Option<S> = match &options.load {
        Some(load) => load(&key).await,
        None => None,
    };
    let mut idle_suppressed = false;

    loop {
        let sleep_fut = async {
            match options.idle_timeout {
                Some(d) if !idle_suppressed => {
                    tokio::time::sleep(d).await;
                    true
                }
                _ => std::future::pending::<bool>().await,
            }
        };

        tokio::select! {
            _ = shutdown.notified() => {
                break;
            }
            fired = sleep_fut => {
                if fired {
                    if let Some(on_idle) = &options.on_idle {
                        on_idle(&key).await;
                    }
                    idle_suppressed = true;
                }
            }
            msg = rx.recv() => {
                match msg {
                    None => break,
                    Some(ControlMsg::CancelIdle) => {
                        idle_suppressed = true;
                    }
                    Some(ControlMsg::Job(job, touch)) => {
                        job(&mut state).await;
                        if touch {
                            idle_suppressed = false;
                        }
                        // No Eq bound on S to diff old/new state cheaply; save
                        // unconditionally whenever state is present.
                        if let (Some(save), Some(s)) = (&options.save, state.as_ref()) {
                            save(&key, s).await;
                        }
                    }
                }
            }
        }
    }
}
