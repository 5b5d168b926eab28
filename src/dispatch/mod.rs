// Event dispatcher: per-entity queues served by a pool of worker tasks.
//
// Each ordering key has its own queue with at most one event in flight, so events
// for one entity are handled in arrival order. Workers take whichever key is ready
// next, and a slow handler only delays later events for its own key.


use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{EntityKey, StateStore};
use crate::command::{CommandParser, InvocationContext};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::event::{Event, EventBody, EventKind};
use crate::telemetry::{error_notice, ErrorReporter, FailureSite};

/// Dispatcher configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Number of worker tasks
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// How long shutdown waits for queued events before aborting workers
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

fn default_workers() -> usize {
    4
}

fn default_shutdown_grace_seconds() -> u64 {
    10
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
        }
    }
}

impl DispatcherConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

/// Lifetime counters
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    received: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    handler_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub received: u64,
    pub processed: u64,
    /// Unknown events discarded
    pub dropped: u64,
    /// Events offered after shutdown began
    pub rejected: u64,
    pub handler_failures: u64,
    /// Events queued or in flight
    pub backlog: u64,
}

impl DispatchMetrics {
    pub fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            backlog: 0,
        }
    }
}

/// Queue identity. Keyless events each get a queue of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum QueueKey {
    Entity(EntityKey),
    Unordered(u64),
}

/// Per-key FIFO queues plus the channel of keys ready to run.
///
/// A key is present in `pending` while it is scheduled or in flight, and the
/// front of its queue is the event being handled.
struct KeyedQueues {
    pending: DashMap<QueueKey, VecDeque<Arc<Event>>>,
    ready_tx: mpsc::UnboundedSender<QueueKey>,
    ready_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueueKey>>,
    outstanding: AtomicU64,
    idle: Notify,
}

impl KeyedQueues {
    fn new() -> Self {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        Self {
            pending: DashMap::new(),
            ready_tx,
            ready_rx: tokio::sync::Mutex::new(ready_rx),
            outstanding: AtomicU64::new(0),
            idle: Notify::new(),
        }
    }

    fn push(&self, key: QueueKey, event: Arc<Event>) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        match self.pending.entry(key) {
            Entry::Occupied(mut queue) => queue.get_mut().push_back(event),
            Entry::Vacant(slot) => {
                slot.insert(VecDeque::from([event]));
                let _ = self.ready_tx.send(key);
            }
        }
    }

    async fn next_ready(&self) -> Option<QueueKey> {
        self.ready_rx.lock().await.recv().await
    }

    fn front(&self, key: QueueKey) -> Option<Arc<Event>> {
        self.pending.get(&key).and_then(|queue| queue.front().cloned())
    }

    /// Retire the front event of `key` and reschedule the key if more are waiting.
    fn complete(&self, key: QueueKey) {
        let more = match self.pending.entry(key) {
            Entry::Occupied(mut queue) => {
                queue.get_mut().pop_front();
                if queue.get().is_empty() {
                    queue.remove();
                    false
                } else {
                    true
                }
            }
            Entry::Vacant(_) => false,
        };
        if more {
            let _ = self.ready_tx.send(key);
        }
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::SeqCst)
    }

    async fn drained(&self) {
        loop {
            let idle = self.idle.notified();
            if self.outstanding() == 0 {
                return;
            }
            idle.await;
        }
    }
}

/// Routes decoded events to the state store and registered handlers.
pub struct Dispatcher {
    queues: Arc<KeyedQueues>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    accepting: AtomicBool,
    next_unordered: AtomicU64,
    cache: Arc<StateStore>,
    parser: Arc<CommandParser>,
    metrics: Arc<DispatchMetrics>,
}

/// State shared by every worker task.
struct Worker {
    ctx: Context,
    parser: Arc<CommandParser>,
    reporter: Arc<dyn ErrorReporter>,
    metrics: Arc<DispatchMetrics>,
}

impl Dispatcher {
    /// Spawn `config.workers` workers. Must be called inside a tokio runtime.
    pub fn start(
        config: &DispatcherConfig,
        ctx: Context,
        parser: Arc<CommandParser>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Arc<Self> {
        let metrics = Arc::new(DispatchMetrics::default());
        let cache = Arc::clone(&ctx.cache);
        let worker = Arc::new(Worker {
            ctx,
            parser: Arc::clone(&parser),
            reporter,
            metrics: Arc::clone(&metrics),
        });
        let queues = Arc::new(KeyedQueues::new());

        let count = config.workers.max(1);
        let handles = (0..count)
            .map(|id| tokio::spawn(run_worker(id, Arc::clone(&worker), Arc::clone(&queues))))
            .collect();

        info!(workers = count, "Dispatcher started");
        Arc::new(Self {
            queues,
            workers: Mutex::new(handles),
            accepting: AtomicBool::new(true),
            next_unordered: AtomicU64::new(0),
            cache,
            parser,
            metrics,
        })
    }

    /// Enqueue an event. Never blocks. Returns false once shutdown has begun.
    ///
    /// Called in gateway delivery order: the event's session epoch is assigned here.
    pub fn dispatch(&self, mut event: Event) -> bool {
        self.metrics.received.fetch_add(1, Ordering::Relaxed);

        if !self.accepting.load(Ordering::SeqCst) {
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        match &event.body {
            EventBody::Unknown { name } => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(event = %name, sequence = event.sequence, "Dropping unknown event");
                return true;
            }
            EventBody::Ready(ready) => self.parser.set_bot_id(ready.user.id),
            _ => {}
        }

        self.cache.stamp(&mut event);
        let key = self.queue_key(&event);
        self.queues.push(key, Arc::new(event));
        true
    }

    fn queue_key(&self, event: &Event) -> QueueKey {
        match event.ordering_key() {
            Some(key) => QueueKey::Entity(key),
            None => QueueKey::Unordered(self.next_unordered.fetch_add(1, Ordering::Relaxed)),
        }
    }

    pub fn metrics(&self) -> DispatchStats {
        DispatchStats {
            backlog: self.queues.outstanding(),
            ..self.metrics.snapshot()
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Stop accepting events, let queues drain for up to `grace`, then abort the
    /// workers.
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::SeqCst);

        let drained = tokio::time::timeout(grace, self.queues.drained())
            .await
            .is_ok();
        let abandoned = self.queues.outstanding();

        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }

        let stats = self.metrics.snapshot();
        if drained {
            info!(processed = stats.processed, "Dispatcher stopped");
        } else {
            warn!(
                processed = stats.processed,
                abandoned = abandoned,
                "Dispatcher stopped before queues drained"
            );
        }
    }
}

async fn run_worker(id: usize, worker: Arc<Worker>, queues: Arc<KeyedQueues>) {
    debug!(worker = id, "Dispatch worker started");
    while let Some(key) = queues.next_ready().await {
        if let Some(event) = queues.front(key) {
            worker.process(event).await;
        }
        queues.complete(key);
    }
}

impl Worker {
    async fn process(&self, event: Arc<Event>) {
        let kind = event.kind();

        if let Err(e) = self.ctx.cache.apply_event(&event).await {
            warn!(sequence = event.sequence, kind = %kind, error = %e, "Cache update failed");
        }

        for listener in self.ctx.registry.listeners_for(kind) {
            let site = FailureSite {
                extension: listener.extension.to_string(),
                handler: kind.to_string(),
                sequence: Some(event.sequence),
            };
            let call = listener
                .handler
                .on_event(self.ctx.clone(), Arc::clone(&event));
            self.guarded(site, call).await;
        }

        if kind == EventKind::MessageCreate {
            self.route_command(&event).await;
        }

        self.metrics.processed.fetch_add(1, Ordering::Relaxed);
    }

    async fn route_command(&self, event: &Event) {
        let EventBody::MessageCreate(message) = &event.body else {
            return;
        };
        let Some(invocation) = self.parser.parse(message) else {
            return;
        };

        // An invocation is consumed by the best route only
        let Some(route) = self.ctx.registry.route(&invocation).into_iter().next() else {
            debug!(trigger = %invocation.trigger, "No handler for trigger");
            return;
        };

        let site = FailureSite {
            extension: route.extension.to_string(),
            handler: invocation.trigger.clone(),
            sequence: Some(event.sequence),
        };
        let at = invocation.context;
        let call = route.handler.call(self.ctx.clone(), invocation);
        if let Some((error_id, error)) = self.guarded(site, call).await {
            if self.parser.error_notices() {
                self.send_notice(at, error_id, &error);
            }
        }
    }

    /// Run a handler, converting errors and panics into reports.
    async fn guarded(
        &self,
        site: FailureSite,
        call: impl Future<Output = Result<()>>,
    ) -> Option<(Uuid, Error)> {
        let error = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => return None,
            Ok(Err(e)) => e,
            Err(panic) => Error::handler(&site.handler, panic_message(panic.as_ref())),
        };
        self.metrics.handler_failures.fetch_add(1, Ordering::Relaxed);
        let error_id = self.reporter.report(&site, &error);
        Some((error_id, error))
    }

    /// Tell the invoker their command failed. Sent off the queue so a slow
    /// REST call never holds up the next event.
    fn send_notice(&self, at: InvocationContext, error_id: Uuid, error: &Error) {
        let text = error_notice(self.ctx.is_owner(at.author_id), error_id, error);
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = ctx.reply(at.channel_id, text).await {
                warn!(error_id = %error_id, error = %e, "Failed to send error notice");
            }
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
