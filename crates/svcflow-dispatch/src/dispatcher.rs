//! Dispatcher: FIFO queue, worker pool and handler table.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{DispatchError, DispatchResult};

/// Identifier of the entity an action belongs to.
pub type EntityId = u64;

/// Future returned by a handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Handler invoked with the action it is registered for.
pub type Handler<A> = Arc<dyn Fn(A) -> HandlerFuture + Send + Sync>;

/// A unit of work routed by name.
pub trait Action: Send + 'static {
    /// Name of the handler that runs this action.
    fn name(&self) -> &'static str;

    /// Entity this action is serialized against.
    fn entity_id(&self) -> EntityId;
}

/// How actions for the same entity interact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Exclusion {
    /// At most one action per entity runs at a time, in submission order.
    #[default]
    PerEntity,
    /// Actions run as soon as a worker is free.
    None,
}

struct QueueState<A> {
    pending: VecDeque<A>,
    busy: HashMap<EntityId, usize>,
    running: usize,
}

impl<A: Action> QueueState<A> {
    /// Pop the oldest action whose entity is free.
    fn take_next(&mut self, exclusion: Exclusion) -> Option<A> {
        let pos = match exclusion {
            Exclusion::None => (!self.pending.is_empty()).then_some(0),
            Exclusion::PerEntity => self
                .pending
                .iter()
                .position(|a| !self.busy.contains_key(&a.entity_id())),
        }?;

        let action = self.pending.remove(pos)?;
        *self.busy.entry(action.entity_id()).or_insert(0) += 1;
        self.running += 1;
        Some(action)
    }

    fn finish(&mut self, entity: EntityId) {
        if let Some(count) = self.busy.get_mut(&entity) {
            *count -= 1;
            if *count == 0 {
                self.busy.remove(&entity);
            }
        }
        self.running -= 1;
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.running == 0
    }
}

struct Shared<A> {
    name: &'static str,
    concurrency: usize,
    exclusion: Exclusion,
    handlers: RwLock<HashMap<&'static str, Handler<A>>>,
    queue: Mutex<QueueState<A>>,
    /// Wakes workers when the queue or the busy set changes.
    work: Notify,
    /// Wakes `wait_idle` callers whenever an action finishes or is dropped.
    idle: Notify,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<A> Shared<A> {
    fn queue(&self) -> std::sync::MutexGuard<'_, QueueState<A>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Bounded pool of workers executing named actions.
///
/// Cloning yields another handle to the same queue and workers.
pub struct Dispatcher<A> {
    shared: Arc<Shared<A>>,
}

impl<A> Clone for Dispatcher<A> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<A: Action> Dispatcher<A> {
    /// Create a dispatcher that will run up to `concurrency` actions at once.
    ///
    /// `name` only tags log lines. Workers are not spawned until
    /// [`Dispatcher::start`].
    pub fn new(name: &'static str, concurrency: usize) -> Self {
        Self::with_exclusion(name, concurrency, Exclusion::PerEntity)
    }

    pub fn with_exclusion(name: &'static str, concurrency: usize, exclusion: Exclusion) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                name,
                concurrency: concurrency.max(1),
                exclusion,
                handlers: RwLock::new(HashMap::new()),
                queue: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    busy: HashMap::new(),
                    running: 0,
                }),
                work: Notify::new(),
                idle: Notify::new(),
                shutdown_tx,
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register the handler for an action name, replacing any previous one.
    pub fn register<F, Fut>(&self, name: &'static str, handler: F)
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Handler<A> = Arc::new(move |action| Box::pin(handler(action)));
        let mut handlers = self
            .shared
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        handlers.insert(name, handler);
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.shared
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Spawn the worker tasks. Calling it again is a no-op.
    pub fn start(&self) {
        let mut workers = self
            .shared
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !workers.is_empty() {
            warn!(dispatcher = self.shared.name, "dispatcher already started");
            return;
        }

        for index in 0..self.shared.concurrency {
            let shared = Arc::clone(&self.shared);
            workers.push(tokio::spawn(worker_loop(shared, index)));
        }
        info!(
            dispatcher = self.shared.name,
            workers = self.shared.concurrency,
            "dispatcher started"
        );
    }

    /// Enqueue an action. Never blocks.
    pub fn submit(&self, action: A) -> DispatchResult<()> {
        if *self.shared.shutdown_tx.borrow() {
            return Err(DispatchError::ShutDown(self.shared.name));
        }
        if !self.has_handler(action.name()) {
            return Err(DispatchError::UnknownAction(action.name().to_string()));
        }

        debug!(
            dispatcher = self.shared.name,
            action = action.name(),
            entity = action.entity_id(),
            "action queued"
        );
        self.shared.queue().pending.push_back(action);
        self.shared.work.notify_waiters();
        Ok(())
    }

    /// Drop every queued action for `entity`. Running actions are untouched.
    ///
    /// Returns the number of actions removed.
    pub fn cancel(&self, entity: EntityId) -> usize {
        let removed = {
            let mut queue = self.shared.queue();
            let before = queue.pending.len();
            queue.pending.retain(|a| a.entity_id() != entity);
            before - queue.pending.len()
        };
        if removed > 0 {
            debug!(
                dispatcher = self.shared.name,
                entity, removed, "queued actions cancelled"
            );
            self.shared.idle.notify_waiters();
        }
        removed
    }

    /// Number of queued actions for `entity`.
    pub fn queued_for(&self, entity: EntityId) -> usize {
        self.shared
            .queue()
            .pending
            .iter()
            .filter(|a| a.entity_id() == entity)
            .count()
    }

    /// Number of queued actions across all entities.
    pub fn queued(&self) -> usize {
        self.shared.queue().pending.len()
    }

    /// Whether an action for `entity` is currently running.
    pub fn is_running(&self, entity: EntityId) -> bool {
        self.shared.queue().busy.contains_key(&entity)
    }

    /// Resolve once the queue is empty and no action is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.queue().is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting work and wait for the workers to exit.
    ///
    /// Running actions are allowed to finish; queued ones are dropped.
    pub async fn shutdown(&self) {
        let _ = self.shared.shutdown_tx.send(true);
        self.shared.work.notify_waiters();

        let workers: Vec<_> = {
            let mut workers = self
                .shared
                .workers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for worker in workers {
            let _ = worker.await;
        }

        let dropped = {
            let mut queue = self.shared.queue();
            let n = queue.pending.len();
            queue.pending.clear();
            n
        };
        self.shared.idle.notify_waiters();
        info!(dispatcher = self.shared.name, dropped, "dispatcher stopped");
    }
}

async fn worker_loop<A: Action>(shared: Arc<Shared<A>>, index: usize) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    debug!(dispatcher = shared.name, worker = index, "worker started");

    loop {
        let notified = shared.work.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if *shutdown_rx.borrow() {
            break;
        }

        let next = shared.queue().take_next(shared.exclusion);
        match next {
            Some(action) => run_action(&shared, action).await,
            None => {
                tokio::select! {
                    _ = &mut notified => {}
                    result = shutdown_rx.changed() => {
                        if result.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    debug!(dispatcher = shared.name, worker = index, "worker stopped");
}

async fn run_action<A: Action>(shared: &Shared<A>, action: A) {
    let name = action.name();
    let entity = action.entity_id();

    let handler = shared
        .handlers
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(name)
        .cloned();

    match handler {
        Some(handler) => {
            info!(dispatcher = shared.name, action = name, entity, "running action");
            // A separate task isolates handler panics from the worker.
            match tokio::spawn(handler(action)).await {
                Ok(Ok(())) => {
                    debug!(dispatcher = shared.name, action = name, entity, "action done")
                }
                Ok(Err(e)) => error!(
                    dispatcher = shared.name,
                    action = name,
                    entity,
                    error = %format!("{e:#}"),
                    "action failed"
                ),
                Err(e) => error!(
                    dispatcher = shared.name,
                    action = name,
                    entity,
                    error = %e,
                    "action panicked"
                ),
            }
        }
        None => warn!(dispatcher = shared.name, action = name, entity, "no handler, dropping"),
    }

    shared.queue().finish(entity);
    shared.work.notify_waiters();
    shared.idle.notify_waiters();
}
