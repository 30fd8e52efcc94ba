//! The delivery manager: submission, the dispatch loop and the single
//! finalisation point for queue entries.
//!
//! ```text
//!  submit ──▶ stores ──▶ loop: next() ──▶ borrow worker ──▶ assign
//!                          ▲                                  │
//!                          │                            pipeline runs
//!                          └──────── release(entry) ◀─────────┘
//! ```
//!
//! Every operation that touches both stores (submit, cancel, sweep,
//! reconfiguration and removal of completed messages) runs under one async
//! store lock.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::{Signal, internal};
use courier_spool::{
    DeliveryState, MailId, MessageStore, QueueEntry, QueueStore, SpoolError,
};
use futures_util::FutureExt;
use parking_lot::RwLock;
use tokio::{
    sync::{
        Mutex, Notify, broadcast,
        broadcast::error::{RecvError, TryRecvError},
        mpsc, oneshot,
    },
    task::JoinHandle,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    DeliveryConfig, DeliveryContext, DeliveryError, DnsError,
    error::{ManagerError, PermanentError, PoolError, TemporaryError},
    listener::ListenerManager,
    message::MessageHeaders,
    pipeline::Pipeline,
    pool::{Executor, WorkerMetrics, WorkerPool},
    state::DeliveryStateMachine,
    sweeper::{MaintenanceSweeper, SweepReport, sweep_stores},
    transport::Transport,
};

/// When a submitted message stops being worth delivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiry {
    /// Keep trying until delivered or out of attempts.
    Never,
    At(DateTime<Utc>),
    /// The configured default retention.
    #[default]
    Default,
}

/// A runtime change applied by the loop between iterations.
#[derive(Debug)]
pub enum Reconfigure {
    PoolSize(usize),
    MessageStore(Arc<dyn MessageStore>),
}

/// The change stays reachable from the caller, so a request the loop never
/// picked up can still be applied directly.
struct Request {
    change: Arc<parking_lot::Mutex<Option<Reconfigure>>>,
    applied: oneshot::Sender<()>,
}

/// State shared by the loop, the workers and the sweeper.
#[derive(Debug)]
pub(crate) struct Core {
    queue: Arc<dyn QueueStore>,
    messages: RwLock<Arc<dyn MessageStore>>,
    store_lock: Mutex<()>,
    listeners: ListenerManager,
    machine: DeliveryStateMachine,
    wake: Notify,
}

impl Core {
    fn message_store(&self) -> Arc<dyn MessageStore> {
        Arc::clone(&*self.messages.read())
    }

    /// Settle, persist and report an entry. Called exactly once per claimed
    /// entry, whatever happened to it.
    pub(crate) async fn release(&self, mut entry: QueueEntry) {
        let state = self.machine.settle(&mut entry, Utc::now());

        let completed = {
            let _guard = self.store_lock.lock().await;

            match self.queue.persist(&entry).await {
                Ok(()) => {}
                Err(SpoolError::NotFound(_)) => {
                    debug!(
                        mail_id = %entry.mail_id,
                        recipient = %entry.recipient,
                        "Released entry was cancelled in flight"
                    );
                    return;
                }
                Err(err) => {
                    error!(
                        mail_id = %entry.mail_id,
                        recipient = %entry.recipient,
                        error = %err,
                        "Failed to persist released entry"
                    );
                    return;
                }
            }

            match self.queue.is_completed(&entry.mail_id).await {
                Ok(true) => {
                    if let Err(err) = self.queue.remove(&entry.mail_id).await {
                        warn!(mail_id = %entry.mail_id, error = %err, "Failed to remove completed message");
                    }
                    true
                }
                Ok(false) => false,
                Err(err) => {
                    warn!(mail_id = %entry.mail_id, error = %err, "Failed to check completion");
                    false
                }
            }
        };

        match state {
            DeliveryState::Sent => info!(
                mail_id = %entry.mail_id,
                recipient = %entry.recipient,
                attempt = entry.attempts(),
                "Delivered"
            ),
            DeliveryState::Failed => warn!(
                mail_id = %entry.mail_id,
                recipient = %entry.recipient,
                attempt = entry.attempts(),
                result = entry.result_info.as_deref().unwrap_or_default(),
                "Delivery failed"
            ),
            DeliveryState::Queued | DeliveryState::InProgress => {}
        }

        self.listeners.notify(&entry, completed);

        if state == DeliveryState::Queued {
            self.wake.notify_one();
        }
    }

    pub(crate) async fn sweep(&self) -> Result<SweepReport, SpoolError> {
        let _guard = self.store_lock.lock().await;
        let messages = self.message_store();
        sweep_stores(self.queue.as_ref(), messages.as_ref()).await
    }
}

/// Runs the pipeline for a worker and hands the entry back to the core.
#[derive(Debug)]
struct DeliveryExecutor {
    pipeline: Pipeline,
    core: Arc<Core>,
}

#[async_trait]
impl Executor for DeliveryExecutor {
    async fn execute(&self, context: &mut DeliveryContext) {
        let outcome = self.pipeline.run(context).await;
        self.core
            .machine
            .apply(context.entry_mut(), &outcome, Utc::now());
    }

    async fn release(&self, entry: QueueEntry) {
        self.core.release(entry).await;
    }
}

struct Tasks {
    manager: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

struct ManagerInner {
    config: DeliveryConfig,
    core: Arc<Core>,
    pool: WorkerPool,
    signals: broadcast::Sender<Signal>,
    requests: mpsc::UnboundedSender<Request>,
    pending: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Request>>>,
    tasks: Mutex<Option<Tasks>>,
    running: AtomicBool,
}

impl ManagerInner {
    async fn init_stores(&self) -> Result<(), ManagerError> {
        self.core.queue.init().await?;
        self.core.message_store().init().await?;
        Ok(())
    }

    async fn apply(&self, change: Reconfigure) {
        let _guard = self.core.store_lock.lock().await;

        match change {
            Reconfigure::PoolSize(size) => self.pool.resize(size),
            Reconfigure::MessageStore(store) => {
                if let Err(err) = store.init().await {
                    error!(error = %err, "New message store failed to initialise, keeping the current one");
                    return;
                }
                *self.core.messages.write() = store;
                internal!(level = INFO, "Message store replaced");
            }
        }
    }

    async fn apply_requests(&self, requests: &mut mpsc::UnboundedReceiver<Request>) {
        while let Ok(request) = requests.try_recv() {
            let change = request.change.lock().take();
            if let Some(change) = change {
                self.apply(change).await;
            }
            let _ = request.applied.send(());
        }
    }

    async fn run(
        self: Arc<Self>,
        mut signals: broadcast::Receiver<Signal>,
        mut requests: mpsc::UnboundedReceiver<Request>,
    ) {
        internal!(level = INFO, "Delivery manager loop started");

        loop {
            self.apply_requests(&mut requests).await;

            match signals.try_recv() {
                Ok(_) | Err(TryRecvError::Closed) => break,
                Err(TryRecvError::Empty | TryRecvError::Lagged(_)) => {}
            }

            match self.core.queue.next().await {
                Ok(Some(entry)) => self.guarded_dispatch(entry).await,
                Ok(None) => {
                    if self.idle(&mut signals).await {
                        break;
                    }
                }
                Err(err) => {
                    error!(error = %err, "Failed to fetch the next queue entry");
                    if self.idle(&mut signals).await {
                        break;
                    }
                }
            }
        }

        // Requests that raced the shutdown are applied directly.
        self.apply_requests(&mut requests).await;
        internal!(level = INFO, "Delivery manager loop stopped");
    }

    /// Wait until woken, the idle interval passes, or shutdown. Returns `true`
    /// on shutdown.
    async fn idle(&self, signals: &mut broadcast::Receiver<Signal>) -> bool {
        tokio::select! {
            () = self.core.wake.notified() => false,
            () = tokio::time::sleep(self.config.idle_wait()) => false,
            signal = signals.recv() => !matches!(signal, Err(RecvError::Lagged(_))),
        }
    }

    /// Dispatch one claimed entry. Whatever is still in the slot afterwards,
    /// because dispatch gave up or panicked, is released unattempted.
    async fn guarded_dispatch(&self, entry: QueueEntry) {
        let mut slot = Some(entry);

        if AssertUnwindSafe(self.dispatch(&mut slot))
            .catch_unwind()
            .await
            .is_err()
        {
            error!("Dispatch panicked, releasing the entry");
        }

        if let Some(mut entry) = slot.take() {
            if entry.has_state(DeliveryState::InProgress)
                && let Err(err) = entry.abandon_attempt(Utc::now())
            {
                warn!(mail_id = %entry.mail_id, error = %err, "Could not abandon attempt");
            }
            self.core.release(entry).await;
        }
    }

    async fn dispatch(&self, slot: &mut Option<QueueEntry>) {
        let Some(entry) = slot.as_mut() else {
            return;
        };
        let now = Utc::now();

        trace!(
            mail_id = %entry.mail_id,
            recipient = %entry.recipient,
            attempt = entry.attempts(),
            "Dispatching"
        );

        if entry.is_expired(now) {
            if let Err(err) = entry.mark_failed(now, "Message expired") {
                warn!(mail_id = %entry.mail_id, error = %err, "Could not expire entry");
            }
            if let Some(entry) = slot.take() {
                self.core.release(entry).await;
            }
            return;
        }

        let body = match self.core.message_store().get(&entry.mail_id).await {
            Ok(Some(body)) => body,
            Ok(None) => {
                let error = DeliveryError::from(PermanentError::ContentMissing(format!(
                    "No message body found for {}",
                    entry.mail_id
                )));
                if let Err(err) = entry.mark_failed(now, error.to_string()) {
                    warn!(mail_id = %entry.mail_id, error = %err, "Could not fail entry");
                }
                if let Some(entry) = slot.take() {
                    self.core.release(entry).await;
                }
                return;
            }
            Err(err) => {
                warn!(mail_id = %entry.mail_id, error = %err, "Failed to load message body");
                entry.result_info = Some(DeliveryError::from(err).to_string());
                if let Some(entry) = slot.take() {
                    self.core.release(entry).await;
                }
                return;
            }
        };

        let worker = match self.pool.borrow(self.config.borrow_timeout()).await {
            Ok(worker) => worker,
            Err(err) => {
                debug!(mail_id = %entry.mail_id, error = %err, "No worker available, returning entry to the queue");
                if let PoolError::Exhausted(_) = err {
                    let error = DeliveryError::from(TemporaryError::PoolExhausted(err.to_string()));
                    entry.result_info = Some(error.to_string());
                }
                return;
            }
        };

        let Some(entry) = slot.take() else {
            return;
        };

        if let Err(err) = worker.assign(DeliveryContext::new(entry, body)) {
            warn!(worker = worker.id(), error = %err, "Worker refused assignment");
            if let PoolError::Occupied(context) = err {
                *slot = Some(context.into_entry());
            }
        }
    }
}

/// Asynchronous outbound delivery engine.
///
/// Cloning is cheap; clones drive the same engine.
#[derive(Clone)]
pub struct DeliveryManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for DeliveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryManager")
            .field("config", &self.inner.config)
            .field("pool", &self.inner.pool)
            .field("running", &self.inner.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DeliveryManager {
    #[must_use]
    pub fn new(
        config: DeliveryConfig,
        queue: Arc<dyn QueueStore>,
        messages: Arc<dyn MessageStore>,
        pipeline: Pipeline,
    ) -> Self {
        let core = Arc::new(Core {
            queue,
            messages: RwLock::new(messages),
            store_lock: Mutex::new(()),
            listeners: ListenerManager::new(),
            machine: DeliveryStateMachine::new(config.retry.clone()),
            wake: Notify::new(),
        });

        let executor = Arc::new(DeliveryExecutor {
            pipeline,
            core: Arc::clone(&core),
        });
        let pool = WorkerPool::new(config.max_workers, config.worker_idle_wait(), executor);

        let (signals, _) = broadcast::channel(16);
        let (requests, pending) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(ManagerInner {
                config,
                core,
                pool,
                signals,
                requests,
                pending: parking_lot::Mutex::new(Some(pending)),
                tasks: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// A manager running the standard pipeline, resolving through the system
    /// DNS configuration tuned by `config.dns`.
    ///
    /// # Errors
    /// If the system DNS configuration cannot be loaded.
    pub fn with_transport(
        config: DeliveryConfig,
        queue: Arc<dyn QueueStore>,
        messages: Arc<dyn MessageStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, DnsError> {
        let pipeline = Pipeline::from_dns_config(&config.dns, transport)?;
        Ok(Self::new(config, queue, messages, pipeline))
    }

    #[must_use]
    pub fn config(&self) -> &DeliveryConfig {
        &self.inner.config
    }

    /// Register and unregister delivery listeners.
    #[must_use]
    pub fn listeners(&self) -> &ListenerManager {
        &self.inner.core.listeners
    }

    /// Initialise the stores and start the loop and the sweeper.
    ///
    /// # Errors
    /// If the manager is already running or was shut down, or a store fails
    /// to initialise.
    pub async fn start(&self) -> Result<(), ManagerError> {
        if self.inner.pool.is_closed() {
            return Err(ManagerError::Stopped);
        }
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(ManagerError::AlreadyRunning);
        }

        let requests = match self.inner.init_stores().await {
            Ok(()) => self.inner.pending.lock().take(),
            Err(err) => {
                self.inner.running.store(false, Ordering::Release);
                return Err(err);
            }
        };
        let Some(requests) = requests else {
            self.inner.running.store(false, Ordering::Release);
            return Err(ManagerError::AlreadyRunning);
        };

        let manager = tokio::spawn(
            Arc::clone(&self.inner).run(self.inner.signals.subscribe(), requests),
        );
        let sweeper = tokio::spawn(
            MaintenanceSweeper::new(Arc::clone(&self.inner.core), self.inner.config.sweep_interval())
                .run(self.inner.signals.subscribe()),
        );
        *self.inner.tasks.lock().await = Some(Tasks { manager, sweeper });

        internal!(
            level = INFO,
            "Delivery manager started with up to {} worker(s)",
            self.inner.pool.max_size()
        );
        Ok(())
    }

    /// Stop the loop, drain the pool and run a last sweep.
    ///
    /// In-flight deliveries get the configured grace period before they are
    /// interrupted; either way their entries are released.
    pub async fn shutdown(&self) {
        let tasks = self.inner.tasks.lock().await.take();
        internal!(level = INFO, "Delivery manager shutting down");

        let _ = self.inner.signals.send(Signal::Shutdown);
        self.inner.core.wake.notify_one();

        if let Some(Tasks { manager, sweeper }) = tasks {
            if let Err(err) = manager.await {
                error!(error = %err, "Delivery loop ended abnormally");
            }
            self.inner.pool.close(self.inner.config.shutdown_grace()).await;
            if let Err(err) = sweeper.await {
                error!(error = %err, "Maintenance sweeper ended abnormally");
            }
        } else {
            self.inner.pool.close(self.inner.config.shutdown_grace()).await;
        }

        self.inner.running.store(false, Ordering::Release);
        internal!(level = INFO, "Delivery manager stopped");
    }

    /// Store `body` and queue one entry per recipient under a fresh
    /// identifier.
    ///
    /// # Errors
    /// If there are no recipients or the body cannot be stored; nothing is
    /// queued in that case.
    pub async fn submit(
        &self,
        body: impl Into<Arc<[u8]>> + Send,
        recipients: &[String],
        expiry: Expiry,
    ) -> Result<MailId, ManagerError> {
        self.submit_with_id(MailId::generate(), body, recipients, expiry)
            .await
    }

    /// Submit a raw message, reading its identifier, expiry and recipients
    /// (`To`, `Cc`, `Bcc`) from its headers.
    ///
    /// # Errors
    /// If the headers cannot be parsed or the submission fails.
    pub async fn submit_message(&self, raw: impl Into<Arc<[u8]>> + Send) -> Result<MailId, ManagerError> {
        let raw: Arc<[u8]> = raw.into();
        let headers = MessageHeaders::parse(&raw)?;

        let expiry = headers.expires_at.map_or(Expiry::Default, Expiry::At);
        let mail_id = headers.mail_id.unwrap_or_else(MailId::generate);

        self.submit_with_id(mail_id, raw, &headers.recipients, expiry)
            .await
    }

    /// Submit under a caller-chosen identifier.
    ///
    /// # Errors
    /// [`SpoolError::AlreadyExists`] if the identifier is already queued, or
    /// as [`submit`](Self::submit).
    #[tracing::instrument(level = "debug", skip(self, body, recipients), fields(recipients = recipients.len()))]
    pub async fn submit_with_id(
        &self,
        mail_id: MailId,
        body: impl Into<Arc<[u8]>> + Send,
        recipients: &[String],
        expiry: Expiry,
    ) -> Result<MailId, ManagerError> {
        if recipients.is_empty() {
            return Err(ManagerError::NoRecipients);
        }

        let now = Utc::now();
        let expires_at = match expiry {
            Expiry::Never => None,
            Expiry::At(at) => Some(at),
            Expiry::Default => self.inner.config.default_expiry(now),
        };

        {
            let core = &self.inner.core;
            let _guard = core.store_lock.lock().await;

            if !core.queue.entries(&mail_id).await?.is_empty() {
                return Err(SpoolError::AlreadyExists(mail_id).into());
            }

            let messages = core.message_store();
            messages.put(&mail_id, body.into()).await?;

            if let Err(err) = core.queue.add(&mail_id, expires_at, recipients).await {
                if let Err(cleanup) = messages.remove(&mail_id).await {
                    warn!(%mail_id, error = %cleanup, "Failed to remove body of rejected submission");
                }
                return Err(err.into());
            }
        }

        internal!(
            level = DEBUG,
            "Queued {mail_id} for {} recipient(s)",
            recipients.len()
        );
        self.inner.core.wake.notify_one();
        Ok(mail_id)
    }

    /// Remove a message's body and entries. Unknown identifiers are a no-op.
    ///
    /// Returns the number of entries removed. Entries in flight finish their
    /// attempt but are not reported.
    ///
    /// # Errors
    /// If either store fails.
    pub async fn cancel(&self, mail_id: &MailId) -> Result<usize, ManagerError> {
        let core = &self.inner.core;
        let _guard = core.store_lock.lock().await;

        let removed = core.queue.remove(mail_id).await?;
        core.message_store().remove(mail_id).await?;

        if removed > 0 {
            internal!(level = DEBUG, "Cancelled {mail_id}, {removed} entry(ies) removed");
        }
        Ok(removed)
    }

    /// Current entries of a message; empty once it completed or if unknown.
    ///
    /// # Errors
    /// If the queue store fails.
    pub async fn status(&self, mail_id: &MailId) -> Result<Vec<QueueEntry>, ManagerError> {
        Ok(self.inner.core.queue.entries(mail_id).await?)
    }

    /// Entries held by the queue store, in any state.
    ///
    /// # Errors
    /// If the queue store fails.
    pub async fn queue_size(&self) -> Result<usize, ManagerError> {
        Ok(self.inner.core.queue.size().await?)
    }

    #[must_use]
    pub fn pool_metrics(&self) -> Vec<WorkerMetrics> {
        self.inner.pool.metrics()
    }

    /// Run a maintenance sweep now.
    ///
    /// # Errors
    /// If either store fails.
    pub async fn sweep(&self) -> Result<SweepReport, ManagerError> {
        Ok(self.inner.core.sweep().await?)
    }

    /// Apply a runtime change. While the loop runs it applies the change
    /// between iterations; otherwise it is applied directly.
    pub async fn reconfigure(&self, change: Reconfigure) {
        if !self.inner.running.load(Ordering::Acquire) {
            self.inner.apply(change).await;
            return;
        }

        let change = Arc::new(parking_lot::Mutex::new(Some(change)));
        let (applied, done) = oneshot::channel();
        let request = Request {
            change: Arc::clone(&change),
            applied,
        };

        if self.inner.requests.send(request).is_ok() {
            self.inner.core.wake.notify_one();
            if done.await.is_ok() {
                return;
            }
        }

        // The loop stopped before it got to the request.
        let unapplied = change.lock().take();
        if let Some(change) = unapplied {
            debug!("Loop not accepting reconfiguration, applying directly");
            self.inner.apply(change).await;
        }
    }
}
