use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use courier_common::{Signal, internal};
use courier_spool::DeliveryState;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{
    Notify,
    broadcast::{self, error::RecvError},
};
use tracing::{error, trace, warn};

use super::{Executor, PoolShared};
use crate::{
    DeliveryContext, DeliveryError,
    error::{PoolError, TemporaryError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Waiting for an assignment.
    Idle,
    /// Holding a context it has not started on yet.
    Assigned,
    Executing,
    /// Destroyed, or stopped by shutdown.
    Retired,
}

/// Read-only snapshot of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerMetrics {
    pub id: usize,
    pub status: WorkerStatus,
    /// Contexts executed and released.
    pub delivered: u64,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub last_duration: Option<Duration>,
    pub total_duration: Duration,
    pub current_recipient: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: u64,
    last_started: Option<DateTime<Utc>>,
    last_finished: Option<DateTime<Utc>>,
    last_duration: Option<Duration>,
    total_duration: Duration,
    current_recipient: Option<String>,
}

/// A long-lived task that executes one [`DeliveryContext`] at a time.
///
/// The worker reports its own liveness: it is alive until it is retired by the
/// pool or stops on shutdown.
#[derive(Debug)]
pub struct Worker {
    id: usize,
    slot: Mutex<Option<DeliveryContext>>,
    executing: AtomicBool,
    alive: AtomicBool,
    wake: Notify,
    counters: Mutex<Counters>,
}

impl Worker {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            slot: Mutex::new(None),
            executing: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            wake: Notify::new(),
            counters: Mutex::default(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Alive, holding nothing and executing nothing.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let slot = self.slot.lock();
        self.is_alive() && slot.is_none() && !self.executing.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn status(&self) -> WorkerStatus {
        let slot = self.slot.lock();
        if !self.is_alive() {
            WorkerStatus::Retired
        } else if self.executing.load(Ordering::Acquire) {
            WorkerStatus::Executing
        } else if slot.is_some() {
            WorkerStatus::Assigned
        } else {
            WorkerStatus::Idle
        }
    }

    #[must_use]
    pub fn metrics(&self) -> WorkerMetrics {
        let status = self.status();
        let counters = self.counters.lock();

        WorkerMetrics {
            id: self.id,
            status,
            delivered: counters.delivered,
            last_started: counters.last_started,
            last_finished: counters.last_finished,
            last_duration: counters.last_duration,
            total_duration: counters.total_duration,
            current_recipient: counters.current_recipient.clone(),
        }
    }

    /// Hand a context to this worker.
    ///
    /// # Errors
    /// [`PoolError::Occupied`] with the rejected context when the worker
    /// already holds or executes one, or has been retired. A worker sitting on
    /// an unstarted context is woken.
    pub fn assign(&self, context: DeliveryContext) -> Result<(), PoolError> {
        let mut slot = self.slot.lock();

        if !self.is_alive() || slot.is_some() || self.executing.load(Ordering::Acquire) {
            if slot.is_some() {
                self.wake.notify_one();
            }
            return Err(PoolError::Occupied(Box::new(context)));
        }

        *slot = Some(context);
        drop(slot);

        self.wake.notify_one();
        Ok(())
    }

    pub(crate) fn retire(&self) {
        self.alive.store(false, Ordering::Release);
        self.wake.notify_one();
    }

    fn take_assignment(&self) -> Option<DeliveryContext> {
        let mut slot = self.slot.lock();
        let context = slot.take();
        if context.is_some() {
            self.executing.store(true, Ordering::Release);
        }
        context
    }

    pub(crate) async fn run(
        self: Arc<Self>,
        pool: Weak<PoolShared>,
        executor: Arc<dyn Executor>,
        mut signals: broadcast::Receiver<Signal>,
        idle_wait: Duration,
    ) {
        internal!(level = DEBUG, "Worker {} started", self.id);
        let _exit = Exit {
            worker: &self,
            pool: &pool,
        };

        while self.is_alive() {
            if let Some(context) = self.take_assignment() {
                if self.execute(context, &executor, &mut signals).await {
                    break;
                }

                match pool.upgrade() {
                    Some(pool) => pool.give_back(Arc::clone(&self)),
                    None => break,
                }
                continue;
            }

            tokio::select! {
                () = self.wake.notified() => {}
                () = tokio::time::sleep(idle_wait) => {
                    trace!(worker = self.id, "No assignment, still alive");
                }
                signal = signals.recv() => match signal {
                    Ok(Signal::Shutdown | Signal::Finalised) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => {}
                },
            }
        }

        self.alive.store(false, Ordering::Release);

        let held = self.slot.lock().take();
        if let Some(context) = held {
            internal!(
                level = DEBUG,
                "Worker {} releasing unstarted delivery on stop",
                self.id
            );
            self.release(context, &executor).await;
        }

        internal!(level = DEBUG, "Worker {} stopped", self.id);
    }

    /// Execute and release one context. Returns `true` when execution was cut
    /// short by [`Signal::Finalised`].
    async fn execute(
        &self,
        mut context: DeliveryContext,
        executor: &Arc<dyn Executor>,
        signals: &mut broadcast::Receiver<Signal>,
    ) -> bool {
        let started = Instant::now();
        {
            let mut counters = self.counters.lock();
            counters.last_started = Some(Utc::now());
            counters.current_recipient = Some(context.entry().recipient.clone());
        }

        let interrupted = {
            let run = AssertUnwindSafe(executor.execute(&mut context)).catch_unwind();
            tokio::select! {
                result = run => {
                    if result.is_err() {
                        error!(worker = self.id, "Delivery panicked");
                    }
                    false
                }
                () = finalised(signals) => true,
            }
        };

        if interrupted {
            warn!(
                worker = self.id,
                mail_id = %context.entry().mail_id,
                recipient = %context.entry().recipient,
                "Delivery interrupted by forced shutdown"
            );

            let entry = context.entry_mut();
            if entry.has_state(DeliveryState::InProgress) {
                let error = DeliveryError::from(TemporaryError::Interrupted(
                    "forced shutdown".to_string(),
                ));
                entry.result_info = Some(error.to_string());
            }
        }

        self.release(context, executor).await;

        let elapsed = started.elapsed();
        {
            let mut counters = self.counters.lock();
            counters.delivered += 1;
            counters.last_finished = Some(Utc::now());
            counters.last_duration = Some(elapsed);
            counters.total_duration += elapsed;
            counters.current_recipient = None;
        }
        self.executing.store(false, Ordering::Release);

        interrupted
    }

    /// Hand the entry back. A panic here is contained so the worker survives.
    async fn release(&self, context: DeliveryContext, executor: &Arc<dyn Executor>) {
        if AssertUnwindSafe(executor.release(context.into_entry()))
            .catch_unwind()
            .await
            .is_err()
        {
            error!(worker = self.id, "Releasing a delivery panicked");
        }
    }
}

/// Takes the worker out of the pool when its task ends, including by panic,
/// so a replacement can be created.
struct Exit<'a> {
    worker: &'a Arc<Worker>,
    pool: &'a Weak<PoolShared>,
}

impl Drop for Exit<'_> {
    fn drop(&mut self) {
        self.worker.alive.store(false, Ordering::Release);
        self.worker.executing.store(false, Ordering::Release);

        if let Some(pool) = self.pool.upgrade() {
            pool.forget(self.worker);
        }
    }
}

/// Resolves once a forced stop is requested. A plain `Shutdown` lets the
/// current delivery finish.
async fn finalised(signals: &mut broadcast::Receiver<Signal>) {
    loop {
        match signals.recv().await {
            Ok(Signal::Finalised) | Err(RecvError::Closed) => return,
            Ok(Signal::Shutdown) | Err(RecvError::Lagged(_)) => {}
        }
    }
}
