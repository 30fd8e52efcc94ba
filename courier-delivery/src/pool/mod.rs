//! Bounded pool of long-lived delivery workers.
//!
//! Workers are created lazily up to the maximum size. A borrowed worker is
//! handed one context through [`Worker::assign`]; once it has executed and
//! released it, the worker returns itself and is validated:
//!
//! - it must report itself alive and idle
//! - the pool must not be over its (possibly shrunk) maximum size
//!
//! Workers failing validation are retired and replaced on demand.
//!
//! Closing the pool broadcasts [`Signal::Shutdown`]; workers finish what they
//! are executing and stop. After the grace period [`Signal::Finalised`]
//! interrupts whatever is still running. Interrupted work is still released.

mod worker;

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_common::{Signal, internal};
use courier_spool::QueueEntry;
use parking_lot::Mutex;
use tokio::{
    sync::{Notify, broadcast},
    task::JoinSet,
    time::Instant,
};
use tracing::{debug, warn};

pub use worker::{Worker, WorkerMetrics, WorkerStatus};

use crate::{DeliveryContext, error::PoolError};

/// What a worker does with its context.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Run the delivery, recording the outcome on the context's entry.
    async fn execute(&self, context: &mut DeliveryContext);

    /// Finalise an entry; called exactly once per assigned context, whether
    /// it ran to completion, was interrupted or never started.
    async fn release(&self, entry: QueueEntry);
}

#[derive(Debug)]
struct PoolState {
    idle: VecDeque<Arc<Worker>>,
    workers: Vec<Arc<Worker>>,
    max_size: usize,
    next_id: usize,
    closed: bool,
}

pub(crate) struct PoolShared {
    state: Mutex<PoolState>,
    returned: Notify,
    signals: broadcast::Sender<Signal>,
    executor: Arc<dyn Executor>,
    idle_wait: Duration,
    tasks: Mutex<JoinSet<()>>,
}

impl PoolShared {
    fn spawn_worker(self: &Arc<Self>, state: &mut PoolState) -> Arc<Worker> {
        let worker = Arc::new(Worker::new(state.next_id));
        state.next_id += 1;
        state.workers.push(Arc::clone(&worker));

        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(Arc::clone(&worker).run(
            Arc::downgrade(self),
            Arc::clone(&self.executor),
            self.signals.subscribe(),
            self.idle_wait,
        ));

        debug!(
            worker = worker.id(),
            size = state.workers.len(),
            "Created worker"
        );
        worker
    }

    fn try_borrow(self: &Arc<Self>) -> Result<Option<Arc<Worker>>, PoolError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }

        while let Some(worker) = state.idle.pop_front() {
            if worker.is_idle() {
                return Ok(Some(worker));
            }
            Self::destroy(&mut state, &worker);
        }

        if state.workers.len() < state.max_size {
            return Ok(Some(self.spawn_worker(&mut state)));
        }

        Ok(None)
    }

    /// Validate a worker that finished its assignment.
    pub(crate) fn give_back(&self, worker: Arc<Worker>) {
        {
            let mut state = self.state.lock();
            let valid = !state.closed
                && worker.is_idle()
                && state.workers.len() <= state.max_size;

            if valid {
                state.idle.push_back(worker);
            } else {
                Self::destroy(&mut state, &worker);
            }
        }

        self.returned.notify_one();
    }

    /// Drop a worker whose task has ended. Waiting borrowers are woken so
    /// they can create a replacement.
    pub(crate) fn forget(&self, worker: &Arc<Worker>) {
        {
            let mut state = self.state.lock();
            state.idle.retain(|idle| !Arc::ptr_eq(idle, worker));
            if state.workers.iter().any(|known| Arc::ptr_eq(known, worker)) {
                Self::destroy(&mut state, worker);
            }
        }

        self.returned.notify_one();
    }

    fn destroy(state: &mut PoolState, worker: &Arc<Worker>) {
        state.workers.retain(|known| !Arc::ptr_eq(known, worker));
        worker.retire();
        debug!(
            worker = worker.id(),
            size = state.workers.len(),
            "Destroyed worker"
        );
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("state", &*self.shared.state.lock())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Empty pool; workers are spawned on first borrow.
    #[must_use]
    pub fn new(max_size: usize, idle_wait: Duration, executor: Arc<dyn Executor>) -> Self {
        let (signals, _) = broadcast::channel(16);

        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    workers: Vec::new(),
                    max_size: max_size.max(1),
                    next_id: 0,
                    closed: false,
                }),
                returned: Notify::new(),
                signals,
                executor,
                idle_wait,
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// Borrow an idle worker, creating one if below the maximum size, or
    /// wait up to `timeout` for one to come back.
    ///
    /// # Errors
    /// [`PoolError::Exhausted`] after the timeout, [`PoolError::Closed`] once
    /// the pool is closed.
    pub async fn borrow(&self, timeout: Duration) -> Result<Arc<Worker>, PoolError> {
        let deadline = Instant::now() + timeout;

        loop {
            let returned = self.shared.returned.notified();
            tokio::pin!(returned);
            returned.as_mut().enable();

            if let Some(worker) = self.shared.try_borrow()? {
                return Ok(worker);
            }

            if tokio::time::timeout_at(deadline, returned).await.is_err() {
                return Err(PoolError::Exhausted(timeout));
            }
        }
    }

    /// Change the maximum size. Surplus idle workers are retired now, busy
    /// ones when they come back.
    pub fn resize(&self, max_size: usize) {
        {
            let mut state = self.shared.state.lock();
            state.max_size = max_size.max(1);

            while state.workers.len() > state.max_size {
                let Some(worker) = state.idle.pop_back() else {
                    break;
                };
                PoolShared::destroy(&mut state, &worker);
            }
        }

        internal!(level = DEBUG, "Worker pool resized to {}", max_size.max(1));
        self.shared.returned.notify_one();
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.shared.state.lock().max_size
    }

    /// Live workers, busy or idle.
    #[must_use]
    pub fn size(&self) -> usize {
        self.shared.state.lock().workers.len()
    }

    #[must_use]
    pub fn idle(&self) -> usize {
        self.shared.state.lock().idle.len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    #[must_use]
    pub fn metrics(&self) -> Vec<WorkerMetrics> {
        let workers = self.shared.state.lock().workers.clone();
        workers.iter().map(|worker| worker.metrics()).collect()
    }

    /// Stop every worker. In-flight deliveries get `grace` to finish before
    /// they are interrupted.
    pub async fn close(&self, grace: Duration) {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.idle.clear();
        }

        let _ = self.shared.signals.send(Signal::Shutdown);
        self.shared.returned.notify_waiters();

        let mut tasks = std::mem::take(&mut *self.shared.tasks.lock());
        if tokio::time::timeout(grace, drain(&mut tasks)).await.is_err() {
            warn!(
                remaining = tasks.len(),
                "Shutdown grace period elapsed, interrupting in-flight deliveries"
            );
            let _ = self.shared.signals.send(Signal::Finalised);
            drain(&mut tasks).await;
        }

        self.shared.state.lock().workers.clear();
        internal!("Worker pool closed");
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(err) = result {
            warn!(error = %err, "Worker task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use courier_spool::{DeliveryState, MailId};
    use pretty_assertions::assert_eq;
    use tokio::sync::Semaphore;

    use super::*;

    /// Executes by waiting on a gate, then marks the entry sent.
    #[derive(Debug)]
    struct Gated {
        gate: Semaphore,
        executed: AtomicUsize,
        released: Mutex<Vec<QueueEntry>>,
    }

    impl Gated {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                executed: AtomicUsize::new(0),
                released: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Executor for Gated {
        async fn execute(&self, context: &mut DeliveryContext) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.executed.fetch_add(1, Ordering::SeqCst);
            let _ = context.entry_mut().mark_sent(Utc::now(), "250 OK");
        }

        async fn release(&self, entry: QueueEntry) {
            self.released.lock().push(entry);
        }
    }

    fn context(index: u32) -> DeliveryContext {
        let now = Utc::now();
        let mut entry = QueueEntry::new(
            MailId::from("1700000000.0"),
            format!("user{index}@example.com"),
            index,
            None,
            now,
        );
        entry.begin_attempt(now).unwrap();
        DeliveryContext::new(entry, Arc::from(b"body".as_slice()))
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    fn pool(max_size: usize, executor: &Arc<Gated>) -> WorkerPool {
        WorkerPool::new(
            max_size,
            Duration::from_secs(60),
            Arc::clone(executor) as Arc<dyn Executor>,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_borrow_creates_lazily_up_to_max() {
        let executor = Gated::new();
        let pool = pool(2, &executor);
        assert_eq!(pool.size(), 0);

        let first = pool.borrow(Duration::from_millis(50)).await.unwrap();
        let second = pool.borrow(Duration::from_millis(50)).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(pool.size(), 2);

        first.assign(context(0)).unwrap();
        second.assign(context(1)).unwrap();

        assert!(matches!(
            pool.borrow(Duration::from_millis(50)).await,
            Err(PoolError::Exhausted(_))
        ));

        executor.gate.add_permits(2);
        wait_for(|| pool.idle() == 2).await;

        assert_eq!(executor.executed.load(Ordering::SeqCst), 2);
        assert!(
            executor
                .released
                .lock()
                .iter()
                .all(|entry| entry.state() == DeliveryState::Sent)
        );
        pool.close(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_borrow_waits_for_returned_worker() {
        let executor = Gated::new();
        let pool = pool(1, &executor);

        let worker = pool.borrow(Duration::from_millis(50)).await.unwrap();
        worker.assign(context(0)).unwrap();

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.borrow(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        executor.gate.add_permits(1);

        let again = waiting.await.unwrap().unwrap();
        assert_eq!(again.id(), worker.id());
        assert_eq!(again.metrics().delivered, 1);
        pool.close(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_assign_to_occupied_worker_is_rejected() {
        let executor = Gated::new();
        let pool = pool(1, &executor);

        let worker = pool.borrow(Duration::from_millis(50)).await.unwrap();
        worker.assign(context(0)).unwrap();

        match worker.assign(context(1)) {
            Err(PoolError::Occupied(rejected)) => {
                assert_eq!(rejected.entry().index, 1);
            }
            other => panic!("expected occupied, got {other:?}"),
        }

        executor.gate.add_permits(1);
        wait_for(|| pool.idle() == 1).await;
        assert_eq!(executor.released.lock().len(), 1);
        pool.close(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shrunk_pool_destroys_returning_worker() {
        let executor = Gated::new();
        let pool = pool(2, &executor);

        let first = pool.borrow(Duration::from_millis(50)).await.unwrap();
        let second = pool.borrow(Duration::from_millis(50)).await.unwrap();
        first.assign(context(0)).unwrap();
        second.assign(context(1)).unwrap();

        pool.resize(1);
        executor.gate.add_permits(2);

        wait_for(|| executor.released.lock().len() == 2 && pool.size() == 1).await;
        assert_eq!(pool.max_size(), 1);
        assert_eq!(
            pool.metrics()
                .iter()
                .filter(|metrics| metrics.status == WorkerStatus::Idle)
                .count(),
            1
        );
        pool.close(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_interrupts_after_grace() {
        let executor = Gated::new();
        let pool = pool(1, &executor);

        let worker = pool.borrow(Duration::from_millis(50)).await.unwrap();
        worker.assign(context(0)).unwrap();
        wait_for(|| worker.status() == WorkerStatus::Executing).await;

        pool.close(Duration::from_millis(50)).await;

        let released = executor.released.lock().clone();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].state(), DeliveryState::InProgress);
        assert_eq!(
            released[0].result_info.as_deref(),
            Some("Temporary failure: Delivery interrupted: forced shutdown")
        );
        assert_eq!(executor.executed.load(Ordering::SeqCst), 0);
        assert!(!worker.is_alive());
        assert!(matches!(
            pool.borrow(Duration::from_millis(10)).await,
            Err(PoolError::Closed)
        ));
    }

    /// Panics on its first release.
    #[derive(Debug, Default)]
    struct FaultyRelease {
        releases: AtomicUsize,
    }

    #[async_trait]
    impl Executor for FaultyRelease {
        async fn execute(&self, context: &mut DeliveryContext) {
            let _ = context.entry_mut().mark_sent(Utc::now(), "250 OK");
        }

        async fn release(&self, _entry: QueueEntry) {
            assert!(
                self.releases.fetch_add(1, Ordering::SeqCst) > 0,
                "release failed"
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_survives_panicking_release() {
        let executor = Arc::new(FaultyRelease::default());
        let pool = WorkerPool::new(
            1,
            Duration::from_secs(60),
            Arc::clone(&executor) as Arc<dyn Executor>,
        );

        let worker = pool.borrow(Duration::from_millis(50)).await.unwrap();
        worker.assign(context(0)).unwrap();
        wait_for(|| pool.idle() == 1).await;

        let again = pool.borrow(Duration::from_secs(1)).await.unwrap();
        assert_eq!(again.id(), worker.id());
        assert_eq!(again.status(), WorkerStatus::Idle);

        again.assign(context(1)).unwrap();
        wait_for(|| executor.releases.load(Ordering::SeqCst) == 2).await;
        wait_for(|| pool.idle() == 1).await;
        assert_eq!(again.metrics().delivered, 2);
        pool.close(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_forgotten_worker_is_replaced() {
        let executor = Gated::new();
        let pool = pool(1, &executor);

        let worker = pool.borrow(Duration::from_millis(50)).await.unwrap();
        pool.shared.forget(&worker);
        assert_eq!(pool.size(), 0);

        let replacement = pool.borrow(Duration::from_millis(50)).await.unwrap();
        assert_ne!(replacement.id(), worker.id());
        pool.close(Duration::from_secs(1)).await;
    }
}
