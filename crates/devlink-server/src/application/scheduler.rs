//! One dispatch task shared by many pools.
//!
//! Devices behind a single physical link cannot talk concurrently, so their
//! pools share one [`SharedScheduler`].  Each round the scheduler visits
//! every registered pool in registration order and dispatches at most one
//! packet from it, so a busy device cannot starve its neighbours:
//!
//! ```text
//! pools A, B, C with two packets each  →  A1 B1 C1 A2 B2 C2
//! ```
//!
//! The scheduler is an explicitly owned handle.  Pools register on it when
//! built with [`PoolBuilder::shared`]; the task runs between
//! [`SharedScheduler::start`] and [`SharedScheduler::shutdown`].  It keeps
//! only weak references, so dropped or shut-down pools fall out of the
//! rotation on the next round.
//!
//! [`PoolBuilder::shared`]: crate::application::PoolBuilder::shared

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::application::instruction_pool::{InstructionPool, PoolRef, IDLE_WAIT};

struct SchedulerInner {
    name: String,
    pools: Mutex<Vec<PoolRef>>,
    wake: Arc<Notify>,
    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Round-robin dispatcher shared by a group of pools.
#[derive(Clone)]
pub struct SharedScheduler {
    inner: Arc<SchedulerInner>,
}

impl SharedScheduler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                name: name.into(),
                pools: Mutex::new(Vec::new()),
                wake: Arc::new(Notify::new()),
                running: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Number of live pools in the rotation.
    pub fn pool_count(&self) -> usize {
        let mut pools = self.inner.lock_pools();
        pools.retain(|p| p.upgrade().is_some_and(|pool| !pool.is_closed()));
        pools.len()
    }

    /// Spawns the dispatch task.  Idempotent.
    pub fn start(&self) {
        let mut task = self.inner.lock_task();
        if task.is_some() {
            return;
        }
        self.inner.running.store(true, Ordering::SeqCst);
        *task = Some(tokio::spawn(run(Arc::downgrade(&self.inner))));
        info!("scheduler {}: started", self.inner.name);
    }

    /// Stops the dispatch task after its current exchange is cancelled.
    /// Registered pools keep their queues.
    pub async fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.wake.notify_one();
        let task = self.inner.lock_task().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
            info!("scheduler {}: stopped", self.inner.name);
        }
    }

    pub(crate) fn register(&self, pool: &InstructionPool) {
        let mut pools = self.inner.lock_pools();
        if !pools.iter().any(|p| p.refers_to(pool)) {
            pools.push(pool.downgrade());
            debug!("scheduler {}: registered pool {}", self.inner.name, pool.name());
        }
        drop(pools);
        self.inner.wake.notify_one();
    }

    pub(crate) fn unregister(&self, pool: &InstructionPool) {
        self.inner.lock_pools().retain(|p| !p.refers_to(pool));
        debug!("scheduler {}: unregistered pool {}", self.inner.name, pool.name());
    }

    /// Notifier pools use to signal new work.
    pub(crate) fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.inner.wake)
    }
}

impl std::fmt::Debug for SharedScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedScheduler")
            .field("name", &self.inner.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl SchedulerInner {
    fn lock_pools(&self) -> MutexGuard<'_, Vec<PoolRef>> {
        self.pools.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Live pools in registration order; prunes dead entries.
    fn live_pools(&self) -> Vec<InstructionPool> {
        let mut pools = self.lock_pools();
        let mut live = Vec::with_capacity(pools.len());
        pools.retain(|p| match p.upgrade() {
            Some(pool) if !pool.is_closed() => {
                live.push(pool);
                true
            }
            _ => false,
        });
        live
    }
}

async fn run(weak: Weak<SchedulerInner>) {
    loop {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if !inner.running.load(Ordering::SeqCst) {
            break;
        }

        let pools = inner.live_pools();
        let mut dispatched = false;
        for pool in &pools {
            if let Some(packet) = pool.next_packet() {
                pool.dispatch(packet).await;
                dispatched = true;
            }
        }
        if dispatched {
            continue;
        }

        let delay = pools
            .iter()
            .map(InstructionPool::idle_delay)
            .min()
            .unwrap_or(IDLE_WAIT);
        let wake = Arc::clone(&inner.wake);
        drop(pools);
        drop(inner);
        tokio::select! {
            _ = wake.notified() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
