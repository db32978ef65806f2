//! Bounded pool of reusable child processes.
//!
//! The pool owns three collections: `idle` children ready for reuse,
//! `active` children checked out by a session, and a FIFO queue of callers
//! waiting for a slot. `idle + active` never exceeds `max`.
//!
//! Every compound operation ("take idle, else spawn if below max, else
//! enqueue") runs under one lock with no suspension point, and spawning is
//! synchronous, so the bound holds no matter how tasks interleave.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;

use crate::child::{ChildHandle, ChildSpawner, ChildState, ExitInfo, wait_for_exit};
use crate::error::GatewayError;

/// Sizing of a [`ChildPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    /// Children spawned eagerly at construction (capped at `max`).
    pub prefork: usize,
    pub max: usize,
    /// How long a queued `acquire` may wait. `None` waits forever.
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            prefork: 1,
            max: 10,
            acquire_timeout: None,
        }
    }
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub active: usize,
    pub queued: usize,
}

type Delivery = Result<ChildHandle, GatewayError>;

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Delivery>,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<ChildHandle>,
    active: HashMap<u64, ChildHandle>,
    waiters: VecDeque<Waiter>,
    closed: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.active.len()
    }

    fn take_idle(&mut self) -> Option<ChildHandle> {
        while let Some(child) = self.idle.pop_front() {
            if child.is_alive() {
                return Some(child);
            }
        }
        None
    }
}

struct PoolInner {
    spawner: Arc<dyn ChildSpawner>,
    options: PoolOptions,
    next_id: AtomicU64,
    state: Mutex<PoolState>,
    span: tracing::Span,
}

/// Cloneable handle to a child process pool.
#[derive(Clone)]
pub struct ChildPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ChildPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildPool")
            .field("command", &self.inner.spawner.describe())
            .field("stats", &self.stats())
            .finish()
    }
}

impl ChildPool {
    /// Create a pool and pre-fork `min(prefork, max)` children into idle.
    ///
    /// Must be called from within a Tokio runtime. Pre-fork spawn failures
    /// are logged; the pool still starts.
    pub fn new(spawner: Arc<dyn ChildSpawner>, options: PoolOptions) -> Self {
        let span = tracing::info_span!("pool", command = %spawner.describe());
        let pool = Self {
            inner: Arc::new(PoolInner {
                spawner,
                options,
                next_id: AtomicU64::new(1),
                state: Mutex::new(PoolState::default()),
                span,
            }),
        };
        let prefork = pool.inner.options.prefork.min(pool.inner.options.max);
        {
            let mut state = pool.inner.lock();
            for _ in 0..prefork {
                match pool.inner.spawn_child() {
                    Ok(child) => state.idle.push_back(child),
                    Err(e) => {
                        pool.inner.span.in_scope(|| tracing::error!(error = %e, "pre-fork spawn failed"));
                    }
                }
            }
        }
        pool.inner
            .span
            .in_scope(|| tracing::info!(prefork, max = pool.inner.options.max, "child pool ready"));
        pool
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Check out a child: idle first, else a new spawn below `max`, else wait
    /// in FIFO order for a release or exit to free a slot.
    ///
    /// Dropping the returned future while queued abandons the wait; a child
    /// handed over at that moment goes back to the pool.
    ///
    /// # Errors
    ///
    /// Spawn failure, [`GatewayError::AcquireTimeout`], or
    /// [`GatewayError::PoolClosed`].
    pub async fn acquire(&self) -> Result<ChildHandle, GatewayError> {
        let (waiter_id, rx) = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(GatewayError::PoolClosed);
            }
            if let Some(child) = state.take_idle() {
                state.active.insert(child.id(), child.clone());
                child.mark(ChildState::Active);
                return Ok(child);
            }
            if state.total() < self.inner.options.max {
                let child = self.inner.spawn_child()?;
                state.active.insert(child.id(), child.clone());
                child.mark(ChildState::Active);
                return Ok(child);
            }
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, tx });
            self.inner.span.in_scope(|| {
                tracing::debug!(queued = state.waiters.len(), "pool at capacity; caller queued")
            });
            (id, rx)
        };

        let mut guard = WaitGuard {
            pool: Arc::downgrade(&self.inner),
            waiter_id,
            rx: Some(rx),
        };
        match self.inner.options.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, guard.recv())
                .await
                .unwrap_or(Err(GatewayError::AcquireTimeout(limit))),
            None => guard.recv().await,
        }
    }

    /// Return a child. A live child is detached from its listener and goes
    /// back to idle; an exited one is dropped. Either way the queue is
    /// serviced.
    pub fn release(&self, child: ChildHandle) {
        child.detach();
        let mut state = self.inner.lock();
        let owned = state.active.remove(&child.id()).is_some();
        if !child.is_alive() {
            self.inner
                .span
                .in_scope(|| tracing::info!(child = child.id(), "Cannot release exited process"));
        } else if !owned || state.closed {
            // Not ours to keep (already reaped or pool closed).
            child.kill();
        } else {
            child.mark(ChildState::Idle);
            state.idle.push_back(child);
        }
        self.inner.service_waiters(&mut state);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            idle: state.idle.len(),
            active: state.active.len(),
            queued: state.waiters.iter().filter(|w| !w.tx.is_closed()).count(),
        }
    }

    /// Kill every child and fail every waiter. Later acquires fail with
    /// [`GatewayError::PoolClosed`].
    pub fn shutdown(&self) {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        state.closed = true;
        for child in state.idle.drain(..).chain(state.active.drain().map(|(_, c)| c)) {
            child.detach();
            child.kill();
        }
        for waiter in state.waiters.drain(..) {
            let _ = waiter.tx.send(Err(GatewayError::PoolClosed));
        }
        self.inner.span.in_scope(|| tracing::info!("child pool shut down"));
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn and wire a child plus its exit watcher. Called with the state
    /// lock held; the watcher only takes the lock after the child exits.
    fn spawn_child(self: &Arc<Self>) -> Result<ChildHandle, GatewayError> {
        let io = self.span.in_scope(|| self.spawner.spawn()).inspect_err(|e| {
            self.span.in_scope(|| tracing::error!(error = %e, "failed to spawn child"));
        })?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let child = self.span.in_scope(|| ChildHandle::start(id, io));

        let pool = Arc::downgrade(self);
        let exits = child.subscribe();
        tokio::spawn(async move {
            let info = wait_for_exit(exits).await;
            if let Some(pool) = pool.upgrade() {
                pool.on_exit(id, info);
            }
        });
        Ok(child)
    }

    fn on_exit(self: &Arc<Self>, id: u64, info: ExitInfo) {
        let mut state = self.lock();
        let before = state.total();
        state.idle.retain(|c| c.id() != id);
        state.active.remove(&id);
        if state.total() != before {
            self.span.in_scope(|| tracing::info!(child = id, %info, "removed exited child from pool"));
        }
        self.service_waiters(&mut state);
    }

    /// Hand children to queued callers while capacity allows. Abandoned
    /// waiters are skipped.
    fn service_waiters(self: &Arc<Self>, state: &mut PoolState) {
        while let Some(front) = state.waiters.front() {
            if front.tx.is_closed() {
                state.waiters.pop_front();
                continue;
            }
            if state.closed {
                break;
            }
            let child = match state.take_idle() {
                Some(child) => child,
                None if state.total() < self.options.max => match self.spawn_child() {
                    Ok(child) => child,
                    Err(e) => {
                        if let Some(waiter) = state.waiters.pop_front() {
                            let _ = waiter.tx.send(Err(e));
                        }
                        continue;
                    }
                },
                None => break,
            };
            let Some(waiter) = state.waiters.pop_front() else {
                state.idle.push_back(child);
                break;
            };
            state.active.insert(child.id(), child.clone());
            child.mark(ChildState::Active);
            if let Err(Ok(child)) = waiter.tx.send(Ok(child)) {
                state.active.remove(&child.id());
                child.mark(ChildState::Idle);
                state.idle.push_front(child);
            }
        }
    }
}

/// A queued acquire. Dropping it removes the waiter, and returns any child
/// that was handed over but never received.
struct WaitGuard {
    pool: Weak<PoolInner>,
    waiter_id: u64,
    rx: Option<oneshot::Receiver<Delivery>>,
}

impl WaitGuard {
    async fn recv(&mut self) -> Delivery {
        let Some(rx) = self.rx.as_mut() else {
            return Err(GatewayError::PoolClosed);
        };
        let delivery = rx.await.unwrap_or(Err(GatewayError::PoolClosed));
        self.rx = None;
        delivery
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        rx.close();
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let handed_over = rx.try_recv().ok().and_then(Result::ok);
        let mut state = pool.lock();
        state.waiters.retain(|w| w.id != self.waiter_id);
        drop(state);
        if let Some(child) = handed_over {
            ChildPool { inner: pool }.release(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::child::{MemoryPeer, MemorySpawner};
    use tokio::sync::mpsc;

    fn pool(prefork: usize, max: usize) -> (ChildPool, Arc<MemorySpawner>, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (spawner, peers) = MemorySpawner::new();
        let spawner = Arc::new(spawner);
        let pool = ChildPool::new(
            spawner.clone(),
            PoolOptions {
                prefork,
                max,
                acquire_timeout: None,
            },
        );
        (pool, spawner, peers)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn prefork_is_capped_at_max() {
        let (pool, _spawner, _peers) = pool(5, 2);
        assert_eq!(pool.stats(), PoolStats { idle: 2, active: 0, queued: 0 });
    }

    #[tokio::test]
    async fn acquire_prefers_idle_then_spawns() {
        let (pool, _spawner, _peers) = pool(1, 3);
        let a = pool.acquire().await.unwrap();
        assert_eq!(pool.stats(), PoolStats { idle: 0, active: 1, queued: 0 });
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.state(), ChildState::Active);
        pool.release(a.clone());
        assert_eq!(a.state(), ChildState::Idle);
        let c = pool.acquire().await.unwrap();
        assert_eq!(c.id(), a.id());
        assert_eq!(pool.stats(), PoolStats { idle: 0, active: 2, queued: 0 });
    }

    #[tokio::test]
    async fn waiters_are_served_fifo() {
        let (pool, _spawner, _peers) = pool(0, 1);
        let held = pool.acquire().await.unwrap();

        let (order_tx, mut order_rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();
        for n in 0..3 {
            let pool = pool.clone();
            let order_tx = order_tx.clone();
            tasks.push(tokio::spawn(async move {
                let child = pool.acquire().await.unwrap();
                order_tx.send(n).unwrap();
                pool.release(child);
            }));
            // Queue in a known order.
            settle().await;
        }
        assert_eq!(pool.stats().queued, 3);

        pool.release(held);
        for task in tasks {
            task.await.unwrap();
        }
        let order: Vec<i32> = std::iter::from_fn(|| order_rx.try_recv().ok()).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(pool.stats(), PoolStats { idle: 1, active: 0, queued: 0 });
    }

    #[tokio::test]
    async fn active_never_exceeds_max() {
        let (pool, _spawner, _peers) = pool(0, 3);
        let mut tasks = Vec::new();
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        for _ in 0..20 {
            let pool = pool.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let child = pool.acquire().await.unwrap();
                let stats = pool.stats();
                assert!(stats.idle + stats.active <= 3);
                peak.fetch_max(stats.active, Ordering::SeqCst);
                tokio::task::yield_now().await;
                pool.release(child);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.stats().queued, 0);
    }

    #[tokio::test]
    async fn crashed_child_is_not_returned_to_idle() {
        let (pool, _spawner, mut peers) = pool(1, 1);
        let child = pool.acquire().await.unwrap();
        let peer = peers.recv().await.unwrap();
        peer.exit(1);
        child.exited().await;
        settle().await;
        assert_eq!(pool.stats().active, 0);

        pool.release(child.clone());
        assert_eq!(pool.stats(), PoolStats { idle: 0, active: 0, queued: 0 });

        let fresh = pool.acquire().await.unwrap();
        assert_ne!(fresh.id(), child.id());
        assert!(fresh.is_alive());
    }

    #[tokio::test]
    async fn crash_of_active_child_services_waiter() {
        let (pool, _spawner, mut peers) = pool(0, 1);
        let held = pool.acquire().await.unwrap();
        let peer = peers.recv().await.unwrap();

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        settle().await;
        assert_eq!(pool.stats().queued, 1);

        peer.exit(137);
        let got = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_ne!(got.id(), held.id());
    }

    #[tokio::test]
    async fn abandoned_waiter_is_skipped() {
        let (pool, _spawner, _peers) = pool(0, 1);
        let held = pool.acquire().await.unwrap();

        let abandoned = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        settle().await;
        let live = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        settle().await;
        abandoned.abort();
        settle().await;
        assert_eq!(pool.stats().queued, 1);

        pool.release(held);
        let child = tokio::time::timeout(Duration::from_secs(5), live)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(child.is_alive());
        assert_eq!(pool.stats(), PoolStats { idle: 0, active: 1, queued: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_timeout_fails_and_dequeues() {
        let (spawner, _peers) = MemorySpawner::new();
        let pool = ChildPool::new(
            Arc::new(spawner),
            PoolOptions {
                prefork: 0,
                max: 1,
                acquire_timeout: Some(Duration::from_millis(100)),
            },
        );
        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, GatewayError::AcquireTimeout(_)));
        assert_eq!(pool.stats().queued, 0);
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_to_caller() {
        let (pool, spawner, _peers) = pool(0, 2);
        spawner.set_failing(true);
        assert!(matches!(pool.acquire().await, Err(GatewayError::Spawn { .. })));
        spawner.set_failing(false);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_fails_waiters_and_later_acquires() {
        let (pool, _spawner, _peers) = pool(0, 1);
        let held = pool.acquire().await.unwrap();
        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        settle().await;
        pool.shutdown();
        assert!(matches!(waiter.await.unwrap(), Err(GatewayError::PoolClosed)));
        assert!(matches!(pool.acquire().await, Err(GatewayError::PoolClosed)));
        let info = tokio::time::timeout(Duration::from_secs(5), held.exited()).await.unwrap();
        assert!(!info.success());
    }
}
