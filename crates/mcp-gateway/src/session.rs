//! Session ids and idle-session reaping.
//!
//! Two reapers implement [`SessionReaper`]:
//!
//! - [`SessionAccessCounter`] counts in-flight accesses per session and only
//!   starts the cleanup timer once the count drops to zero. Overlapping
//!   requests (a long-lived GET alongside POSTs) keep the session alive.
//! - [`ActivityReaper`] restarts the timer whenever a response completes and
//!   cancels it whenever a request arrives.
//!
//! Firing a timer removes the entry and calls the owner's cleanup callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::AbortHandle;

/// Callback invoked with the session id when a session is reaped.
pub type CleanupFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Generate an opaque, unguessable session id.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Anomalies reported by [`SessionAccessCounter::dec`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} is not tracked")]
    UnknownSession(String),

    #[error("session {0} is already pending cleanup")]
    PendingCleanup(String),

    /// The stored count is already zero. Indicates a bookkeeping bug.
    #[error("session {id} has invalid access count {count}")]
    InvalidAccessCount { id: String, count: usize },
}

/// Which [`SessionReaper`] a stateful bridge uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReaperKind {
    #[default]
    AccessCount,
    Activity,
}

impl ReaperKind {
    pub fn build(self, timeout: Duration, cleanup: CleanupFn) -> Arc<dyn SessionReaper> {
        match self {
            Self::AccessCount => Arc::new(SessionAccessCounter::new(timeout, cleanup)),
            Self::Activity => Arc::new(ActivityReaper::new(timeout, cleanup)),
        }
    }
}

impl std::str::FromStr for ReaperKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "access-count" | "access_count" => Ok(Self::AccessCount),
            "activity" => Ok(Self::Activity),
            other => Err(format!("unknown session reaper `{other}` (expected access-count or activity)")),
        }
    }
}

/// Hooks a bridge calls around each access to a session.
pub trait SessionReaper: Send + Sync {
    /// An access (request, stream) began.
    fn begin(&self, id: &str);
    /// An access finished.
    fn end(&self, id: &str);
    /// The session is gone for another reason; stop tracking it without
    /// running cleanup.
    fn forget(&self, id: &str);
}

/// Holds one access open for its lifetime.
pub struct AccessGuard {
    reaper: Arc<dyn SessionReaper>,
    id: String,
}

impl AccessGuard {
    pub fn new(reaper: Arc<dyn SessionReaper>, id: impl Into<String>) -> Self {
        let id = id.into();
        reaper.begin(&id);
        Self { reaper, id }
    }
}

impl Drop for AccessGuard {
    fn drop(&mut self) {
        self.reaper.end(&self.id);
    }
}

/// Schedule `cleanup` for `id` after `timeout`, unless `still_pending`
/// reports that the timer was superseded in the meantime.
fn schedule<F>(timeout: Duration, id: String, still_pending: F, cleanup: CleanupFn) -> AbortHandle
where
    F: FnOnce(&str) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if still_pending(&id) {
            tracing::info!(session = %id, "session timed out; cleaning up");
            cleanup(&id);
        }
    })
    .abort_handle()
}

#[derive(Debug)]
enum Access {
    Active(usize),
    PendingCleanup { generation: u64, timer: AbortHandle },
}

struct CounterState {
    entries: HashMap<String, Access>,
    generation: u64,
}

/// Reference-counted reaper with deferred cleanup.
#[derive(Clone)]
pub struct SessionAccessCounter {
    state: Arc<Mutex<CounterState>>,
    timeout: Duration,
    cleanup: CleanupFn,
}

impl SessionAccessCounter {
    pub fn new(timeout: Duration, cleanup: CleanupFn) -> Self {
        Self {
            state: Arc::new(Mutex::new(CounterState {
                entries: HashMap::new(),
                generation: 0,
            })),
            timeout,
            cleanup,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CounterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the start of an access: creates a count of 1, cancels a
    /// pending cleanup, or increments.
    pub fn inc(&self, id: &str, reason: &str) {
        let mut guard = self.lock();
        let state = &mut *guard;
        match state.entries.get_mut(id) {
            None => {
                tracing::info!(session = %id, reason, "session access count 0 -> 1 (new session)");
                state.entries.insert(id.to_string(), Access::Active(1));
            }
            Some(Access::PendingCleanup { timer, .. }) => {
                timer.abort();
                tracing::info!(session = %id, reason, "session access count 0 -> 1 (cleanup cancelled)");
                state.entries.insert(id.to_string(), Access::Active(1));
            }
            Some(Access::Active(count)) => {
                tracing::info!(session = %id, reason, "session access count {} -> {}", count, *count + 1);
                *count += 1;
            }
        }
    }

    /// Record the end of an access. Reaching zero starts the cleanup timer.
    ///
    /// # Errors
    ///
    /// Unknown or already-pending sessions are reported without changing
    /// state. [`SessionError::InvalidAccessCount`] means the counter's own
    /// invariant is broken; the operation is aborted.
    pub fn dec(&self, id: &str, reason: &str) -> Result<(), SessionError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let entry = match state.entries.get_mut(id) {
            None => return Err(SessionError::UnknownSession(id.to_string())),
            Some(Access::PendingCleanup { .. }) => {
                return Err(SessionError::PendingCleanup(id.to_string()));
            }
            Some(Access::Active(count)) => count,
        };
        if *entry == 0 {
            return Err(SessionError::InvalidAccessCount {
                id: id.to_string(),
                count: 0,
            });
        }
        tracing::info!(session = %id, reason, "session access count {} -> {}", *entry, *entry - 1);
        *entry -= 1;
        if *entry > 0 {
            return Ok(());
        }

        state.generation += 1;
        let generation = state.generation;
        let weak = Arc::downgrade(&self.state);
        let timer = schedule(
            self.timeout,
            id.to_string(),
            move |id| {
                let Some(shared) = weak.upgrade() else {
                    return false;
                };
                let mut guard = shared.lock().unwrap_or_else(PoisonError::into_inner);
                let state = &mut *guard;
                match state.entries.get(id) {
                    Some(Access::PendingCleanup { generation: g, .. }) if *g == generation => {
                        state.entries.remove(id);
                        true
                    }
                    _ => false,
                }
            },
            Arc::clone(&self.cleanup),
        );
        tracing::info!(session = %id, timeout_ms = self.timeout.as_millis() as u64, "session idle; cleanup scheduled");
        state
            .entries
            .insert(id.to_string(), Access::PendingCleanup { generation, timer });
        Ok(())
    }

    /// Stop tracking `id` unconditionally, optionally running cleanup now.
    pub fn clear(&self, id: &str, run_cleanup: bool, reason: &str) {
        let removed = self.lock().entries.remove(id);
        if let Some(Access::PendingCleanup { timer, .. }) = &removed {
            timer.abort();
        }
        tracing::info!(session = %id, reason, tracked = removed.is_some(), "session access cleared");
        if run_cleanup {
            (self.cleanup)(id);
        }
    }

    /// Current access count; `Some(0)` while cleanup is pending.
    pub fn count(&self, id: &str) -> Option<usize> {
        match self.lock().entries.get(id)? {
            Access::Active(n) => Some(*n),
            Access::PendingCleanup { .. } => Some(0),
        }
    }

    pub fn is_pending_cleanup(&self, id: &str) -> bool {
        matches!(self.lock().entries.get(id), Some(Access::PendingCleanup { .. }))
    }
}

impl SessionReaper for SessionAccessCounter {
    fn begin(&self, id: &str) {
        self.inc(id, "access began");
    }

    fn end(&self, id: &str) {
        match self.dec(id, "access ended") {
            Ok(()) => {}
            Err(e @ SessionError::InvalidAccessCount { .. }) => {
                tracing::error!(session = %id, error = %e, "session access counter invariant violated");
            }
            Err(e) => tracing::warn!(session = %id, error = %e, "ignoring session access decrement"),
        }
    }

    fn forget(&self, id: &str) {
        self.clear(id, false, "session closed");
    }
}

/// Timer-reset reaper: activity cancels the timer, completion restarts it.
#[derive(Clone)]
pub struct ActivityReaper {
    timers: Arc<Mutex<HashMap<String, (u64, AbortHandle)>>>,
    generation: Arc<std::sync::atomic::AtomicU64>,
    timeout: Duration,
    cleanup: CleanupFn,
}

impl ActivityReaper {
    pub fn new(timeout: Duration, cleanup: CleanupFn) -> Self {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(std::sync::atomic::AtomicU64::new(0)),
            timeout,
            cleanup,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (u64, AbortHandle)>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_timer(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }
}

impl SessionReaper for ActivityReaper {
    fn begin(&self, id: &str) {
        if let Some((_, timer)) = self.lock().remove(id) {
            timer.abort();
            tracing::debug!(session = %id, "session activity; cleanup timer cancelled");
        }
    }

    fn end(&self, id: &str) {
        let generation = self
            .generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let weak = Arc::downgrade(&self.timers);
        let mut timers = self.lock();
        let timer = schedule(
            self.timeout,
            id.to_string(),
            move |id| {
                let Some(shared) = weak.upgrade() else {
                    return false;
                };
                let mut guard = shared.lock().unwrap_or_else(PoisonError::into_inner);
                let timers = &mut *guard;
                match timers.get(id) {
                    Some((g, _)) if *g == generation => {
                        timers.remove(id);
                        true
                    }
                    _ => false,
                }
            },
            Arc::clone(&self.cleanup),
        );
        if let Some((_, old)) = timers.insert(id.to_string(), (generation, timer)) {
            old.abort();
        }
    }

    fn forget(&self, id: &str) {
        if let Some((_, timer)) = self.lock().remove(id) {
            timer.abort();
        }
    }
}
