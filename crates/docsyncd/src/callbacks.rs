//! Deferred work scheduled on the tokio runtime.
//!
//! A [`CallbackGroup`] registers three categories of callbacks and keeps one
//! bookkeeping entry (a [`CancellationToken`]) per outstanding registration:
//!
//! - next-tick: runs as soon as the runtime polls it; safe to add from any thread
//! - timeout: runs once after a delay
//! - periodic: runs repeatedly; the next run starts a full period after the
//!   previous one *started*, but never before the previous one finished
//!
//! Entries for one-shot callbacks are removed just before the callback runs,
//! so removing a callback that already fired fails exactly like removing it
//! twice.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Callback failures are logged; they never stop a periodic schedule

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use docsync_core::{CallbackId, CallbackKind, DomainError};

/// Smallest accepted period for periodic callbacks.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

// ============================================================================
// Callback Types
// ============================================================================

/// Errors raised by callback registration or by the callbacks themselves.
#[derive(Debug, Clone, Error)]
pub enum CallbackError {
    /// Removal of an id that already ran or was already removed
    #[error("{kind} callback {id} already ran or was already removed, cannot be removed again")]
    AlreadyRemoved { id: CallbackId, kind: CallbackKind },

    /// The callback itself reported a failure
    #[error("callback failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Document(#[from] DomainError),
}

pub type CallbackResult = Result<(), CallbackError>;

/// Boxed future returned by asynchronous callbacks.
pub type CallbackFuture = Pin<Box<dyn Future<Output = CallbackResult> + Send>>;

/// What a callback invocation produced: either it already finished, or it
/// handed back work that must be awaited before the invocation counts as done.
pub enum CallbackOutcome {
    Ready(CallbackResult),
    Pending(CallbackFuture),
}

impl CallbackOutcome {
    pub fn done() -> Self {
        Self::Ready(Ok(()))
    }

    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = CallbackResult> + Send + 'static,
    {
        Self::Pending(Box::pin(future))
    }

    /// Waits for the invocation to finish.
    pub async fn resolve(self) -> CallbackResult {
        match self {
            Self::Ready(result) => result,
            Self::Pending(future) => future.await,
        }
    }
}

impl From<CallbackResult> for CallbackOutcome {
    fn from(result: CallbackResult) -> Self {
        Self::Ready(result)
    }
}

/// A schedulable callback.
pub type Callback = Arc<dyn Fn() -> CallbackOutcome + Send + Sync>;

// ============================================================================
// Callback Group
// ============================================================================

type Registry = Mutex<HashMap<CallbackId, CancellationToken>>;

struct GroupInner {
    runtime: Handle,
    next_tick: Registry,
    timeout: Registry,
    periodic: Registry,
}

impl GroupInner {
    fn registry(&self, kind: CallbackKind) -> &Registry {
        match kind {
            CallbackKind::NextTick => &self.next_tick,
            CallbackKind::Timeout => &self.timeout,
            CallbackKind::Periodic => &self.periodic,
        }
    }

    /// Removes the entry of a one-shot callback that is about to run.
    ///
    /// Returns false if it was removed in the meantime.
    fn claim(&self, kind: CallbackKind, id: CallbackId) -> bool {
        self.registry(kind).lock().remove(&id).is_some()
    }
}

/// Registry of deferred callbacks bound to one runtime.
///
/// Cloning is cheap and clones share the same registrations.
#[derive(Clone)]
pub struct CallbackGroup {
    inner: Arc<GroupInner>,
}

impl CallbackGroup {
    /// Creates a group that spawns its callbacks on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                runtime,
                next_tick: Mutex::new(HashMap::new()),
                timeout: Mutex::new(HashMap::new()),
                periodic: Mutex::new(HashMap::new()),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Next tick
    // ------------------------------------------------------------------------

    /// Runs `callback` on the next runtime iteration.
    ///
    /// Safe to call from threads outside the runtime.
    pub fn add_next_tick_callback(&self, callback: Callback) -> CallbackId {
        self.add_next_tick_callback_with_id(CallbackId::next(), callback)
    }

    pub(crate) fn add_next_tick_callback_with_id(
        &self,
        id: CallbackId,
        callback: Callback,
    ) -> CallbackId {
        let token = self.register(CallbackKind::NextTick, id);
        let inner = Arc::clone(&self.inner);

        self.inner.runtime.spawn(async move {
            if token.is_cancelled() || !inner.claim(CallbackKind::NextTick, id) {
                return;
            }
            invoke(id, CallbackKind::NextTick, &callback).await;
        });

        id
    }

    pub fn remove_next_tick_callback(&self, id: CallbackId) -> Result<(), CallbackError> {
        self.remove(CallbackKind::NextTick, id)
    }

    // ------------------------------------------------------------------------
    // Timeout
    // ------------------------------------------------------------------------

    /// Runs `callback` once after `delay`.
    pub fn add_timeout_callback(&self, callback: Callback, delay: Duration) -> CallbackId {
        self.add_timeout_callback_with_id(CallbackId::next(), callback, delay)
    }

    pub(crate) fn add_timeout_callback_with_id(
        &self,
        id: CallbackId,
        callback: Callback,
        delay: Duration,
    ) -> CallbackId {
        let token = self.register(CallbackKind::Timeout, id);
        let inner = Arc::clone(&self.inner);

        self.inner.runtime.spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = sleep(delay) => {}
            }
            if !inner.claim(CallbackKind::Timeout, id) {
                return;
            }
            invoke(id, CallbackKind::Timeout, &callback).await;
        });

        id
    }

    pub fn remove_timeout_callback(&self, id: CallbackId) -> Result<(), CallbackError> {
        self.remove(CallbackKind::Timeout, id)
    }

    // ------------------------------------------------------------------------
    // Periodic
    // ------------------------------------------------------------------------

    /// Runs `callback` every `period` until removed.
    ///
    /// The first run happens one period after registration. Invocations never
    /// overlap: a run that takes longer than the period delays the next one
    /// instead of queueing it.
    pub fn add_periodic_callback(&self, callback: Callback, period: Duration) -> CallbackId {
        self.add_periodic_callback_with_id(CallbackId::next(), callback, period)
    }

    pub(crate) fn add_periodic_callback_with_id(
        &self,
        id: CallbackId,
        callback: Callback,
        period: Duration,
    ) -> CallbackId {
        let period = period.max(MIN_PERIOD);
        let token = self.register(CallbackKind::Periodic, id);

        self.inner.runtime.spawn(async move {
            let mut next_run = Instant::now() + period;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = sleep_until(next_run) => {}
                }
                // The period counts from the start of this run
                next_run = Instant::now() + period;
                invoke(id, CallbackKind::Periodic, &callback).await;
            }
            debug!(callback_id = %id, "Periodic callback stopped");
        });

        id
    }

    pub fn remove_periodic_callback(&self, id: CallbackId) -> Result<(), CallbackError> {
        self.remove(CallbackKind::Periodic, id)
    }

    // ------------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------------

    fn register(&self, kind: CallbackKind, id: CallbackId) -> CancellationToken {
        let token = CancellationToken::new();
        self.inner.registry(kind).lock().insert(id, token.clone());
        token
    }

    /// Removes a registration of the given kind.
    pub fn remove(&self, kind: CallbackKind, id: CallbackId) -> Result<(), CallbackError> {
        let token = self
            .inner
            .registry(kind)
            .lock()
            .remove(&id)
            .ok_or(CallbackError::AlreadyRemoved { id, kind })?;
        token.cancel();
        Ok(())
    }

    /// Removes every outstanding registration.
    pub fn remove_all_callbacks(&self) {
        let mut removed = 0;
        for kind in [CallbackKind::NextTick, CallbackKind::Timeout, CallbackKind::Periodic] {
            let drained: Vec<CancellationToken> = self
                .inner
                .registry(kind)
                .lock()
                .drain()
                .map(|(_, token)| token)
                .collect();
            removed += drained.len();
            for token in drained {
                token.cancel();
            }
        }
        if removed > 0 {
            debug!(removed, "Removed all callbacks");
        }
    }

    /// Number of outstanding registrations of one kind.
    pub fn count(&self, kind: CallbackKind) -> usize {
        self.inner.registry(kind).lock().len()
    }

    /// Number of outstanding registrations across all kinds.
    pub fn len(&self) -> usize {
        self.count(CallbackKind::NextTick)
            + self.count(CallbackKind::Timeout)
            + self.count(CallbackKind::Periodic)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, kind: CallbackKind, id: CallbackId) -> bool {
        self.inner.registry(kind).lock().contains_key(&id)
    }
}

/// Runs one invocation to completion, logging failures.
async fn invoke(id: CallbackId, kind: CallbackKind, callback: &Callback) {
    if let Err(e) = callback().resolve().await {
        error!(callback_id = %id, kind = %kind, error = %e, "Error thrown from callback");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback(counter: &Arc<AtomicUsize>) -> Callback {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            CallbackOutcome::done()
        })
    }

    /// Lets spawned tasks run (paused clock: auto-advances when idle).
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_tick_runs_and_cleans_up() {
        let group = CallbackGroup::new(Handle::current());
        let counter = Arc::new(AtomicUsize::new(0));

        let id = group.add_next_tick_callback(counting_callback(&counter));
        assert!(group.contains(CallbackKind::NextTick, id));

        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(group.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_next_tick_after_it_fired_fails() {
        let group = CallbackGroup::new(Handle::current());
        let counter = Arc::new(AtomicUsize::new(0));

        let id = group.add_next_tick_callback(counting_callback(&counter));
        settle().await;

        let err = group.remove_next_tick_callback(id).unwrap_err();
        assert!(matches!(err, CallbackError::AlreadyRemoved { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_next_tick_never_runs() {
        let group = CallbackGroup::new(Handle::current());
        let counter = Arc::new(AtomicUsize::new(0));

        let id = group.add_next_tick_callback(counting_callback(&counter));
        group.remove_next_tick_callback(id).unwrap();
        settle().await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(group.remove_next_tick_callback(id).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_once_after_delay() {
        let group = CallbackGroup::new(Handle::current());
        let counter = Arc::new(AtomicUsize::new(0));

        group.add_timeout_callback(counting_callback(&counter), Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(group.count(CallbackKind::Timeout), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(group.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_double_remove() {
        let group = CallbackGroup::new(Handle::current());
        let counter = Arc::new(AtomicUsize::new(0));

        let id = group.add_timeout_callback(counting_callback(&counter), Duration::from_secs(1));
        group.remove_timeout_callback(id).unwrap();
        assert!(group.remove_timeout_callback(id).is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_repeats_until_removed() {
        let group = CallbackGroup::new(Handle::current());
        let counter = Arc::new(AtomicUsize::new(0));

        let id =
            group.add_periodic_callback(counting_callback(&counter), Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(35)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        group.remove_periodic_callback(id).unwrap();
        assert!(group.remove_periodic_callback(id).is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(group.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_slow_invocation_delays_next() {
        let group = CallbackGroup::new(Handle::current());
        let starts = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&starts);

        // Each run takes 25ms against a 10ms period
        let callback: Callback = Arc::new(move || {
            record.lock().push(Instant::now());
            CallbackOutcome::pending(async {
                sleep(Duration::from_millis(25)).await;
                Ok(())
            })
        });
        let origin = Instant::now();
        group.add_periodic_callback(callback, Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(100)).await;
        group.remove_all_callbacks();

        let starts = starts.lock().clone();
        assert!(starts.len() >= 3);
        assert!(starts[0] - origin >= Duration::from_millis(10));
        for pair in starts.windows(2) {
            // A new run only starts once the previous one finished
            assert!(pair[1] - pair[0] >= Duration::from_millis(25));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_keeps_running_after_error() {
        let group = CallbackGroup::new(Handle::current());
        let counter = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&counter);

        let callback: Callback = Arc::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            CallbackOutcome::Ready(Err(CallbackError::Failed("boom".to_string())))
        });
        group.add_periodic_callback(callback, Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(45)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(group.count(CallbackKind::Periodic), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_leaked_entries_after_steady_state() {
        let group = CallbackGroup::new(Handle::current());
        let counter = Arc::new(AtomicUsize::new(0));

        let mut removed = Vec::new();
        for i in 0..10u64 {
            group.add_next_tick_callback(counting_callback(&counter));
            let id = group.add_timeout_callback(
                counting_callback(&counter),
                Duration::from_millis(5 * (i + 1)),
            );
            if i % 2 == 0 {
                removed.push(id);
            }
        }
        for id in removed {
            group.remove_timeout_callback(id).unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 15);
        assert_eq!(group.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_all_callbacks() {
        let group = CallbackGroup::new(Handle::current());
        let counter = Arc::new(AtomicUsize::new(0));

        group.add_next_tick_callback(counting_callback(&counter));
        group.add_timeout_callback(counting_callback(&counter), Duration::from_millis(5));
        group.add_periodic_callback(counting_callback(&counter), Duration::from_millis(5));
        assert_eq!(group.len(), 3);

        group.remove_all_callbacks();
        assert!(group.is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_next_tick_from_foreign_thread() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let group = CallbackGroup::new(runtime.handle().clone());
        let counter = Arc::new(AtomicUsize::new(0));

        let worker_group = group.clone();
        let worker_counter = Arc::clone(&counter);
        std::thread::spawn(move || {
            worker_group.add_next_tick_callback(counting_callback(&worker_counter));
        })
        .join()
        .unwrap();

        runtime.block_on(async {
            for _ in 0..100 {
                if counter.load(Ordering::SeqCst) == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(group.is_empty());
    }
}
