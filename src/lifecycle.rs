//! Tracking of in-flight requests within a session: ID uniqueness, staged
//! timeouts, and orderly shutdown.
//!
//! Every client-originated request gets registered here with two deadlines.
//! The soft timeout is advisory; when it expires the registered callback runs
//! and the surrounding server typically emits a progress or cancellation
//! notification.  The maximum timeout is the hard ceiling; its callback is the
//! hook for producing a final error response and releasing resources.  Exactly
//! one of four events terminates a tracked request: completion by the caller,
//! the soft timer, the maximum timer, or shutdown of the whole manager.
//!
//! The manager never touches the wire itself.  It only calls back into the
//! code that registered the request, outside of any internal lock and behind a
//! panic barrier, so a misbehaving callback can neither deadlock nor crash the
//! session.
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::{TaskTracker, TaskTrackerToken};

use crate::types::Id;
use crate::{ProtocolError, Result};

/// The stage of the request deadline that expired, passed to timeout
/// callbacks so they can tell a warning from the final cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutType {
    /// The initial soft timeout expired.  Typically used to issue a
    /// cancellation or progress notification; the request stops being tracked
    /// but the callback decides what actually happens to it.
    Soft,
    /// The maximum allowed timeout expired and the request state was
    /// forcefully cleaned up.
    Maximum,
}

impl fmt::Display for TimeoutType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeoutType::Soft => "soft",
            TimeoutType::Maximum => "maximum",
        })
    }
}

/// Callback invoked (at most once per request) when a tracked request times
/// out.
pub type TimeoutCallback = dyn Fn(Id, TimeoutType) + Send + Sync;

/// Sink for errors recovered from panicking timeout callbacks.
pub type ErrorCallback = dyn Fn(Id, ProtocolError) + Send + Sync;

/// A scheduled one-shot timer: the task sleeping towards the deadline plus a
/// flag the task raises the instant its sleep completes.
///
/// The flag is what lets [`RequestLifecycleManager::reset_timeout`] tell a
/// stoppable timer from one that is already on its way to the lock; aborting
/// the task is idempotent and harmless in either case.
struct TimerHandle {
    task: JoinHandle<()>,
    fired: Arc<AtomicBool>,
}

impl TimerHandle {
    fn stop(&self) {
        self.task.abort();
    }

    fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Internal bookkeeping for one tracked request.
///
/// Lives in the manager's table from successful registration until the first
/// terminal event.  The tracker token rides along so the pending-callbacks
/// count stays correct no matter which path destroys the state: it is released
/// only when the state drops, and the timeout path keeps the state alive until
/// the callback has returned.
struct RequestState {
    id: Id,
    soft_timeout: Duration,
    maximum_timeout: Duration,
    soft_timer: Option<TimerHandle>,
    maximum_timer: Option<TimerHandle>,
    on_timeout: Arc<TimeoutCallback>,
    last_activity: Instant,
    _pending: TaskTrackerToken,
}

impl RequestState {
    /// Stop whatever timers are still scheduled.  Idempotent; timers that
    /// already fired or were already stopped are unaffected.
    fn stop_timers(&mut self) {
        if let Some(timer) = self.soft_timer.take() {
            timer.stop();
        }
        if let Some(timer) = self.maximum_timer.take() {
            timer.stop();
        }
    }
}

/// Tables guarded by the manager's single lock.
///
/// `used_ids` only ever grows: terminating a request removes it from
/// `requests` but its ID stays burned for the life of the session.
#[derive(Default)]
struct Tables {
    requests: HashMap<Id, RequestState>,
    used_ids: HashSet<Id>,
}

struct ManagerInner {
    tables: Mutex<Tables>,
    shutdown: CancellationToken,
    pending: TaskTracker,
    on_error: Option<Box<ErrorCallback>>,
}

/// Tracks the lifecycle of MCP protocol requests within one session.
///
/// Enforces that request IDs are never reused within the session and drives
/// the two-stage timeout for every tracked request.  Cheaply clonable; clones
/// share the same session state, so a clone can be captured by a timeout
/// callback to register follow-up requests.
///
/// Must be used from within a tokio runtime (timers are spawned tasks).
///
/// Typical usage:
///
/// ```
/// use std::time::Duration;
/// use mcp_protocol::{Id, RequestLifecycleManager};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> mcp_protocol::Result<()> {
/// let manager = RequestLifecycleManager::new();
/// manager.start_request(
///     Id::from("request-123"),
///     Duration::from_secs(5),
///     Duration::from_secs(30),
///     |id, timeout| tracing::warn!(request_id = %id, %timeout, "request timed out"),
/// )?;
///
/// // ... and when the request completes on time:
/// manager.complete_request(&Id::from("request-123"));
/// # manager.stop_all(true).await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RequestLifecycleManager {
    inner: Arc<ManagerInner>,
}

/// Builder for [`RequestLifecycleManager`].
///
/// Both knobs are optional: without a parent token the manager gets its own
/// root token, and without an error handler callback panics are logged and
/// swallowed.
#[derive(Default)]
pub struct RequestLifecycleManagerBuilder {
    parent_token: Option<CancellationToken>,
    on_error: Option<Box<ErrorCallback>>,
}

impl RequestLifecycleManagerBuilder {
    /// Tie the manager's shutdown signal to `token`: cancelling the parent
    /// cancels the manager as if [`RequestLifecycleManager::stop_all`] had
    /// signalled it (timer fires after that point are suppressed).
    pub fn parent_token(mut self, token: CancellationToken) -> Self {
        self.parent_token = Some(token);
        self
    }

    /// Install a sink that receives `(id, error)` whenever a timeout callback
    /// panics.  Without one, panics are reported through `tracing` instead.
    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Id, ProtocolError) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(handler));
        self
    }

    pub fn build(self) -> RequestLifecycleManager {
        let shutdown = match self.parent_token {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        RequestLifecycleManager {
            inner: Arc::new(ManagerInner {
                tables: Mutex::new(Tables::default()),
                shutdown,
                pending: TaskTracker::new(),
                on_error: self.on_error,
            }),
        }
    }
}

impl RequestLifecycleManager {
    /// Create a manager with a fresh shutdown token and no error sink.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> RequestLifecycleManagerBuilder {
        RequestLifecycleManagerBuilder::default()
    }

    /// Begin tracking a new request.
    ///
    /// Request IDs MUST be unique per session, and that includes IDs of
    /// requests that already terminated.  Note that a rejected registration
    /// still consumes its ID if the rejection was for the timeout parameters:
    /// by the time those are checked the ID has already been claimed.
    ///
    /// `on_timeout` is invoked at most once, with whichever deadline expires
    /// first, unless the request is completed or the manager shut down before
    /// then.  It runs outside the manager lock, so it may safely call back
    /// into the manager (including starting new requests).
    ///
    /// Returns an error if the ID is empty or already used, or if the timeout
    /// pair is invalid (`soft_timeout` and `maximum_timeout` must both be
    /// non-zero, with `soft_timeout <= maximum_timeout`).
    pub fn start_request<F>(
        &self,
        id: Id,
        soft_timeout: Duration,
        maximum_timeout: Duration,
        on_timeout: F,
    ) -> Result<()>
    where
        F: Fn(Id, TimeoutType) + Send + Sync + 'static,
    {
        if id.is_empty() {
            return Err(ProtocolError::EmptyRequestId);
        }

        let mut tables = self.inner.tables.lock().unwrap();

        if !tables.used_ids.insert(id.clone()) {
            return Err(ProtocolError::DuplicateRequestId);
        }

        if soft_timeout.is_zero() {
            return Err(ProtocolError::SoftTimeoutNotPositive);
        }
        if maximum_timeout.is_zero() {
            return Err(ProtocolError::MaximumTimeoutNotPositive);
        }
        if soft_timeout > maximum_timeout {
            return Err(ProtocolError::SoftTimeoutExceedsMaximum);
        }

        let state = RequestState {
            id: id.clone(),
            soft_timeout,
            maximum_timeout,
            soft_timer: Some(self.spawn_timer(id.clone(), soft_timeout, TimeoutType::Soft)),
            maximum_timer: Some(self.spawn_timer(id.clone(), maximum_timeout, TimeoutType::Maximum)),
            on_timeout: Arc::new(on_timeout),
            last_activity: Instant::now(),
            _pending: self.inner.pending.token(),
        };
        tables.requests.insert(id, state);
        Ok(())
    }

    /// Replace the timeout callback for an active request.
    ///
    /// Takes effect for any timer fire that has not yet captured the callback;
    /// a fire that wins the lock first still runs the old one.
    pub fn update_callback<F>(&self, id: &Id, on_timeout: F) -> Result<()>
    where
        F: Fn(Id, TimeoutType) + Send + Sync + 'static,
    {
        let mut tables = self.inner.tables.lock().unwrap();
        let state = tables
            .requests
            .get_mut(id)
            .ok_or(ProtocolError::RequestNotFound)?;
        state.on_timeout = Arc::new(on_timeout);
        state.last_activity = Instant::now();
        Ok(())
    }

    /// Stop tracking a request that completed successfully.
    ///
    /// Best-effort and idempotent: completing an unknown (or already
    /// terminated) request is not an error, because completion legitimately
    /// races the timers and exactly one of them finds the state.
    pub fn complete_request(&self, id: &Id) {
        drop(self.inner.cleanup_request(id));
    }

    /// Push the soft deadline of an active request out by its original soft
    /// timeout, typically on receipt of a progress notification.
    ///
    /// The maximum deadline is deliberately left anchored to the original
    /// registration; progress can extend the warning stage forever, but not
    /// the hard ceiling.
    ///
    /// If the soft timer has already fired (or is firing right now), this
    /// returns success without rescheduling anything and the outstanding fire
    /// proceeds normally.
    pub fn reset_timeout(&self, id: &Id) -> Result<()> {
        let mut tables = self.inner.tables.lock().unwrap();
        let state = tables
            .requests
            .get_mut(id)
            .ok_or(ProtocolError::RequestNotFound)?;

        if let Some(timer) = &state.soft_timer {
            if timer.has_fired() {
                // Too late to extend; the fire resolves through cleanup.
                return Ok(());
            }
            timer.stop();
        }

        let soft_timeout = state.soft_timeout;
        state.soft_timer = Some(self.spawn_timer(id.clone(), soft_timeout, TimeoutType::Soft));
        state.last_activity = Instant::now();
        Ok(())
    }

    /// Snapshot of the currently active request IDs.
    pub fn active_ids(&self) -> Vec<Id> {
        let tables = self.inner.tables.lock().unwrap();
        tables.requests.keys().cloned().collect()
    }

    /// Number of currently active requests.
    pub fn len(&self) -> usize {
        let tables = self.inner.tables.lock().unwrap();
        tables.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// When the request was registered or last touched (reset, callback
    /// update).  Advisory; `None` once the request has terminated.
    pub fn last_activity(&self, id: &Id) -> Option<Instant> {
        let tables = self.inner.tables.lock().unwrap();
        tables.requests.get(id).map(|state| state.last_activity)
    }

    /// The manager's shutdown signal, for integration into select loops.
    ///
    /// The returned token is cancelled once [`Self::stop_all`] begins (or the
    /// parent token, if one was configured, is cancelled).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Shut the manager down: cancel the shutdown token, stop every timer,
    /// and drop all active request state.  No callback fires for requests
    /// swept here, and timer fires that lost the race are suppressed.
    ///
    /// With `wait == true` this does not return until every timeout callback
    /// that was already dispatched has returned (normally or by panicking
    /// into the recovery barrier).  That wait is the one unbounded operation
    /// on the manager.
    ///
    /// Returns the IDs that were still active, so the caller can synthesize
    /// cancellation responses for them.  Used IDs are retained: a session
    /// never forgets which IDs it has seen.
    pub async fn stop_all(&self, wait: bool) -> Vec<Id> {
        self.inner.shutdown.cancel();

        let ids: Vec<Id> = {
            let mut tables = self.inner.tables.lock().unwrap();
            tables
                .requests
                .drain()
                .map(|(id, mut state)| {
                    state.stop_timers();
                    id
                })
                .collect()
        };

        self.inner.pending.close();
        if wait {
            self.inner.pending.wait().await;
        }

        ids
    }

    /// Schedule a one-shot timer that fires `timeout_type` for `id` after
    /// `delay`, unless stopped first.
    fn spawn_timer(&self, id: Id, delay: Duration, timeout_type: TimeoutType) -> TimerHandle {
        let fired = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn({
            let inner = Arc::clone(&self.inner);
            let fired = Arc::clone(&fired);
            async move {
                tokio::time::sleep(delay).await;
                // Past this point the timer can no longer be stopped, only
                // beaten to the state table.
                fired.store(true, Ordering::Release);
                inner.trigger_timeout(&id, timeout_type);
            }
        });
        TimerHandle { task, fired }
    }
}

impl Default for RequestLifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerInner {
    /// Timer-fire path.  Whichever terminal event takes the lock first wins:
    /// capturing the callback and removing the state happen under one lock
    /// acquisition, so a completed, shut-down, or already-fired request is a
    /// no-op here.
    fn trigger_timeout(&self, id: &Id, timeout_type: TimeoutType) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let Some(state) = self.cleanup_request(id) else {
            // Some other terminal event got there first
            return;
        };

        tracing::debug!(
            request_id = %state.id,
            timeout = %timeout_type,
            soft_timeout = ?state.soft_timeout,
            maximum_timeout = ?state.maximum_timeout,
            "request timed out"
        );

        let on_timeout = Arc::clone(&state.on_timeout);
        let result = catch_unwind(AssertUnwindSafe(|| on_timeout(state.id.clone(), timeout_type)));
        if let Err(payload) = result {
            let error = ProtocolError::CallbackPanic {
                message: crate::error::panic_message(payload),
            };
            match &self.on_error {
                Some(sink) => sink(state.id.clone(), error),
                None => {
                    tracing::error!(request_id = %state.id, err = %error, "timeout callback panicked")
                }
            }
        }

        // `state` drops here, releasing its pending-callbacks token strictly
        // after the callback returned.  That ordering is what makes
        // `stop_all(true)` a real join.
    }

    /// Remove a request from tracking and stop its timers.  Returns the
    /// removed state (whose drop releases the pending-callbacks token), or
    /// `None` if the request already terminated.  Never touches `used_ids`.
    fn cleanup_request(&self, id: &Id) -> Option<RequestState> {
        let mut tables = self.tables.lock().unwrap();
        let mut state = tables.requests.remove(id)?;
        state.stop_timers();
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn noop_callback(_: Id, _: TimeoutType) {}

    #[test]
    fn test_timeout_type_display() {
        assert_eq!(TimeoutType::Soft.to_string(), "soft");
        assert_eq!(TimeoutType::Maximum.to_string(), "maximum");
    }

    #[tokio::test]
    async fn test_new_manager_is_idle() {
        let manager = RequestLifecycleManager::new();
        assert_eq!(manager.len(), 0);
        assert!(manager.is_empty());
        assert!(manager.active_ids().is_empty());
        assert!(!manager.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_start_request_validation_order() {
        let manager = RequestLifecycleManager::new();
        let hour = Duration::from_secs(3600);

        assert_matches!(
            manager.start_request(Id::Str(String::new()), hour, hour, noop_callback),
            Err(ProtocolError::EmptyRequestId)
        );
        assert_matches!(
            manager.start_request(Id::from("soft-zero"), Duration::ZERO, hour, noop_callback),
            Err(ProtocolError::SoftTimeoutNotPositive)
        );
        assert_matches!(
            manager.start_request(Id::from("max-zero"), hour, Duration::ZERO, noop_callback),
            Err(ProtocolError::MaximumTimeoutNotPositive)
        );
        assert_matches!(
            manager.start_request(Id::from("soft-exceeds"), hour * 2, hour, noop_callback),
            Err(ProtocolError::SoftTimeoutExceedsMaximum)
        );
        // Equal soft and maximum timeouts are allowed
        assert!(manager
            .start_request(Id::from("equal"), hour, hour, noop_callback)
            .is_ok());
    }

    #[tokio::test]
    async fn test_rejected_timeouts_still_burn_the_id() {
        let manager = RequestLifecycleManager::new();
        let hour = Duration::from_secs(3600);

        // The ID is claimed before the timeouts are validated...
        assert_matches!(
            manager.start_request(Id::from("burned"), Duration::ZERO, hour, noop_callback),
            Err(ProtocolError::SoftTimeoutNotPositive)
        );
        // ...so retrying with valid timeouts finds it already used
        assert_matches!(
            manager.start_request(Id::from("burned"), hour, hour, noop_callback),
            Err(ProtocolError::DuplicateRequestId)
        );
        // An ID that failed the emptiness check, by contrast, was never claimed
        assert_matches!(
            manager.start_request(Id::Number(0), hour, hour, noop_callback),
            Err(ProtocolError::EmptyRequestId)
        );
        // None of those registrations ever became an active request
        assert_eq!(manager.len(), 0);
    }

    #[tokio::test]
    async fn test_update_and_reset_unknown_request() {
        let manager = RequestLifecycleManager::new();
        assert_matches!(
            manager.update_callback(&Id::from("nope"), noop_callback),
            Err(ProtocolError::RequestNotFound)
        );
        assert_matches!(
            manager.reset_timeout(&Id::from("nope")),
            Err(ProtocolError::RequestNotFound)
        );
        // Completion of an unknown request is deliberately not an error
        manager.complete_request(&Id::from("nope"));
    }

    #[tokio::test]
    async fn test_cleanup_request_is_terminal() {
        let manager = RequestLifecycleManager::new();
        let hour = Duration::from_secs(3600);
        let id = Id::from("cleanup");
        manager.start_request(id.clone(), hour, hour, noop_callback).unwrap();

        assert!(manager.inner.cleanup_request(&id).is_some());
        assert!(manager.inner.cleanup_request(&id).is_none());
        assert_eq!(manager.len(), 0);

        // The ID stays burned even though the request is gone
        assert_matches!(
            manager.start_request(id, hour, hour, noop_callback),
            Err(ProtocolError::DuplicateRequestId)
        );
    }

    #[tokio::test]
    async fn test_trigger_invokes_the_current_callback() {
        let manager = RequestLifecycleManager::new();
        let hour = Duration::from_secs(3600);
        let id = Id::from("trigger");

        let observed: Arc<Mutex<Vec<TimeoutType>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&observed);
        manager
            .start_request(id.clone(), hour, hour, move |_, timeout| {
                sink.lock().unwrap().push(timeout);
            })
            .unwrap();

        manager.inner.trigger_timeout(&id, TimeoutType::Maximum);
        assert_eq!(*observed.lock().unwrap(), vec![TimeoutType::Maximum]);
        assert_eq!(manager.len(), 0);

        // A second fire for the same request finds nothing to do
        manager.inner.trigger_timeout(&id, TimeoutType::Soft);
        assert_eq!(observed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_trigger_panic_reaches_the_sink() {
        let caught: Arc<Mutex<Option<(Id, ProtocolError)>>> = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&caught);
        let manager = RequestLifecycleManager::builder()
            .error_handler(move |id, err| {
                *sink.lock().unwrap() = Some((id, err));
            })
            .build();

        let hour = Duration::from_secs(3600);
        let id = Id::from("panic-sink");
        manager
            .start_request(id.clone(), hour, hour, |_, _| panic!("panic-test"))
            .unwrap();

        manager.inner.trigger_timeout(&id, TimeoutType::Soft);

        let caught = caught.lock().unwrap().take().expect("sink should have been called");
        assert_eq!(caught.0, id);
        assert_matches!(
            caught.1,
            ProtocolError::CallbackPanic { message } if message.contains("panic-test")
        );
        assert_eq!(manager.len(), 0);
    }

    #[tokio::test]
    async fn test_trigger_panic_without_sink_does_not_crash() {
        let manager = RequestLifecycleManager::new();
        let hour = Duration::from_secs(3600);
        let id = Id::from("panic-log");
        manager
            .start_request(id.clone(), hour, hour, |_, _| panic!("expected panic log"))
            .unwrap();

        // Contained by the recovery barrier; the request is still cleaned up
        manager.inner.trigger_timeout(&id, TimeoutType::Soft);
        assert_eq!(manager.len(), 0);
    }

    #[tokio::test]
    async fn test_trigger_after_shutdown_is_suppressed() {
        let manager = RequestLifecycleManager::new();
        let hour = Duration::from_secs(3600);
        let id = Id::from("late-fire");

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        manager
            .start_request(id.clone(), hour, hour, move |_, _| {
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();

        manager.stop_all(false).await;

        manager.inner.trigger_timeout(&id, TimeoutType::Soft);
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stop_all_returns_active_ids_and_cancels() {
        let manager = RequestLifecycleManager::new();
        let hour = Duration::from_secs(3600);
        for name in ["stop-1", "stop-2", "stop-3"] {
            manager
                .start_request(Id::from(name), hour, hour * 2, noop_callback)
                .unwrap();
        }
        assert_eq!(manager.len(), 3);

        let mut ids = manager.stop_all(true).await;
        ids.sort();
        assert_eq!(
            ids,
            vec![Id::from("stop-1"), Id::from("stop-2"), Id::from("stop-3")]
        );
        assert_eq!(manager.len(), 0);
        assert!(manager.cancellation_token().is_cancelled());

        // Used IDs survive shutdown
        assert_matches!(
            manager.start_request(Id::from("stop-1"), hour, hour, noop_callback),
            Err(ProtocolError::DuplicateRequestId)
        );
    }

    #[tokio::test]
    async fn test_stop_all_with_no_requests() {
        let manager = RequestLifecycleManager::new();
        let ids = manager.stop_all(true).await;
        assert!(ids.is_empty());
        assert!(manager.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_parent_token_propagates() {
        let parent = CancellationToken::new();
        let manager = RequestLifecycleManager::builder()
            .parent_token(parent.clone())
            .build();
        assert!(!manager.cancellation_token().is_cancelled());

        parent.cancel();
        assert!(manager.cancellation_token().is_cancelled());
    }
}
