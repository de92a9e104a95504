//! Circuit Breaker controller
//!
//! The controller owns the breaker configuration, serializes protected calls
//! and keeps a cached [`State`] in sync with the authoritative record held by
//! a [`BreakerStorage`].
//!
//! # Locking
//! - The call lock is held for the whole dispatch of a protected call,
//!   including the protected function itself, so calls through one breaker
//!   never overlap. It is released on every exit path, including a dropped
//!   `call_async` future.
//! - The call lock is reentrant: the thread (for `call`) or task (for
//!   `call_async`) holding it may call through the same breaker again, and
//!   the nested call is dispatched without acquiring it a second time.
//! - Configuration and the cached state sit behind a separate bookkeeping
//!   lock that is never held while user code (protected functions,
//!   listeners, exclusion predicates) runs. Manual transitions only take
//!   this lock, so a protected function may trip its own breaker.

use anyhow::{ensure, Context, Result};
use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use std::cell::RefCell;
use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::error::{BreakerError, StateError};
use super::exclusion::Exclusion;
use super::listener::CircuitBreakerListener;
use super::state::{Admission, CircuitBreakerState, ClosedState, State};
use super::storage::{BreakerStorage, InMemoryCircuitBreakerStorage};
use crate::config::BreakerConfig;
use crate::logging;

thread_local! {
    /// Breakers whose call lock is held by a blocking call on this thread
    static THREAD_HELD: RefCell<Vec<Uuid>> = const { RefCell::new(Vec::new()) };
}

tokio::task_local! {
    /// Breakers whose call lock is held by the current task
    static TASK_HELD: Vec<Uuid>;
}

/// Registers a breaker's call lock as held by the current thread until dropped
struct ThreadHold {
    id: Uuid,
}

impl ThreadHold {
    fn enter(id: Uuid) -> Self {
        THREAD_HELD.with(|held| held.borrow_mut().push(id));
        Self { id }
    }
}

impl Drop for ThreadHold {
    fn drop(&mut self) {
        let _ = THREAD_HELD.try_with(|held| {
            let mut held = held.borrow_mut();
            if let Some(index) = held.iter().rposition(|id| *id == self.id) {
                held.remove(index);
            }
        });
    }
}

/// Mutable breaker bookkeeping
struct Core {
    fail_max: u32,
    timeout: Duration,
    name: Option<String>,
    exclusions: Vec<Exclusion>,
    listeners: Vec<Arc<dyn CircuitBreakerListener>>,
    /// Cached view of the state held by storage
    state: State,
}

struct Inner {
    id: Uuid,
    storage: Arc<dyn BreakerStorage>,
    call_lock: tokio::sync::Mutex<()>,
    core: Mutex<Core>,
}

/// Circuit breaker implementation
///
/// Cloning is cheap; clones share configuration, state and locks.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

/// Builder for [`CircuitBreaker`]
pub struct CircuitBreakerBuilder {
    config: BreakerConfig,
    exclusions: Vec<Exclusion>,
    listeners: Vec<Arc<dyn CircuitBreakerListener>>,
    storage: Option<Arc<dyn BreakerStorage>>,
}

impl CircuitBreakerBuilder {
    /// Replace the whole configuration
    pub fn config(mut self, config: BreakerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn fail_max(mut self, fail_max: u32) -> Self {
        self.config.fail_max = fail_max;
        self
    }

    pub fn timeout_duration(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_timeout(timeout);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    /// Exclude errors of type `T` from accounting
    pub fn exclude<T: Error + 'static>(self) -> Self {
        self.exclusion(Exclusion::of::<T>())
    }

    pub fn exclusion(mut self, exclusion: Exclusion) -> Self {
        self.exclusions.push(exclusion);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn CircuitBreakerListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Use `storage` instead of a private in-memory store
    pub fn storage(mut self, storage: Arc<dyn BreakerStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Validate the configuration and load the initial state from storage
    pub fn build(self) -> Result<CircuitBreaker> {
        self.config.validate()?;
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(InMemoryCircuitBreakerStorage::new()));
        let state = State::load(storage.as_ref())
            .context("failed to load circuit breaker state from storage")?;

        Ok(CircuitBreaker::assemble(
            self.config,
            self.exclusions,
            self.listeners,
            storage,
            state,
        ))
    }
}

impl CircuitBreaker {
    /// Create a closed circuit breaker with default settings and in-memory storage
    pub fn new() -> Self {
        Self::assemble(
            BreakerConfig::default(),
            Vec::new(),
            Vec::new(),
            Arc::new(InMemoryCircuitBreakerStorage::new()),
            State::Closed(ClosedState),
        )
    }

    pub fn builder() -> CircuitBreakerBuilder {
        CircuitBreakerBuilder {
            config: BreakerConfig::default(),
            exclusions: Vec::new(),
            listeners: Vec::new(),
            storage: None,
        }
    }

    /// Create a circuit breaker from a configuration, with in-memory storage
    pub fn from_config(config: BreakerConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    fn assemble(
        config: BreakerConfig,
        exclusions: Vec<Exclusion>,
        listeners: Vec<Arc<dyn CircuitBreakerListener>>,
        storage: Arc<dyn BreakerStorage>,
        state: State,
    ) -> Self {
        let timeout = config.timeout();
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                storage,
                call_lock: tokio::sync::Mutex::new(()),
                core: Mutex::new(Core {
                    fail_max: config.fail_max,
                    timeout,
                    name: config.name,
                    exclusions,
                    listeners,
                    state,
                }),
            }),
        }
    }

    /// Call `f` according to the rules of the current state.
    ///
    /// Blocks while another thread or task calls through this breaker. A
    /// call made from inside `f` on the same breaker is dispatched
    /// immediately. Outside of such a nested call, must not be used from
    /// inside an async runtime; use [`call_async`](Self::call_async) there.
    pub fn call<F, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: Error + 'static,
    {
        if self.holds_call_lock() {
            return self.dispatch(f);
        }

        let _guard = self.inner.call_lock.blocking_lock();
        let _hold = ThreadHold::enter(self.inner.id);
        self.dispatch(f)
    }

    /// Await `f` according to the rules of the current state.
    ///
    /// Dropping the returned future before `f` completes releases the call
    /// lock and leaves counter and state untouched.
    pub async fn call_async<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        if self.holds_call_lock() {
            return self.dispatch_async(f).await;
        }

        let _guard = self.inner.call_lock.lock().await;
        let mut held = TASK_HELD.try_with(Vec::clone).unwrap_or_default();
        held.push(self.inner.id);
        TASK_HELD.scope(held, self.dispatch_async(f)).await
    }

    fn dispatch<F, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: Error + 'static,
    {
        self.prepare::<E>()?;
        let result = f();
        self.settle(result)
    }

    async fn dispatch_async<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        self.prepare::<E>()?;
        let result = f().await;
        self.settle(result)
    }

    /// Whether the current thread or task already holds the call lock
    fn holds_call_lock(&self) -> bool {
        let id = self.inner.id;
        THREAD_HELD
            .try_with(|held| held.borrow().contains(&id))
            .unwrap_or(false)
            || TASK_HELD.try_with(|held| held.contains(&id)).unwrap_or(false)
    }

    /// Decide whether the pending call may run
    fn prepare<E>(&self) -> Result<(), BreakerError<E>> {
        let state = self.sync_state()?;
        let timeout = self.core().timeout;

        match state.admit(timeout, Utc::now()) {
            Admission::Proceed => {}
            Admission::Trial => {
                self.enter(CircuitBreakerState::HalfOpen)?;
            }
            Admission::Reject { remaining, reopens_at } => {
                logging::log_rejected(&self.label(), remaining);
                return Err(BreakerError::Open {
                    name: self.name(),
                    remaining,
                    reopens_at,
                });
            }
        };

        self.notify(|listener| listener.before_call(self))?;
        Ok(())
    }

    /// Account for the outcome of a dispatched call.
    ///
    /// The outcome is recorded against the state storage holds once `f`
    /// returned, which may differ from the state it was dispatched under.
    fn settle<T, E>(&self, result: Result<T, E>) -> Result<T, BreakerError<E>>
    where
        E: Error + 'static,
    {
        if let Err(err) = &result {
            if !self.is_system_error(err) {
                logging::log_excluded_failure(&self.label(), err);
                return result.map_err(BreakerError::Inner);
            }
        }

        let state = self.sync_state()?;
        match result {
            Ok(value) => {
                let target = self.checked("reset counter", state.record_success(self.storage()))?;
                if let Some(target) = target {
                    self.enter(target)?;
                }
                self.notify(|listener| listener.on_success(self))?;
                Ok(value)
            }
            Err(err) => {
                logging::log_counted_failure(&self.label(), &err);
                let fail_max = self.core().fail_max;
                let target = self.checked(
                    "count failure",
                    state.record_failure(self.storage(), fail_max),
                )?;
                self.notify(|listener| listener.on_failure(self, &err))?;
                if let Some(target) = target {
                    self.enter(target)?;
                }
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Open the circuit; following calls fail until the timeout elapses
    pub fn open(&self) -> Result<(), StateError> {
        self.enter(CircuitBreakerState::Open).map(drop)
    }

    /// Half-open the circuit; the next call decides between open and closed
    pub fn half_open(&self) -> Result<(), StateError> {
        self.enter(CircuitBreakerState::HalfOpen).map(drop)
    }

    /// Close the circuit and reset the failure counter
    pub fn close(&self) -> Result<(), StateError> {
        self.enter(CircuitBreakerState::Closed).map(drop)
    }

    /// Current state tag, as held by storage
    pub fn current_state(&self) -> Result<CircuitBreakerState, StateError> {
        self.sync_state().map(|state| state.tag())
    }

    /// Current state value, synchronized with storage
    pub fn state(&self) -> Result<State, StateError> {
        self.sync_state()
    }

    /// Number of consecutive counted failures
    pub fn fail_counter(&self) -> Result<u32, StateError> {
        self.checked("read counter", self.storage().counter())
    }

    pub fn fail_max(&self) -> u32 {
        self.core().fail_max
    }

    /// Set the number of consecutive failures that opens the circuit
    pub fn set_fail_max(&self, fail_max: u32) -> Result<()> {
        ensure!(fail_max >= 1, "fail_max must be at least 1, got {}", fail_max);
        self.core().fail_max = fail_max;
        Ok(())
    }

    /// How long the circuit stays open before a trial call is permitted
    pub fn timeout_duration(&self) -> Duration {
        self.core().timeout
    }

    pub fn set_timeout_duration(&self, timeout: Duration) {
        self.core().timeout = timeout;
    }

    pub fn name(&self) -> Option<String> {
        self.core().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.core().name = Some(name.into());
    }

    pub fn clear_name(&self) {
        self.core().name = None;
    }

    /// Identifier unique to this breaker and its clones
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Whether `other` is a handle to the same breaker
    pub fn same_as(&self, other: &CircuitBreaker) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Exclusion rules, in registration order
    pub fn excluded(&self) -> Vec<Exclusion> {
        self.core().exclusions.clone()
    }

    pub fn add_exclusion(&self, exclusion: Exclusion) {
        self.core().exclusions.push(exclusion);
    }

    pub fn add_exclusions(&self, exclusions: impl IntoIterator<Item = Exclusion>) {
        self.core().exclusions.extend(exclusions);
    }

    /// Exclude errors of type `T` from accounting
    pub fn add_excluded<T: Error + 'static>(&self) {
        self.add_exclusion(Exclusion::of::<T>());
    }

    /// Remove the first rule equal to `exclusion`; returns whether one was found
    pub fn remove_exclusion(&self, exclusion: &Exclusion) -> bool {
        let mut core = self.core();
        match core.exclusions.iter().position(|rule| rule == exclusion) {
            Some(index) => {
                core.exclusions.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn remove_excluded<T: Error + 'static>(&self) -> bool {
        self.remove_exclusion(&Exclusion::of::<T>())
    }

    /// Whether `error` counts as a failure of the protected system.
    ///
    /// Errors matching an exclusion rule are business errors and do not
    /// count.
    pub fn is_system_error(&self, error: &(dyn Error + 'static)) -> bool {
        let exclusions = self.excluded();
        !exclusions.iter().any(|rule| rule.matches(error))
    }

    /// Registered listeners, in notification order
    pub fn listeners(&self) -> Vec<Arc<dyn CircuitBreakerListener>> {
        self.core().listeners.clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn CircuitBreakerListener>) {
        self.core().listeners.push(listener);
    }

    pub fn add_listeners(&self, listeners: impl IntoIterator<Item = Arc<dyn CircuitBreakerListener>>) {
        self.core().listeners.extend(listeners);
    }

    /// Unregister `listener`, matched by pointer; returns whether it was registered
    pub fn remove_listener<L>(&self, listener: &Arc<L>) -> bool
    where
        L: CircuitBreakerListener + ?Sized,
    {
        let target = Arc::as_ptr(listener).cast::<()>();
        let mut core = self.core();
        match core
            .listeners
            .iter()
            .position(|registered| Arc::as_ptr(registered).cast::<()>() == target)
        {
            Some(index) => {
                core.listeners.remove(index);
                true
            }
            None => false,
        }
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        self.inner.core.lock()
    }

    fn storage(&self) -> &dyn BreakerStorage {
        self.inner.storage.as_ref()
    }

    /// Name for logs: the configured name, or the instance id
    fn label(&self) -> String {
        self.name().unwrap_or_else(|| self.inner.id.to_string())
    }

    fn checked<T>(&self, operation: &str, result: Result<T>) -> Result<T, StateError> {
        result.map_err(|err| {
            logging::log_storage_failure(&self.label(), operation, &err);
            StateError::Storage(err)
        })
    }

    /// Bring the cached state in line with storage.
    ///
    /// A tag written by someone else is adopted and announced to listeners
    /// like any other transition.
    fn sync_state(&self) -> Result<State, StateError> {
        let stored = self.checked("read state", self.storage().state())?;
        let cached = self.core().state;

        if cached.tag() == stored {
            return match cached {
                State::Open(open) => self.refresh_opened_at(open.opened_at()),
                other => Ok(other),
            };
        }

        let mut adopted = self.checked("load state", State::load(self.storage()))?;
        if adopted.tag() == CircuitBreakerState::Closed {
            self.checked("reset counter", self.storage().reset_counter())?;
        }

        let previous = {
            let mut core = self.core();
            // Another caller may have adopted it in the meantime.
            if core.state.tag() == adopted.tag() {
                adopted = core.state;
                None
            } else {
                Some(std::mem::replace(&mut core.state, adopted).tag())
            }
        };

        if let Some(previous) = previous {
            logging::log_transition(&self.label(), previous, adopted.tag(), true);
            self.notify_state_change(previous, adopted.tag())?;
        }
        Ok(adopted)
    }

    /// Pick up a reopening recorded by another instance sharing the storage
    fn refresh_opened_at(&self, cached: chrono::DateTime<Utc>) -> Result<State, StateError> {
        let stored = self.checked("read opened-at", self.storage().opened_at())?;
        let mut core = self.core();
        if let (Some(at), State::Open(_)) = (stored, core.state) {
            if at != cached {
                core.state = State::Open(super::state::OpenState::new(at));
            }
        }
        Ok(core.state)
    }

    /// Move to `target`, writing through to storage and notifying listeners
    fn enter(&self, target: CircuitBreakerState) -> Result<State, StateError> {
        let next = self.checked(
            "write state",
            State::enter(target, self.storage(), Utc::now()),
        )?;
        let previous = std::mem::replace(&mut self.core().state, next).tag();

        logging::log_transition(&self.label(), previous, target, false);
        self.notify_state_change(previous, target)?;
        Ok(next)
    }

    fn notify_state_change(
        &self,
        previous: CircuitBreakerState,
        new: CircuitBreakerState,
    ) -> Result<(), StateError> {
        self.notify(|listener| listener.state_change(self, previous, new))
    }

    /// Run `hook` on each listener in order, stopping at the first error
    fn notify<H>(&self, mut hook: H) -> Result<(), StateError>
    where
        H: FnMut(&dyn CircuitBreakerListener) -> Result<()>,
    {
        for listener in self.listeners() {
            if let Err(err) = hook(listener.as_ref()) {
                logging::log_listener_failure(&self.label(), &err);
                return Err(StateError::Listener(err));
            }
        }
        Ok(())
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core();
        f.debug_struct("CircuitBreaker")
            .field("id", &self.inner.id)
            .field("name", &core.name)
            .field("fail_max", &core.fail_max)
            .field("timeout", &core.timeout)
            .field("state", &core.state.tag())
            .finish()
    }
}
