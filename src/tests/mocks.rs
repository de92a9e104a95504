#[cfg(test)]
pub mod mocks {
    use crate::resilience::{CircuitBreaker, CircuitBreakerListener, CircuitBreakerState};
    use anyhow::{bail, Result};
    use std::error::Error;
    use std::sync::{Arc, Mutex};
    use thiserror::Error;

    /// Infrastructure failure, counted by breakers
    #[derive(Debug, Error, PartialEq, Eq)]
    #[error("backend unavailable")]
    pub struct BackendDown;

    /// Business failure, usually excluded
    #[derive(Debug, Error, PartialEq, Eq)]
    #[error("record not found")]
    pub struct NotFound;

    /// Service error wrapping both kinds
    #[derive(Debug, Error)]
    pub enum ServiceError {
        #[error(transparent)]
        Backend(#[from] BackendDown),
        #[error("lookup failed")]
        Lookup(#[source] NotFound),
    }

    /// Everything a listener can observe
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Event {
        BeforeCall,
        Success,
        Failure(String),
        StateChange(CircuitBreakerState, CircuitBreakerState),
    }

    /// RecordingListener keeps every notification it receives
    #[derive(Default)]
    pub struct RecordingListener {
        events: Mutex<Vec<Event>>,
        refuse_state_changes: bool,
    }

    impl RecordingListener {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// A listener that records, then rejects, every state change
        pub fn refusing() -> Arc<Self> {
            Arc::new(Self {
                refuse_state_changes: true,
                ..Self::default()
            })
        }

        pub fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        pub fn transitions(&self) -> Vec<(CircuitBreakerState, CircuitBreakerState)> {
            self.events()
                .into_iter()
                .filter_map(|event| match event {
                    Event::StateChange(from, to) => Some((from, to)),
                    _ => None,
                })
                .collect()
        }

        pub fn clear(&self) {
            self.events.lock().unwrap().clear();
        }

        fn push(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl CircuitBreakerListener for RecordingListener {
        fn before_call(&self, _breaker: &CircuitBreaker) -> Result<()> {
            self.push(Event::BeforeCall);
            Ok(())
        }

        fn on_success(&self, _breaker: &CircuitBreaker) -> Result<()> {
            self.push(Event::Success);
            Ok(())
        }

        fn on_failure(&self, _breaker: &CircuitBreaker, error: &(dyn Error + 'static)) -> Result<()> {
            self.push(Event::Failure(error.to_string()));
            Ok(())
        }

        fn state_change(
            &self,
            _breaker: &CircuitBreaker,
            previous: CircuitBreakerState,
            new: CircuitBreakerState,
        ) -> Result<()> {
            self.push(Event::StateChange(previous, new));
            if self.refuse_state_changes {
                bail!("listener refused {} -> {}", previous, new);
            }
            Ok(())
        }
    }

    /// Listener appending its label to a shared log, to check ordering
    pub struct LabelListener {
        pub label: &'static str,
        pub log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl CircuitBreakerListener for LabelListener {
        fn state_change(
            &self,
            _breaker: &CircuitBreaker,
            _previous: CircuitBreakerState,
            _new: CircuitBreakerState,
        ) -> Result<()> {
            self.log.lock().unwrap().push(self.label);
            Ok(())
        }
    }
}
