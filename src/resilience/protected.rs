//! Functions bound to a circuit breaker.

use std::error::Error;
use std::future::Future;

use super::circuit_breaker::CircuitBreaker;
use super::error::BreakerError;

/// A function whose calls always go through a circuit breaker
///
/// Each invocation is accounted exactly once, whether it is made through
/// [`Protected::call`] or handed to [`CircuitBreaker::call_protected`].
pub struct Protected<F> {
    breaker: CircuitBreaker,
    func: F,
}

impl<F> Protected<F> {
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Unwrap the bare function
    pub fn into_inner(self) -> F {
        self.func
    }

    pub fn call<T, E>(&self) -> Result<T, BreakerError<E>>
    where
        F: Fn() -> Result<T, E>,
        E: Error + 'static,
    {
        self.breaker.call(&self.func)
    }

    pub fn call_with<A, T, E>(&self, arg: A) -> Result<T, BreakerError<E>>
    where
        F: Fn(A) -> Result<T, E>,
        E: Error + 'static,
    {
        self.breaker.call(|| (self.func)(arg))
    }

    pub async fn call_async<Fut, T, E>(&self) -> Result<T, BreakerError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        self.breaker.call_async(&self.func).await
    }

    pub async fn call_with_async<A, Fut, T, E>(&self, arg: A) -> Result<T, BreakerError<E>>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        self.breaker.call_async(|| (self.func)(arg)).await
    }
}

impl<F> std::fmt::Debug for Protected<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protected")
            .field("breaker", &self.breaker)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Bind `func` to this breaker
    pub fn protect<F>(&self, func: F) -> Protected<F> {
        Protected {
            breaker: self.clone(),
            func,
        }
    }

    /// Run an already protected function.
    ///
    /// The function's own breaker does the accounting; this breaker does not
    /// count the invocation a second time.
    pub fn call_protected<F, T, E>(&self, protected: &Protected<F>) -> Result<T, BreakerError<E>>
    where
        F: Fn() -> Result<T, E>,
        E: Error + 'static,
    {
        protected.call()
    }

    /// Await an already protected function, without a second round of accounting
    pub async fn call_protected_async<F, Fut, T, E>(
        &self,
        protected: &Protected<F>,
    ) -> Result<T, BreakerError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        protected.call_async().await
    }
}
