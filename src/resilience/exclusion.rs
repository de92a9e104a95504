//! Errors excluded from breaker accounting.
//!
//! Business errors (a missing record, a rejected input) say nothing about the
//! health of the protected system. Excluding them lets those errors pass
//! through a breaker without counting towards its threshold.

use std::any::TypeId;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

type Matcher = Arc<dyn Fn(&(dyn Error + 'static)) -> bool + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Key {
    Type { id: TypeId, name: &'static str },
    Named(String),
}

/// A rule marking errors that a breaker must ignore
#[derive(Clone)]
pub struct Exclusion {
    key: Key,
    matcher: Matcher,
}

impl Exclusion {
    /// Exclude errors of type `T`.
    ///
    /// Matches when the error itself, or any error in its `source()` chain,
    /// is a `T`. Wrapping an excluded error therefore keeps it excluded.
    pub fn of<T: Error + 'static>() -> Self {
        Self {
            key: Key::Type {
                id: TypeId::of::<T>(),
                name: std::any::type_name::<T>(),
            },
            matcher: Arc::new(|error: &(dyn Error + 'static)| {
                let mut cause = Some(error);
                while let Some(current) = cause {
                    if current.is::<T>() {
                        return true;
                    }
                    cause = current.source();
                }
                false
            }),
        }
    }

    /// Exclude errors for which `predicate` returns true.
    ///
    /// `name` identifies the rule for [`CircuitBreaker::remove_exclusion`].
    ///
    /// [`CircuitBreaker::remove_exclusion`]: super::CircuitBreaker::remove_exclusion
    pub fn predicate<P>(name: impl Into<String>, predicate: P) -> Self
    where
        P: Fn(&(dyn Error + 'static)) -> bool + Send + Sync + 'static,
    {
        Self {
            key: Key::Named(name.into()),
            matcher: Arc::new(predicate),
        }
    }

    pub fn name(&self) -> &str {
        match &self.key {
            Key::Type { name, .. } => name,
            Key::Named(name) => name,
        }
    }

    /// Whether `error` is covered by this rule
    pub fn matches(&self, error: &(dyn Error + 'static)) -> bool {
        (self.matcher)(error)
    }
}

impl PartialEq for Exclusion {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Exclusion {}

impl fmt::Debug for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Exclusion").field(&self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("record not found")]
    struct NotFound;

    #[derive(Debug, Error)]
    #[error("lookup failed")]
    struct LookupFailed {
        #[source]
        source: NotFound,
    }

    #[derive(Debug, Error)]
    #[error("request failed")]
    struct RequestFailed {
        #[source]
        source: LookupFailed,
    }

    #[derive(Debug, Error)]
    #[error("timed out after {0} ms")]
    struct TimedOut(u64);

    #[test]
    fn type_exclusion_matches_exact_type() {
        let exclusion = Exclusion::of::<NotFound>();
        assert!(exclusion.matches(&NotFound));
        assert!(!exclusion.matches(&TimedOut(10)));
    }

    #[test]
    fn type_exclusion_matches_wrapped_cause() {
        let exclusion = Exclusion::of::<NotFound>();
        assert!(exclusion.matches(&LookupFailed { source: NotFound }));
        assert!(!Exclusion::of::<TimedOut>().matches(&LookupFailed { source: NotFound }));
    }

    #[test]
    fn type_exclusion_walks_whole_chain() {
        let error = RequestFailed {
            source: LookupFailed { source: NotFound },
        };
        assert!(Exclusion::of::<NotFound>().matches(&error));
        assert!(Exclusion::of::<LookupFailed>().matches(&error));
        assert!(!Exclusion::of::<TimedOut>().matches(&error));
    }

    #[test]
    fn predicate_exclusion() {
        let exclusion = Exclusion::predicate("short timeouts", |error| {
            error
                .downcast_ref::<TimedOut>()
                .is_some_and(|timed_out| timed_out.0 < 100)
        });
        assert!(exclusion.matches(&TimedOut(50)));
        assert!(!exclusion.matches(&TimedOut(500)));
        assert_eq!(exclusion.name(), "short timeouts");
    }

    #[test]
    fn equality_follows_identity() {
        assert_eq!(Exclusion::of::<NotFound>(), Exclusion::of::<NotFound>());
        assert_ne!(Exclusion::of::<NotFound>(), Exclusion::of::<TimedOut>());
        assert_eq!(
            Exclusion::predicate("a", |_| true),
            Exclusion::predicate("a", |_| false)
        );
        assert!(Exclusion::of::<NotFound>().name().ends_with("NotFound"));
    }
}
