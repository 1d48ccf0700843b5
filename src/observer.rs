//! Observer lists with per-observer isolation.
//!
//! A failing or panicking observer is logged and skipped; the remaining
//! observers still run and the caller never sees the failure.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::warn;

/// Receives events of type `T`.
pub trait Observer<T>: Send + Sync {
    fn notify(&self, event: &T) -> anyhow::Result<()>;
}

impl<T, F> Observer<T> for F
where
    F: Fn(&T) -> anyhow::Result<()> + Send + Sync,
{
    fn notify(&self, event: &T) -> anyhow::Result<()> {
        self(event)
    }
}

/// Ordered list of observers.
pub struct ObserverList<T> {
    name: &'static str,
    observers: RwLock<Vec<Arc<dyn Observer<T>>>>,
}

impl<T> ObserverList<T> {
    /// Creates an empty list; `name` labels failures in the logs.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, observer: Arc<dyn Observer<T>>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Notifies every observer in registration order. Returns the number of
    /// observers that failed.
    pub fn notify(&self, event: &T) -> usize {
        // Snapshot so observers may register further observers without deadlocking.
        let observers: Vec<Arc<dyn Observer<T>>> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut failures = 0;
        for (index, observer) in observers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| observer.notify(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(observers = self.name, index, error = %e, "Observer failed");
                }
                Err(_) => {
                    failures += 1;
                    warn!(observers = self.name, index, "Observer panicked");
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_failing_observers_do_not_stop_others() {
        let list: ObserverList<u32> = ObserverList::new("test");
        let seen = Arc::new(AtomicUsize::new(0));

        list.register(Arc::new(|_: &u32| -> anyhow::Result<()> {
            anyhow::bail!("broken observer")
        }));
        list.register(Arc::new(|_: &u32| -> anyhow::Result<()> { panic!("boom") }));
        let counter = Arc::clone(&seen);
        list.register(Arc::new(move |value: &u32| -> anyhow::Result<()> {
            counter.fetch_add(*value as usize, Ordering::SeqCst);
            Ok(())
        }));

        assert_eq!(list.len(), 3);
        assert_eq!(list.notify(&7), 2);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_empty_list() {
        let list: ObserverList<String> = ObserverList::new("empty");
        assert!(list.is_empty());
        assert_eq!(list.notify(&"x".to_string()), 0);
    }
}
