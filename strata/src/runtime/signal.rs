//! Single-fulfillment completion signal.

use std::sync::Arc;
use tokio::sync::watch;

/// A write-once value observable by any number of waiters.
///
/// The construction cache uses one signal per graph node: the first
/// requester fulfills it with the build result, every concurrent or later
/// requester awaits it. Only the first [`Signal::complete`] wins;
/// subsequent completions are ignored.
pub struct Signal<T> {
    tx: Arc<watch::Sender<Option<T>>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone> Signal<T> {
    /// Creates an unfulfilled signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Fulfills the signal. Returns `false` if it was already fulfilled.
    pub fn complete(&self, value: T) -> bool {
        let mut value = Some(value);
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = value.take();
                true
            } else {
                false
            }
        })
    }

    /// True once the signal has been fulfilled.
    pub fn is_complete(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Waits until the signal is fulfilled and returns the value.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while
        // a waiter holds this signal.
        let slot = rx
            .wait_for(|slot| slot.is_some())
            .await
            .expect("signal sender dropped while waiting");
        slot.clone().expect("slot fulfilled by wait_for predicate")
    }
}

impl<T: Clone> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_complete_then_wait() {
        let signal = Signal::new();
        assert!(signal.complete(5));
        assert_eq!(signal.wait().await, 5);
    }

    #[tokio::test]
    async fn test_first_completion_wins() {
        let signal = Signal::new();
        assert!(signal.complete("first"));
        assert!(!signal.complete("second"));
        assert_eq!(signal.wait().await, "first");
    }

    #[tokio::test]
    async fn test_many_waiters_observe_one_value() {
        let signal = Signal::new();

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let signal = signal.clone();
                tokio::spawn(async move { signal.wait().await })
            })
            .collect();

        // Give the waiters a moment to park before fulfilling.
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.complete(99u32);

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), 99);
        }
    }

    #[tokio::test]
    async fn test_is_complete() {
        let signal = Signal::new();
        assert!(!signal.is_complete());
        signal.complete(());
        assert!(signal.is_complete());
    }
}
