//! Externally settled futures
//!
//! A [`Deferred`] is settled from callback-driven code (transport events) and
//! awaited by call sites. Only the first `resolve`/`reject` takes effect.
//! Any number of waiters may await the same deferred; each gets a clone of
//! the settled value.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// Observable state of a deferred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredState {
    Pending,
    Resolved,
    Rejected,
}

#[derive(Debug, Clone)]
enum Settlement<T, E> {
    Pending,
    Resolved(T),
    Rejected(E),
}

/// Manually resolvable/rejectable future
#[derive(Debug)]
pub struct Deferred<T, E> {
    tx: Arc<watch::Sender<Settlement<T, E>>>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Settlement::Pending);
        Self { tx: Arc::new(tx) }
    }

    /// Resolve the deferred. Returns false if it was already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Settlement::Resolved(value))
    }

    /// Reject the deferred. Returns false if it was already settled.
    pub fn reject(&self, error: E) -> bool {
        self.settle(Settlement::Rejected(error))
    }

    fn settle(&self, outcome: Settlement<T, E>) -> bool {
        let mut outcome = Some(outcome);
        self.tx.send_if_modified(|current| {
            if matches!(current, Settlement::Pending) {
                if let Some(outcome) = outcome.take() {
                    *current = outcome;
                    return true;
                }
            }
            false
        })
    }

    pub fn state(&self) -> DeferredState {
        match &*self.tx.borrow() {
            Settlement::Pending => DeferredState::Pending,
            Settlement::Resolved(_) => DeferredState::Resolved,
            Settlement::Rejected(_) => DeferredState::Rejected,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state() == DeferredState::Pending
    }

    /// Whether both handles refer to the same underlying deferred
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }

    /// Future that completes once the deferred is settled.
    ///
    /// The returned future owns its receiver, so it is `'static` and may be
    /// moved into spawned tasks or `select!` arms. A deferred that is never
    /// settled never completes.
    pub fn wait(&self) -> impl Future<Output = Result<T, E>> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move {
            loop {
                let settled = match &*rx.borrow_and_update() {
                    Settlement::Pending => None,
                    Settlement::Resolved(value) => Some(Ok(value.clone())),
                    Settlement::Rejected(error) => Some(Err(error.clone())),
                };
                if let Some(result) = settled {
                    return result;
                }
                if rx.changed().await.is_err() {
                    // every handle dropped while pending
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

impl<T, E> Default for Deferred<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_resolve_from_outside() {
        let deferred: Deferred<u32, String> = Deferred::new();
        let waiter = deferred.wait();

        let settler = deferred.clone();
        tokio::spawn(async move {
            settler.resolve(7);
        });

        assert_eq!(waiter.await, Ok(7));
        assert_eq!(deferred.state(), DeferredState::Resolved);
    }

    #[tokio::test]
    async fn test_only_first_settlement_counts() {
        let deferred: Deferred<u32, String> = Deferred::new();

        assert!(deferred.reject("boom".to_string()));
        assert!(!deferred.resolve(1));
        assert!(!deferred.reject("again".to_string()));

        assert_eq!(deferred.wait().await, Err("boom".to_string()));
        assert_eq!(deferred.state(), DeferredState::Rejected);
    }

    #[tokio::test]
    async fn test_wait_after_settlement() {
        let deferred: Deferred<&'static str, ()> = Deferred::new();
        deferred.resolve("done");

        assert_eq!(deferred.wait().await, Ok("done"));
        assert_eq!(deferred.wait().await, Ok("done"));
    }

    #[tokio::test]
    async fn test_multiple_waiters() {
        let deferred: Deferred<u8, ()> = Deferred::new();
        let first = tokio::spawn(deferred.wait());
        let second = tokio::spawn(deferred.wait());

        tokio::time::sleep(Duration::from_millis(5)).await;
        deferred.resolve(3);

        assert_eq!(first.await.unwrap(), Ok(3));
        assert_eq!(second.await.unwrap(), Ok(3));
    }

    #[tokio::test]
    async fn test_pending_wait_does_not_complete() {
        let deferred: Deferred<u8, ()> = Deferred::new();
        let result = tokio::time::timeout(Duration::from_millis(20), deferred.wait()).await;

        assert!(result.is_err());
        assert!(deferred.is_pending());
    }

    #[test]
    fn test_same_as() {
        let deferred: Deferred<u8, ()> = Deferred::new();
        let clone = deferred.clone();
        let other: Deferred<u8, ()> = Deferred::new();

        assert!(deferred.same_as(&clone));
        assert!(!deferred.same_as(&other));
    }
}
