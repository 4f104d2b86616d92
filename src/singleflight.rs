//! Per-key load deduplication.
//!
//! Concurrent loads of the same key collapse onto one execution: the first
//! caller runs the loader, later callers wait on a watch channel and receive
//! the same value or the same error. The in-flight slot lives exactly as long
//! as that execution and is removed before the outcome is released, so no
//! result is ever kept around and the next call after resolution loads again.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::watch;
use tracing::debug;

use crate::error::SharedError;

/// Outcome handed to every caller of one load
pub type Outcome<T> = Result<T, SharedError>;

type Slot<T> = watch::Receiver<Option<Outcome<T>>>;

#[derive(Debug, thiserror::Error)]
#[error("in-flight load was cancelled before it finished")]
struct LoadCancelled;

enum Role<T> {
    Leader(watch::Sender<Option<Outcome<T>>>),
    Follower(Slot<T>),
}

/// Removes the slot and notifies waiters, also when the leader is dropped
/// mid-load.
struct InFlightGuard<'a, T: Clone> {
    key: &'a str,
    in_flight: &'a Mutex<HashMap<String, Slot<T>>>,
    tx: Option<watch::Sender<Option<Outcome<T>>>>,
}

impl<T: Clone> InFlightGuard<'_, T> {
    fn complete(mut self, outcome: Outcome<T>) {
        self.release(outcome);
    }

    fn release(&mut self, outcome: Outcome<T>) {
        if let Some(tx) = self.tx.take() {
            lock(self.in_flight).remove(self.key);
            let _ = tx.send(Some(outcome));
        }
    }
}

impl<T: Clone> Drop for InFlightGuard<'_, T> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            debug!("In-flight load for key {} dropped before completion", self.key);
            self.release(Err(Arc::new(LoadCancelled)));
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Collapses concurrent loads of the same key into one
pub struct LoadDeduplicator<T> {
    in_flight: Mutex<HashMap<String, Slot<T>>>,
}

impl<T: Clone> Default for LoadDeduplicator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> LoadDeduplicator<T> {
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `load` for `key` unless a load for `key` is already running, in
    /// which case wait for that one and share its outcome.
    pub async fn run<F, Fut>(&self, key: &str, load: F) -> Outcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        let role = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get(key) {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(key.to_owned(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(rx) => {
                debug!("Waiting for in-flight load of key: {}", key);
                wait(rx).await
            }
            Role::Leader(tx) => {
                let guard = InFlightGuard {
                    key,
                    in_flight: &self.in_flight,
                    tx: Some(tx),
                };
                let outcome = load().await;
                guard.complete(outcome.clone());
                outcome
            }
        }
    }

    /// Number of keys with a load currently running
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }
}

async fn wait<T: Clone>(mut rx: Slot<T>) -> Outcome<T> {
    loop {
        if let Some(outcome) = rx.borrow_and_update().as_ref() {
            return outcome.clone();
        }
        if rx.changed().await.is_err() {
            return Err(Arc::new(LoadCancelled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use futures::future::join_all;

    #[tokio::test]
    async fn test_concurrent_loads_collapse() {
        let dedup = LoadDeduplicator::<String>::new();
        let calls = AtomicUsize::new(0);

        let loads = (0..16).map(|_| {
            dedup.run("user:42", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok("Alice".to_owned())
            })
        });
        let outcomes = join_all(loads).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(outcomes.iter().all(|o| o.as_deref().ok() == Some("Alice")));
        assert_eq!(dedup.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_loads_collapse_across_tasks() {
        let dedup = Arc::new(LoadDeduplicator::<u64>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());

        // leader parks until every follower has had time to join
        let leader = tokio::spawn({
            let (dedup, calls, gate) = (dedup.clone(), calls.clone(), gate.clone());
            async move {
                dedup
                    .run("k", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok(7)
                    })
                    .await
            }
        });
        while dedup.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let followers: Vec<_> = (0..8)
            .map(|_| {
                let (dedup, calls) = (dedup.clone(), calls.clone());
                tokio::spawn(async move {
                    dedup
                        .run("k", || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(0)
                        })
                        .await
                })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.notify_one();

        assert_eq!(leader.await.unwrap().unwrap(), 7);
        for f in followers {
            assert_eq!(f.await.unwrap().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_is_shared() {
        let dedup = LoadDeduplicator::<u32>::new();
        let calls = AtomicUsize::new(0);

        let loads = (0..4).map(|_| {
            dedup.run("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err::<u32, SharedError>(Arc::new(io::Error::other("db down")))
            })
        });
        let outcomes = join_all(loads).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for o in outcomes {
            assert_eq!(o.unwrap_err().to_string(), "db down");
        }
    }

    #[tokio::test]
    async fn test_nothing_is_retained_after_resolution() {
        let dedup = LoadDeduplicator::<u32>::new();

        let first = dedup.run("k", || async { Ok(1) }).await.unwrap();
        let second = dedup.run("k", || async { Ok(2) }).await.unwrap();

        assert_eq!((first, second), (1, 2));
        assert_eq!(dedup.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_collapse() {
        let dedup = LoadDeduplicator::<&'static str>::new();
        let calls = AtomicUsize::new(0);

        let (a, b) = tokio::join!(
            dedup.run("a", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok("a")
            }),
            dedup.run("b", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok("b")
            }),
        );

        assert_eq!((a.unwrap(), b.unwrap()), ("a", "b"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_leader_releases_followers() {
        let dedup = LoadDeduplicator::<u32>::new();

        let mut leader = Box::pin(dedup.run("k", || async {
            futures::future::pending::<()>().await;
            Ok(1)
        }));
        assert!(futures::poll!(leader.as_mut()).is_pending());
        assert_eq!(dedup.in_flight(), 1);

        let mut follower = Box::pin(dedup.run("k", || async { Ok(2) }));
        assert!(futures::poll!(follower.as_mut()).is_pending());

        drop(leader);
        assert_eq!(dedup.in_flight(), 0);
        assert!(follower.await.is_err());

        // the key is free again
        assert_eq!(dedup.run("k", || async { Ok(3) }).await.unwrap(), 3);
    }
}
