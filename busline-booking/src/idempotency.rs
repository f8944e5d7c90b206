//! At-most-once execution per key.
//!
//! The first caller for a key becomes the executor; callers arriving while it
//! runs wait for its result; callers arriving after a successful completion
//! get the cached value until it expires. Failures are handed to the callers
//! already waiting and then forgotten, so a later retry with the same key runs
//! again.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;

type Shared<T, E> = Option<Result<T, E>>;

enum Slot<T, E> {
    InFlight {
        id: u64,
        rx: watch::Receiver<Shared<T, E>>,
    },
    Done {
        value: T,
        completed_at: Instant,
    },
}

struct Slots<K, T, E> {
    entries: HashMap<K, Slot<T, E>>,
    next_id: u64,
}

impl<K: Eq + Hash + Clone, T, E> Slots<K, T, E> {
    fn purge_expired(&mut self, now: Instant, retention: Duration) {
        self.entries.retain(|_, slot| match slot {
            Slot::Done { completed_at, .. } => now.duration_since(*completed_at) < retention,
            Slot::InFlight { .. } => true,
        });
    }

    /// Drops the oldest completed entries until there is room for one more.
    /// In-flight entries are never evicted.
    fn make_room(&mut self, capacity: usize) {
        while self.entries.len() >= capacity {
            let oldest = self
                .entries
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Done { completed_at, .. } => Some((key.clone(), *completed_at)),
                    Slot::InFlight { .. } => None,
                })
                .min_by_key(|(_, completed_at)| *completed_at)
                .map(|(key, _)| key);

            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    fn remove_if_owner(&mut self, key: &K, owner: u64) {
        if matches!(self.entries.get(key), Some(Slot::InFlight { id, .. }) if *id == owner) {
            self.entries.remove(key);
        }
    }
}

fn lock<K, T, E>(slots: &Mutex<Slots<K, T, E>>) -> MutexGuard<'_, Slots<K, T, E>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a call to [`IdempotencyGate::run`] was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    /// This caller executed the operation.
    Executed,
    /// Joined an execution that was already in flight.
    Shared,
    /// Returned a previously completed result.
    Cached,
}

pub enum Admission<K: Eq + Hash + Clone, T, E> {
    /// Caller must execute and then [`Ticket::complete`].
    New(Ticket<K, T, E>),
    /// Someone else is executing; await the shared result.
    Pending(Waiter<T, E>),
    Cached(T),
}

/// Ownership of one in-flight execution. Dropping it without completing
/// releases the key so that waiters can re-admit.
pub struct Ticket<K: Eq + Hash + Clone, T, E> {
    key: K,
    id: u64,
    tx: Option<watch::Sender<Shared<T, E>>>,
    slots: Arc<Mutex<Slots<K, T, E>>>,
}

impl<K: Eq + Hash + Clone, T: Clone, E: Clone> Ticket<K, T, E> {
    /// Publishes the result to every waiter; successes are cached.
    pub fn complete(mut self, result: Result<T, E>) -> Result<T, E> {
        {
            let mut slots = lock(&self.slots);
            match &result {
                Ok(value) => {
                    if matches!(slots.entries.get(&self.key), Some(Slot::InFlight { id, .. }) if *id == self.id) {
                        slots.entries.insert(
                            self.key.clone(),
                            Slot::Done {
                                value: value.clone(),
                                completed_at: Instant::now(),
                            },
                        );
                    }
                }
                Err(_) => slots.remove_if_owner(&self.key, self.id),
            }
        }

        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(result.clone()));
        }
        result
    }
}

impl<K: Eq + Hash + Clone, T, E> Drop for Ticket<K, T, E> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            lock(&self.slots).remove_if_owner(&self.key, self.id);
        }
    }
}

pub struct Waiter<T, E> {
    rx: watch::Receiver<Shared<T, E>>,
}

impl<T: Clone, E: Clone> Waiter<T, E> {
    /// `None` when the executor went away without a result.
    pub async fn wait(mut self) -> Option<Result<T, E>> {
        match self.rx.wait_for(|value| value.is_some()).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        }
    }
}

pub struct IdempotencyGate<K, T, E> {
    slots: Arc<Mutex<Slots<K, T, E>>>,
    retention: Duration,
    capacity: usize,
}

impl<K, T, E> IdempotencyGate<K, T, E>
where
    K: Eq + Hash + Clone,
    T: Clone,
    E: Clone,
{
    pub fn new(retention: Duration, capacity: usize) -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                entries: HashMap::new(),
                next_id: 0,
            })),
            retention,
            capacity: capacity.max(1),
        }
    }

    pub fn admit(&self, key: &K) -> Admission<K, T, E> {
        let mut slots = lock(&self.slots);
        slots.purge_expired(Instant::now(), self.retention);

        match slots.entries.get(key) {
            Some(Slot::Done { value, .. }) => return Admission::Cached(value.clone()),
            Some(Slot::InFlight { rx, .. }) => return Admission::Pending(Waiter { rx: rx.clone() }),
            None => {}
        }

        slots.make_room(self.capacity);

        let (tx, rx) = watch::channel(None);
        let id = slots.next_id;
        slots.next_id += 1;
        slots.entries.insert(key.clone(), Slot::InFlight { id, rx });

        Admission::New(Ticket {
            key: key.clone(),
            id,
            tx: Some(tx),
            slots: Arc::clone(&self.slots),
        })
    }

    /// Runs `op` at most once for `key` among concurrent and repeated callers.
    pub async fn run<F, Fut>(&self, key: K, op: F) -> (Served, Result<T, E>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let ticket = loop {
            match self.admit(&key) {
                Admission::Cached(value) => return (Served::Cached, Ok(value)),
                Admission::Pending(waiter) => {
                    if let Some(result) = waiter.wait().await {
                        return (Served::Shared, result);
                    }
                    // executor vanished, try to take over
                }
                Admission::New(ticket) => break ticket,
            }
        };

        let result = op().await;
        (Served::Executed, ticket.complete(result))
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Gate = IdempotencyGate<String, u32, String>;

    fn gate() -> Arc<Gate> {
        Arc::new(IdempotencyGate::new(Duration::from_secs(60), 100))
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_execute_once() {
        let gate = gate();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let gate = Arc::clone(&gate);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                gate.run("RT-ABC123".to_string(), || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(7)
                })
                .await
            }));
        }

        let mut executed = 0;
        for handle in handles {
            let (served, result) = handle.await.unwrap();
            assert_eq!(result, Ok(7));
            if served == Served::Executed {
                executed += 1;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(executed, 1);
    }

    #[tokio::test]
    async fn test_completed_result_is_cached() {
        let gate = gate();
        let (served, first) = gate.run("k".to_string(), || async { Ok(1) }).await;
        assert_eq!(served, Served::Executed);
        assert_eq!(first, Ok(1));

        let (served, second) = gate.run("k".to_string(), || async { Ok(2) }).await;
        assert_eq!(served, Served::Cached);
        assert_eq!(second, Ok(1));
    }

    #[tokio::test]
    async fn test_failure_is_shared_then_forgotten() {
        let gate = gate();

        let leader = match gate.admit(&"k".to_string()) {
            Admission::New(ticket) => ticket,
            _ => panic!("expected a fresh admission"),
        };
        let waiter = match gate.admit(&"k".to_string()) {
            Admission::Pending(waiter) => waiter,
            _ => panic!("expected a pending admission"),
        };

        let result = leader.complete(Err("deadlock".to_string()));
        assert_eq!(result, Err("deadlock".to_string()));
        assert_eq!(waiter.wait().await, Some(Err("deadlock".to_string())));
        assert!(gate.is_empty());

        let (served, retry) = gate.run("k".to_string(), || async { Ok(3) }).await;
        assert_eq!(served, Served::Executed);
        assert_eq!(retry, Ok(3));
    }

    #[tokio::test]
    async fn test_abandoned_ticket_releases_key() {
        let gate = gate();
        let ticket = match gate.admit(&"k".to_string()) {
            Admission::New(ticket) => ticket,
            _ => panic!("expected a fresh admission"),
        };
        let waiter = match gate.admit(&"k".to_string()) {
            Admission::Pending(waiter) => waiter,
            _ => panic!("expected a pending admission"),
        };

        drop(ticket);
        assert_eq!(waiter.wait().await, None);

        let (served, result) = gate.run("k".to_string(), || async { Ok(9) }).await;
        assert_eq!(served, Served::Executed);
        assert_eq!(result, Ok(9));
    }

    #[tokio::test]
    async fn test_entries_expire_after_retention() {
        let gate: Gate = IdempotencyGate::new(Duration::from_millis(20), 100);
        gate.run("k".to_string(), || async { Ok(1) }).await.1.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        let (served, result) = gate.run("k".to_string(), || async { Ok(2) }).await;
        assert_eq!(served, Served::Executed);
        assert_eq!(result, Ok(2));
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_completed() {
        let gate: Gate = IdempotencyGate::new(Duration::from_secs(60), 2);
        gate.run("a".to_string(), || async { Ok(1) }).await.1.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        gate.run("b".to_string(), || async { Ok(2) }).await.1.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        gate.run("c".to_string(), || async { Ok(3) }).await.1.unwrap();

        assert_eq!(gate.len(), 2);
        assert!(matches!(gate.admit(&"b".to_string()), Admission::Cached(2)));
        assert!(matches!(gate.admit(&"a".to_string()), Admission::New(_)));
    }
}
