//! Keyed single-flight memoization.
//!
//! At most one computation runs per key at a time. Callers arriving while a computation is in
//! flight wait for it and receive a clone of its result, error included. The bookkeeping lock is
//! only held while inspecting the table, never while a computation runs.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;
use tokio::sync::watch;

type Slot<V, E> = Option<Result<V, E>>;

/// Pending entries carry the generation of the computation that owns them.
enum Entry<V, E> {
    Pending(u64, watch::Receiver<Slot<V, E>>),
    Done(Result<V, E>),
}

enum Step<V, E> {
    Ready(Result<V, E>),
    Wait(watch::Receiver<Slot<V, E>>),
    Compute(u64, watch::Sender<Slot<V, E>>),
}

pub struct Cache<K, V, E> {
    entries: Mutex<HashMap<K, Entry<V, E>>>,
    generation: AtomicU64,
    cache_failures: bool,
}

impl<K, V, E> Default for Cache<K, V, E> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            cache_failures: false,
        }
    }
}

impl<K, V, E> Cache<K, V, E>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
    E: Clone,
{
    /// A cache that forgets failed computations, so the next caller retries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep failed results as well; later callers get the cached error.
    pub fn caching_failures(mut self) -> Self {
        self.cache_failures = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Entry<V, E>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn get_or_compute<F, Fut>(&self, key: K, f: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        loop {
            let step = {
                let mut entries = self.lock();
                match entries.get(&key) {
                    Some(Entry::Done(result)) => Step::Ready(result.clone()),
                    Some(Entry::Pending(_, rx)) => Step::Wait(rx.clone()),
                    None => {
                        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                        let (tx, rx) = watch::channel(None);
                        entries.insert(key.clone(), Entry::Pending(generation, rx));
                        Step::Compute(generation, tx)
                    }
                }
            };

            match step {
                Step::Ready(result) => {
                    debug!("cache hit for {key:?}");
                    return result;
                }
                Step::Compute(generation, tx) => return self.compute(key, generation, tx, f).await,
                Step::Wait(mut rx) => {
                    debug!("waiting for in-flight computation of {key:?}");
                    let outcome = match rx.wait_for(Option::is_some).await {
                        Ok(slot) => slot.clone(),
                        Err(_) => None,
                    };
                    if let Some(result) = outcome {
                        return result;
                    }
                    // The computing caller was dropped before finishing.
                    debug!("in-flight computation of {key:?} was abandoned, retrying");
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    async fn compute<F, Fut>(
        &self,
        key: K,
        generation: u64,
        tx: watch::Sender<Slot<V, E>>,
        f: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let mut flight = Flight {
            cache: self,
            key: Some(key),
            generation,
        };
        let result = f().await;

        if let Some(key) = flight.key.take() {
            let mut entries = self.lock();
            if !owns(&entries, &key, generation) {
                debug!("{key:?} was dropped from the cache while computing");
            } else if result.is_ok() || self.cache_failures {
                entries.insert(key, Entry::Done(result.clone()));
            } else {
                entries.remove(&key);
            }
        }
        tx.send_replace(Some(result.clone()));
        result
    }

    /// Drop every entry. In-flight computations are not cancelled, but their results are no
    /// longer stored.
    pub fn close(&self) {
        self.lock().clear();
    }
}

/// Whether `key` is still pending on the computation of `generation`.
fn owns<K: Eq + Hash, V, E>(entries: &HashMap<K, Entry<V, E>>, key: &K, generation: u64) -> bool {
    matches!(entries.get(key), Some(Entry::Pending(owner, _)) if *owner == generation)
}

/// Removes a pending entry if its computation is dropped before completing.
struct Flight<'a, K: Eq + Hash, V, E> {
    cache: &'a Cache<K, V, E>,
    key: Option<K>,
    generation: u64,
}

impl<K: Eq + Hash, V, E> Drop for Flight<'_, K, V, E> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let mut entries = self
                .cache
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if owns(&entries, &key, self.generation) {
                entries.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    type TestCache = Cache<String, usize, String>;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn identical_keys_compute_once() {
        let cache = Arc::new(TestCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_compute("k".to_string(), move || async move {
                            let token = calls.fetch_add(1, Ordering::SeqCst) + 100;
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(token)
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(100));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn distinct_keys_run_independently() {
        let cache = Arc::new(TestCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        // Both computations must be running at the same time to pass the barrier.
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let tasks: Vec<_> = ["k1", "k2"]
            .into_iter()
            .map(|key| {
                let cache = cache.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_compute(key.to_string(), move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            barrier.wait().await;
                            Ok(key.len())
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            let result = tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("distinct keys were serialized");
            assert_eq!(result.unwrap(), Ok(2));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn waiters_share_the_error() {
        let cache = Arc::new(TestCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_compute("k".to_string(), move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Err::<usize, _>("boom".to_string())
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap(), Err("boom".to_string()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached_by_default() {
        let cache = TestCache::new();
        let first = cache
            .get_or_compute("k".to_string(), || async { Err("boom".to_string()) })
            .await;
        assert_eq!(first, Err("boom".to_string()));

        let second = cache
            .get_or_compute("k".to_string(), || async { Ok(7) })
            .await;
        assert_eq!(second, Ok(7));
    }

    #[tokio::test]
    async fn failures_can_be_cached() {
        let cache = TestCache::new().caching_failures();
        let _ = cache
            .get_or_compute("k".to_string(), || async { Err("boom".to_string()) })
            .await;

        let second = cache
            .get_or_compute("k".to_string(), || async { Ok(7) })
            .await;
        assert_eq!(second, Err("boom".to_string()));
    }

    #[tokio::test]
    async fn successes_are_cached_until_close() {
        let cache = TestCache::new();
        assert_eq!(
            cache.get_or_compute("k".to_string(), || async { Ok(1) }).await,
            Ok(1)
        );
        assert_eq!(
            cache.get_or_compute("k".to_string(), || async { Ok(2) }).await,
            Ok(1)
        );
        cache.close();
        assert_eq!(
            cache.get_or_compute("k".to_string(), || async { Ok(3) }).await,
            Ok(3)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_computation_is_retried() {
        let cache = Arc::new(TestCache::new());

        let stuck = tokio::spawn({
            let cache = cache.clone();
            async move {
                cache
                    .get_or_compute("k".to_string(), || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(1)
                    })
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        stuck.abort();
        let _ = stuck.await;

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            cache.get_or_compute("k".to_string(), || async { Ok(2) }),
        )
        .await
        .unwrap();
        assert_eq!(result, Ok(2));
    }

    /// Computation of `value` that reports when it starts and finishes once released.
    fn gated(
        cache: &Arc<TestCache>,
        value: usize,
    ) -> (
        tokio::task::JoinHandle<Result<usize, String>>,
        oneshot::Receiver<()>,
        oneshot::Sender<()>,
    ) {
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let cache = cache.clone();
        let task = tokio::spawn(async move {
            cache
                .get_or_compute("k".to_string(), move || async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok(value)
                })
                .await
        });
        (task, started_rx, release_tx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn computation_from_before_close_does_not_overwrite_newer_one() {
        let cache = Arc::new(TestCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let (old, old_started, release_old) = gated(&cache, 1);
        old_started.await.unwrap();
        cache.close();
        let (new, new_started, release_new) = gated(&cache, 2);
        new_started.await.unwrap();

        release_old.send(()).unwrap();
        assert_eq!(old.await.unwrap(), Ok(1));

        let waiter = tokio::spawn({
            let cache = cache.clone();
            let calls = calls.clone();
            async move {
                cache
                    .get_or_compute("k".to_string(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(3)
                    })
                    .await
            }
        });
        release_new.send(()).unwrap();

        assert_eq!(new.await.unwrap(), Ok(2));
        assert_eq!(waiter.await.unwrap(), Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
